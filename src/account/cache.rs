use crate::core::errors::ExchangeError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

/// Single-value cache with a time-to-live and single-flight refresh.
///
/// Reads take the shared lock. A stale read falls through to `refresh`, which
/// serializes loaders so that concurrent misses produce one upstream call.
#[derive(Debug)]
pub struct TtlCell<T> {
    ttl: Duration,
    entry: RwLock<Option<CacheEntry<T>>>,
    refresh: Mutex<()>,
    /// Bumped by `put` and `invalidate`; loads started before a bump are not stored
    epoch: AtomicU64,
}

impl<T: Clone + Send + Sync> TtlCell<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::new(None),
            refresh: Mutex::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The value if `now < expires_at`
    pub async fn get_fresh(&self) -> Option<T> {
        let now = Instant::now();
        self.entry
            .read()
            .await
            .as_ref()
            .filter(|e| now < e.expires_at)
            .map(|e| e.value.clone())
    }

    /// The value regardless of age
    pub async fn peek(&self) -> Option<T> {
        self.entry.read().await.as_ref().map(|e| e.value.clone())
    }

    /// Store a committed `value`; loads already in flight are discarded.
    ///
    /// `expires_at` never moves backwards.
    pub async fn put(&self, value: T) {
        let mut entry = self.entry.write().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.store(&mut entry, value);
    }

    pub async fn invalidate(&self) {
        let mut entry = self.entry.write().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *entry = None;
    }

    fn store(&self, entry: &mut Option<CacheEntry<T>>, value: T) {
        let mut expires_at = Instant::now() + self.ttl;
        if let Some(old) = entry.as_ref() {
            expires_at = expires_at.max(old.expires_at);
        }
        *entry = Some(CacheEntry { value, expires_at });
    }

    /// Fresh value, or the result of exactly one `load` shared by all concurrent misses.
    ///
    /// A failed load is returned to its caller and nothing is cached; the next
    /// waiter in line then tries its own load.
    pub async fn get_or_load<F, Fut>(&self, load: F) -> Result<T, ExchangeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        self.get_or_load_with(load, std::future::ready).await
    }

    /// Like [`get_or_load`](Self::get_or_load), but a loaded value passes
    /// through `keep` before it is stored.
    ///
    /// `keep` runs under the entry lock and only when no `put` or `invalidate`
    /// happened since the load started. A load overtaken by a `put` returns the
    /// committed value instead and never reaches `keep`.
    pub async fn get_or_load_with<F, Fut, K, KFut>(&self, load: F, keep: K) -> Result<T, ExchangeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
        K: FnOnce(T) -> KFut,
        KFut: Future<Output = T>,
    {
        if let Some(value) = self.get_fresh().await {
            return Ok(value);
        }

        let _flight = self.refresh.lock().await;
        if let Some(value) = self.get_fresh().await {
            return Ok(value);
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let value = load().await?;

        let mut entry = self.entry.write().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Ok(entry.as_ref().map_or(value, |e| e.value.clone()));
        }
        let value = keep(value).await;
        self.store(&mut entry, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cell = TtlCell::new(Duration::from_secs(5));
        cell.put(7).await;
        assert_eq!(cell.get_fresh().await, Some(7));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cell.get_fresh().await, None);
        assert_eq!(cell.peek().await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_load_once() {
        let cell = Arc::new(TtlCell::new(Duration::from_secs(60)));
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cell = cell.clone();
            let loads = loads.clone();
            handles.push(tokio::spawn(async move {
                cell.get_or_load(|| async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, ExchangeError>(42)
                })
                .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let cell: TtlCell<u32> = TtlCell::new(Duration::from_secs(60));
        let err = cell
            .get_or_load(|| async { Err(ExchangeError::RequestError("down".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::RequestError(_)));
        assert_eq!(cell.peek().await, None);

        let value = cell.get_or_load(|| async { Ok(3) }).await.unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_discards_in_flight_load() {
        let cell = Arc::new(TtlCell::new(Duration::from_secs(60)));
        let loader = {
            let cell = cell.clone();
            tokio::spawn(async move {
                cell.get_or_load(|| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, ExchangeError>(1)
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.invalidate().await;

        assert_eq!(loader.await.unwrap().unwrap(), 1);
        assert_eq!(cell.peek().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_overtakes_in_flight_load() {
        let cell = Arc::new(TtlCell::new(Duration::from_secs(60)));
        let kept = Arc::new(AtomicUsize::new(0));
        let loader = {
            let cell = cell.clone();
            let kept = kept.clone();
            tokio::spawn(async move {
                cell.get_or_load_with(
                    || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, ExchangeError>(1)
                    },
                    |v| async move {
                        kept.fetch_add(1, Ordering::SeqCst);
                        v
                    },
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.put(2).await;

        assert_eq!(loader.await.unwrap().unwrap(), 2);
        assert_eq!(cell.peek().await, Some(2));
        assert_eq!(kept.load(Ordering::SeqCst), 0);
    }
}
