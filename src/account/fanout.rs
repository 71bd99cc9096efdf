use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Values held for a subscriber that is behind; older ones are dropped first
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

/// Handle returned by [`FanOut::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Subscriber<T> {
    id: SubscriptionId,
    tx: broadcast::Sender<T>,
    worker: JoinHandle<()>,
}

/// One-to-many dispatch of values to registered callbacks.
///
/// Every subscriber gets its own worker task and bounded queue, so a slow
/// callback only delays itself and values reach each callback in publish order.
/// A subscriber that falls [`SUBSCRIBER_QUEUE_CAPACITY`] values behind loses the
/// oldest ones. Each invocation runs on a separate task; a panic is logged and
/// the worker moves on.
pub struct FanOut<T> {
    subscribers: RwLock<Vec<Subscriber<T>>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> FanOut<T> {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn subscribe(&self, callback: Callback<T>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = broadcast::channel::<T>(SUBSCRIBER_QUEUE_CAPACITY);

        let worker = tokio::spawn(async move {
            loop {
                let value = match rx.recv().await {
                    Ok(value) => value,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(subscriber = id.0, skipped, "slow subscriber, dropped oldest updates");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let callback = callback.clone();
                if let Err(e) = tokio::spawn(async move { callback(value) }).await {
                    if e.is_panic() {
                        error!(subscriber = id.0, "balance subscriber panicked");
                    }
                }
            }
            debug!(subscriber = id.0, "subscriber worker stopped");
        });

        self.subscribers
            .write()
            .await
            .push(Subscriber { id, tx, worker });
        id
    }

    /// Returns false if `id` was not subscribed
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        match subscribers.iter().position(|s| s.id == id) {
            // dropping the sender lets the worker drain its queue and exit
            Some(index) => {
                subscribers.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Queue `value` for every subscriber; never waits on a callback
    pub async fn publish(&self, value: T) {
        let senders: Vec<_> = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|s| s.tx.clone())
            .collect();
        for tx in senders {
            // a closed queue means the subscriber is being removed
            let _ = tx.send(value.clone());
        }
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    /// Stop all workers without delivering what is still queued
    pub async fn clear(&self) {
        for subscriber in self.subscribers.write().await.drain(..) {
            subscriber.worker.abort();
        }
    }
}

impl<T: Clone + Send + 'static> Default for FanOut<T> {
    fn default() -> Self {
        Self::new()
    }
}
