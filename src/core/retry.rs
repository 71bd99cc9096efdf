use crate::core::errors::ExchangeError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::warn;

/// Number of backoff sleeps before a throttled call is abandoned
pub const RATE_LIMIT_MAX_RETRIES: usize = 5;

/// 500 ms, 1 s, 2 s, 4 s, 8 s with +/-20% jitter on each step
pub fn rate_limit_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(250)
        .max_delay(Duration::from_secs(8))
        .map(jitter)
        .take(RATE_LIMIT_MAX_RETRIES)
}

fn jitter(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.8..=1.2))
}

/// Run `op`, backing off and retrying only while the exchange reports throttling.
///
/// Any other error is returned immediately. After the last backoff the final
/// error is returned unchanged.
pub async fn retry_rate_limited<T, F, Fut>(operation: &str, mut op: F) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    RetryIf::spawn(
        rate_limit_backoff(),
        || op(),
        |err: &ExchangeError| {
            let retry = err.is_rate_limited();
            if retry {
                warn!(operation, error = %err, "rate limited, backing off");
            }
            retry
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_schedule_within_jitter() {
        let delays: Vec<_> = rate_limit_backoff().collect();
        let nominal = [500u64, 1_000, 2_000, 4_000, 8_000];
        assert_eq!(delays.len(), nominal.len());
        for (delay, expected) in delays.iter().zip(nominal) {
            let ms = delay.as_millis() as u64;
            assert!(ms >= expected * 8 / 10, "{ms} < 80% of {expected}");
            assert!(ms <= expected * 12 / 10, "{ms} > 120% of {expected}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_throttle_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry_rate_limited("op", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ExchangeError::ApiError {
                    code: -2010,
                    message: "Insufficient balance".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_throttle_clears() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = retry_rate_limited("op", || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExchangeError::ApiError {
                        code: -1003,
                        message: "Too many requests".to_string(),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
