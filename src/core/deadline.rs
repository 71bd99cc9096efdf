use crate::core::errors::ExchangeError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// Absolute point in time after which an operation must give up.
///
/// Built on `tokio::time::Instant` so paused-clock tests drive expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn after(duration: Duration) -> Self {
        Self(Instant::now() + duration)
    }

    /// A deadline for background work that is bounded by shutdown, not by time
    pub fn far_future() -> Self {
        Self::after(Duration::from_secs(60 * 60 * 24 * 365))
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    /// The earlier of the two deadlines
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        if other.0 < self.0 {
            other
        } else {
            self
        }
    }

    /// Run `fut` to completion or fail with `DeadlineExceeded` naming `operation`
    pub async fn run<T, F>(self, operation: &str, fut: F) -> Result<T, ExchangeError>
    where
        F: Future<Output = Result<T, ExchangeError>>,
    {
        match timeout_at(self.0, fut).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::DeadlineExceeded(operation.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let deadline = Deadline::after(Duration::from_millis(100));
        let result: Result<(), _> = deadline
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ExchangeError::DeadlineExceeded(op)) if op == "slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_passes_result_through() {
        let deadline = Deadline::after(Duration::from_secs(1));
        let value = deadline.run("fast", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(!deadline.is_expired());
    }

    #[test]
    fn test_min_picks_earlier() {
        let now = Instant::now();
        let a = Deadline::at(now + Duration::from_secs(1));
        let b = Deadline::at(now + Duration::from_secs(2));
        assert_eq!(a.min(b), a);
        assert_eq!(b.min(a), a);
    }
}
