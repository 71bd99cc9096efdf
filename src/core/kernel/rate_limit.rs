use crate::core::deadline::Deadline;
use crate::core::errors::ExchangeError;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Which bucket a request draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Public,
    Private,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

/// Classic token bucket. Refill is computed lazily from elapsed time.
///
/// `0 <= tokens <= capacity` holds after every operation.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_second,
            last_refill: Instant::now(),
        }
    }

    /// Bucket for an exchange limit given per minute. Capacity defaults to one
    /// second worth of requests.
    pub fn per_minute(rate_per_minute: u32, burst: Option<u32>) -> Self {
        let per_second = f64::from(rate_per_minute) / 60.0;
        let capacity = burst.unwrap_or_else(|| per_second.ceil() as u32);
        Self::new(capacity, per_second)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Take one token if available, otherwise report how long until one is
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        if self.refill_per_second <= 0.0 {
            return Err(Duration::MAX);
        }
        let missing = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(missing / self.refill_per_second))
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Public and private token buckets shared by every request a client issues
#[derive(Debug)]
pub struct RateLimiter {
    public: Mutex<TokenBucket>,
    private: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(public: TokenBucket, private: TokenBucket) -> Self {
        Self {
            public: Mutex::new(public),
            private: Mutex::new(private),
        }
    }

    pub fn per_minute(
        public_rate: u32,
        private_rate: u32,
        public_burst: Option<u32>,
        private_burst: Option<u32>,
    ) -> Self {
        Self::new(
            TokenBucket::per_minute(public_rate, public_burst),
            TokenBucket::per_minute(private_rate, private_burst),
        )
    }

    fn bucket(&self, class: EndpointClass) -> &Mutex<TokenBucket> {
        match class {
            EndpointClass::Public => &self.public,
            EndpointClass::Private => &self.private,
        }
    }

    /// Wait for one token of `class`, or fail once `deadline` passes.
    ///
    /// The lock is never held while sleeping; a waiter that wakes re-checks the bucket.
    pub async fn acquire(
        &self,
        class: EndpointClass,
        deadline: Deadline,
    ) -> Result<(), ExchangeError> {
        loop {
            let wait = {
                let mut bucket = self.bucket(class).lock().await;
                match bucket.try_acquire(Instant::now()) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };

            let wake_at = Instant::now().checked_add(wait);
            match wake_at {
                Some(at) if at <= deadline.instant() => {
                    trace!(class = class.as_str(), wait_ms = wait.as_millis() as u64, "rate limiter waiting");
                    tokio::time::sleep_until(at).await;
                }
                _ => {
                    return Err(ExchangeError::DeadlineExceeded(format!(
                        "{} rate limiter",
                        class.as_str()
                    )))
                }
            }
        }
    }
}
