use crate::core::deadline::Deadline;
use crate::core::errors::ExchangeError;
use crate::core::shutdown::ShutdownSignal;
use crate::core::traits::RestSurface;
use crate::core::types::ListenKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Listen key shared by the stream (which replaces it) and the renewer (which extends it)
pub type ListenKeySlot = Arc<Mutex<Option<ListenKey>>>;

/// Token of the last key the renewer gave up on. The stream compares it with
/// the key in use, so a report about an already replaced key is ignored.
pub type KeyExpiry = watch::Sender<Option<String>>;

/// Consecutive renewal failures that force a reconnect with a fresh key
pub const MAX_RENEW_FAILURES: u32 = 2;

/// Keeps the current listen key alive on a fixed schedule.
///
/// A failed renewal is retried after `grace` instead of a full interval. After
/// [`MAX_RENEW_FAILURES`] failures in a row on the same key, that key is
/// published on `expired` so the stream replaces it.
pub struct ListenKeyRenewer {
    rest: Arc<dyn RestSurface>,
    slot: ListenKeySlot,
    interval: Duration,
    grace: Duration,
    request_timeout: Duration,
    expired: Arc<KeyExpiry>,
}

impl ListenKeyRenewer {
    pub fn new(
        rest: Arc<dyn RestSurface>,
        slot: ListenKeySlot,
        interval: Duration,
        expired: Arc<KeyExpiry>,
    ) -> Self {
        Self {
            rest,
            slot,
            interval,
            grace: (interval / 10).max(Duration::from_secs(1)),
            request_timeout: Duration::from_secs(10),
            expired,
        }
    }

    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn spawn(self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn current_token(&self) -> Option<String> {
        self.slot.lock().await.as_ref().map(|k| k.token.clone())
    }

    /// Renew whatever key is current. `Ok(false)` if there is none yet.
    pub async fn renew_once(&self) -> Result<bool, ExchangeError> {
        match self.current_token().await {
            Some(token) => self.renew(&token).await.map(|()| true),
            None => Ok(false),
        }
    }

    async fn renew(&self, token: &str) -> Result<(), ExchangeError> {
        let deadline = Deadline::after(self.request_timeout);
        self.rest.renew_listen_key(token, deadline).await?;

        let mut slot = self.slot.lock().await;
        // the stream may have swapped keys meanwhile
        if let Some(key) = slot.as_mut().filter(|k| k.token == token) {
            *key = key.renewed(Instant::now());
            debug!(remaining_secs = key.remaining(Instant::now()).as_secs(), "listen key renewed");
        }
        Ok(())
    }

    async fn run(self, mut shutdown: ShutdownSignal) {
        let mut failures = 0;
        let mut failing: Option<String> = None;
        let mut wait = self.interval;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }

            let Some(token) = self.current_token().await else {
                wait = self.interval;
                continue;
            };
            match self.renew(&token).await {
                Ok(()) => {
                    failures = 0;
                    failing = None;
                    wait = self.interval;
                }
                Err(e) => {
                    // failures only add up against the same key
                    if failing.as_deref() != Some(token.as_str()) {
                        failures = 0;
                    }
                    failures += 1;
                    warn!(error = %e, failures, "listen key renewal failed");
                    if failures >= MAX_RENEW_FAILURES {
                        info!("forcing user stream reconnect with a new listen key");
                        self.expired.send_replace(Some(token));
                        failing = None;
                        failures = 0;
                        wait = self.interval;
                    } else {
                        failing = Some(token);
                        wait = self.grace;
                    }
                }
            }
        }
        debug!("listen key renewer stopped");
    }
}
