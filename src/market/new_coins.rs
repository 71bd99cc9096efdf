use crate::core::clock::Clock;
use crate::core::deadline::Deadline;
use crate::core::errors::ExchangeError;
use crate::core::retry::retry_rate_limited;
use crate::core::shutdown::ShutdownSignal;
use crate::core::traits::RestSurface;
use crate::core::types::NewCoin;
use crate::hub::{HubHandle, MessageType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Payload of a `new_coin_alert` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCoinAlertPayload {
    pub coins: Vec<NewCoin>,
    pub detected_at: DateTime<Utc>,
}

/// Watches the listing for upcoming symbols and announces each one once
pub struct NewCoinWatcher {
    rest: Arc<dyn RestSurface>,
    hub: HubHandle,
    clock: Arc<dyn Clock>,
    seen: Mutex<HashSet<String>>,
    interval: Duration,
    request_timeout: Duration,
}

impl NewCoinWatcher {
    pub fn new(
        rest: Arc<dyn RestSurface>,
        hub: HubHandle,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            rest,
            hub,
            clock,
            seen: Mutex::new(HashSet::new()),
            interval,
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Symbols in the current listing that have not been reported before
    pub async fn check_once(&self) -> Result<Vec<NewCoin>, ExchangeError> {
        let listing = retry_rate_limited("get_new_coins", || {
            self.rest
                .get_new_coins(Deadline::after(self.request_timeout))
        })
        .await?;

        let mut seen = self.seen.lock().await;
        Ok(listing
            .into_iter()
            .filter(|coin| seen.insert(coin.symbol.clone()))
            .collect())
    }

    pub fn start(self: Arc<Self>, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let coins = match self.check_once().await {
                    Ok(coins) if coins.is_empty() => continue,
                    Ok(coins) => coins,
                    Err(e) => {
                        warn!(error = %e, "new coin check failed");
                        continue;
                    }
                };
                info!(count = coins.len(), "new listings detected");
                let payload = NewCoinAlertPayload {
                    coins,
                    detected_at: self.clock.now(),
                };
                if let Err(e) = self.hub.publish(MessageType::NewCoinAlert, &payload).await {
                    warn!(error = %e, "hub rejected new coin alert");
                    break;
                }
            }
        })
    }
}
