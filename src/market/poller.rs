use crate::core::clock::Clock;
use crate::core::deadline::Deadline;
use crate::core::errors::ExchangeError;
use crate::core::shutdown::ShutdownSignal;
use crate::core::traits::RestSurface;
use crate::core::types::{conversion, Ticker};
use crate::hub::{HubHandle, MessageType};
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Payload of a `market_data` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataPayload {
    pub tickers: Vec<Ticker>,
    pub observed_at: DateTime<Utc>,
}

/// Samples 24h tickers for a set of symbols on a fixed interval and feeds the hub
pub struct MarketPoller {
    rest: Arc<dyn RestSurface>,
    hub: HubHandle,
    clock: Arc<dyn Clock>,
    symbols: RwLock<BTreeSet<String>>,
    interval: Duration,
    concurrency: usize,
    request_timeout: Duration,
}

impl MarketPoller {
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
            symbols: RwLock::new(BTreeSet::new()),
            interval,
            concurrency: 8,
            request_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns false if the symbol was already polled
    pub async fn add_symbol(&self, symbol: &str) -> Result<bool, ExchangeError> {
        conversion::validate_symbol(symbol)?;
        Ok(self.symbols.write().await.insert(symbol.to_string()))
    }

    pub async fn remove_symbol(&self, symbol: &str) -> bool {
        self.symbols.write().await.remove(symbol)
    }

    pub async fn symbols(&self) -> Vec<String> {
        self.symbols.read().await.iter().cloned().collect()
    }

    /// Fetch every symbol once; failures are logged and left out
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> MarketDataPayload {
        let symbols = self.symbols().await;
        let deadline = Deadline::after(self.request_timeout);

        let mut tickers: Vec<Ticker> = stream::iter(symbols)
            .map(|symbol| async move {
                match self.rest.get_ticker(&symbol, deadline).await {
                    Ok(ticker) => Some(ticker),
                    Err(e) => {
                        warn!(%symbol, error = %e, "ticker fetch failed, skipping");
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|ticker| async move { ticker })
            .collect()
            .await;
        tickers.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        MarketDataPayload {
            tickers,
            observed_at: self.clock.now(),
        }
    }

    /// Poll on every tick until shutdown
    pub fn start(self: Arc<Self>, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = self.interval.as_millis() as u64, "market poller started");

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let payload = self.poll_once().await;
                if payload.tickers.is_empty() {
                    continue;
                }
                debug!(tickers = payload.tickers.len(), "publishing market data");
                if let Err(e) = self.hub.publish(MessageType::MarketData, &payload).await {
                    warn!(error = %e, "hub rejected market data");
                    break;
                }
            }
            info!("market poller stopped");
        })
    }
}
