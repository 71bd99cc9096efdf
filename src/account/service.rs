use crate::account::cache::TtlCell;
use crate::account::fanout::{Callback, FanOut, SubscriptionId};
use crate::core::clock::Clock;
use crate::core::config::ExchangeConfig;
use crate::core::deadline::Deadline;
use crate::core::errors::ExchangeError;
use crate::core::retry::retry_rate_limited;
use crate::core::traits::{
    PositionValuer, RestSurface, TransactionStore, WalletStore, WsUserData,
};
use crate::core::types::{
    AssetBalance, Balance, BalanceSource, BalanceSummary, PositionRisk, RiskLevel, Transaction,
    TransactionAnalysis, TransactionKind, Wallet,
};
use crate::store::{MemoryTransactionStore, MemoryWalletStore, StaticPositions};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

/// Reason recorded when a sync finds the exchange disagreeing with the local wallet
pub const SYNC_REASON: &str = "Balance sync with exchange";

pub type BalanceCallback = Callback<Wallet>;

type Delta = (AssetBalance, DateTime<Utc>);

#[derive(Debug, Clone)]
pub struct AccountServiceConfig {
    pub cache_ttl: Duration,
    /// Asset that `update_balance` adjusts and `Balance::fiat` reports
    pub quote_asset: String,
    /// Positions above this USD exposure are `HIGH` risk
    pub risk_threshold_usd: f64,
    /// Budget for work the service starts on its own (delta merges, stream setup)
    pub request_timeout: Duration,
}

impl AccountServiceConfig {
    pub fn from_exchange_config(config: &ExchangeConfig) -> Self {
        Self {
            cache_ttl: config.cache_ttl(),
            quote_asset: config.quote_asset.clone(),
            request_timeout: config.request_timeout(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_risk_threshold(mut self, usd: f64) -> Self {
        self.risk_threshold_usd = usd;
        self
    }
}

impl Default for AccountServiceConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            quote_asset: "USDT".to_string(),
            risk_threshold_usd: 1_000.0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct AccountServiceBuilder {
    rest: Arc<dyn RestSurface>,
    clock: Arc<dyn Clock>,
    config: AccountServiceConfig,
    user_stream: Option<Arc<dyn WsUserData>>,
    wallet_store: Arc<dyn WalletStore>,
    transactions: Arc<dyn TransactionStore>,
    positions: Arc<dyn PositionValuer>,
}

impl AccountServiceBuilder {
    pub fn new(rest: Arc<dyn RestSurface>, clock: Arc<dyn Clock>) -> Self {
        Self {
            rest,
            clock,
            config: AccountServiceConfig::default(),
            user_stream: None,
            wallet_store: Arc::new(MemoryWalletStore::new()),
            transactions: Arc::new(MemoryTransactionStore::new()),
            positions: Arc::new(StaticPositions::default()),
        }
    }

    pub fn with_config(mut self, config: AccountServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_user_stream(mut self, stream: Arc<dyn WsUserData>) -> Self {
        self.user_stream = Some(stream);
        self
    }

    pub fn with_wallet_store(mut self, store: Arc<dyn WalletStore>) -> Self {
        self.wallet_store = store;
        self
    }

    pub fn with_transaction_store(mut self, store: Arc<dyn TransactionStore>) -> Self {
        self.transactions = store;
        self
    }

    pub fn with_position_valuer(mut self, positions: Arc<dyn PositionValuer>) -> Self {
        self.positions = positions;
        self
    }

    pub fn build(self) -> AccountService {
        let (deltas, delta_rx) = mpsc::unbounded_channel();
        AccountService {
            inner: Arc::new(Inner {
                wallet: TtlCell::new(self.config.cache_ttl),
                balance: TtlCell::new(self.config.cache_ttl),
                rest: self.rest,
                clock: self.clock,
                config: self.config,
                user_stream: self.user_stream,
                wallet_store: self.wallet_store,
                transactions: self.transactions,
                positions: self.positions,
                high_water: Mutex::new(None),
                mutation: Mutex::new(()),
                subscribers: FanOut::new(),
                stream_ready: Mutex::new(false),
                deltas,
                delta_rx: Mutex::new(Some(delta_rx)),
            }),
        }
    }
}

struct Inner {
    rest: Arc<dyn RestSurface>,
    clock: Arc<dyn Clock>,
    config: AccountServiceConfig,
    user_stream: Option<Arc<dyn WsUserData>>,
    wallet_store: Arc<dyn WalletStore>,
    transactions: Arc<dyn TransactionStore>,
    positions: Arc<dyn PositionValuer>,
    wallet: TtlCell<Wallet>,
    balance: TtlCell<Balance>,
    /// Latest `updated_at` handed out; later wallets are clamped to it
    high_water: Mutex<Option<DateTime<Utc>>>,
    /// Serializes every wallet mutation so subscribers see them in order
    mutation: Mutex<()>,
    subscribers: FanOut<Wallet>,
    stream_ready: Mutex<bool>,
    deltas: mpsc::UnboundedSender<Delta>,
    delta_rx: Mutex<Option<mpsc::UnboundedReceiver<Delta>>>,
}

/// Account and balance state for one exchange account.
///
/// REST snapshots and user-stream deltas are merged into one wallet held in a
/// TTL cache. Every mutation is persisted and fanned out to subscribers.
#[derive(Clone)]
pub struct AccountService {
    inner: Arc<Inner>,
}

impl Inner {
    async fn stamp(&self, wallet: &mut Wallet) {
        let mut high_water = self.high_water.lock().await;
        if let Some(previous) = *high_water {
            wallet.touch(previous);
        }
        *high_water = Some(wallet.updated_at);
    }

    async fn persist(&self, wallet: &Wallet) {
        if let Err(e) = self.wallet_store.save(wallet).await {
            warn!(error = %e, "failed to persist wallet");
        }
    }

    /// Snapshot misses are stamped and persisted only if no commit overtook them
    async fn get_wallet(&self, deadline: Deadline) -> Result<Wallet, ExchangeError> {
        self.wallet
            .get_or_load_with(
                || self.rest.get_wallet(deadline),
                |mut wallet| async move {
                    self.stamp(&mut wallet).await;
                    self.persist(&wallet).await;
                    debug!(assets = wallet.balances.len(), "wallet snapshot fetched");
                    wallet
                },
            )
            .await
    }

    async fn get_account_balance(&self, deadline: Deadline) -> Result<Balance, ExchangeError> {
        self.balance
            .get_or_load(|| async {
                let wallet = self.get_wallet(deadline).await?;
                Ok(Balance::from_wallet(
                    &wallet,
                    &self.config.quote_asset,
                    Some(BalanceSource::RestSnapshot),
                ))
            })
            .await
    }

    /// Refresh both caches and notify subscribers. Caller holds `mutation`.
    async fn commit(&self, wallet: Wallet, source: Option<BalanceSource>) {
        let balance = Balance::from_wallet(&wallet, &self.config.quote_asset, source);
        self.wallet.put(wallet.clone()).await;
        self.balance.put(balance).await;
        self.subscribers.publish(wallet).await;
    }

    async fn apply_delta(&self, balance: AssetBalance, at: DateTime<Utc>) {
        let _mutation = self.mutation.lock().await;
        let deadline = Deadline::after(self.config.request_timeout);
        let mut wallet = match self.get_wallet(deadline).await {
            Ok(wallet) => wallet,
            Err(e) => {
                warn!(asset = %balance.asset, error = %e, "dropping wallet delta, no base snapshot");
                return;
            }
        };

        debug!(asset = %balance.asset, free = balance.free, locked = balance.locked, "applying wallet delta");
        wallet.apply_delta(balance, at);
        self.stamp(&mut wallet).await;
        self.persist(&wallet).await;
        self.commit(wallet, Some(BalanceSource::WsDelta)).await;
    }

    async fn on_reconnect(&self) {
        info!("user stream reconnected, invalidating account caches");
        self.wallet.invalidate().await;
        self.balance.invalidate().await;
    }

    async fn run_deltas(weak: Weak<Self>, mut rx: mpsc::UnboundedReceiver<Delta>) {
        while let Some((balance, at)) = rx.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.apply_delta(balance, at).await;
        }
        debug!("wallet delta worker stopped");
    }
}

impl AccountService {
    pub fn builder(rest: Arc<dyn RestSurface>, clock: Arc<dyn Clock>) -> AccountServiceBuilder {
        AccountServiceBuilder::new(rest, clock)
    }

    pub fn config(&self) -> &AccountServiceConfig {
        &self.inner.config
    }

    /// Balance from cache, or a fresh REST snapshot on a miss
    #[instrument(skip(self, deadline))]
    pub async fn get_account_balance(&self, deadline: Deadline) -> Result<Balance, ExchangeError> {
        self.inner.get_account_balance(deadline).await
    }

    #[instrument(skip(self, deadline))]
    pub async fn get_wallet(&self, deadline: Deadline) -> Result<Wallet, ExchangeError> {
        self.inner.get_wallet(deadline).await
    }

    /// Quote-asset holdings plus the value of every open position
    pub async fn get_portfolio_value(&self, deadline: Deadline) -> Result<f64, ExchangeError> {
        let balance = self.inner.get_account_balance(deadline).await?;
        let positions = self.inner.positions.position_values().await?;
        Ok(balance.fiat + positions.values().sum::<f64>())
    }

    pub async fn validate_api_keys(&self, deadline: Deadline) -> Result<bool, ExchangeError> {
        self.inner.rest.validate_keys(deadline).await
    }

    /// Reconcile the persisted wallet with a fresh exchange snapshot.
    ///
    /// A difference in the quote asset is recorded as a transaction. The
    /// snapshot then replaces the cached and stored wallet.
    #[instrument(skip(self, deadline))]
    pub async fn sync_with_exchange(&self, deadline: Deadline) -> Result<Wallet, ExchangeError> {
        let inner = &self.inner;
        let _mutation = inner.mutation.lock().await;

        let rest = inner.rest.clone();
        let mut fresh = deadline
            .run(
                "wallet sync",
                retry_rate_limited("get_wallet", || rest.get_wallet(deadline)),
            )
            .await?;
        inner.stamp(&mut fresh).await;

        let quote = &inner.config.quote_asset;
        let local_total = inner
            .wallet_store
            .load()
            .await?
            .map_or(0.0, |w| w.total_of(quote));
        let remote_total = fresh.total_of(quote);
        let difference = remote_total - local_total;
        if difference.abs() > f64::EPSILON {
            info!(%quote, local_total, remote_total, "local wallet out of sync");
            inner
                .transactions
                .append(Transaction {
                    amount: difference,
                    balance_after: remote_total,
                    reason: SYNC_REASON.to_string(),
                    timestamp: fresh.updated_at,
                })
                .await?;
        }

        inner.wallet_store.save(&fresh).await?;
        inner
            .commit(fresh.clone(), Some(BalanceSource::RestSnapshot))
            .await;
        Ok(fresh)
    }

    /// Apply a signed local change to the quote asset and record it
    #[instrument(skip(self, deadline))]
    pub async fn update_balance(
        &self,
        deadline: Deadline,
        amount: f64,
        reason: &str,
    ) -> Result<Transaction, ExchangeError> {
        if !amount.is_finite() {
            return Err(ExchangeError::InvalidParameters(format!(
                "amount must be finite, got {}",
                amount
            )));
        }

        let inner = &self.inner;
        let _mutation = inner.mutation.lock().await;
        let mut wallet = inner.get_wallet(deadline).await?;

        let quote = inner.config.quote_asset.clone();
        let (free, locked) = wallet.get(&quote).map_or((0.0, 0.0), |b| (b.free, b.locked));
        let new_free = free + amount;
        if new_free < 0.0 {
            return Err(ExchangeError::InvalidParameters(format!(
                "insufficient {} balance: {} available, {} requested",
                quote, free, -amount
            )));
        }

        let now = inner.clock.now();
        wallet.apply_delta(AssetBalance::new(quote, new_free, locked), now);
        inner.stamp(&mut wallet).await;
        inner.wallet_store.save(&wallet).await?;

        let transaction = Transaction {
            amount,
            balance_after: new_free + locked,
            reason: reason.to_string(),
            timestamp: wallet.updated_at,
        };
        inner.transactions.append(transaction.clone()).await?;
        inner.commit(wallet, None).await;
        Ok(transaction)
    }

    /// Register `callback` for every wallet mutation and make sure the user stream is live.
    ///
    /// The callback is removed again if the stream cannot be brought up.
    pub async fn subscribe_to_balance_updates(
        &self,
        callback: BalanceCallback,
    ) -> Result<SubscriptionId, ExchangeError> {
        let id = self.inner.subscribers.subscribe(callback).await;
        if let Err(e) = self.ensure_stream().await {
            self.inner.subscribers.unsubscribe(id).await;
            return Err(e);
        }
        Ok(id)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.unsubscribe(id).await
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len().await
    }

    async fn ensure_stream(&self) -> Result<(), ExchangeError> {
        let Some(stream) = self.inner.user_stream.clone() else {
            return Ok(());
        };
        let mut ready = self.inner.stream_ready.lock().await;
        if *ready {
            return Ok(());
        }

        if let Some(rx) = self.inner.delta_rx.lock().await.take() {
            tokio::spawn(Inner::run_deltas(Arc::downgrade(&self.inner), rx));
        }

        let weak = Arc::downgrade(&self.inner);
        stream
            .set_reconnect_hook(Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    tokio::spawn(async move { inner.on_reconnect().await });
                }
            }))
            .await;

        let deltas = self.inner.deltas.clone();
        stream
            .subscribe_to_account_updates(Arc::new(move |balance, at| {
                // the receiver only goes away with the service itself
                let _ = deltas.send((balance, at));
            }))
            .await?;

        let deadline = Deadline::after(self.inner.config.request_timeout);
        stream.connect(deadline).await?;
        stream.authenticate(deadline).await?;

        *ready = true;
        info!("balance updates subscribed");
        Ok(())
    }

    /// Drop cached state so the next read goes to the exchange
    pub async fn invalidate_cache(&self) {
        self.inner.on_reconnect().await;
    }

    pub async fn get_balance_summary(
        &self,
        deadline: Deadline,
        days: u32,
    ) -> Result<BalanceSummary, ExchangeError> {
        let balance = self.inner.get_account_balance(deadline).await?;
        let end = self.inner.clock.now();
        let start = end - chrono::Duration::days(i64::from(days));
        let transactions = self.get_transaction_history(start, end).await?;

        let deposits: f64 = transactions
            .iter()
            .filter(|t| t.amount > 0.0)
            .map(|t| t.amount)
            .sum();
        let withdrawals: f64 = transactions
            .iter()
            .filter(|t| t.amount < 0.0)
            .map(|t| -t.amount)
            .sum();

        Ok(BalanceSummary {
            current_balance: balance.fiat,
            deposits,
            withdrawals,
            net_change: deposits - withdrawals,
            transaction_count: transactions.len(),
            period_days: days,
            generated_at: end,
        })
    }

    pub async fn get_transaction_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, ExchangeError> {
        if start > end {
            return Err(ExchangeError::InvalidParameters(
                "invalid time range".to_string(),
            ));
        }
        self.inner.transactions.find_by_time_range(start, end).await
    }

    pub async fn analyze_transactions(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TransactionAnalysis, ExchangeError> {
        let transactions = self.get_transaction_history(start, end).await?;

        let mut analysis = TransactionAnalysis {
            start_time: start,
            end_time: end,
            total_count: transactions.len(),
            buy_count: 0,
            sell_count: 0,
            total_volume: 0.0,
            buy_volume: 0.0,
            sell_volume: 0.0,
        };
        for transaction in &transactions {
            match TransactionKind::classify(&transaction.reason) {
                TransactionKind::Buy => {
                    analysis.buy_count += 1;
                    analysis.buy_volume += transaction.amount;
                }
                TransactionKind::Sell => {
                    analysis.sell_count += 1;
                    analysis.sell_volume -= transaction.amount;
                }
                TransactionKind::Other => {}
            }
        }
        analysis.total_volume = analysis.buy_volume + analysis.sell_volume;
        Ok(analysis)
    }

    pub async fn get_position_risk(&self, symbol: &str) -> Result<PositionRisk, ExchangeError> {
        let values = self.inner.positions.position_values().await?;
        let exposure = values.get(symbol).copied().ok_or_else(|| {
            ExchangeError::InvalidParameters(format!("no open position for {}", symbol))
        })?;
        Ok(self.assess(symbol, exposure))
    }

    pub async fn get_all_position_risks(
        &self,
    ) -> Result<HashMap<String, PositionRisk>, ExchangeError> {
        let values = self.inner.positions.position_values().await?;
        Ok(values
            .into_iter()
            .map(|(symbol, exposure)| {
                let risk = self.assess(&symbol, exposure);
                (symbol, risk)
            })
            .collect())
    }

    /// Sum of all open position values
    pub async fn get_current_exposure(&self) -> Result<f64, ExchangeError> {
        let values = self.inner.positions.position_values().await?;
        Ok(values.values().sum())
    }

    fn assess(&self, symbol: &str, exposure: f64) -> PositionRisk {
        let risk_level = if exposure > self.inner.config.risk_threshold_usd {
            RiskLevel::High
        } else {
            RiskLevel::Low
        };
        PositionRisk {
            symbol: symbol.to_string(),
            exposure_usd: exposure,
            risk_level,
        }
    }

    /// Close the user stream and stop notifying subscribers
    pub async fn close(&self) -> Result<(), ExchangeError> {
        self.inner.subscribers.clear().await;
        if let Some(stream) = &self.inner.user_stream {
            stream.close().await?;
        }
        *self.inner.stream_ready.lock().await = false;
        Ok(())
    }
}

impl std::fmt::Debug for AccountService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountService")
            .field("config", &self.inner.config)
            .field("has_user_stream", &self.inner.user_stream.is_some())
            .finish_non_exhaustive()
    }
}
