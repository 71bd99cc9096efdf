use crate::core::{
    deadline::Deadline,
    errors::ExchangeError,
    types::{
        AssetBalance, Kline, KlineInterval, ListenKey, NewCoin, Order, OrderBook, OrderRequest,
        Ticker, Transaction, Wallet,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Typed view of the exchange REST API
#[async_trait]
pub trait RestSurface: Send + Sync {
    /// 24h rolling ticker for one symbol
    async fn get_ticker(&self, symbol: &str, deadline: Deadline) -> Result<Ticker, ExchangeError>;

    async fn get_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: u32,
        deadline: Deadline,
    ) -> Result<Vec<Kline>, ExchangeError>;

    async fn get_order_book(
        &self,
        symbol: &str,
        depth: u32,
        deadline: Deadline,
    ) -> Result<OrderBook, ExchangeError>;

    /// Full account snapshot as a wallet
    async fn get_wallet(&self, deadline: Deadline) -> Result<Wallet, ExchangeError>;

    async fn place_order(
        &self,
        order: &OrderRequest,
        deadline: Deadline,
    ) -> Result<Order, ExchangeError>;

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        deadline: Deadline,
    ) -> Result<Order, ExchangeError>;

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
        deadline: Deadline,
    ) -> Result<Order, ExchangeError>;

    /// Open orders, optionally restricted to one symbol
    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
        deadline: Deadline,
    ) -> Result<Vec<Order>, ExchangeError>;

    /// Returns `Ok(false)` when the exchange rejects the keys, `Err` on transport failure
    async fn validate_keys(&self, deadline: Deadline) -> Result<bool, ExchangeError>;

    /// Symbols announced but not yet open for trading
    async fn get_new_coins(&self, deadline: Deadline) -> Result<Vec<NewCoin>, ExchangeError>;

    async fn create_listen_key(&self, deadline: Deadline) -> Result<ListenKey, ExchangeError>;

    async fn renew_listen_key(&self, token: &str, deadline: Deadline) -> Result<(), ExchangeError>;

    async fn close_listen_key(&self, token: &str, deadline: Deadline) -> Result<(), ExchangeError>;
}

/// Lifecycle of the user-data stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
    Reconnecting,
    Closed,
}

/// Receives one asset's post-change balance and the event time
pub type WalletDeltaHandler = Arc<dyn Fn(AssetBalance, DateTime<Utc>) + Send + Sync>;

/// Invoked after the stream has re-authenticated on a fresh connection
pub type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Authenticated private WebSocket feed
#[async_trait]
pub trait WsUserData: Send + Sync {
    async fn connect(&self, deadline: Deadline) -> Result<(), ExchangeError>;

    async fn authenticate(&self, deadline: Deadline) -> Result<(), ExchangeError>;

    /// Install the wallet-delta handler. Calling it again replaces the handler.
    async fn subscribe_to_account_updates(
        &self,
        handler: WalletDeltaHandler,
    ) -> Result<(), ExchangeError>;

    async fn set_reconnect_hook(&self, hook: ReconnectHook);

    fn state(&self) -> StreamState;

    async fn close(&self) -> Result<(), ExchangeError>;
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn load(&self) -> Result<Option<Wallet>, ExchangeError>;

    async fn save(&self, wallet: &Wallet) -> Result<(), ExchangeError>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn append(&self, transaction: Transaction) -> Result<(), ExchangeError>;

    /// Records with `start <= timestamp <= end`, oldest first
    async fn find_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, ExchangeError>;
}

/// Source of open-position valuations in the quote currency
#[async_trait]
pub trait PositionValuer: Send + Sync {
    async fn position_values(&self) -> Result<HashMap<String, f64>, ExchangeError>;
}
