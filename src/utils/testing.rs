//! In-memory stand-ins for the exchange capability traits.
//!
//! They record every call so tests can assert on request counts, and their
//! responses can be changed or made to fail while a test runs.

use crate::core::clock::Clock;
use crate::core::deadline::Deadline;
use crate::core::errors::ExchangeError;
use crate::core::traits::{
    ReconnectHook, RestSurface, StreamState, WalletDeltaHandler, WsUserData,
};
use crate::core::types::{
    conversion, AssetBalance, Kline, KlineInterval, ListenKey, NewCoin, Order, OrderBook,
    OrderRequest, OrderStatus, Ticker, Wallet,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-operation call counters
#[derive(Debug, Default)]
pub struct CallCounts {
    pub wallet: AtomicUsize,
    pub ticker: AtomicUsize,
    pub new_coins: AtomicUsize,
    pub orders: AtomicUsize,
    pub listen_key_create: AtomicUsize,
    pub listen_key_renew: AtomicUsize,
    pub listen_key_close: AtomicUsize,
}

/// Exchange REST surface backed by in-memory state
pub struct InMemoryRest {
    clock: Arc<dyn Clock>,
    wallet: Mutex<Wallet>,
    tickers: Mutex<HashMap<String, Ticker>>,
    new_coins: Mutex<Vec<NewCoin>>,
    orders: Mutex<HashMap<String, Order>>,
    wallet_failures: Mutex<VecDeque<ExchangeError>>,
    renew_failures: AtomicUsize,
    failing_symbols: Mutex<HashSet<String>>,
    latency: Mutex<Duration>,
    keys_valid: AtomicBool,
    next_id: AtomicU64,
    closed_keys: Mutex<Vec<String>>,
    pub calls: CallCounts,
}

impl InMemoryRest {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let wallet = Wallet::empty(clock.now());
        Self {
            clock,
            wallet: Mutex::new(wallet),
            tickers: Mutex::new(HashMap::new()),
            new_coins: Mutex::new(Vec::new()),
            orders: Mutex::new(HashMap::new()),
            wallet_failures: Mutex::new(VecDeque::new()),
            renew_failures: AtomicUsize::new(0),
            failing_symbols: Mutex::new(HashSet::new()),
            latency: Mutex::new(Duration::ZERO),
            keys_valid: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            closed_keys: Mutex::new(Vec::new()),
            calls: CallCounts::default(),
        }
    }

    /// Replace the account snapshot the next `get_wallet` returns
    pub fn set_balances(&self, balances: Vec<AssetBalance>) {
        *lock(&self.wallet) = Wallet::from_balances(balances, self.clock.now());
    }

    pub fn set_wallet(&self, wallet: Wallet) {
        *lock(&self.wallet) = wallet;
    }

    /// Serve `last_price` for `symbol`
    pub fn set_ticker(&self, symbol: &str, last_price: f64) {
        let ticker = Ticker {
            symbol: symbol.to_string(),
            last_price,
            volume_24h: 0.0,
            high_24h: last_price,
            low_24h: last_price,
            price_change_pct: 0.0,
            observed_at: self.clock.now(),
        };
        lock(&self.tickers).insert(symbol.to_string(), ticker);
    }

    pub fn fail_ticker(&self, symbol: &str) {
        lock(&self.failing_symbols).insert(symbol.to_string());
    }

    pub fn set_new_coins(&self, coins: Vec<NewCoin>) {
        *lock(&self.new_coins) = coins;
    }

    /// Queue an error for an upcoming `get_wallet` call
    pub fn fail_next_wallet(&self, error: ExchangeError) {
        lock(&self.wallet_failures).push_back(error);
    }

    /// Make the next `count` renewals fail
    pub fn fail_renewals(&self, count: usize) {
        self.renew_failures.store(count, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn set_keys_valid(&self, valid: bool) {
        self.keys_valid.store(valid, Ordering::SeqCst);
    }

    pub fn closed_keys(&self) -> Vec<String> {
        lock(&self.closed_keys).clone()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    async fn respond(&self, deadline: Deadline) -> Result<(), ExchangeError> {
        let latency = *lock(&self.latency);
        if latency.is_zero() {
            return Ok(());
        }
        deadline
            .run("in-memory request", async {
                tokio::time::sleep(latency).await;
                Ok(())
            })
            .await
    }

    fn find_order(&self, symbol: &str, order_id: &str) -> Result<Order, ExchangeError> {
        lock(&self.orders)
            .get(order_id)
            .filter(|o| o.symbol == symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::ApiError {
                code: -2013,
                message: "Order does not exist.".to_string(),
            })
    }
}

#[async_trait]
impl RestSurface for InMemoryRest {
    async fn get_ticker(&self, symbol: &str, deadline: Deadline) -> Result<Ticker, ExchangeError> {
        self.calls.ticker.fetch_add(1, Ordering::SeqCst);
        conversion::validate_symbol(symbol)?;
        self.respond(deadline).await?;
        if lock(&self.failing_symbols).contains(symbol) {
            return Err(ExchangeError::RequestError("connection reset".to_string()));
        }
        lock(&self.tickers)
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::ApiError {
                code: -1121,
                message: "Invalid symbol.".to_string(),
            })
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: u32,
        deadline: Deadline,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let ticker = self.get_ticker(symbol, deadline).await?;
        let now = self.clock.now_millis();
        Ok((0..i64::from(limit.min(3)))
            .map(|i| Kline {
                symbol: symbol.to_string(),
                interval,
                open_time: now - (i + 1) * 60_000,
                close_time: now - i * 60_000 - 1,
                open: ticker.last_price,
                high: ticker.last_price,
                low: ticker.last_price,
                close: ticker.last_price,
                volume: 0.0,
            })
            .collect())
    }

    async fn get_order_book(
        &self,
        symbol: &str,
        _depth: u32,
        deadline: Deadline,
    ) -> Result<OrderBook, ExchangeError> {
        self.get_ticker(symbol, deadline).await?;
        Ok(OrderBook {
            symbol: symbol.to_string(),
            last_update_id: 1,
            bids: Vec::new(),
            asks: Vec::new(),
        })
    }

    async fn get_wallet(&self, deadline: Deadline) -> Result<Wallet, ExchangeError> {
        self.calls.wallet.fetch_add(1, Ordering::SeqCst);
        // the snapshot reflects the account when the request arrived
        let mut wallet = lock(&self.wallet).clone();
        wallet.updated_at = self.clock.now();
        self.respond(deadline).await?;
        if let Some(error) = lock(&self.wallet_failures).pop_front() {
            return Err(error);
        }
        Ok(wallet)
    }

    async fn place_order(
        &self,
        order: &OrderRequest,
        deadline: Deadline,
    ) -> Result<Order, ExchangeError> {
        self.calls.orders.fetch_add(1, Ordering::SeqCst);
        conversion::validate_symbol(&order.symbol)?;
        self.respond(deadline).await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let now = self.clock.now();
        let placed = Order {
            client_id: order.client_order_id.clone().unwrap_or_else(|| id.clone()),
            exchange_id: Some(id.clone()),
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: conversion::decimal_to_f64(order.quantity).unwrap_or_default(),
            price: order.price.and_then(conversion::decimal_to_f64),
            status: OrderStatus::New,
            created_at: now,
            updated_at: now,
            filled_qty: 0.0,
        };
        lock(&self.orders).insert(id, placed.clone());
        Ok(placed)
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        deadline: Deadline,
    ) -> Result<Order, ExchangeError> {
        self.respond(deadline).await?;
        let mut order = self.find_order(symbol, order_id)?;
        if !order.apply_update(OrderStatus::Canceled, order.filled_qty, self.clock.now()) {
            return Err(ExchangeError::ApiError {
                code: -2011,
                message: "Unknown order sent.".to_string(),
            });
        }
        lock(&self.orders).insert(order_id.to_string(), order.clone());
        Ok(order)
    }

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
        deadline: Deadline,
    ) -> Result<Order, ExchangeError> {
        self.respond(deadline).await?;
        self.find_order(symbol, order_id)
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
        deadline: Deadline,
    ) -> Result<Vec<Order>, ExchangeError> {
        self.respond(deadline).await?;
        Ok(lock(&self.orders)
            .values()
            .filter(|o| !o.status.is_terminal())
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn validate_keys(&self, deadline: Deadline) -> Result<bool, ExchangeError> {
        self.respond(deadline).await?;
        Ok(self.keys_valid.load(Ordering::SeqCst))
    }

    async fn get_new_coins(&self, deadline: Deadline) -> Result<Vec<NewCoin>, ExchangeError> {
        self.calls.new_coins.fetch_add(1, Ordering::SeqCst);
        self.respond(deadline).await?;
        Ok(lock(&self.new_coins).clone())
    }

    async fn create_listen_key(&self, deadline: Deadline) -> Result<ListenKey, ExchangeError> {
        let n = self.calls.listen_key_create.fetch_add(1, Ordering::SeqCst) + 1;
        self.respond(deadline).await?;
        Ok(ListenKey::issue(format!("key-{}", n), Instant::now()))
    }

    async fn renew_listen_key(&self, _token: &str, deadline: Deadline) -> Result<(), ExchangeError> {
        self.calls.listen_key_renew.fetch_add(1, Ordering::SeqCst);
        self.respond(deadline).await?;
        let failed = self
            .renew_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ExchangeError::RequestError("keepalive failed".to_string()));
        }
        Ok(())
    }

    async fn close_listen_key(&self, token: &str, deadline: Deadline) -> Result<(), ExchangeError> {
        self.calls.listen_key_close.fetch_add(1, Ordering::SeqCst);
        self.respond(deadline).await?;
        lock(&self.closed_keys).push(token.to_string());
        Ok(())
    }
}

/// User-data stream driven by the test instead of a socket
#[derive(Default)]
pub struct InMemoryUserStream {
    state: Mutex<Option<StreamState>>,
    handler: Mutex<Option<WalletDeltaHandler>>,
    hook: Mutex<Option<ReconnectHook>>,
    connects: AtomicUsize,
    reject_auth: AtomicBool,
}

impl InMemoryUserStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_authentication(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Deliver a delta as if it arrived on the account channel.
    /// Returns false if no handler is installed.
    pub fn push_delta(&self, balance: AssetBalance, at: DateTime<Utc>) -> bool {
        let handler = lock(&self.handler).clone();
        match handler {
            Some(handler) => {
                handler(balance, at);
                true
            }
            None => false,
        }
    }

    /// Pretend the connection dropped and came back
    pub fn simulate_reconnect(&self) {
        let hook = lock(&self.hook).clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn set_state(&self, state: StreamState) {
        *lock(&self.state) = Some(state);
    }
}

#[async_trait]
impl WsUserData for InMemoryUserStream {
    async fn connect(&self, _deadline: Deadline) -> Result<(), ExchangeError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.set_state(StreamState::Authenticating);
        Ok(())
    }

    async fn authenticate(&self, _deadline: Deadline) -> Result<(), ExchangeError> {
        if self.reject_auth.load(Ordering::SeqCst) {
            self.set_state(StreamState::Disconnected);
            return Err(ExchangeError::AuthError("subscription rejected".to_string()));
        }
        self.set_state(StreamState::Subscribed);
        Ok(())
    }

    async fn subscribe_to_account_updates(
        &self,
        handler: WalletDeltaHandler,
    ) -> Result<(), ExchangeError> {
        *lock(&self.handler) = Some(handler);
        Ok(())
    }

    async fn set_reconnect_hook(&self, hook: ReconnectHook) {
        *lock(&self.hook) = Some(hook);
    }

    fn state(&self) -> StreamState {
        lock(&self.state).unwrap_or(StreamState::Disconnected)
    }

    async fn close(&self) -> Result<(), ExchangeError> {
        self.set_state(StreamState::Closed);
        Ok(())
    }
}
