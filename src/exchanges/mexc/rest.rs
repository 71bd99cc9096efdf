use crate::core::clock::Clock;
use crate::core::deadline::Deadline;
use crate::core::errors::ExchangeError;
use crate::core::kernel::RestClient;
use crate::core::traits::RestSurface;
use crate::core::types::{
    conversion, Kline, KlineInterval, ListenKey, NewCoin, Order, OrderBook, OrderRequest,
    OrderType, Ticker, Wallet,
};
use crate::exchanges::mexc::converters::{
    convert_account, convert_kline, convert_new_coin, convert_order, convert_order_ack,
    convert_order_book, convert_ticker, interval_to_mexc,
};
use crate::exchanges::mexc::types::{
    MexcAccountInfo, MexcDepth, MexcExchangeInfo, MexcListenKey, MexcOrder, MexcOrderAck,
    MexcRestKline, MexcTicker24h,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

pub const MAX_KLINE_LIMIT: u32 = 1000;
pub const MAX_DEPTH: u32 = 5000;

/// Codes meaning the key or its signature was refused: invalid key, bad key
/// format, bad signature, IP not whitelisted, no permission
const KEY_REJECTION_CODES: [i32; 5] = [10072, 700001, 700002, 700006, 700007];

/// Whether `err` is the exchange refusing these credentials
fn is_key_rejection(err: &ExchangeError) -> bool {
    match err {
        ExchangeError::ApiError { code, .. } => {
            matches!(*code, 401 | 403) || KEY_REJECTION_CODES.contains(code)
        }
        _ => false,
    }
}

/// Typed MEXC spot API on top of a generic `RestClient`
pub struct MexcRestClient<R: RestClient> {
    client: R,
    clock: Arc<dyn Clock>,
    /// Sign market-data reads too, so they draw from the private bucket
    sign_market_data: bool,
}

impl<R: RestClient> MexcRestClient<R> {
    pub fn new(client: R, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            clock,
            sign_market_data: false,
        }
    }

    #[must_use]
    pub fn with_signed_market_data(mut self, signed: bool) -> Self {
        self.sign_market_data = signed;
        self
    }

    pub fn inner(&self) -> &R {
        &self.client
    }
}

fn check_range(name: &str, value: u32, max: u32) -> Result<(), ExchangeError> {
    if value == 0 || value > max {
        return Err(ExchangeError::InvalidParameters(format!(
            "{} must be within 1..={}, got {}",
            name, max, value
        )));
    }
    Ok(())
}

fn validate_order(order: &OrderRequest) -> Result<(), ExchangeError> {
    conversion::validate_symbol(&order.symbol)?;
    if order.quantity.is_sign_negative() || order.quantity.is_zero() {
        return Err(ExchangeError::InvalidParameters(
            "order quantity must be positive".to_string(),
        ));
    }
    match (order.order_type, order.price) {
        (OrderType::Limit, None) => Err(ExchangeError::InvalidParameters(
            "limit orders need a price".to_string(),
        )),
        (OrderType::Limit, Some(price)) if price.is_sign_negative() || price.is_zero() => Err(
            ExchangeError::InvalidParameters("order price must be positive".to_string()),
        ),
        _ => Ok(()),
    }
}

#[async_trait]
impl<R: RestClient> RestSurface for MexcRestClient<R> {
    #[instrument(skip(self, deadline), fields(exchange = "mexc"))]
    async fn get_ticker(&self, symbol: &str, deadline: Deadline) -> Result<Ticker, ExchangeError> {
        conversion::validate_symbol(symbol)?;
        let ticker: MexcTicker24h = self
            .client
            .get_json(
                "/api/v3/ticker/24hr",
                &[("symbol", symbol)],
                self.sign_market_data,
                deadline,
            )
            .await?;
        convert_ticker(ticker, self.clock.now())
    }

    #[instrument(skip(self, deadline), fields(exchange = "mexc"))]
    async fn get_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: u32,
        deadline: Deadline,
    ) -> Result<Vec<Kline>, ExchangeError> {
        conversion::validate_symbol(symbol)?;
        check_range("limit", limit, MAX_KLINE_LIMIT)?;
        let limit = limit.to_string();
        let rows: Vec<MexcRestKline> = self
            .client
            .get_json(
                "/api/v3/klines",
                &[
                    ("symbol", symbol),
                    ("interval", interval_to_mexc(interval)),
                    ("limit", limit.as_str()),
                ],
                self.sign_market_data,
                deadline,
            )
            .await?;
        rows.iter()
            .map(|row| convert_kline(symbol, interval, row))
            .collect()
    }

    #[instrument(skip(self, deadline), fields(exchange = "mexc"))]
    async fn get_order_book(
        &self,
        symbol: &str,
        depth: u32,
        deadline: Deadline,
    ) -> Result<OrderBook, ExchangeError> {
        conversion::validate_symbol(symbol)?;
        check_range("depth", depth, MAX_DEPTH)?;
        let depth = depth.to_string();
        let book: MexcDepth = self
            .client
            .get_json(
                "/api/v3/depth",
                &[("symbol", symbol), ("limit", depth.as_str())],
                self.sign_market_data,
                deadline,
            )
            .await?;
        convert_order_book(symbol, book)
    }

    #[instrument(skip(self, deadline), fields(exchange = "mexc"))]
    async fn get_wallet(&self, deadline: Deadline) -> Result<Wallet, ExchangeError> {
        let account: MexcAccountInfo = self
            .client
            .get_json("/api/v3/account", &[], true, deadline)
            .await?;
        convert_account(&account, self.clock.now())
    }

    #[instrument(skip(self, order, deadline), fields(exchange = "mexc", symbol = %order.symbol, side = order.side.as_str()))]
    async fn place_order(
        &self,
        order: &OrderRequest,
        deadline: Deadline,
    ) -> Result<Order, ExchangeError> {
        validate_order(order)?;

        let quantity = order.quantity.normalize().to_string();
        let price = order.price.map(|p| p.normalize().to_string());
        let mut params = vec![
            ("symbol", order.symbol.as_str()),
            ("side", order.side.as_str()),
            ("type", order.order_type.as_str()),
            ("quantity", quantity.as_str()),
        ];
        if let Some(price) = price.as_deref() {
            params.push(("price", price));
        }
        if let Some(client_id) = order.client_order_id.as_deref() {
            params.push(("newClientOrderId", client_id));
        }

        let ack: MexcOrderAck = self
            .client
            .post_json("/api/v3/order", &params, true, deadline)
            .await?;
        debug!(order_id = %ack.order_id, "order accepted");
        convert_order_ack(
            ack,
            order.client_order_id.as_deref().unwrap_or_default(),
            self.clock.now(),
        )
    }

    #[instrument(skip(self, deadline), fields(exchange = "mexc"))]
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        deadline: Deadline,
    ) -> Result<Order, ExchangeError> {
        conversion::validate_symbol(symbol)?;
        let order: MexcOrder = self
            .client
            .delete_json(
                "/api/v3/order",
                &[("symbol", symbol), ("orderId", order_id)],
                true,
                deadline,
            )
            .await?;
        convert_order(order, self.clock.now())
    }

    #[instrument(skip(self, deadline), fields(exchange = "mexc"))]
    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
        deadline: Deadline,
    ) -> Result<Order, ExchangeError> {
        conversion::validate_symbol(symbol)?;
        let order: MexcOrder = self
            .client
            .get_json(
                "/api/v3/order",
                &[("symbol", symbol), ("orderId", order_id)],
                true,
                deadline,
            )
            .await?;
        convert_order(order, self.clock.now())
    }

    #[instrument(skip(self, deadline), fields(exchange = "mexc"))]
    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
        deadline: Deadline,
    ) -> Result<Vec<Order>, ExchangeError> {
        let mut params = Vec::new();
        if let Some(symbol) = symbol {
            conversion::validate_symbol(symbol)?;
            params.push(("symbol", symbol));
        }
        let orders: Vec<MexcOrder> = self
            .client
            .get_json("/api/v3/openOrders", &params, true, deadline)
            .await?;
        let now = self.clock.now();
        orders
            .into_iter()
            .map(|order| convert_order(order, now))
            .collect()
    }

    #[instrument(skip(self, deadline), fields(exchange = "mexc"))]
    async fn validate_keys(&self, deadline: Deadline) -> Result<bool, ExchangeError> {
        let result: Result<Value, _> = self
            .client
            .get_json("/api/v3/account", &[], true, deadline)
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(ExchangeError::AuthError(reason)) => {
                warn!(%reason, "no credentials to validate");
                Ok(false)
            }
            Err(err) if is_key_rejection(&err) => {
                warn!(error = %err, "exchange rejected API keys");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self, deadline), fields(exchange = "mexc"))]
    async fn get_new_coins(&self, deadline: Deadline) -> Result<Vec<NewCoin>, ExchangeError> {
        let info: MexcExchangeInfo = self
            .client
            .get_json("/api/v3/exchangeInfo", &[], false, deadline)
            .await?;
        Ok(info
            .symbols
            .into_iter()
            .filter(|s| !s.is_tradable())
            .map(convert_new_coin)
            .collect())
    }

    #[instrument(skip(self, deadline), fields(exchange = "mexc"))]
    async fn create_listen_key(&self, deadline: Deadline) -> Result<ListenKey, ExchangeError> {
        let key: MexcListenKey = self
            .client
            .post_json("/api/v3/userDataStream", &[], true, deadline)
            .await?;
        Ok(ListenKey::issue(key.listen_key, tokio::time::Instant::now()))
    }

    #[instrument(skip(self, token, deadline), fields(exchange = "mexc"))]
    async fn renew_listen_key(&self, token: &str, deadline: Deadline) -> Result<(), ExchangeError> {
        let _: Value = self
            .client
            .put_json("/api/v3/userDataStream", &[("listenKey", token)], true, deadline)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, token, deadline), fields(exchange = "mexc"))]
    async fn close_listen_key(&self, token: &str, deadline: Deadline) -> Result<(), ExchangeError> {
        let _: Value = self
            .client
            .delete_json("/api/v3/userDataStream", &[("listenKey", token)], true, deadline)
            .await?;
        Ok(())
    }
}
