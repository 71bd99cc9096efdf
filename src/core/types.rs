use crate::core::errors::ExchangeError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Limit => "LIMIT",
            Self::Market => "MARKET",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum TimeInForce {
    GTC,
    IOC,
    FOK,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GTC => "GTC",
            Self::IOC => "IOC",
            Self::FOK => "FOK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal statuses are absorbing: no further update may leave them
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }

    /// Map the exchange's status string onto the domain enum
    pub fn from_exchange(status: &str) -> Option<Self> {
        match status {
            "NEW" => Some(Self::New),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FILLED" => Some(Self::Filled),
            "CANCELED" | "CANCELLED" | "PARTIALLY_CANCELED" => Some(Self::Canceled),
            "REJECTED" => Some(Self::Rejected),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Closed set of candle intervals the REST client accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KlineInterval {
    #[serde(rename = "1m")]
    Minutes1,
    #[serde(rename = "5m")]
    Minutes5,
    #[serde(rename = "15m")]
    Minutes15,
    #[serde(rename = "1h")]
    Hours1,
    #[serde(rename = "4h")]
    Hours4,
    #[serde(rename = "1d")]
    Days1,
}

impl KlineInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minutes1 => "1m",
            Self::Minutes5 => "5m",
            Self::Minutes15 => "15m",
            Self::Hours1 => "1h",
            Self::Hours4 => "4h",
            Self::Days1 => "1d",
        }
    }
}

impl FromStr for KlineInterval {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::Minutes1),
            "5m" => Ok(Self::Minutes5),
            "15m" => Ok(Self::Minutes15),
            "1h" => Ok(Self::Hours1),
            "4h" => Ok(Self::Hours4),
            "1d" => Ok(Self::Days1),
            other => Err(ExchangeError::InvalidParameters(format!(
                "unsupported kline interval: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for KlineInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Balance of one asset. `total` is always `free + locked`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
    pub total: f64,
    pub last_price_quote: Option<f64>,
}

impl AssetBalance {
    pub fn new(asset: impl Into<String>, free: f64, locked: f64) -> Self {
        Self {
            asset: asset.into(),
            free,
            locked,
            total: free + locked,
            last_price_quote: None,
        }
    }

    #[must_use]
    pub fn with_last_price(mut self, price: f64) -> Self {
        self.last_price_quote = Some(price);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceSource {
    RestSnapshot,
    WsDelta,
}

/// Point-in-time view of the account, with the quote-asset (fiat) holding broken out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub assets: HashMap<String, AssetBalance>,
    pub fiat: f64,
    pub generated_at: DateTime<Utc>,
    pub source: Option<BalanceSource>,
}

impl Balance {
    pub fn from_wallet(wallet: &Wallet, quote_asset: &str, source: Option<BalanceSource>) -> Self {
        Self {
            fiat: wallet.total_of(quote_asset),
            assets: wallet.balances.clone(),
            generated_at: wallet.updated_at,
            source,
        }
    }
}

/// Canonical mapping of asset to balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub balances: HashMap<String, AssetBalance>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn empty(at: DateTime<Utc>) -> Self {
        Self {
            balances: HashMap::new(),
            updated_at: at,
        }
    }

    pub fn from_balances(balances: impl IntoIterator<Item = AssetBalance>, at: DateTime<Utc>) -> Self {
        Self {
            balances: balances
                .into_iter()
                .map(|b| (b.asset.clone(), b))
                .collect(),
            updated_at: at,
        }
    }

    pub fn get(&self, asset: &str) -> Option<&AssetBalance> {
        self.balances.get(asset)
    }

    pub fn total_of(&self, asset: &str) -> f64 {
        self.balances.get(asset).map_or(0.0, |b| b.total)
    }

    /// Replace one asset's entry, keeping `updated_at` monotonic
    pub fn apply_delta(&mut self, balance: AssetBalance, at: DateTime<Utc>) {
        let balance = AssetBalance {
            total: balance.free + balance.locked,
            ..balance
        };
        self.balances.insert(balance.asset.clone(), balance);
        self.touch(at);
    }

    /// Advance `updated_at` to `at` unless that would move it backwards
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }
}

/// Order submission; quantities stay decimal until they are on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            time_in_force: None,
            client_order_id: None,
        }
    }

    pub fn limit(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            time_in_force: Some(TimeInForce::GTC),
            client_order_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub client_id: String,
    pub exchange_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_qty: f64,
}

impl Order {
    /// Apply a status query result. Returns false when the order is already terminal.
    pub fn apply_update(&mut self, status: OrderStatus, filled_qty: f64, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.filled_qty = filled_qty.clamp(self.filled_qty, self.quantity);
        if at > self.updated_at {
            self.updated_at = at;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub volume_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub price_change_pct: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub interval: KlineInterval,
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub last_update_id: i64,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

/// A symbol that is announced or freshly listed on the exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewCoin {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub status: String,
}

/// Credential for the user-data stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenKey {
    pub token: String,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl ListenKey {
    /// The exchange keeps a key alive for 60 minutes after the last keepalive
    pub const VALIDITY: std::time::Duration = std::time::Duration::from_secs(60 * 60);

    pub fn issue(token: impl Into<String>, now: Instant) -> Self {
        Self {
            token: token.into(),
            issued_at: now,
            expires_at: now + Self::VALIDITY,
        }
    }

    pub fn renewed(&self, now: Instant) -> Self {
        Self {
            token: self.token.clone(),
            issued_at: self.issued_at,
            expires_at: now + Self::VALIDITY,
        }
    }

    pub fn remaining(&self, now: Instant) -> std::time::Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub amount: f64,
    pub balance_after: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionKind {
    Buy,
    Sell,
    Other,
}

impl TransactionKind {
    /// Classify a transaction reason. Frozen: existing persisted records rely on it.
    pub fn classify(reason: &str) -> Self {
        let reason = reason.to_lowercase();
        if ["buy", "purchase", "deposit"]
            .iter()
            .any(|needle| reason.contains(needle))
        {
            Self::Buy
        } else if ["sell", "sale", "withdrawal"]
            .iter()
            .any(|needle| reason.contains(needle))
        {
            Self::Sell
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub current_balance: f64,
    pub deposits: f64,
    pub withdrawals: f64,
    pub net_change: f64,
    pub transaction_count: usize,
    pub period_days: u32,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionAnalysis {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_count: usize,
    pub buy_count: usize,
    pub sell_count: usize,
    pub total_volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRisk {
    pub symbol: String,
    pub exposure_usd: f64,
    pub risk_level: RiskLevel,
}

/// Strict conversions from the exchange's decimal strings
pub mod conversion {
    use super::*;

    /// Parse a decimal string; anything unparseable is a schema error, never zero
    pub fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, ExchangeError> {
        Decimal::from_str(raw.trim())
            .or_else(|_| Decimal::from_scientific(raw.trim()))
            .map_err(|e| ExchangeError::unmarshal(format!("invalid decimal in `{}`: {}", field, e), raw))
    }

    /// Decimal string to f64 at the boundary into domain types
    pub fn parse_f64(field: &str, raw: &str) -> Result<f64, ExchangeError> {
        let value = parse_decimal(field, raw)?;
        decimal_to_f64(value).ok_or_else(|| {
            ExchangeError::unmarshal(format!("`{}` does not fit in f64", field), raw)
        })
    }

    /// Nearest f64 to the exact decimal value
    pub fn decimal_to_f64(value: Decimal) -> Option<f64> {
        value.normalize().to_string().parse::<f64>().ok().filter(|v| v.is_finite())
    }

    /// Upper-case ASCII alphanumerics only, e.g. `BTCUSDT`
    pub fn validate_symbol(symbol: &str) -> Result<(), ExchangeError> {
        let valid = !symbol.is_empty()
            && symbol
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
        if valid {
            Ok(())
        } else {
            Err(ExchangeError::InvalidParameters(format!(
                "symbol must be upper-case alphanumeric: {:?}",
                symbol
            )))
        }
    }
}
