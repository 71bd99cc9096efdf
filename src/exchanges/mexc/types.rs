use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Ids arrive as either JSON strings or numbers depending on the endpoint
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MexcTicker24h {
    pub symbol: String,
    pub price_change_percent: String,
    pub last_price: String,
    pub high_price: String,
    pub low_price: String,
    pub volume: String,
    #[serde(default)]
    pub close_time: Option<i64>,
}

/// One candle: `[openTime, open, high, low, close, volume, closeTime, quoteVolume]`
pub type MexcRestKline = Vec<Value>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MexcDepth {
    #[serde(default)]
    pub last_update_id: i64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MexcBalance {
    pub asset: String,
    pub free: String,
    pub locked: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MexcAccountInfo {
    #[serde(default)]
    pub can_trade: Option<bool>,
    #[serde(default)]
    pub update_time: Option<i64>,
    pub balances: Vec<MexcBalance>,
}

/// Reply to `POST /api/v3/order`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MexcOrderAck {
    pub symbol: String,
    #[serde(deserialize_with = "string_or_number")]
    pub order_id: String,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    pub orig_qty: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    #[serde(default)]
    pub transact_time: Option<i64>,
}

/// Order as returned by the query, cancel and open-orders endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MexcOrder {
    pub symbol: String,
    #[serde(deserialize_with = "string_or_number")]
    pub order_id: String,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    pub orig_qty: String,
    #[serde(default)]
    pub executed_qty: Option<String>,
    pub status: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub update_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MexcSymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default)]
    pub is_spot_trading_allowed: Option<bool>,
}

impl MexcSymbolInfo {
    /// Status `1` (or the textual forms some gateways use) means open for trading
    pub fn is_tradable(&self) -> bool {
        matches!(self.status.as_str(), "1" | "ENABLED" | "TRADING")
            && self.is_spot_trading_allowed.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MexcExchangeInfo {
    pub symbols: Vec<MexcSymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MexcListenKey {
    pub listen_key: String,
}

// WebSocket Types

#[derive(Debug, Clone, Serialize)]
pub struct MexcWsRequest<'a> {
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a [String]>,
}

/// Acknowledgement of a `SUBSCRIPTION` request
#[derive(Debug, Clone, Deserialize)]
pub struct MexcWsAck {
    #[serde(default)]
    pub id: i64,
    pub code: i64,
    pub msg: String,
}

/// Private account push: `f`/`l` are post-change absolute values
#[derive(Debug, Clone, Deserialize)]
pub struct MexcAccountDelta {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "f")]
    pub free: String,
    #[serde(rename = "l")]
    pub locked: String,
    #[serde(rename = "c", default)]
    pub change_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MexcAccountPush {
    #[serde(rename = "c")]
    pub channel: String,
    #[serde(rename = "d")]
    pub data: MexcAccountDelta,
    #[serde(rename = "t", default)]
    pub timestamp: Option<i64>,
}
