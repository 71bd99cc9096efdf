use crate::core::errors::ExchangeError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Closed set of message types on the UI socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    MarketData,
    TradeNotification,
    NewCoinAlert,
    PortfolioUpdate,
    TradeUpdate,
    AccountUpdate,
    Error,
    SubscriptionSuccess,
    Ping,
    Pong,
    AuthSuccess,
    AuthFailure,
    PerformanceReport,
}

/// `{"type", "timestamp", "payload"}` wrapper for everything sent to UI clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Unix seconds
    pub timestamp: i64,
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: MessageType, timestamp: i64, payload: Value) -> Self {
        Self {
            kind,
            timestamp,
            payload,
        }
    }

    /// Wrap any serializable payload
    pub fn with_payload<P: Serialize>(
        kind: MessageType,
        timestamp: i64,
        payload: &P,
    ) -> Result<Self, ExchangeError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| ExchangeError::Other(format!("Failed to encode payload: {}", e)))?;
        Ok(Self::new(kind, timestamp, payload))
    }

    pub fn error(timestamp: i64, message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            timestamp,
            json!({ "message": message.into() }),
        )
    }

    pub fn pong(timestamp: i64) -> Self {
        Self::new(MessageType::Pong, timestamp, json!({ "timestamp": timestamp }))
    }

    pub fn subscription_success(timestamp: i64, channel: &str) -> Self {
        Self::new(
            MessageType::SubscriptionSuccess,
            timestamp,
            json!({ "channel": channel }),
        )
    }

    pub fn to_json(&self) -> Result<String, ExchangeError> {
        serde_json::to_string(self)
            .map_err(|e| ExchangeError::Other(format!("Failed to encode envelope: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscribePayload {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// Requests a UI client may send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Subscribe(SubscribePayload),
    SubscribeTicker(SubscribePayload),
    Ping,
    Unknown(String),
}

#[derive(Deserialize)]
struct RawInbound {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl Inbound {
    /// Parse `{type, payload}`. Only malformed JSON is an error; unknown types are `Unknown`.
    pub fn parse(text: &str) -> Result<Self, ExchangeError> {
        let raw: RawInbound = serde_json::from_str(text)
            .map_err(|e| ExchangeError::unmarshal(format!("invalid message: {}", e), text))?;

        let subscribe_payload = |payload: Value| -> Result<SubscribePayload, ExchangeError> {
            if payload.is_null() {
                return Ok(SubscribePayload {
                    channel: None,
                    symbols: Vec::new(),
                });
            }
            serde_json::from_value(payload)
                .map_err(|e| ExchangeError::unmarshal(format!("invalid payload: {}", e), text))
        };

        match raw.kind.as_str() {
            "subscribe" => Ok(Self::Subscribe(subscribe_payload(raw.payload)?)),
            "subscribe_ticker" => Ok(Self::SubscribeTicker(subscribe_payload(raw.payload)?)),
            "ping" => Ok(Self::Ping),
            _ => Ok(Self::Unknown(raw.kind)),
        }
    }
}
