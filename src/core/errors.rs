use thiserror::Error;

/// Exchange code the venue returns when a caller exceeds its request weight.
pub const RATE_LIMIT_CODE: i32 = -1003;

#[derive(Error, Debug)]
pub enum ExchangeError {
    /// The exchange rejected the request (bad symbol, bad signature, insufficient balance...)
    #[error("API error: {code} - {message}")]
    ApiError { code: i32, message: String },

    /// DNS, TCP, TLS or timeout failure below the HTTP layer
    #[error("Request failed: {0}")]
    RequestError(String),

    /// The response was not the JSON shape we expected
    #[error("Failed to decode response: {message}")]
    UnmarshalError { message: String, body: String },

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::core::config::ConfigError),

    #[error("Other error: {0}")]
    Other(String),
}

impl ExchangeError {
    pub fn unmarshal(message: impl Into<String>, body: impl Into<String>) -> Self {
        Self::UnmarshalError {
            message: message.into(),
            body: body.into(),
        }
    }

    /// True for remote throttling: code -1003 or a message mentioning "rate limit".
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::ApiError { code, message } => {
                *code == RATE_LIMIT_CODE || message.to_lowercase().contains("rate limit")
            }
            _ => false,
        }
    }

    /// Transport failures and throttling may succeed when tried again later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::RequestError(_)) || self.is_rate_limited()
    }

    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        Self::RequestError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Self::ConnectionClosed(err.to_string())
            }
            other => Self::RequestError(format!("WebSocket error: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_by_code() {
        let err = ExchangeError::ApiError {
            code: -1003,
            message: "Too much request weight used".to_string(),
        };
        assert!(err.is_rate_limited());
        assert!(err.is_retriable());
    }

    #[test]
    fn test_rate_limited_by_message() {
        let err = ExchangeError::ApiError {
            code: 700_003,
            message: "Rate Limit exceeded for this key".to_string(),
        };
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_business_rejection_is_not_retriable() {
        let err = ExchangeError::ApiError {
            code: -2010,
            message: "Insufficient balance".to_string(),
        };
        assert!(!err.is_rate_limited());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_unmarshal_keeps_body() {
        let err = ExchangeError::unmarshal("missing field `balances`", "{\"foo\":1}");
        match err {
            ExchangeError::UnmarshalError { body, .. } => assert_eq!(body, "{\"foo\":1}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
