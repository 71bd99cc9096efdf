use crate::core::clock::Clock;
use crate::core::errors::ExchangeError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Result type for signing operations: (headers, signed query string)
pub type SignatureResult = Result<(HashMap<String, String>, String), ExchangeError>;

/// Signer trait for request authentication
///
/// Implementations receive the already URL-encoded query (parameters in
/// insertion order, no leading `?`) and return the headers to attach and the
/// final query string to send.
pub trait Signer: Send + Sync {
    /// Sign a request
    ///
    /// # Arguments
    /// * `method` - HTTP method (GET, POST, etc.)
    /// * `endpoint` - API endpoint path
    /// * `query_string` - Encoded query without `timestamp` or `signature`
    fn sign_request(&self, method: &str, endpoint: &str, query_string: &str) -> SignatureResult;
}

/// Header the exchange reads the public API key from
pub const API_KEY_HEADER: &str = "X-MEXC-APIKEY";

/// HMAC-SHA256 query signer.
///
/// Appends `timestamp` (unix ms, never decreasing across calls on one signer)
/// and then `signature`, the lowercase hex HMAC of everything before it.
pub struct HmacSigner {
    api_key: String,
    secret_key: String,
    clock: Arc<dyn Clock>,
    last_timestamp: AtomicI64,
}

impl HmacSigner {
    /// Create a new HMAC signer
    ///
    /// # Arguments
    /// * `api_key` - API key from the exchange
    /// * `secret_key` - Secret key for signing
    /// * `clock` - Wall clock used for request timestamps
    pub fn new(api_key: String, secret_key: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            api_key,
            secret_key,
            clock,
            last_timestamp: AtomicI64::new(0),
        }
    }

    /// Strictly non-decreasing millisecond timestamp
    pub fn next_timestamp(&self) -> i64 {
        let now = self.clock.now_millis();
        let previous = self.last_timestamp.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }

    /// Lowercase hex HMAC-SHA256 of `payload`
    pub fn signature(&self, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ExchangeError::AuthError(format!("Invalid secret key: {}", e)))?;

        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a signed query the way the exchange would
    pub fn verify(&self, signed_query: &str) -> bool {
        let Some((canonical, signature)) = signed_query.rsplit_once("&signature=") else {
            return false;
        };
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes()) else {
            return false;
        };
        mac.update(canonical.as_bytes());
        hex::decode(signature).is_ok_and(|bytes| mac.verify_slice(&bytes).is_ok())
    }
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner").finish_non_exhaustive()
    }
}

impl Signer for HmacSigner {
    fn sign_request(&self, _method: &str, _endpoint: &str, query_string: &str) -> SignatureResult {
        let timestamp = self.next_timestamp();
        let canonical = if query_string.is_empty() {
            format!("timestamp={}", timestamp)
        } else {
            format!("{}&timestamp={}", query_string, timestamp)
        };
        let signature = self.signature(&canonical)?;

        let mut headers = HashMap::new();
        headers.insert(API_KEY_HEADER.to_string(), self.api_key.clone());

        Ok((headers, format!("{}&signature={}", canonical, signature)))
    }
}
