use crate::core::deadline::Deadline;
use crate::core::errors::{ExchangeError, RATE_LIMIT_CODE};
use crate::core::kernel::rate_limit::{EndpointClass, RateLimiter};
use crate::core::kernel::signer::Signer;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{instrument, trace, warn};

/// REST client trait for making HTTP requests
///
/// Every call consumes exactly one rate-limiter token (public or private
/// bucket depending on `authenticated`) before it is dispatched, and never
/// retries on its own.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Send a request and return the raw response body of a 2xx reply
    ///
    /// # Arguments
    /// * `method` - HTTP method
    /// * `endpoint` - The API endpoint path
    /// * `query_params` - Query parameters in the order they must be encoded
    /// * `authenticated` - Whether to sign the request
    /// * `deadline` - Gives up with `DeadlineExceeded` once passed
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
        deadline: Deadline,
    ) -> Result<String, ExchangeError>;

    /// Make a GET request with strongly-typed response
    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
        deadline: Deadline,
    ) -> Result<T, ExchangeError> {
        let body = self
            .request(Method::GET, endpoint, query_params, authenticated, deadline)
            .await?;
        decode(&body)
    }

    /// Make a POST request with strongly-typed response. Parameters travel in the query.
    async fn post_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
        deadline: Deadline,
    ) -> Result<T, ExchangeError> {
        let body = self
            .request(Method::POST, endpoint, query_params, authenticated, deadline)
            .await?;
        decode(&body)
    }

    /// Make a PUT request with strongly-typed response
    async fn put_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
        deadline: Deadline,
    ) -> Result<T, ExchangeError> {
        let body = self
            .request(Method::PUT, endpoint, query_params, authenticated, deadline)
            .await?;
        decode(&body)
    }

    /// Make a DELETE request with strongly-typed response
    async fn delete_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
        deadline: Deadline,
    ) -> Result<T, ExchangeError> {
        let body = self
            .request(Method::DELETE, endpoint, query_params, authenticated, deadline)
            .await?;
        decode(&body)
    }
}

/// Decode a response body, keeping the body on failure
pub fn decode<T: DeserializeOwned>(body: &str) -> Result<T, ExchangeError> {
    serde_json::from_str(body).map_err(|e| {
        warn!(error = %e, "response did not match the expected schema");
        ExchangeError::unmarshal(format!("Failed to parse JSON response: {}", e), body)
    })
}

/// URL-encode parameters in insertion order
pub fn encode_query(params: &[(&str, &str)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Error body the exchange returns alongside non-2xx statuses
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i32,
    #[serde(alias = "message")]
    msg: String,
}

/// Map a non-2xx reply onto the error taxonomy
pub fn classify_failure(status: StatusCode, body: &str) -> ExchangeError {
    // 429 is throttling, 418 is the ban that follows ignoring it
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        let message = serde_json::from_str::<ApiErrorBody>(body)
            .map_or_else(|_| body.to_string(), |e| e.msg);
        return ExchangeError::ApiError {
            code: RATE_LIMIT_CODE,
            message,
        };
    }

    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(api) => ExchangeError::ApiError {
            code: api.code,
            message: api.msg,
        },
        // a gateway page rather than an exchange verdict
        Err(_) if status.is_server_error() => {
            ExchangeError::RequestError(format!("HTTP {}: {}", status.as_u16(), body))
        }
        Err(_) => ExchangeError::ApiError {
            code: i32::from(status.as_u16()),
            message: body.to_string(),
        },
    }
}

/// Configuration for the REST client
#[derive(Clone, Debug)]
pub struct RestClientConfig {
    /// Base URL for the API
    pub base_url: String,
    /// Exchange name for logging and tracing
    pub exchange_name: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// User agent string to include in requests
    pub user_agent: String,
}

impl RestClientConfig {
    pub fn new(base_url: String, exchange_name: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            exchange_name,
            timeout_seconds: 30,
            user_agent: concat!("spotdesk/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Builder for creating REST client instances
pub struct RestClientBuilder {
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl RestClientBuilder {
    pub fn new(config: RestClientConfig) -> Self {
        Self {
            config,
            signer: None,
            limiter: None,
        }
    }

    /// Set the signer for authenticated requests
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Share a rate limiter with other clients of the same account
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Build the REST client
    pub fn build(self) -> Result<ReqwestRest, ExchangeError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(self.config.timeout_seconds))
            .user_agent(&self.config.user_agent)
            .build()
            .map_err(|e| ExchangeError::Other(format!("Failed to build HTTP client: {}", e)))?;

        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(RateLimiter::per_minute(1200, 600, None, None)));

        Ok(ReqwestRest {
            client,
            config: self.config,
            signer: self.signer,
            limiter,
        })
    }
}

/// Implementation of `RestClient` using reqwest
#[derive(Clone)]
pub struct ReqwestRest {
    client: Client,
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
    limiter: Arc<RateLimiter>,
}

impl std::fmt::Debug for ReqwestRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestRest")
            .field("config", &self.config)
            .field("has_signer", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl ReqwestRest {
    pub fn has_signer(&self) -> bool {
        self.signer.is_some()
    }

    pub fn config(&self) -> &RestClientConfig {
        &self.config
    }

    /// Build the exact URL that goes on the wire, plus the headers to attach
    fn prepare(
        &self,
        method: &Method,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<(String, Vec<(String, String)>), ExchangeError> {
        let query = encode_query(query_params);

        let (query, headers) = if authenticated {
            let signer = self.signer.as_ref().ok_or_else(|| {
                ExchangeError::AuthError(
                    "Authentication required but no signer provided".to_string(),
                )
            })?;
            let (headers, signed) = signer.sign_request(method.as_str(), endpoint, &query)?;
            (signed, headers.into_iter().collect())
        } else {
            (query, Vec::new())
        };

        let url = if query.is_empty() {
            format!("{}{}", self.config.base_url, endpoint)
        } else {
            format!("{}{}?{}", self.config.base_url, endpoint, query)
        };
        Ok((url, headers))
    }

    async fn dispatch(
        &self,
        method: Method,
        url: String,
        headers: Vec<(String, String)>,
    ) -> Result<String, ExchangeError> {
        let mut request = self.client.request(method, url);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExchangeError::RequestError(format!("Request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            ExchangeError::RequestError(format!("Failed to read response body: {}", e))
        })?;

        trace!(status = %status, body = %body, "response");

        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_failure(status, &body))
        }
    }
}

#[async_trait]
impl RestClient for ReqwestRest {
    #[instrument(skip(self, query_params, deadline), fields(exchange = %self.config.exchange_name, method = %method, endpoint = %endpoint))]
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
        deadline: Deadline,
    ) -> Result<String, ExchangeError> {
        let class = if authenticated {
            EndpointClass::Private
        } else {
            EndpointClass::Public
        };
        self.limiter.acquire(class, deadline).await?;

        // sign after the wait so the timestamp reflects dispatch time
        let (url, headers) = self.prepare(&method, endpoint, query_params, authenticated)?;
        deadline
            .run(endpoint, self.dispatch(method, url, headers))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_query_keeps_insertion_order() {
        let query = encode_query(&[("symbol", "BTCUSDT"), ("limit", "5"), ("a", "x y&z")]);
        assert_eq!(query, "symbol=BTCUSDT&limit=5&a=x+y%26z");
    }

    #[test]
    fn test_429_is_rate_limited() {
        let err = classify_failure(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_api_error_body_is_parsed() {
        let err = classify_failure(
            StatusCode::BAD_REQUEST,
            r#"{"code":-1121,"msg":"Invalid symbol."}"#,
        );
        match err {
            ExchangeError::ApiError { code, message } => {
                assert_eq!(code, -1121);
                assert_eq!(message, "Invalid symbol.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_error_body_uses_status() {
        let err = classify_failure(StatusCode::FORBIDDEN, "<html>forbidden</html>");
        assert!(matches!(err, ExchangeError::ApiError { code: 403, .. }));
    }

    #[test]
    fn test_gateway_failure_is_transport_error() {
        let err = classify_failure(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
        assert!(matches!(err, ExchangeError::RequestError(_)), "got {err:?}");
        assert!(err.is_retriable());

        let err = classify_failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"code":-1001,"msg":"Internal error"}"#,
        );
        assert!(matches!(err, ExchangeError::ApiError { code: -1001, .. }));
    }

    #[test]
    fn test_decode_failure_carries_body() {
        let err = decode::<Vec<u32>>("{\"not\":\"a list\"}").unwrap_err();
        match err {
            ExchangeError::UnmarshalError { body, .. } => assert_eq!(body, "{\"not\":\"a list\"}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
