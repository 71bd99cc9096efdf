use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.mexc.com";
pub const DEFAULT_WS_URL: &str = "wss://wbs.mexc.com/ws";

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub api_key: Secret<String>,
    pub secret_key: Secret<String>,
    pub base_url: String,
    pub ws_url: String,
    pub cache_ttl_seconds: u64,
    pub public_rate_per_minute: u32,
    pub private_rate_per_minute: u32,
    /// Bucket capacity for public endpoints; defaults to one second worth of tokens
    pub public_burst: Option<u32>,
    /// Bucket capacity for private endpoints; defaults to one second worth of tokens
    pub private_burst: Option<u32>,
    pub poll_interval_ms: u64,
    pub listen_key_renew_interval_ms: u64,
    pub ws_ping_interval_ms: u64,
    pub request_timeout_seconds: u64,
    pub quote_asset: String,
}

// Custom Serialize implementation - never expose secrets in serialization
impl Serialize for ExchangeConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ExchangeConfig", 14)?;
        state.serialize_field("api_key", "[REDACTED]")?;
        state.serialize_field("secret_key", "[REDACTED]")?;
        state.serialize_field("base_url", &self.base_url)?;
        state.serialize_field("ws_url", &self.ws_url)?;
        state.serialize_field("cache_ttl_seconds", &self.cache_ttl_seconds)?;
        state.serialize_field("public_rate_per_minute", &self.public_rate_per_minute)?;
        state.serialize_field("private_rate_per_minute", &self.private_rate_per_minute)?;
        state.serialize_field("public_burst", &self.public_burst)?;
        state.serialize_field("private_burst", &self.private_burst)?;
        state.serialize_field("poll_interval_ms", &self.poll_interval_ms)?;
        state.serialize_field(
            "listen_key_renew_interval_ms",
            &self.listen_key_renew_interval_ms,
        )?;
        state.serialize_field("ws_ping_interval_ms", &self.ws_ping_interval_ms)?;
        state.serialize_field("request_timeout_seconds", &self.request_timeout_seconds)?;
        state.serialize_field("quote_asset", &self.quote_asset)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ExchangeConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ExchangeConfigHelper {
            api_key: String,
            secret_key: String,
            base_url: Option<String>,
            ws_url: Option<String>,
            cache_ttl_seconds: Option<u64>,
            public_rate_per_minute: Option<u32>,
            private_rate_per_minute: Option<u32>,
            public_burst: Option<u32>,
            private_burst: Option<u32>,
            poll_interval_ms: Option<u64>,
            listen_key_renew_interval_ms: Option<u64>,
            ws_ping_interval_ms: Option<u64>,
            request_timeout_seconds: Option<u64>,
            quote_asset: Option<String>,
        }

        let helper = ExchangeConfigHelper::deserialize(deserializer)?;
        let defaults = Self::new(helper.api_key, helper.secret_key);
        Ok(Self {
            base_url: helper.base_url.unwrap_or(defaults.base_url),
            ws_url: helper.ws_url.unwrap_or(defaults.ws_url),
            cache_ttl_seconds: helper
                .cache_ttl_seconds
                .unwrap_or(defaults.cache_ttl_seconds),
            public_rate_per_minute: helper
                .public_rate_per_minute
                .unwrap_or(defaults.public_rate_per_minute),
            private_rate_per_minute: helper
                .private_rate_per_minute
                .unwrap_or(defaults.private_rate_per_minute),
            public_burst: helper.public_burst,
            private_burst: helper.private_burst,
            poll_interval_ms: helper.poll_interval_ms.unwrap_or(defaults.poll_interval_ms),
            listen_key_renew_interval_ms: helper
                .listen_key_renew_interval_ms
                .unwrap_or(defaults.listen_key_renew_interval_ms),
            ws_ping_interval_ms: helper
                .ws_ping_interval_ms
                .unwrap_or(defaults.ws_ping_interval_ms),
            request_timeout_seconds: helper
                .request_timeout_seconds
                .unwrap_or(defaults.request_timeout_seconds),
            quote_asset: helper.quote_asset.unwrap_or(defaults.quote_asset),
            ..defaults
        })
    }
}

impl ExchangeConfig {
    /// Create a new configuration with API credentials and default tuning
    #[must_use]
    pub fn new(api_key: String, secret_key: String) -> Self {
        Self {
            api_key: Secret::new(api_key),
            secret_key: Secret::new(secret_key),
            base_url: DEFAULT_BASE_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            cache_ttl_seconds: 300,
            public_rate_per_minute: 1200,
            private_rate_per_minute: 600,
            public_burst: None,
            private_burst: None,
            poll_interval_ms: 5_000,
            listen_key_renew_interval_ms: 1_800_000,
            ws_ping_interval_ms: 54_000,
            request_timeout_seconds: 30,
            quote_asset: "USDT".to_string(),
        }
    }

    /// Create configuration for read-only operations (market data only)
    #[must_use]
    pub fn read_only() -> Self {
        Self::new(String::new(), String::new())
    }

    /// Create configuration from environment variables
    ///
    /// Expected environment variables:
    /// - `{PREFIX}_API_KEY`, `{PREFIX}_SECRET_KEY`
    /// - `{PREFIX}_BASE_URL`, `{PREFIX}_WS_URL` (optional)
    /// - `{PREFIX}_CACHE_TTL_SECONDS`, `{PREFIX}_PUBLIC_RATE_PER_MINUTE`,
    ///   `{PREFIX}_PRIVATE_RATE_PER_MINUTE`, `{PREFIX}_POLL_INTERVAL_MS`,
    ///   `{PREFIX}_LISTEN_KEY_RENEW_INTERVAL_MS`, `{PREFIX}_WS_PING_INTERVAL_MS`,
    ///   `{PREFIX}_QUOTE_ASSET` (optional)
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.to_uppercase();
        let var = |name: &str| format!("{}_{}", prefix, name);

        let api_key_var = var("API_KEY");
        let secret_key_var = var("SECRET_KEY");
        let api_key = env::var(&api_key_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(api_key_var))?;
        let secret_key = env::var(&secret_key_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(secret_key_var))?;

        let mut config = Self::new(api_key, secret_key);
        if let Ok(base_url) = env::var(var("BASE_URL")) {
            config.base_url = base_url;
        }
        if let Ok(ws_url) = env::var(var("WS_URL")) {
            config.ws_url = ws_url;
        }
        if let Ok(quote) = env::var(var("QUOTE_ASSET")) {
            config.quote_asset = quote;
        }

        config.cache_ttl_seconds = parse_env(&var("CACHE_TTL_SECONDS"), config.cache_ttl_seconds)?;
        config.public_rate_per_minute = parse_env(
            &var("PUBLIC_RATE_PER_MINUTE"),
            config.public_rate_per_minute,
        )?;
        config.private_rate_per_minute = parse_env(
            &var("PRIVATE_RATE_PER_MINUTE"),
            config.private_rate_per_minute,
        )?;
        config.poll_interval_ms = parse_env(&var("POLL_INTERVAL_MS"), config.poll_interval_ms)?;
        config.listen_key_renew_interval_ms = parse_env(
            &var("LISTEN_KEY_RENEW_INTERVAL_MS"),
            config.listen_key_renew_interval_ms,
        )?;
        config.ws_ping_interval_ms =
            parse_env(&var("WS_PING_INTERVAL_MS"), config.ws_ping_interval_ms)?;

        config.validate()?;
        Ok(config)
    }

    /// Create configuration from .env file and environment variables
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(prefix, ".env")
    }

    /// Create configuration from a specific .env file path
    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(_) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // Missing file is fine, system env vars still apply
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env(prefix)
    }

    /// Load configuration trying `.env.local`, `.env.{ENVIRONMENT}` and `.env` in order
    #[cfg(feature = "env-file")]
    pub fn from_env_auto(prefix: &str) -> Result<Self, ConfigError> {
        let env_files = [
            ".env.local".to_string(),
            format!(
                ".env.{}",
                env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
            ),
            ".env".to_string(),
        ];

        for env_file in &env_files {
            match dotenv::from_path(env_file) {
                Ok(_) => break,
                Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                }
                Err(e) => {
                    return Err(ConfigError::InvalidConfiguration(format!(
                        "Failed to load .env file '{}': {}",
                        env_file, e
                    )));
                }
            }
        }

        Self::from_env(prefix)
    }

    /// Reject settings that would stall the rate limiter or the timers
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.is_empty() || self.ws_url.is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "exchange base_url and ws_url must be set".to_string(),
            ));
        }
        if self.public_rate_per_minute == 0 || self.private_rate_per_minute == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "rate limits must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_ms == 0
            || self.listen_key_renew_interval_ms == 0
            || self.ws_ping_interval_ms == 0
        {
            return Err(ConfigError::InvalidConfiguration(
                "intervals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Check if this configuration has credentials for signed requests
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.api_key.expose_secret().is_empty() && !self.secret_key.expose_secret().is_empty()
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = ws_url.into();
        self
    }

    #[must_use]
    pub const fn with_cache_ttl_seconds(mut self, seconds: u64) -> Self {
        self.cache_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub const fn with_rates_per_minute(mut self, public: u32, private: u32) -> Self {
        self.public_rate_per_minute = public;
        self.private_rate_per_minute = private;
        self
    }

    #[must_use]
    pub const fn with_bursts(mut self, public: u32, private: u32) -> Self {
        self.public_burst = Some(public);
        self.private_burst = Some(private);
        self
    }

    #[must_use]
    pub const fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    #[must_use]
    pub const fn with_listen_key_renew_interval_ms(mut self, ms: u64) -> Self {
        self.listen_key_renew_interval_ms = ms;
        self
    }

    #[must_use]
    pub const fn with_ws_ping_interval_ms(mut self, ms: u64) -> Self {
        self.ws_ping_interval_ms = ms;
        self
    }

    #[must_use]
    pub fn with_quote_asset(mut self, quote: impl Into<String>) -> Self {
        self.quote_asset = quote.into();
        self
    }

    /// Get API key (use carefully - exposes secret)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Get secret key (use carefully - exposes secret)
    pub fn secret_key(&self) -> &str {
        self.secret_key.expose_secret()
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn listen_key_renew_interval(&self) -> Duration {
        Duration::from_millis(self.listen_key_renew_interval_ms)
    }

    pub fn ws_ping_interval(&self) -> Duration {
        Duration::from_millis(self.ws_ping_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn parse_env<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| {
            ConfigError::InvalidConfiguration(format!("{} has an invalid value: {}", name, raw))
        }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_exchange_limits() {
        let config = ExchangeConfig::new("ak".to_string(), "sk".to_string());
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.listen_key_renew_interval(), Duration::from_secs(1800));
        assert_eq!(config.ws_ping_interval(), Duration::from_secs(54));
        assert_eq!(config.quote_asset, "USDT");
        assert!(config.has_credentials());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_redacts_secrets() {
        let config = ExchangeConfig::new("my-key".to_string(), "my-secret".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("my-key"));
        assert!(!json.contains("my-secret"));
        assert!(json.contains("[REDACTED]"));
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: ExchangeConfig = serde_json::from_str(
            r#"{"api_key":"a","secret_key":"b","poll_interval_ms":1000}"#,
        )
        .unwrap();
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.private_rate_per_minute, 600);
        assert_eq!(config.api_key(), "a");
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let config = ExchangeConfig::read_only().with_rates_per_minute(0, 10);
        assert!(config.validate().is_err());
        assert!(!config.has_credentials());
    }
}
