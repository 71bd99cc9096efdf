use crate::core::clock::{Clock, SystemClock};
use crate::core::config::ExchangeConfig;
use crate::core::errors::ExchangeError;
use crate::core::kernel::{
    HmacSigner, RateLimiter, ReqwestRest, RestClientBuilder, RestClientConfig,
};
use crate::exchanges::mexc::rest::MexcRestClient;
use crate::exchanges::mexc::user_stream::{MexcUserStream, UserStreamConfig};
use std::sync::Arc;

pub type MexcRest = MexcRestClient<ReqwestRest>;

/// Build the signed, rate-limited REST surface described by `config`
pub fn build_rest(config: &ExchangeConfig) -> Result<MexcRest, ExchangeError> {
    build_rest_with_clock(config, Arc::new(SystemClock))
}

pub fn build_rest_with_clock(
    config: &ExchangeConfig,
    clock: Arc<dyn Clock>,
) -> Result<MexcRest, ExchangeError> {
    config.validate()?;

    let rest_config = RestClientConfig::new(config.base_url.clone(), "mexc".to_string())
        .with_timeout(config.request_timeout_seconds);

    let limiter = Arc::new(RateLimiter::per_minute(
        config.public_rate_per_minute,
        config.private_rate_per_minute,
        config.public_burst,
        config.private_burst,
    ));

    let mut rest_builder = RestClientBuilder::new(rest_config).with_rate_limiter(limiter);

    // Add authentication if credentials are provided
    if config.has_credentials() {
        let signer = Arc::new(HmacSigner::new(
            config.api_key().to_string(),
            config.secret_key().to_string(),
            clock.clone(),
        ));
        rest_builder = rest_builder.with_signer(signer);
    }

    let rest = rest_builder.build()?;
    Ok(MexcRestClient::new(rest, clock).with_signed_market_data(config.has_credentials()))
}

/// Build the user-data stream on top of an already-built REST surface
pub fn build_user_stream(
    config: &ExchangeConfig,
    rest: Arc<MexcRest>,
    clock: Arc<dyn Clock>,
) -> Result<MexcUserStream, ExchangeError> {
    if !config.has_credentials() {
        return Err(ExchangeError::AuthError(
            "the user-data stream needs API credentials".to_string(),
        ));
    }

    let stream_config = UserStreamConfig::new(config.ws_url.clone())
        .with_ping_interval(config.ws_ping_interval())
        .with_renew_interval(config.listen_key_renew_interval());
    Ok(MexcUserStream::new(rest, clock, stream_config))
}
