//! Exchange-agnostic transport: signed REST, rate limiting and WebSocket framing.
//!
//! Nothing in here knows about a particular venue. Exchange adapters under
//! `crate::exchanges` supply the endpoint paths, the wire types and a
//! [`WsCodec`], and wire the pieces together in their builders.
//!
//! ```rust,no_run
//! use spotdesk::core::clock::SystemClock;
//! use spotdesk::core::deadline::Deadline;
//! use spotdesk::core::kernel::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), spotdesk::core::errors::ExchangeError> {
//! let signer = Arc::new(HmacSigner::new(
//!     "api_key".to_string(),
//!     "secret_key".to_string(),
//!     Arc::new(SystemClock),
//! ));
//! let rest = RestClientBuilder::new(RestClientConfig::new(
//!     "https://api.mexc.com".to_string(),
//!     "mexc".to_string(),
//! ))
//! .with_signer(signer)
//! .with_rate_limiter(Arc::new(RateLimiter::per_minute(1200, 600, None, None)))
//! .build()?;
//!
//! let deadline = Deadline::after(Duration::from_secs(10));
//! let body = rest
//!     .request(reqwest::Method::GET, "/api/v3/account", &[], true, deadline)
//!     .await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```
pub mod codec;
pub mod rate_limit;
pub mod rest;
pub mod signer;
pub mod ws;

pub use codec::WsCodec;
pub use rate_limit::{EndpointClass, RateLimiter, TokenBucket};
pub use rest::{ReqwestRest, RestClient, RestClientBuilder, RestClientConfig};
pub use signer::{HmacSigner, SignatureResult, Signer};
pub use ws::{TungsteniteWs, WsFrame};
