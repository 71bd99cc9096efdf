pub mod builder;
pub mod codec;
pub mod converters;
pub mod listen_key;
pub mod rest;
pub mod types;
pub mod user_stream;

// Re-export main types for easier importing
pub use builder::{build_rest, build_rest_with_clock, build_user_stream, MexcRest};
pub use codec::{MexcCodec, MexcMessage, ACCOUNT_CHANNEL};
pub use listen_key::{KeyExpiry, ListenKeyRenewer, ListenKeySlot};
pub use rest::MexcRestClient;
pub use user_stream::{MexcUserStream, UserStreamConfig};
