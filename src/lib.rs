pub mod account;
pub mod core;
pub mod exchanges;
pub mod hub;
pub mod market;
pub mod store;
pub mod utils;

pub use account::AccountService;
pub use core::{errors::ExchangeError, traits::*, types::*};
pub use exchanges::mexc::{MexcRestClient, MexcUserStream};
pub use hub::{Envelope, HubHandle, MessageType};
pub use market::{MarketPoller, NewCoinWatcher};
