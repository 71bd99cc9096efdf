pub mod new_coins;
pub mod poller;

pub use new_coins::{NewCoinAlertPayload, NewCoinWatcher};
pub use poller::{MarketDataPayload, MarketPoller};
