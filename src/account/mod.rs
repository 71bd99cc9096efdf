//! Account state: TTL-cached wallet, user-stream deltas and subscriber fan-out.

pub mod cache;
pub mod fanout;
pub mod service;

pub use cache::TtlCell;
pub use fanout::{Callback, FanOut, SubscriptionId};
pub use service::{
    AccountService, AccountServiceBuilder, AccountServiceConfig, BalanceCallback, SYNC_REASON,
};
