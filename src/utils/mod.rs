pub mod testing;

pub use testing::{InMemoryRest, InMemoryUserStream};
