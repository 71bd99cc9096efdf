//! In-memory implementations of the persistence collaborators.

pub mod memory;

pub use memory::{MemoryTransactionStore, MemoryWalletStore, StaticPositions};
