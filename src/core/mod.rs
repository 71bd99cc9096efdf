pub mod clock;
pub mod config;
pub mod deadline;
pub mod errors;
pub mod kernel;
pub mod retry;
pub mod shutdown;
pub mod traits;
pub mod types;
