//! In-process broadcast hub relaying domain events to UI WebSocket clients.

pub mod broker;
pub mod envelope;
pub mod server;
pub mod session;

pub use broker::{new_hub, with_capacity, Frame, Hub, HubHandle, SessionId};
pub use envelope::{Envelope, Inbound, MessageType, SubscribePayload};
pub use server::serve;
pub use session::{run_session, SessionConfig};
