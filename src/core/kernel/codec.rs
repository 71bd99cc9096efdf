use crate::core::errors::ExchangeError;
use tokio_tungstenite::tungstenite::Message;

/// Converts between raw WebSocket frames and an exchange's typed messages.
///
/// Control frames (ping, pong, close) never reach the codec; the transport
/// handles them.
pub trait WsCodec: Send + Sync + 'static {
    type Message: Send + Sync;

    /// Build the frame that subscribes to `channels`
    fn encode_subscription(&self, channels: &[String]) -> Result<Message, ExchangeError>;

    /// `Ok(None)` means the frame was understood and deliberately ignored
    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ExchangeError>;
}
