use crate::core::deadline::Deadline;
use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::WsCodec;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument, warn};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What one read from the socket produced
#[derive(Debug)]
pub enum WsFrame<M> {
    /// A decoded data message
    Data(M),
    /// Reply to one of our pings
    Pong,
    /// Any other frame: server pings (already answered) and codec-ignored data
    Other,
}

/// Tungstenite-based client WebSocket with a pluggable codec.
///
/// Transport only: reconnect policy and heartbeats belong to the caller.
pub struct TungsteniteWs<C: WsCodec> {
    url: String,
    exchange_name: String,
    codec: C,
    write: Option<SplitSink<Stream, Message>>,
    read: Option<SplitStream<Stream>>,
}

impl<C: WsCodec> TungsteniteWs<C> {
    pub fn new(url: String, exchange_name: String, codec: C) -> Self {
        Self {
            url,
            exchange_name,
            codec,
            write: None,
            read: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Point the next `connect` at a different URL (e.g. a fresh listen key)
    pub fn set_url(&mut self, url: String) {
        self.url = url;
    }

    pub fn is_connected(&self) -> bool {
        self.write.is_some()
    }

    #[instrument(skip(self, deadline), fields(exchange = %self.exchange_name))]
    pub async fn connect(&mut self, deadline: Deadline) -> Result<(), ExchangeError> {
        let (stream, _) = deadline
            .run("websocket connect", async {
                connect_async(self.url.as_str()).await.map_err(|e| {
                    ExchangeError::RequestError(format!("WebSocket connection failed: {}", e))
                })
            })
            .await?;

        let (write, read) = stream.split();
        self.write = Some(write);
        self.read = Some(read);
        debug!("websocket connected");
        Ok(())
    }

    pub async fn send_raw(&mut self, msg: Message, deadline: Deadline) -> Result<(), ExchangeError> {
        let write = self.write.as_mut().ok_or_else(|| {
            ExchangeError::ConnectionClosed("WebSocket not connected".to_string())
        })?;

        let sent = deadline
            .run("websocket send", async move { write.send(msg).await.map_err(ExchangeError::from) })
            .await;
        if let Err(ref e) = sent {
            if !e.is_deadline() {
                self.drop_connection();
            }
        }
        sent
    }

    pub async fn subscribe(
        &mut self,
        channels: &[String],
        deadline: Deadline,
    ) -> Result<(), ExchangeError> {
        if channels.is_empty() {
            return Ok(());
        }
        let message = self.codec.encode_subscription(channels)?;
        self.send_raw(message, deadline).await
    }

    pub async fn ping(&mut self, deadline: Deadline) -> Result<(), ExchangeError> {
        self.send_raw(Message::Ping(Vec::new()), deadline).await
    }

    /// Read the next frame. `None` means the peer closed the connection.
    ///
    /// Cancel-safe: dropping the future loses no data frame.
    pub async fn next_frame(&mut self) -> Option<Result<WsFrame<C::Message>, ExchangeError>> {
        let read = self.read.as_mut()?;
        let message = match read.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                self.drop_connection();
                return Some(Err(e.into()));
            }
            None => {
                self.drop_connection();
                return None;
            }
        };

        match message {
            Message::Close(frame) => {
                debug!(?frame, "websocket closed by peer");
                self.drop_connection();
                None
            }
            Message::Pong(_) => Some(Ok(WsFrame::Pong)),
            Message::Ping(payload) => {
                if let Some(write) = self.write.as_mut() {
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        warn!("Failed to send pong response: {}", e);
                    }
                }
                Some(Ok(WsFrame::Other))
            }
            Message::Frame(_) => Some(Ok(WsFrame::Other)),
            data => match self.codec.decode_message(data) {
                Ok(Some(decoded)) => Some(Ok(WsFrame::Data(decoded))),
                Ok(None) => Some(Ok(WsFrame::Other)),
                Err(e) => Some(Err(e)),
            },
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut write) = self.write.take() {
            let _ = write.send(Message::Close(None)).await;
        }
        self.read = None;
    }

    fn drop_connection(&mut self) {
        self.write = None;
        self.read = None;
    }
}
