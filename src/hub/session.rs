use crate::hub::broker::{Frame, HubHandle, SessionId};
use crate::hub::envelope::{Envelope, Inbound};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Per-connection limits and timers
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_message_size: usize,
    /// Reset each time the client answers a ping
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_size: 512,
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(54),
        }
    }
}

/// Serve one UI connection until either pump stops, then unregister it
pub async fn run_session<S>(ws: WebSocketStream<S>, hub: HubHandle, config: SessionConfig)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (id, outbound) = match hub.register().await {
        Ok(registered) => registered,
        Err(e) => {
            warn!(error = %e, "rejecting UI connection");
            return;
        }
    };
    info!(session = id, "UI session opened");

    let (sink, stream) = ws.split();
    let (reply_tx, reply_rx) = mpsc::channel::<Envelope>(16);

    let mut write = tokio::spawn(write_pump(id, sink, outbound, reply_rx, config.clone()));
    let mut read = tokio::spawn(read_pump(id, stream, reply_tx, hub.clone(), config));

    tokio::select! {
        _ = &mut read => write.abort(),
        _ = &mut write => read.abort(),
    }

    hub.unregister(id);
    info!(session = id, "UI session closed");
}

async fn read_pump<S>(
    id: SessionId,
    mut stream: SplitStream<WebSocketStream<S>>,
    replies: mpsc::Sender<Envelope>,
    hub: HubHandle,
    config: SessionConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut subscriptions = BTreeSet::new();
    let mut read_deadline = Instant::now() + config.read_timeout;

    loop {
        let message = match timeout_at(read_deadline, stream.next()).await {
            Err(_) => {
                debug!(session = id, "read deadline passed");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(session = id, error = %e, "read failed");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        let text = match message {
            Message::Pong(_) => {
                read_deadline = Instant::now() + config.read_timeout;
                continue;
            }
            Message::Close(_) => return,
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(session = id, "binary frame is not UTF-8, closing");
                    return;
                }
            },
            Message::Ping(_) | Message::Frame(_) => continue,
        };

        if text.len() > config.max_message_size {
            warn!(session = id, size = text.len(), "message too large, closing");
            return;
        }

        let now = hub.now_unix();
        let reply = match Inbound::parse(&text) {
            Ok(Inbound::Subscribe(payload) | Inbound::SubscribeTicker(payload)) => {
                let channel = payload.channel.unwrap_or_else(|| "ticker".to_string());
                subscriptions.insert(channel.clone());
                subscriptions.extend(payload.symbols.iter().map(|s| format!("{}:{}", channel, s)));
                debug!(session = id, %channel, symbols = ?payload.symbols, "subscribed");
                Envelope::subscription_success(now, &channel)
            }
            Ok(Inbound::Ping) => Envelope::pong(now),
            Ok(Inbound::Unknown(kind)) => {
                Envelope::error(now, format!("unknown message type: {}", kind))
            }
            Err(e) => Envelope::error(now, e.to_string()),
        };

        if replies.send(reply).await.is_err() {
            return;
        }
    }
}

async fn write_pump<S>(
    id: SessionId,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    mut replies: mpsc::Receiver<Envelope>,
    config: SessionConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            biased;
            reply = replies.recv() => match reply {
                Some(envelope) => match envelope.to_json() {
                    Ok(json) => Message::Text(json),
                    Err(e) => {
                        warn!(session = id, error = %e, "dropping reply");
                        continue;
                    }
                },
                // read pump is gone
                None => break,
            },
            frame = outbound.recv() => match frame {
                Some(frame) => Message::Text(frame.to_string()),
                None => {
                    debug!(session = id, "outbound queue closed");
                    break;
                }
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match timeout(config.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(session = id, error = %e, "write failed");
                return;
            }
            Err(_) => {
                warn!(session = id, "write deadline passed");
                return;
            }
        }
    }

    let _ = timeout(config.write_timeout, sink.send(Message::Close(None))).await;
}
