use crate::core::clock::Clock;
use crate::core::deadline::Deadline;
use crate::core::errors::ExchangeError;
use crate::core::kernel::ws::{TungsteniteWs, WsFrame};
use crate::core::shutdown::{self, ShutdownSignal, ShutdownTrigger};
use crate::core::traits::{ReconnectHook, RestSurface, StreamState, WalletDeltaHandler, WsUserData};
use crate::exchanges::mexc::codec::{MexcCodec, MexcMessage, ACCOUNT_CHANNEL};
use crate::exchanges::mexc::converters::{convert_account_delta, millis_to_utc};
use crate::exchanges::mexc::listen_key::{KeyExpiry, ListenKeyRenewer, ListenKeySlot};
use crate::exchanges::mexc::types::MexcAccountPush;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

type Session = TungsteniteWs<MexcCodec>;

/// Timers and limits for the user-data stream
#[derive(Debug, Clone)]
pub struct UserStreamConfig {
    /// Base WebSocket URL; `?listenKey=...` is appended
    pub ws_url: String,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// Connection is considered dead after this long without any frame
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Budget for each connect + authenticate attempt while reconnecting
    pub attempt_timeout: Duration,
    pub renew_interval: Duration,
    pub renew_grace: Duration,
}

impl UserStreamConfig {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            ping_interval: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(10),
            renew_interval: Duration::from_secs(30 * 60),
            renew_grace: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    #[must_use]
    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    #[must_use]
    pub fn with_reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_min = min;
        self.reconnect_max = max;
        self
    }
}

/// Why a connected session stopped pumping
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Lost(ExchangeError),
    /// The listen key could not be kept alive; reconnect with a new one
    KeyExpired,
}

struct Shared {
    rest: Arc<dyn RestSurface>,
    clock: Arc<dyn Clock>,
    config: UserStreamConfig,
    state: watch::Sender<StreamState>,
    shutdown: ShutdownTrigger,
    listen_key: ListenKeySlot,
    key_expired: Arc<KeyExpiry>,
    /// Connected but not yet authenticated session
    pending: Mutex<Option<Session>>,
    handler: RwLock<Option<WalletDeltaHandler>>,
    reconnect_hook: RwLock<Option<ReconnectHook>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// MEXC private user-data stream.
///
/// `connect` obtains a listen key and opens the socket, `authenticate`
/// subscribes to the account channel and hands the socket to a background
/// pump that keeps it alive, reconnecting with backoff when it dies.
#[derive(Clone)]
pub struct MexcUserStream {
    shared: Arc<Shared>,
}

impl MexcUserStream {
    pub fn new(rest: Arc<dyn RestSurface>, clock: Arc<dyn Clock>, config: UserStreamConfig) -> Self {
        let (state, _) = watch::channel(StreamState::Disconnected);
        let (trigger, _) = shutdown::channel();
        Self {
            shared: Arc::new(Shared {
                rest,
                clock,
                config,
                state,
                shutdown: trigger,
                listen_key: Arc::new(Mutex::new(None)),
                key_expired: Arc::new(watch::channel(None).0),
                pending: Mutex::new(None),
                handler: RwLock::new(None),
                reconnect_hook: RwLock::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Watch state transitions
    pub fn state_changes(&self) -> watch::Receiver<StreamState> {
        self.shared.state.subscribe()
    }

    /// Token of the listen key currently in use
    pub async fn listen_key(&self) -> Option<String> {
        self.shared
            .listen_key
            .lock()
            .await
            .as_ref()
            .map(|k| k.token.clone())
    }
}

impl std::fmt::Debug for MexcUserStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MexcUserStream")
            .field("state", &*self.shared.state.borrow())
            .field("ws_url", &self.shared.config.ws_url)
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Closed is terminal; late transitions from the pump are ignored
    fn set_state(&self, state: StreamState) {
        self.state.send_if_modified(|current| {
            if *current == state || *current == StreamState::Closed {
                return false;
            }
            debug!(previous = ?*current, ?state, "user stream state");
            *current = state;
            true
        });
    }

    fn current_state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Make sure a listen key exists (a fresh one when `replace`), then open the socket
    async fn open_session(&self, replace: bool, deadline: Deadline) -> Result<Session, ExchangeError> {
        let token = {
            let mut slot = self.listen_key.lock().await;
            if replace {
                if let Some(old) = slot.take() {
                    if let Err(e) = self.rest.close_listen_key(&old.token, deadline).await {
                        warn!(error = %e, "failed to close replaced listen key");
                    }
                }
            }
            match slot.as_ref() {
                Some(key) => key.token.clone(),
                None => {
                    let key = self.rest.create_listen_key(deadline).await?;
                    let token = key.token.clone();
                    *slot = Some(key);
                    token
                }
            }
        };

        let url = format!("{}?listenKey={}", self.config.ws_url, token);
        let mut session = TungsteniteWs::new(url, "mexc".to_string(), MexcCodec);
        session.connect(deadline).await?;
        Ok(session)
    }

    /// Subscribe to the account channel and wait for the exchange to accept it
    async fn authenticate_session(
        &self,
        session: &mut Session,
        deadline: Deadline,
    ) -> Result<(), ExchangeError> {
        session
            .subscribe(&[ACCOUNT_CHANNEL.to_string()], deadline)
            .await?;

        deadline
            .run("user stream authentication", async {
                loop {
                    match session.next_frame().await {
                        Some(Ok(WsFrame::Data(MexcMessage::Ack(ack)))) => {
                            return if ack.code == 0 {
                                Ok(())
                            } else {
                                Err(ExchangeError::AuthError(format!(
                                    "subscription rejected ({}): {}",
                                    ack.code, ack.msg
                                )))
                            };
                        }
                        Some(Ok(WsFrame::Data(MexcMessage::Account(push)))) => {
                            self.dispatch(push).await;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e @ ExchangeError::UnmarshalError { .. })) => {
                            warn!(error = %e, "ignoring malformed frame");
                        }
                        Some(Err(e)) => return Err(e),
                        None => {
                            return Err(ExchangeError::ConnectionClosed(
                                "closed during authentication".to_string(),
                            ))
                        }
                    }
                }
            })
            .await
    }

    async fn dispatch(&self, push: MexcAccountPush) {
        let balance = match convert_account_delta(&push.data) {
            Ok(balance) => balance,
            Err(e) => {
                warn!(error = %e, "dropping malformed account delta");
                return;
            }
        };
        let at = push
            .data
            .change_time
            .or(push.timestamp)
            .and_then(millis_to_utc)
            .unwrap_or_else(|| self.clock.now());

        let handler = self.handler.read().await.clone();
        if let Some(handler) = handler {
            handler(balance, at);
        }
    }

    /// Whether `token` is still the key this stream uses
    async fn is_current_key(&self, token: &str) -> bool {
        self.listen_key
            .lock()
            .await
            .as_ref()
            .is_some_and(|k| k.token == token)
    }

    /// Read frames and keep the heartbeat going until the session ends
    async fn pump(
        &self,
        session: &mut Session,
        expired: &mut watch::Receiver<Option<String>>,
        shutdown: &mut ShutdownSignal,
    ) -> SessionEnd {
        let cfg = &self.config;
        let mut ping = interval_at(Instant::now() + cfg.ping_interval, cfg.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut read_deadline = Instant::now() + cfg.read_timeout;
        let mut pong_due: Option<Instant> = None;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return SessionEnd::Shutdown,
                Ok(()) = expired.changed() => {
                    let token = expired.borrow_and_update().clone();
                    if let Some(token) = token {
                        if self.is_current_key(&token).await {
                            return SessionEnd::KeyExpired;
                        }
                        debug!("ignoring expiry of a replaced listen key");
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = session.ping(Deadline::after(cfg.write_timeout)).await {
                        return SessionEnd::Lost(e);
                    }
                    if pong_due.is_none() {
                        pong_due = Some(Instant::now() + cfg.pong_timeout);
                    }
                }
                () = sleep_until(read_deadline) => {
                    return SessionEnd::Lost(ExchangeError::DeadlineExceeded("user stream read".to_string()));
                }
                () = sleep_until(pong_due.unwrap_or(read_deadline)), if pong_due.is_some() => {
                    return SessionEnd::Lost(ExchangeError::DeadlineExceeded("user stream pong".to_string()));
                }
                frame = session.next_frame() => {
                    read_deadline = Instant::now() + cfg.read_timeout;
                    match frame {
                        Some(Ok(WsFrame::Pong | WsFrame::Data(MexcMessage::Pong))) => pong_due = None,
                        Some(Ok(WsFrame::Data(MexcMessage::Account(push)))) => self.dispatch(push).await,
                        Some(Ok(_)) => {}
                        Some(Err(e @ ExchangeError::UnmarshalError { .. })) => {
                            warn!(error = %e, "ignoring malformed frame");
                        }
                        Some(Err(e)) => return SessionEnd::Lost(e),
                        None => {
                            return SessionEnd::Lost(ExchangeError::ConnectionClosed(
                                "user stream closed by peer".to_string(),
                            ))
                        }
                    }
                }
            }
        }
    }

    /// Own the authenticated session for its whole life, reconnecting as needed
    async fn run(self: Arc<Self>, mut session: Session, mut shutdown: ShutdownSignal) {
        let mut expired = self.key_expired.subscribe();
        loop {
            let mut replace_key = match self.pump(&mut session, &mut expired, &mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(e) => {
                    warn!(error = %e, "user stream lost");
                    false
                }
                SessionEnd::KeyExpired => true,
            };
            session.close().await;
            self.set_state(StreamState::Reconnecting);

            let mut delay = self.config.reconnect_min;
            let mut attempts = 0u32;
            session = loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("user stream pump stopped while reconnecting");
                        return;
                    }
                    () = sleep(delay) => {}
                }

                attempts += 1;
                match self.reconnect_once(replace_key).await {
                    Ok(session) => break session,
                    Err(e) => {
                        warn!(error = %e, attempts, "user stream reconnect failed");
                        if matches!(e, ExchangeError::AuthError(_)) || attempts >= 2 {
                            // the key itself may be gone
                            replace_key = true;
                        }
                        delay = (delay * 2).min(self.config.reconnect_max);
                    }
                }
            };

            self.set_state(StreamState::Subscribed);
            info!(attempts, "user stream re-authenticated");
            let hook = self.reconnect_hook.read().await.clone();
            if let Some(hook) = hook {
                hook();
            }
        }

        session.close().await;
        debug!("user stream pump stopped");
    }

    async fn reconnect_once(&self, replace_key: bool) -> Result<Session, ExchangeError> {
        let deadline = Deadline::after(self.config.attempt_timeout);
        self.set_state(StreamState::Connecting);
        let mut session = self.open_session(replace_key, deadline).await?;
        self.set_state(StreamState::Authenticating);
        match self.authenticate_session(&mut session, deadline).await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.close().await;
                self.set_state(StreamState::Reconnecting);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl WsUserData for MexcUserStream {
    #[instrument(skip(self, deadline), fields(exchange = "mexc"))]
    async fn connect(&self, deadline: Deadline) -> Result<(), ExchangeError> {
        let shared = &self.shared;
        match shared.current_state() {
            StreamState::Closed => {
                return Err(ExchangeError::ConnectionClosed(
                    "user stream has been closed".to_string(),
                ))
            }
            StreamState::Subscribed | StreamState::Reconnecting => return Ok(()),
            _ => {}
        }

        let mut pending = shared.pending.lock().await;
        if pending.is_some() {
            return Ok(());
        }
        shared.set_state(StreamState::Connecting);
        match shared.open_session(false, deadline).await {
            Ok(session) => {
                *pending = Some(session);
                shared.set_state(StreamState::Authenticating);
                Ok(())
            }
            Err(e) => {
                shared.set_state(StreamState::Disconnected);
                Err(e)
            }
        }
    }

    #[instrument(skip(self, deadline), fields(exchange = "mexc"))]
    async fn authenticate(&self, deadline: Deadline) -> Result<(), ExchangeError> {
        let shared = &self.shared;
        if matches!(
            shared.current_state(),
            StreamState::Subscribed | StreamState::Reconnecting
        ) {
            return Ok(());
        }

        let mut pending = shared.pending.lock().await;
        let Some(mut session) = pending.take() else {
            return Err(ExchangeError::ConnectionClosed(
                "connect must succeed before authenticate".to_string(),
            ));
        };

        match shared.authenticate_session(&mut session, deadline).await {
            Ok(()) => {}
            Err(e) if e.is_deadline() => {
                // still connected; the caller may try again
                *pending = Some(session);
                return Err(e);
            }
            Err(e) => {
                error!(error = %e, "user stream authentication failed");
                session.close().await;
                shared.set_state(StreamState::Disconnected);
                return Err(e);
            }
        }
        drop(pending);

        shared.set_state(StreamState::Subscribed);
        info!("user stream subscribed");

        let renewer = ListenKeyRenewer::new(
            shared.rest.clone(),
            shared.listen_key.clone(),
            shared.config.renew_interval,
            shared.key_expired.clone(),
        )
        .with_grace(shared.config.renew_grace)
        .spawn(shared.shutdown.subscribe());
        let pump = tokio::spawn(shared.clone().run(session, shared.shutdown.subscribe()));

        let mut tasks = shared.tasks.lock().await;
        tasks.push(renewer);
        tasks.push(pump);
        Ok(())
    }

    async fn subscribe_to_account_updates(
        &self,
        handler: WalletDeltaHandler,
    ) -> Result<(), ExchangeError> {
        if self.shared.current_state() == StreamState::Closed {
            return Err(ExchangeError::ConnectionClosed(
                "user stream has been closed".to_string(),
            ));
        }
        *self.shared.handler.write().await = Some(handler);
        Ok(())
    }

    async fn set_reconnect_hook(&self, hook: ReconnectHook) {
        *self.shared.reconnect_hook.write().await = Some(hook);
    }

    fn state(&self) -> StreamState {
        self.shared.current_state()
    }

    #[instrument(skip(self), fields(exchange = "mexc"))]
    async fn close(&self) -> Result<(), ExchangeError> {
        let shared = &self.shared;
        if shared.current_state() == StreamState::Closed {
            return Ok(());
        }
        shared.set_state(StreamState::Closed);
        shared.shutdown.trigger();

        let tasks: Vec<_> = shared.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "user stream task ended abnormally");
            }
        }
        if let Some(mut session) = shared.pending.lock().await.take() {
            session.close().await;
        }

        let key = shared.listen_key.lock().await.take();
        if let Some(key) = key {
            shared
                .rest
                .close_listen_key(&key.token, Deadline::after(shared.config.attempt_timeout))
                .await?;
            info!("listen key closed");
        }
        Ok(())
    }
}
