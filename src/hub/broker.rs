use crate::core::clock::Clock;
use crate::core::errors::ExchangeError;
use crate::core::shutdown::ShutdownSignal;
use crate::hub::envelope::{Envelope, MessageType};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Outbound queue capacity per session; a session that falls this far behind is evicted
pub const SESSION_QUEUE_CAPACITY: usize = 256;
pub const BROADCAST_QUEUE_CAPACITY: usize = 1024;

pub type SessionId = u64;

/// Pre-encoded envelope shared by every session queue
pub type Frame = Arc<str>;

struct Registration {
    id: SessionId,
    outbound: mpsc::Sender<Frame>,
    added: oneshot::Sender<()>,
}

/// Hub event loop. Owns the session set; see [`HubHandle`] for the public side.
pub struct Hub {
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::UnboundedReceiver<SessionId>,
    broadcast_rx: mpsc::Receiver<Envelope>,
    sessions: HashMap<SessionId, mpsc::Sender<Frame>>,
    session_count: Arc<AtomicUsize>,
}

/// Cloneable entry point for producers and sessions
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::UnboundedSender<SessionId>,
    broadcast_tx: mpsc::Sender<Envelope>,
    next_id: Arc<AtomicU64>,
    session_count: Arc<AtomicUsize>,
    session_capacity: usize,
    clock: Arc<dyn Clock>,
}

pub fn new_hub(clock: Arc<dyn Clock>) -> (Hub, HubHandle) {
    with_capacity(clock, BROADCAST_QUEUE_CAPACITY, SESSION_QUEUE_CAPACITY)
}

pub fn with_capacity(
    clock: Arc<dyn Clock>,
    broadcast_capacity: usize,
    session_capacity: usize,
) -> (Hub, HubHandle) {
    let (register_tx, register_rx) = mpsc::channel(64);
    let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
    let (broadcast_tx, broadcast_rx) = mpsc::channel(broadcast_capacity);
    let session_count = Arc::new(AtomicUsize::new(0));

    let hub = Hub {
        register_rx,
        unregister_rx,
        broadcast_rx,
        sessions: HashMap::new(),
        session_count: session_count.clone(),
    };
    let handle = HubHandle {
        register_tx,
        unregister_tx,
        broadcast_tx,
        next_id: Arc::new(AtomicU64::new(1)),
        session_count,
        session_capacity,
        clock,
    };
    (hub, handle)
}

impl Hub {
    /// Run until shutdown or until every handle is gone
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        info!("hub started");
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(registration) = self.register_rx.recv() => self.add(registration),
                Some(id) = self.unregister_rx.recv() => self.remove(id, "unregistered"),
                envelope = self.broadcast_rx.recv() => match envelope {
                    Some(envelope) => self.dispatch(&envelope),
                    None => break,
                },
            }
        }

        // dropping the queues ends every write pump
        while let Ok(id) = self.unregister_rx.try_recv() {
            self.sessions.remove(&id);
        }
        let remaining = self.sessions.len();
        self.sessions.clear();
        self.session_count.store(0, Ordering::Relaxed);
        info!(remaining, "hub stopped");
    }

    fn add(&mut self, registration: Registration) {
        self.sessions
            .insert(registration.id, registration.outbound);
        self.session_count
            .store(self.sessions.len(), Ordering::Relaxed);
        debug!(session = registration.id, "session registered");
        let _ = registration.added.send(());
    }

    fn remove(&mut self, id: SessionId, why: &str) {
        if self.sessions.remove(&id).is_some() {
            self.session_count
                .store(self.sessions.len(), Ordering::Relaxed);
            debug!(session = id, why, "session removed");
        }
    }

    fn dispatch(&mut self, envelope: &Envelope) {
        let frame: Frame = match envelope.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(error = %e, kind = ?envelope.kind, "dropping unencodable envelope");
                return;
            }
        };

        let mut evicted = Vec::new();
        for (id, outbound) in &self.sessions {
            match outbound.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session = id, "session queue full, evicting");
                    evicted.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evicted.push(*id),
            }
        }
        for id in evicted {
            self.remove(id, "evicted");
        }
    }
}

impl HubHandle {
    /// Add a session and wait until the hub has it.
    ///
    /// The returned receiver is the session's outbound queue. It closes when the
    /// session is evicted, unregistered, or the hub stops.
    pub async fn register(&self) -> Result<(SessionId, mpsc::Receiver<Frame>), ExchangeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound, rx) = mpsc::channel(self.session_capacity);
        let (added, confirmed) = oneshot::channel();

        self.register_tx
            .send(Registration {
                id,
                outbound,
                added,
            })
            .await
            .map_err(|_| ExchangeError::ConnectionClosed("hub is not running".to_string()))?;
        confirmed
            .await
            .map_err(|_| ExchangeError::ConnectionClosed("hub is not running".to_string()))?;
        Ok((id, rx))
    }

    pub fn unregister(&self, id: SessionId) {
        let _ = self.unregister_tx.send(id);
    }

    /// Queue an envelope for every session, waiting while the hub is backed up
    pub async fn broadcast(&self, envelope: Envelope) -> Result<(), ExchangeError> {
        self.broadcast_tx
            .send(envelope)
            .await
            .map_err(|_| ExchangeError::ConnectionClosed("hub is not running".to_string()))
    }

    /// Like [`broadcast`](Self::broadcast) but drops the envelope if the hub queue is full
    pub fn try_broadcast(&self, envelope: Envelope) -> bool {
        match self.broadcast_tx.try_send(envelope) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "broadcast dropped");
                false
            }
        }
    }

    /// Wrap `payload` in an envelope stamped with the hub clock and broadcast it
    pub async fn publish<P: Serialize>(
        &self,
        kind: MessageType,
        payload: &P,
    ) -> Result<(), ExchangeError> {
        let envelope = Envelope::with_payload(kind, self.now_unix(), payload)?;
        self.broadcast(envelope).await
    }

    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Relaxed)
    }

    pub fn now_unix(&self) -> i64 {
        self.clock.now_millis() / 1000
    }
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("sessions", &self.session_count())
            .field("session_capacity", &self.session_capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::shutdown;
    use serde_json::json;

    fn start(session_capacity: usize) -> (HubHandle, shutdown::ShutdownTrigger) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let (hub, handle) = with_capacity(clock, 16, session_capacity);
        let (trigger, signal) = shutdown::channel();
        tokio::spawn(hub.run(signal));
        (handle, trigger)
    }

    fn tick(n: u64) -> Envelope {
        Envelope::new(MessageType::MarketData, 0, json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_registered_session_receives_broadcast() {
        let (hub, _trigger) = start(8);
        let (_, mut rx) = hub.register().await.unwrap();
        assert_eq!(hub.session_count(), 1);

        hub.publish(MessageType::AccountUpdate, &json!({ "fiat": 10.0 }))
            .await
            .unwrap();
        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "account_update");
        assert_eq!(value["timestamp"], 1_700_000_000);
        assert_eq!(value["payload"]["fiat"], 10.0);
    }

    #[tokio::test]
    async fn test_full_queue_evicts_session() {
        let (hub, _trigger) = start(2);
        let (_, mut stalled) = hub.register().await.unwrap();

        for n in 0..3 {
            hub.broadcast(tick(n)).await.unwrap();
        }
        // the two queued frames drain, then the queue reports closed
        assert!(stalled.recv().await.is_some());
        assert!(stalled.recv().await.is_some());
        assert!(stalled.recv().await.is_none());
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister_closes_queue() {
        let (hub, _trigger) = start(8);
        let (id, mut rx) = hub.register().await.unwrap();
        hub.unregister(id);
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_sessions() {
        let (hub, trigger) = start(8);
        let (_, mut a) = hub.register().await.unwrap();
        let (_, mut b) = hub.register().await.unwrap();
        trigger.trigger();
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert!(hub.register().await.is_err());
    }
}
