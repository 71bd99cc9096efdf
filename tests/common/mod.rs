#![allow(dead_code)]

//! Loopback stand-ins for the exchange: a canned-JSON axum app and a
//! user-data WebSocket server the test can push into or cut off.

use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub const ACCOUNT_CHANNEL: &str = "spot@private.account.v3.api";

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let give_up = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < give_up,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: HashMap<String, String>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone)]
struct Canned {
    status: u16,
    body: String,
}

#[derive(Clone, Default)]
struct MockState {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    routes: Arc<Mutex<HashMap<(String, String), Canned>>>,
}

/// Records every request and answers from the route table
async fn answer(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    let path = uri.path().to_string();
    let key = (method.as_str().to_string(), path.clone());
    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.as_str().to_string(),
        path,
        query: uri.query().unwrap_or_default().to_string(),
        headers: headers
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect(),
    });

    let canned = state.routes.lock().unwrap().get(&key).cloned().unwrap_or(Canned {
        status: 404,
        body: r#"{"code":-1,"msg":"no route"}"#.to_string(),
    });
    (
        StatusCode::from_u16(canned.status).unwrap(),
        [(header::CONTENT_TYPE, "application/json")],
        canned.body,
    )
}

/// Exchange REST stand-in: an axum app on a loopback port with a canned route table
pub struct MockRest {
    addr: SocketAddr,
    state: MockState,
    task: JoinHandle<()>,
}

impl MockRest {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = MockState::default();
        let app = Router::new().fallback(answer).with_state(state.clone());
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state, task }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn respond(&self, method: &str, path: &str, status: u16, body: &str) {
        self.state.routes.lock().unwrap().insert(
            (method.to_string(), path.to_string()),
            Canned {
                status,
                body: body.to_string(),
            },
        );
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, method: &str, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }
}

impl Drop for MockRest {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone)]
enum StreamCommand {
    Push(String),
    /// Drop the TCP connection without a close handshake
    Cut,
}

struct StreamServerState {
    commands: broadcast::Sender<StreamCommand>,
    connections: AtomicUsize,
    subscribed: AtomicUsize,
    /// Subscriptions still to be refused with a non-zero ack code
    rejections: AtomicUsize,
    paths: Mutex<Vec<String>>,
}

/// User-data WebSocket server that acks the account subscription
pub struct MockUserStreamServer {
    addr: SocketAddr,
    state: Arc<StreamServerState>,
    task: JoinHandle<()>,
}

impl MockUserStreamServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (commands, _) = broadcast::channel(64);
        let state = Arc::new(StreamServerState {
            commands,
            connections: AtomicUsize::new(0),
            subscribed: AtomicUsize::new(0),
            rejections: AtomicUsize::new(0),
            paths: Mutex::new(Vec::new()),
        });

        let task = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve_stream(stream, state.clone()));
                }
            })
        };

        Self { addr, state, task }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Sessions that completed the account subscription
    pub fn subscribed(&self) -> usize {
        self.state.subscribed.load(Ordering::SeqCst)
    }

    /// Request targets seen during the WebSocket handshake
    pub fn paths(&self) -> Vec<String> {
        self.state.paths.lock().unwrap().clone()
    }

    pub fn push_account(&self, asset: &str, free: &str, locked: &str, at_ms: i64) {
        let frame = format!(
            r#"{{"c":"{}","d":{{"a":"{}","f":"{}","l":"{}","c":{}}},"t":{}}}"#,
            ACCOUNT_CHANNEL, asset, free, locked, at_ms, at_ms
        );
        let _ = self.state.commands.send(StreamCommand::Push(frame));
    }

    /// Refuse the next `count` subscriptions
    pub fn reject_subscriptions(&self, count: usize) {
        self.state.rejections.store(count, Ordering::SeqCst);
    }

    /// Kill every live session
    pub fn cut_connections(&self) {
        let _ = self.state.commands.send(StreamCommand::Cut);
    }
}

impl Drop for MockUserStreamServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_stream(tcp: TcpStream, state: Arc<StreamServerState>) {
    let handshake_state = state.clone();
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        handshake_state
            .paths
            .lock()
            .unwrap()
            .push(request.uri().to_string());
        Ok(response)
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);

    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) if text.contains("SUBSCRIPTION") => break,
            Some(Ok(_)) => {}
            _ => return,
        }
    }

    let rejected = state
        .rejections
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if rejected {
        let nack = r#"{"id":0,"code":700002,"msg":"listen key rejected"}"#;
        let _ = ws.send(Message::Text(nack.to_string())).await;
        return;
    }

    let mut commands = state.commands.subscribe();
    let ack = format!(r#"{{"id":0,"code":0,"msg":"{}"}}"#, ACCOUNT_CHANNEL);
    if ws.send(Message::Text(ack)).await.is_err() {
        return;
    }
    state.subscribed.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Ok(StreamCommand::Push(frame)) => {
                    if ws.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
                Ok(StreamCommand::Cut) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
            incoming = ws.next() => match incoming {
                Some(Ok(_)) => {}
                _ => return,
            },
        }
    }
}
