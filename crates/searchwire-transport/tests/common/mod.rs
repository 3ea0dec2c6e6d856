//! Common test utilities: a scripted sender and an in-process HTTP node cluster.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use searchwire_transport::{
    Connection, HttpSender, ManualClock, Method, NodeDescriptor, OutgoingRequest, RawResponse,
    SendError, SendErrorKind, Transport, TransportConfig, TransportEvent,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub type Reply = Result<RawResponse, SendError>;

pub fn ok(status: u16) -> Reply {
    Ok(RawResponse::empty(status))
}

pub fn refused() -> Reply {
    Err(SendError::new(SendErrorKind::ConnectionRefused, "connection refused"))
}

pub fn json_reply(body: serde_json::Value) -> Reply {
    Ok(RawResponse {
        status: 200,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: body.to_string().into(),
    })
}

/// One call seen by [`MockSender`].
#[derive(Debug, Clone)]
pub struct Call {
    pub connection_id: String,
    pub method: Method,
    pub path: String,
}

/// Per-node behavior of [`MockSender`].
#[derive(Default)]
struct NodeScript {
    requests: VecDeque<Reply>,
    pings: VecDeque<Reply>,
    fallback: Option<Reply>,
    ping_fallback: Option<Reply>,
}

/// Sender answering from per-connection scripts. Pings (`HEAD /`) are scripted
/// separately from other requests; unscripted calls answer 200.
#[derive(Default)]
pub struct MockSender {
    nodes: Mutex<HashMap<String, NodeScript>>,
    calls: Mutex<Vec<Call>>,
}

impl MockSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues replies for non-ping requests to `id`.
    pub fn script(&self, id: &str, replies: Vec<Reply>) {
        self.nodes
            .lock()
            .entry(id.to_string())
            .or_default()
            .requests
            .extend(replies);
    }

    /// Queues replies for pings to `id`.
    pub fn script_pings(&self, id: &str, replies: Vec<Reply>) {
        self.nodes
            .lock()
            .entry(id.to_string())
            .or_default()
            .pings
            .extend(replies);
    }

    /// Makes every unscripted call to `id` (pings included) answer `reply`.
    pub fn always(&self, id: &str, reply: Reply) {
        let mut nodes = self.nodes.lock();
        let node = nodes.entry(id.to_string()).or_default();
        node.fallback = Some(reply.clone());
        node.ping_fallback = Some(reply);
    }

    /// Simulates a killed node.
    pub fn kill(&self, id: &str) {
        self.always(id, refused());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Non-ping calls to `id`.
    pub fn requests_to(&self, id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.connection_id == id && !is_ping(c.method, &c.path))
            .count()
    }

    /// Pings sent to `id`.
    pub fn pings_to(&self, id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.connection_id == id && is_ping(c.method, &c.path))
            .count()
    }
}

fn is_ping(method: Method, path: &str) -> bool {
    method == Method::Head && path == "/"
}

#[async_trait]
impl HttpSender for MockSender {
    async fn send(
        &self,
        connection: &Connection,
        request: &OutgoingRequest,
        _timeout: Duration,
    ) -> Reply {
        self.calls.lock().push(Call {
            connection_id: connection.id().to_string(),
            method: request.method,
            path: request.path.clone(),
        });
        let ping = is_ping(request.method, &request.path);
        let mut nodes = self.nodes.lock();
        let Some(node) = nodes.get_mut(connection.id()) else {
            return ok(200);
        };
        let (queue, fallback) = if ping {
            (&mut node.pings, &node.ping_fallback)
        } else {
            (&mut node.requests, &node.fallback)
        };
        queue
            .pop_front()
            .or_else(|| fallback.clone())
            .unwrap_or_else(|| ok(200))
    }
}

/// Config with `node0..nodeN` at distinct fake addresses.
pub fn cluster_config(count: usize) -> TransportConfig {
    TransportConfig {
        nodes: (0..count)
            .map(|i| NodeDescriptor::new(format!("http://10.1.0.{}:9200", i + 1)).with_id(format!("node{i}")))
            .collect(),
        ..TransportConfig::default()
    }
}

pub fn transport(config: TransportConfig, sender: Arc<MockSender>) -> (Transport, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let transport = Transport::with_clock(config, sender, clock.clone()).unwrap();
    (transport, clock)
}

/// Drains every event currently buffered.
pub fn drain(rx: &mut broadcast::Receiver<TransportEvent>) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// An address nothing listens on.
pub fn dead_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

struct NodeState {
    name: String,
    status: AtomicU16,
    hits: AtomicUsize,
    nodes: Mutex<serde_json::Value>,
}

/// A search node served over real HTTP by axum.
pub struct TestNode {
    pub addr: SocketAddr,
    state: Arc<NodeState>,
    task: JoinHandle<()>,
}

impl TestNode {
    pub async fn start(name: &str) -> Self {
        let state = Arc::new(NodeState {
            name: name.to_string(),
            status: AtomicU16::new(200),
            hits: AtomicUsize::new(0),
            nodes: Mutex::new(json!({ "nodes": {} })),
        });
        let app = Router::new()
            .route("/", get(root))
            .route("/_nodes/_all/http", get(nodes_info))
            .route("/echo", get(echo).post(echo))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Status answered by `/` and `/echo` from now on.
    pub fn set_status(&self, status: u16) {
        self.state.status.store(status, Ordering::SeqCst);
    }

    /// Body served by the discovery endpoint.
    pub fn set_nodes(&self, nodes: serde_json::Value) {
        *self.state.nodes.lock() = nodes;
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn status_of(state: &NodeState) -> StatusCode {
    StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::OK)
}

async fn root(State(state): State<Arc<NodeState>>) -> (StatusCode, Json<serde_json::Value>) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    (
        status_of(&state),
        Json(json!({ "name": state.name, "tagline": "You Know, for Search" })),
    )
}

async fn nodes_info(State(state): State<Arc<NodeState>>) -> Json<serde_json::Value> {
    Json(state.nodes.lock().clone())
}

async fn echo(
    State(state): State<Arc<NodeState>>,
    headers: axum::http::HeaderMap,
    body: String,
) -> (StatusCode, [(&'static str, &'static str); 1], Json<serde_json::Value>) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    (
        status_of(&state),
        [("warning", "299 searchwire-test \"echo is deprecated\"")],
        Json(json!({
            "node": state.name,
            "body": body,
            "user_agent": header("user-agent"),
            "opaque_id": header("x-opaque-id"),
            "content_type": header("content-type"),
        })),
    )
}
