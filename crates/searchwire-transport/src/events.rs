//! Observability event channel.
//!
//! The transport publishes request lifecycle, sniff, and resurrect notifications on a
//! bounded broadcast channel. Publishing never blocks; receivers that fall behind lose
//! the oldest events and see `RecvError::Lagged`.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::connection::{Connection, NodeDescriptor};
use crate::resurrect::ResurrectStrategy;
use crate::sender::Method;
use crate::sniffer::SniffReason;

/// Opaque identifier correlating events of one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// An attempt is about to be sent.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    /// Logical request.
    pub request_id: RequestId,
    /// Connection chosen for this attempt.
    pub connection_id: String,
    /// Method.
    pub method: Method,
    /// Path.
    pub path: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Outcome of a logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// A node answered with this status.
    Status(u16),
    /// The request failed; the message is the error's display form.
    Failed(String),
}

/// A logical request finished.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    /// Logical request.
    pub request_id: RequestId,
    /// Connection of the final attempt, if any attempt was made.
    pub connection_id: Option<String>,
    /// Physical attempts made.
    pub attempts: u32,
    /// Final outcome.
    pub outcome: ResponseOutcome,
}

/// A topology discovery finished.
#[derive(Debug, Clone)]
pub struct SniffEvent {
    /// Why the sniff ran.
    pub reason: SniffReason,
    /// Discovered nodes, or the failure message.
    pub result: Result<Vec<NodeDescriptor>, String>,
}

/// A dead connection was evaluated for resurrection.
#[derive(Debug, Clone)]
pub struct ResurrectEvent {
    /// Strategy that evaluated it.
    pub strategy: ResurrectStrategy,
    /// Whether the connection is considered alive afterwards.
    pub is_alive: bool,
    /// The evaluated connection.
    pub connection: Arc<Connection>,
    /// Client name.
    pub name: String,
    /// Client version.
    pub version: &'static str,
    /// Logical request that triggered the evaluation.
    pub request_id: RequestId,
}

/// Everything published on the channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// See [`RequestEvent`].
    Request(RequestEvent),
    /// See [`ResponseEvent`].
    Response(ResponseEvent),
    /// See [`SniffEvent`].
    Sniff(SniffEvent),
    /// See [`ResurrectEvent`].
    Resurrect(ResurrectEvent),
}

/// Broadcast bus carrying [`TransportEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TransportEvent>,
}

impl EventBus {
    /// Creates a bus holding at most `capacity` undelivered events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event; returns the number of receivers it reached.
    pub fn publish(&self, event: TransportEvent) -> usize {
        // send only fails when nobody is subscribed
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.subscribe()
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
