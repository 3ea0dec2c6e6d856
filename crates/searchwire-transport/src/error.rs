use thiserror::Error;

use crate::request::Response;
use crate::sender::SendError;

/// Errors surfaced by the transport to its callers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The pool had no eligible connection before any attempt was made.
    #[error("no living connections available")]
    NoLivingConnections,

    /// A single attempt failed below HTTP (refused, reset, DNS, attempt timeout).
    #[error("connection error on {connection_id}: {source}")]
    Connection {
        /// Connection the attempt was sent to.
        connection_id: String,
        /// Underlying sender failure.
        #[source]
        source: SendError,
    },

    /// The node answered with a status that signals it cannot serve traffic.
    #[error("node {connection_id} unavailable: status {status}")]
    NodeUnavailable {
        /// Connection that answered.
        connection_id: String,
        /// Status code received.
        status: u16,
    },

    /// The node answered with an application-level error status.
    #[error("response error: status {}", .0.status())]
    Response(Box<Response>),

    /// The retry budget was spent, or every eligible connection was tried.
    #[error("request failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        /// Number of physical attempts made.
        attempts: u32,
        /// Last failure observed.
        #[source]
        source: Box<TransportError>,
    },

    /// Invalid configuration or call-time arguments.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The overall per-call deadline was exceeded.
    #[error("request deadline of {timeout_ms}ms exceeded after {attempts} attempt(s)")]
    Timeout {
        /// Configured deadline in milliseconds.
        timeout_ms: u64,
        /// Attempts started before the deadline hit.
        attempts: u32,
    },

    /// Topology discovery failed.
    #[error("sniff failed: {0}")]
    Sniff(String),

    /// Another sniff is already running.
    #[error("sniff already in progress")]
    SniffInProgress,

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure, e.g. reading a config file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Returns true for failures that count against a node's health.
    pub fn is_node_fault(&self) -> bool {
        matches!(
            self,
            TransportError::Connection { .. } | TransportError::NodeUnavailable { .. }
        )
    }

    /// Status code carried by the error, if the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::NodeUnavailable { status, .. } => Some(*status),
            TransportError::Response(response) => Some(response.status()),
            TransportError::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, TransportError>;
