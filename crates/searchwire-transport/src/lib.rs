#![warn(missing_docs)]

//! searchwire transport: routes requests across a cluster of search nodes,
//! quarantines failing nodes, resurrects them, and keeps membership in sync via sniffing.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod connection;
pub mod deadline;
pub mod error;
pub mod events;
pub mod http;
pub mod metrics;
pub mod pool;
pub mod request;
pub mod resurrect;
pub mod sender;
pub mod sniffer;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TransportConfig;
pub use connection::{Connection, ConnectionStatus, NodeDescriptor, Roles};
pub use error::{Result, TransportError};
pub use events::{EventBus, RequestId, TransportEvent};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use http::ReqwestSender;
pub use pool::{ConnectionPool, ConnectionSnapshot, NodeFilter, PoolConfig, PoolStats, Selector};
pub use request::{RequestOptions, RequestParams, Response};
pub use resurrect::ResurrectStrategy;
pub use sender::{HttpSender, Method, OutgoingRequest, RawResponse, SendError, SendErrorKind};
pub use sniffer::{SniffReason, SnifferConfig};
pub use transport::Transport;
