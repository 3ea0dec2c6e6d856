//! Topology discovery ("sniffing").
//!
//! A sniff asks any reachable node for the cluster's node list and reconciles the pool
//! with it. Only one sniff runs at a time; a failed sniff never changes membership.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::connection::{NodeDescriptor, Roles};
use crate::error::{Result, TransportError};
use crate::events::{EventBus, SniffEvent, TransportEvent};
use crate::metrics::TransportMetrics;
use crate::pool::{ConnectionPool, NodeFilter, UpdateSummary};
use crate::request::RetryableStatusCodes;
use crate::sender::{HttpSender, Method, OutgoingRequest};

/// Default discovery endpoint.
pub const DEFAULT_SNIFF_ENDPOINT: &str = "/_nodes/_all/http";

/// Why a sniff ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SniffReason {
    /// Transport construction with `sniff_on_start`.
    Start,
    /// Periodic refresh.
    Interval,
    /// No connection was left alive after a failure.
    ConnectionFault,
    /// Explicit call.
    Manual,
}

impl fmt::Display for SniffReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SniffReason::Start => "sniff-on-start",
            SniffReason::Interval => "sniff-interval",
            SniffReason::ConnectionFault => "sniff-on-connection-fault",
            SniffReason::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Configuration for sniffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnifferConfig {
    /// Periodic refresh interval; `None` disables interval sniffing.
    pub interval: Option<Duration>,
    /// Sniff when the transport is created.
    pub on_start: bool,
    /// Sniff when a failure leaves no alive connection.
    pub on_connection_fault: bool,
    /// Discovery path.
    pub endpoint: String,
    /// Per-attempt timeout of the discovery request.
    pub timeout: Duration,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        Self {
            interval: None,
            on_start: false,
            on_connection_fault: false,
            endpoint: DEFAULT_SNIFF_ENDPOINT.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Borrowed collaborators of a sniff.
pub(crate) struct SniffContext<'a> {
    pub pool: &'a ConnectionPool,
    pub sender: &'a dyn HttpSender,
    pub events: &'a EventBus,
    pub metrics: &'a TransportMetrics,
    pub unavailable: &'a RetryableStatusCodes,
}

/// Runs discoveries and tracks when the next interval sniff is due.
#[derive(Debug)]
pub struct Sniffer {
    config: SnifferConfig,
    clock: Arc<dyn Clock>,
    in_progress: AtomicBool,
    next_sniff: Mutex<Option<Instant>>,
}

/// Resets the in-progress flag when a sniff ends, however it ends.
struct SniffGuard<'a>(&'a AtomicBool);

impl Drop for SniffGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Sniffer {
    /// Creates a sniffer; the first interval sniff is due one interval from now.
    pub fn new(config: SnifferConfig, clock: Arc<dyn Clock>) -> Self {
        let next_sniff = config.interval.map(|interval| clock.now() + interval);
        Self {
            config,
            clock,
            in_progress: AtomicBool::new(false),
            next_sniff: Mutex::new(next_sniff),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &SnifferConfig {
        &self.config
    }

    /// True while a sniff is running.
    pub fn is_sniffing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// True when interval sniffing is enabled, due, and no sniff is running.
    pub fn interval_due(&self) -> bool {
        let due = self
            .next_sniff
            .lock()
            .is_some_and(|next| self.clock.now() >= next);
        due && !self.is_sniffing()
    }

    /// Discovers the topology and reconciles the pool.
    pub(crate) async fn sniff(
        &self,
        ctx: &SniffContext<'_>,
        reason: SniffReason,
    ) -> Result<Vec<NodeDescriptor>> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sniff ({}) skipped, another sniff is running", reason);
            return Err(TransportError::SniffInProgress);
        }
        let _guard = SniffGuard(&self.in_progress);

        let result = match self.discover(ctx).await {
            Ok(nodes) => ctx.pool.update(&nodes).map(|summary| (nodes, summary)),
            Err(e) => Err(e),
        };

        if let Some(interval) = self.config.interval {
            *self.next_sniff.lock() = Some(self.clock.now() + interval);
        }

        ctx.metrics.record_sniff(result.is_ok());
        match result {
            Ok((nodes, summary)) => {
                log_summary(reason, &summary);
                ctx.events.publish(TransportEvent::Sniff(SniffEvent {
                    reason,
                    result: Ok(nodes.clone()),
                }));
                Ok(nodes)
            }
            Err(e) => {
                warn!("Sniff ({}) failed: {}", reason, e);
                ctx.events.publish(TransportEvent::Sniff(SniffEvent {
                    reason,
                    result: Err(e.to_string()),
                }));
                Err(e)
            }
        }
    }

    /// Asks connections in selection order until one returns a node list.
    async fn discover(&self, ctx: &SniffContext<'_>) -> Result<Vec<NodeDescriptor>> {
        let request = OutgoingRequest::new(Method::Get, self.config.endpoint.clone());
        let mut tried: Vec<String> = Vec::new();
        let mut last_error = None;

        while let Some(selection) = ctx.pool.get_connection(&NodeFilter::Any, &tried) {
            let connection = selection.connection;
            tried.push(connection.id().to_string());

            let outcome = tokio::time::timeout(
                self.config.timeout,
                ctx.sender.send(&connection, &request, self.config.timeout),
            )
            .await;
            let response = match outcome {
                Ok(Ok(response)) if ctx.unavailable.contains(response.status) => {
                    ctx.pool.mark_dead(connection.id());
                    last_error = Some(format!(
                        "{} answered {}",
                        connection.id(),
                        response.status
                    ));
                    continue;
                }
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    ctx.pool.mark_dead(connection.id());
                    last_error = Some(format!("{}: {}", connection.id(), e));
                    continue;
                }
                Err(_) => {
                    ctx.pool.mark_dead(connection.id());
                    last_error = Some(format!("{}: discovery timed out", connection.id()));
                    continue;
                }
            };

            ctx.pool.mark_alive(connection.id());
            if !(200..300).contains(&response.status) {
                return Err(TransportError::Sniff(format!(
                    "{} answered {} to {}",
                    connection.id(),
                    response.status,
                    self.config.endpoint
                )));
            }
            let nodes = parse_nodes(&response.body, connection.url().scheme())?;
            if nodes.is_empty() {
                return Err(TransportError::Sniff(
                    "discovery returned no http-enabled nodes".to_string(),
                ));
            }
            return Ok(nodes);
        }

        Err(TransportError::Sniff(last_error.unwrap_or_else(|| {
            "no connection available for discovery".to_string()
        })))
    }
}

fn log_summary(reason: SniffReason, summary: &UpdateSummary) {
    if summary.is_unchanged() {
        debug!(
            "Sniff ({}) found no membership change ({} nodes)",
            reason,
            summary.retained.len()
        );
    } else {
        info!(
            "Sniff ({}): added {:?}, removed {:?}",
            reason, summary.added, summary.removed
        );
    }
}

#[derive(Debug, Deserialize)]
struct NodesInfo {
    #[serde(default)]
    nodes: BTreeMap<String, NodeInfo>,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    #[serde(default)]
    roles: Option<Vec<String>>,
    #[serde(default)]
    http: Option<HttpInfo>,
}

#[derive(Debug, Deserialize)]
struct HttpInfo {
    publish_address: String,
}

/// Parses a `_nodes/http` response into node descriptors.
///
/// `publish_address` may be `host:port` or `hostname/ip:port`; the latter keeps the
/// hostname. Nodes without HTTP enabled are skipped.
pub fn parse_nodes(body: &[u8], scheme: &str) -> Result<Vec<NodeDescriptor>> {
    let info: NodesInfo = serde_json::from_slice(body)
        .map_err(|e| TransportError::Sniff(format!("invalid nodes response: {}", e)))?;

    let nodes = info
        .nodes
        .into_iter()
        .filter_map(|(id, node)| {
            let http = node.http?;
            let address = publish_host(&http.publish_address);
            let mut descriptor =
                NodeDescriptor::new(format!("{}://{}", scheme, address)).with_id(id);
            if let Some(roles) = node.roles {
                descriptor = descriptor.with_roles(Roles::from_names(&roles));
            }
            Some(descriptor)
        })
        .collect();
    Ok(nodes)
}

fn publish_host(address: &str) -> String {
    match address.split_once('/') {
        Some((hostname, rest)) if !hostname.is_empty() => {
            let port = rest.rsplit_once(':').map(|(_, port)| port);
            match port {
                Some(port) => format!("{}:{}", hostname, port),
                None => hostname.to_string(),
            }
        }
        Some((_, rest)) => rest.to_string(),
        None => address.to_string(),
    }
}
