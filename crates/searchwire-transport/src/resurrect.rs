//! Resurrect strategies for dead connections.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::deadline::{bound_timeout, Deadline};
use crate::error::TransportError;
use crate::events::{EventBus, RequestId, ResurrectEvent, TransportEvent};
use crate::metrics::TransportMetrics;
use crate::pool::{ConnectionPool, NodeFilter};
use crate::request::RetryableStatusCodes;
use crate::sender::{HttpSender, OutgoingRequest};

/// Version reported in resurrect events.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Policy applied when a dead connection becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResurrectStrategy {
    /// Probe with `HEAD /` before trusting the node.
    #[default]
    Ping,
    /// Trust the node; the next real request is the probe.
    Optimistic,
    /// Never resurrect through the timer-driven path.
    None,
}

impl ResurrectStrategy {
    /// Lower-case name as used in configuration and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResurrectStrategy::Ping => "ping",
            ResurrectStrategy::Optimistic => "optimistic",
            ResurrectStrategy::None => "none",
        }
    }
}

impl fmt::Display for ResurrectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResurrectStrategy {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ping" => Ok(ResurrectStrategy::Ping),
            "optimistic" => Ok(ResurrectStrategy::Optimistic),
            "none" => Ok(ResurrectStrategy::None),
            other => Err(TransportError::Configuration(format!(
                "unknown resurrect strategy {}",
                other
            ))),
        }
    }
}

/// Everything a resurrect evaluation touches, borrowed from the transport.
pub(crate) struct ResurrectContext<'a> {
    pub pool: &'a ConnectionPool,
    pub sender: &'a dyn HttpSender,
    pub events: &'a EventBus,
    pub metrics: &'a TransportMetrics,
    pub name: &'a str,
    pub request_id: RequestId,
    /// Overall deadline of the request the evaluation runs on behalf of.
    pub deadline: Option<Deadline>,
}

enum PingOutcome {
    Alive,
    Dead,
    /// The request deadline ran out before the node answered.
    Cut,
}

/// Applies a [`ResurrectStrategy`] to dead connections.
#[derive(Debug, Clone)]
pub struct Resurrector {
    strategy: ResurrectStrategy,
    ping_timeout: Duration,
    unavailable: Arc<RetryableStatusCodes>,
}

impl Resurrector {
    /// Creates a resurrector. A ping answered with a status in `unavailable` counts as failed.
    pub fn new(
        strategy: ResurrectStrategy,
        ping_timeout: Duration,
        unavailable: Arc<RetryableStatusCodes>,
    ) -> Self {
        Self {
            strategy,
            ping_timeout,
            unavailable,
        }
    }

    /// Configured strategy.
    pub fn strategy(&self) -> ResurrectStrategy {
        self.strategy
    }

    /// Timer-driven pass: evaluates the dead connection whose timeout elapsed first.
    ///
    /// Returns whether a connection was evaluated and, if so, whether it came back.
    pub(crate) async fn resurrect_due(
        &self,
        ctx: &ResurrectContext<'_>,
        filter: &NodeFilter,
    ) -> Option<bool> {
        if self.strategy == ResurrectStrategy::None
            || ctx.deadline.as_ref().is_some_and(Deadline::is_expired)
        {
            return None;
        }
        let connection = ctx.pool.begin_resurrect(filter)?;
        Some(self.evaluate(ctx, connection).await)
    }

    /// Decides whether a dead connection may serve traffic, updating its health.
    ///
    /// A ping cut short by the request deadline leaves health untouched and publishes
    /// nothing; the connection is reported as not usable.
    pub(crate) async fn evaluate(
        &self,
        ctx: &ResurrectContext<'_>,
        connection: Arc<Connection>,
    ) -> bool {
        let is_alive = match self.strategy {
            ResurrectStrategy::None => return true,
            ResurrectStrategy::Optimistic => {
                ctx.pool.mark_alive(connection.id());
                true
            }
            ResurrectStrategy::Ping => match self.ping(ctx, &connection).await {
                PingOutcome::Alive => {
                    ctx.pool.mark_alive(connection.id());
                    true
                }
                PingOutcome::Dead => {
                    ctx.pool.mark_dead(connection.id());
                    false
                }
                PingOutcome::Cut => return false,
            },
        };

        ctx.metrics.inc_resurrect_attempts();
        if is_alive {
            ctx.metrics.inc_resurrect_successes();
        }
        info!(
            "Resurrect {} on {}: alive={}",
            self.strategy,
            connection.id(),
            is_alive
        );
        ctx.events.publish(TransportEvent::Resurrect(ResurrectEvent {
            strategy: self.strategy,
            is_alive,
            connection,
            name: ctx.name.to_string(),
            version: CLIENT_VERSION,
            request_id: ctx.request_id,
        }));
        is_alive
    }

    async fn ping(&self, ctx: &ResurrectContext<'_>, connection: &Connection) -> PingOutcome {
        let (timeout, deadline_binding) = bound_timeout(ctx.deadline.as_ref(), self.ping_timeout);
        if timeout.is_zero() {
            return PingOutcome::Cut;
        }
        let probe = OutgoingRequest::ping();
        let outcome =
            tokio::time::timeout(timeout, ctx.sender.send(connection, &probe, timeout)).await;
        match outcome {
            Ok(Ok(response)) if self.unavailable.contains(response.status) => PingOutcome::Dead,
            Ok(Ok(_)) => PingOutcome::Alive,
            Ok(Err(e)) => {
                debug!("Ping to {} failed: {}", connection.id(), e);
                PingOutcome::Dead
            }
            Err(_) if deadline_binding => {
                debug!("Ping to {} cut short by the request deadline", connection.id());
                PingOutcome::Cut
            }
            Err(_) => {
                debug!("Ping to {} timed out", connection.id());
                PingOutcome::Dead
            }
        }
    }
}
