//! Connection pool: node membership, health bookkeeping and selection.
//!
//! The pool owns every [`Connection`] together with its health state. Health changes only
//! through [`ConnectionPool::mark_alive`], [`ConnectionPool::mark_dead`] and resurrect
//! claiming; membership changes only through add/remove/[`ConnectionPool::update`]. All of
//! it sits behind one mutex, so a sniff update can never interleave with a mark call on
//! the same connection.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backoff::ResurrectBackoff;
use crate::clock::{Clock, SystemClock};
use crate::connection::{Connection, ConnectionStatus, NodeDescriptor, Roles};
use crate::error::{Result, TransportError};

/// A single node role, used by [`NodeFilter::Role`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Cluster management.
    Master,
    /// Data.
    Data,
    /// Ingest.
    Ingest,
    /// Machine learning.
    Ml,
}

/// Which connections may serve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeFilter {
    /// Every node except dedicated master nodes.
    #[default]
    ExcludeMasterOnly,
    /// Every node.
    Any,
    /// Only nodes carrying this role.
    Role(Role),
}

impl NodeFilter {
    /// True when `roles` passes the filter.
    pub fn accepts(&self, roles: Roles) -> bool {
        match self {
            NodeFilter::ExcludeMasterOnly => !roles.is_master_only(),
            NodeFilter::Any => true,
            NodeFilter::Role(Role::Master) => roles.master,
            NodeFilter::Role(Role::Data) => roles.data,
            NodeFilter::Role(Role::Ingest) => roles.ingest,
            NodeFilter::Role(Role::Ml) => roles.ml,
        }
    }
}

/// How an alive connection is picked among candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// Rotate over insertion order.
    #[default]
    RoundRobin,
    /// Uniformly at random.
    Random,
}

/// Configuration for the connection pool.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// Quarantine schedule for dead connections.
    pub resurrect_backoff: ResurrectBackoff,
    /// Alive-connection selection policy.
    pub selector: Selector,
}

/// Point-in-time view of one connection and its health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// The connection.
    pub connection: Arc<Connection>,
    /// Health status.
    pub status: ConnectionStatus,
    /// Consecutive failures since last alive.
    pub dead_count: u32,
    /// Instant before which the timer-driven resurrect path skips this connection.
    pub resurrect_at: Option<Instant>,
}

/// Statistics about the connection pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of connections.
    pub total: usize,
    /// Number of alive connections.
    pub alive: usize,
    /// Number of dead connections.
    pub dead: usize,
}

/// Result of reconciling the pool against a node list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Ids added.
    pub added: Vec<String>,
    /// Ids removed.
    pub removed: Vec<String>,
    /// Ids kept with their health untouched.
    pub retained: Vec<String>,
}

impl UpdateSummary {
    /// True when membership did not change.
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// A connection handed out by [`ConnectionPool::get_connection`].
#[derive(Debug, Clone)]
pub struct Selection {
    /// The selected connection.
    pub connection: Arc<Connection>,
    /// `Dead` when no alive candidate existed and this is a resurrection attempt.
    pub status: ConnectionStatus,
}

/// Internal state for a single connection.
#[derive(Debug)]
struct Slot {
    connection: Arc<Connection>,
    status: ConnectionStatus,
    dead_count: u32,
    resurrect_at: Option<Instant>,
}

impl Slot {
    fn new(connection: Connection) -> Self {
        Self {
            connection: Arc::new(connection),
            status: ConnectionStatus::Alive,
            dead_count: 0,
            resurrect_at: None,
        }
    }

    fn id(&self) -> &str {
        self.connection.id()
    }

    fn elapsed(&self, now: Instant) -> bool {
        self.resurrect_at.map_or(true, |at| at <= now)
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            connection: Arc::clone(&self.connection),
            status: self.status,
            dead_count: self.dead_count,
            resurrect_at: self.resurrect_at,
        }
    }
}

/// Health-aware pool of cluster connections.
#[derive(Debug)]
pub struct ConnectionPool {
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    /// Slots in insertion order; ids are unique.
    slots: Mutex<Vec<Slot>>,
    /// Round-robin cursor, advanced on every selection.
    cursor: AtomicUsize,
}

impl ConnectionPool {
    /// Creates an empty pool using the system clock.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates an empty pool reading time from `clock`.
    pub fn with_clock(config: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            slots: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// The pool's clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Adds a connection; fails if its id is already present.
    pub fn add_connection(&self, descriptor: &NodeDescriptor) -> Result<Arc<Connection>> {
        let connection = Connection::from_descriptor(descriptor)?;
        let mut slots = self.slots.lock();
        if slots.iter().any(|s| s.id() == connection.id()) {
            return Err(TransportError::Configuration(format!(
                "connection with id {} already exists",
                connection.id()
            )));
        }
        let slot = Slot::new(connection);
        let handle = Arc::clone(&slot.connection);
        debug!("Added connection {} to pool", handle);
        slots.push(slot);
        Ok(handle)
    }

    /// Adds every descriptor, stopping at the first error.
    pub fn add_nodes(&self, descriptors: &[NodeDescriptor]) -> Result<()> {
        for descriptor in descriptors {
            self.add_connection(descriptor)?;
        }
        Ok(())
    }

    /// Removes a connection. Returns false if it was not present.
    pub fn remove_connection(&self, id: &str) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|s| s.id() != id);
        let removed = slots.len() != before;
        if removed {
            debug!("Removed connection {} from pool", id);
        }
        removed
    }

    /// Removes every connection.
    pub fn empty(&self) {
        self.slots.lock().clear();
    }

    /// Number of connections.
    pub fn size(&self) -> usize {
        self.slots.lock().len()
    }

    /// True when at least one connection is alive.
    pub fn has_alive(&self) -> bool {
        self.slots
            .lock()
            .iter()
            .any(|s| s.status == ConnectionStatus::Alive)
    }

    /// Snapshot of one connection.
    pub fn snapshot(&self, id: &str) -> Option<ConnectionSnapshot> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.id() == id)
            .map(Slot::snapshot)
    }

    /// Snapshots of every connection, in insertion order.
    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        self.slots.lock().iter().map(Slot::snapshot).collect()
    }

    /// Gets pool-wide statistics.
    pub fn stats(&self) -> PoolStats {
        let slots = self.slots.lock();
        let alive = slots
            .iter()
            .filter(|s| s.status == ConnectionStatus::Alive)
            .count();
        PoolStats {
            total: slots.len(),
            alive,
            dead: slots.len() - alive,
        }
    }

    /// Selects the connection for the next attempt.
    ///
    /// Alive candidates (matching `filter`, not in `exclude`) are preferred using the
    /// configured selector. Without one, dead candidates whose resurrect timeout has
    /// elapsed are returned least recently failed first, flagged
    /// [`ConnectionStatus::Dead`]. Returns `None` if nothing qualifies.
    pub fn get_connection(&self, filter: &NodeFilter, exclude: &[String]) -> Option<Selection> {
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let slots = self.slots.lock();

        let candidates: Vec<&Slot> = slots
            .iter()
            .filter(|s| filter.accepts(s.connection.roles()))
            .filter(|s| !exclude.iter().any(|id| id == s.id()))
            .collect();

        let alive: Vec<&Slot> = candidates
            .iter()
            .copied()
            .filter(|s| s.status == ConnectionStatus::Alive)
            .collect();

        if !alive.is_empty() {
            let index = match self.config.selector {
                Selector::RoundRobin => cursor % alive.len(),
                Selector::Random => rand::thread_rng().gen_range(0..alive.len()),
            };
            let slot = alive[index];
            debug!("Selected alive connection {}", slot.id());
            return Some(Selection {
                connection: Arc::clone(&slot.connection),
                status: ConnectionStatus::Alive,
            });
        }

        let revivable = candidates
            .iter()
            .copied()
            .filter(|s| s.status == ConnectionStatus::Dead && s.elapsed(now))
            .min_by_key(|s| (s.dead_count, s.resurrect_at))?;
        debug!(
            "No alive connection, selecting dead connection {} (dead_count={})",
            revivable.id(),
            revivable.dead_count
        );
        Some(Selection {
            connection: Arc::clone(&revivable.connection),
            status: ConnectionStatus::Dead,
        })
    }

    /// Claims the dead connection whose resurrect timeout elapsed first.
    ///
    /// The claimed connection's timer is re-armed with its current backoff so that
    /// concurrent requests do not evaluate it twice; its dead count is unchanged.
    pub fn begin_resurrect(&self, filter: &NodeFilter) -> Option<Arc<Connection>> {
        let now = self.clock.now();
        let mut slots = self.slots.lock();
        let slot = slots
            .iter_mut()
            .filter(|s| s.status == ConnectionStatus::Dead)
            .filter(|s| filter.accepts(s.connection.roles()))
            .filter(|s| s.elapsed(now))
            .min_by_key(|s| s.resurrect_at)?;
        slot.resurrect_at = Some(now + self.config.resurrect_backoff.delay(slot.dead_count));
        Some(Arc::clone(&slot.connection))
    }

    /// Marks a connection alive and resets its dead count. Idempotent.
    pub fn mark_alive(&self, id: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.id() == id) {
            if slot.status == ConnectionStatus::Dead {
                info!(
                    "Connection {} is alive again after {} failure(s)",
                    id, slot.dead_count
                );
            }
            slot.status = ConnectionStatus::Alive;
            slot.dead_count = 0;
            slot.resurrect_at = None;
        }
    }

    /// Marks a connection dead and pushes its resurrect timeout out.
    pub fn mark_dead(&self, id: &str) {
        let now = self.clock.now();
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.id() == id) {
            slot.status = ConnectionStatus::Dead;
            slot.dead_count = slot.dead_count.saturating_add(1);
            let delay = self.config.resurrect_backoff.delay(slot.dead_count);
            slot.resurrect_at = Some(now + delay);
            warn!(
                "Marked connection {} dead (dead_count={}, resurrect in {}s)",
                id,
                slot.dead_count,
                delay.as_secs()
            );
        }
    }

    /// Reconciles membership with a discovered node list.
    ///
    /// Unknown nodes are added alive, missing nodes are removed, and retained nodes keep
    /// their health. A node whose id is unknown but whose URL matches an existing
    /// connection is retained and re-keyed to the new id.
    pub fn update(&self, nodes: &[NodeDescriptor]) -> Result<UpdateSummary> {
        let incoming = nodes
            .iter()
            .map(Connection::from_descriptor)
            .collect::<Result<Vec<_>>>()?;

        let mut seen = HashSet::new();
        for connection in &incoming {
            if !seen.insert(connection.id().to_string()) {
                return Err(TransportError::Configuration(format!(
                    "duplicate node id {} in update",
                    connection.id()
                )));
            }
        }

        let mut slots = self.slots.lock();
        let mut previous: Vec<Option<Slot>> = slots.drain(..).map(Some).collect();
        // retained slots keep their position; new ones go to the end
        let mut kept: Vec<Option<Slot>> = previous.iter().map(|_| None).collect();
        let mut fresh = Vec::new();
        let mut summary = UpdateSummary::default();

        for connection in incoming {
            let by_id = previous
                .iter()
                .position(|s| s.as_ref().is_some_and(|s| s.id() == connection.id()));
            let by_url = || {
                previous.iter().position(|s| {
                    s.as_ref()
                        .is_some_and(|s| s.connection.url() == connection.url())
                })
            };
            let matched = by_id
                .or_else(by_url)
                .and_then(|i| previous[i].take().map(|slot| (i, slot)));
            match matched {
                Some((i, mut slot)) => {
                    if slot.id() != connection.id() {
                        debug!("Re-keyed connection {} to {}", slot.id(), connection.id());
                        slot.connection = Arc::new(slot.connection.with_id(connection.id()));
                    }
                    kept[i] = Some(slot);
                }
                None => {
                    summary.added.push(connection.id().to_string());
                    fresh.push(Slot::new(connection));
                }
            }
        }

        summary.removed = previous
            .into_iter()
            .flatten()
            .map(|s| s.id().to_string())
            .collect();
        let mut next: Vec<Slot> = kept.into_iter().flatten().collect();
        summary.retained = next.iter().map(|s| s.id().to_string()).collect();
        next.extend(fresh);
        *slots = next;

        if !summary.is_unchanged() {
            info!(
                "Pool updated: {} added, {} removed, {} retained",
                summary.added.len(),
                summary.removed.len(),
                summary.retained.len()
            );
        }
        Ok(summary)
    }
}
