//! Overall deadline of a logical request.
//!
//! Uses `tokio::time::Instant` so that it follows the runtime clock (and paused time in tests).

use std::time::Duration;

use tokio::time::Instant;

/// Absolute expiry for all attempts of one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    expiry: Instant,
    budget: Duration,
}

impl Deadline {
    /// Creates a deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            expiry: Instant::now() + budget,
            budget,
        }
    }

    /// Returns the remaining time, or `None` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        if self.expiry > now {
            Some(self.expiry - now)
        } else {
            None
        }
    }

    /// Returns `true` if the deadline has expired.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// The budget this deadline was created with.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Clamps `timeout` to the remaining time. Returns the clamped value and whether
    /// the deadline (rather than `timeout`) is the binding limit.
    pub fn bound(&self, timeout: Duration) -> (Duration, bool) {
        match self.remaining() {
            Some(remaining) if remaining < timeout => (remaining, true),
            Some(_) => (timeout, false),
            None => (Duration::ZERO, true),
        }
    }
}

/// Clamps `timeout` by an optional deadline.
pub fn bound_timeout(deadline: Option<&Deadline>, timeout: Duration) -> (Duration, bool) {
    deadline.map_or((timeout, false), |d| d.bound(timeout))
}
