//! Store connectivity health
//!
//! Flipped by the outcome of store round-trips made anywhere in the process.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Externally observable health of this proxy's presence layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Store unreachable; queries are answered from last-known-good cache
    Degraded { since: DateTime<Utc>, reason: String },
}

impl HealthStatus {
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

#[derive(Debug)]
pub struct HealthTracker {
    status: RwLock<HealthStatus>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: RwLock::new(HealthStatus::Healthy),
        }
    }

    #[must_use]
    pub fn status(&self) -> HealthStatus {
        self.status.read().clone()
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.status.read().is_healthy()
    }

    pub fn record_success(&self) {
        let mut status = self.status.write();
        if let HealthStatus::Degraded { since, .. } = &*status {
            let outage_ms = Utc::now().signed_duration_since(*since).num_milliseconds();
            tracing::info!(outage_ms, "Store connectivity restored");
            *status = HealthStatus::Healthy;
        }
    }

    pub fn record_failure(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut status = self.status.write();
        match &mut *status {
            HealthStatus::Healthy => {
                tracing::warn!(reason = %reason, "Store unavailable, serving last-known-good data");
                *status = HealthStatus::Degraded {
                    since: Utc::now(),
                    reason,
                };
            }
            HealthStatus::Degraded { reason: current, .. } => *current = reason,
        }
    }

    /// Record the outcome of an operation that talked to the store.
    ///
    /// Only `StoreUnavailable` counts as a failure; any other error still
    /// means the store answered.
    pub fn observe<T>(&self, result: &Result<T>) {
        match result {
            Err(Error::StoreUnavailable(reason)) => self.record_failure(reason.clone()),
            Err(Error::Closed) => {}
            _ => self.record_success(),
        }
    }
}
