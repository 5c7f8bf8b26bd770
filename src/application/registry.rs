//! Admission control: live session count per client identity.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use metrics::{counter, gauge};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub(crate) const METRIC_SESSIONS_ACTIVE: &str = "bucketcast_sessions_active";
pub(crate) const METRIC_SESSIONS_REJECTED: &str = "bucketcast_sessions_rejected_total";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("identity `{identity}` already holds {limit} sessions")]
    CapacityExceeded { identity: String, limit: u32 },
}

/// Tracks which connections each identity currently holds.
///
/// Admission is decided and recorded under the identity's map entry, so two
/// concurrent connects can never both take the last slot.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    max_per_identity: u32,
    sessions: Arc<DashMap<String, HashSet<Uuid>>>,
}

impl ConnectionRegistry {
    pub fn new(max_per_identity: u32) -> Self {
        Self {
            max_per_identity: max_per_identity.max(1),
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.max_per_identity
    }

    /// Register `connection_id` under `identity`, or reject it when the
    /// identity is already at its limit.
    pub fn admit(&self, identity: &str, connection_id: Uuid) -> Result<SessionGuard, AdmissionError> {
        {
            let mut entry = self.sessions.entry(identity.to_string()).or_default();
            if entry.len() >= self.max_per_identity as usize {
                drop(entry);
                counter!(METRIC_SESSIONS_REJECTED).increment(1);
                warn!(
                    target = "bucketcast::registry",
                    identity,
                    limit = self.max_per_identity,
                    "session rejected at capacity"
                );
                return Err(AdmissionError::CapacityExceeded {
                    identity: identity.to_string(),
                    limit: self.max_per_identity,
                });
            }
            entry.insert(connection_id);
        }

        gauge!(METRIC_SESSIONS_ACTIVE).increment(1.0);
        debug!(
            target = "bucketcast::registry",
            identity,
            connection_id = %connection_id,
            "session admitted"
        );
        Ok(SessionGuard {
            registry: self.clone(),
            identity: identity.to_string(),
            connection_id,
        })
    }

    /// Sessions currently held by `identity`.
    pub fn active(&self, identity: &str) -> usize {
        self.sessions
            .get(identity)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    pub fn total_active(&self) -> usize {
        self.sessions.iter().map(|entry| entry.len()).sum()
    }

    fn release(&self, identity: &str, connection_id: Uuid) {
        let removed = match self.sessions.get_mut(identity) {
            Some(mut entry) => entry.remove(&connection_id),
            None => false,
        };
        self.sessions.remove_if(identity, |_, held| held.is_empty());

        if removed {
            gauge!(METRIC_SESSIONS_ACTIVE).decrement(1.0);
            debug!(
                target = "bucketcast::registry",
                identity,
                connection_id = %connection_id,
                "session released"
            );
        }
    }
}

/// Holds a registry slot; dropping it deregisters the session.
#[derive(Debug)]
pub struct SessionGuard {
    registry: ConnectionRegistry,
    identity: String,
    connection_id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.release(&self.identity, self.connection_id);
    }
}
