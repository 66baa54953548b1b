//! Connection registry: at most one live connection per remote SKI.
//!
//! When both nodes dial each other at the same time, each ends up with an
//! inbound and an outbound connection for the same peer. Both sides must
//! keep the same one, so the winner is decided by comparing SKIs: the node
//! with the greater SKI keeps the connection it initiated.

use crate::connection::ShipConnectionHandle;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shiplink_types::ConnectionRole;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Result of [`ConnectionRegistry::register`].
#[derive(Debug)]
pub enum RegisterOutcome {
    /// No live connection existed for this SKI.
    Registered,
    /// The new connection won; the returned one must be closed.
    Replaced(ShipConnectionHandle),
    /// An existing connection won; the new one must be closed.
    Rejected,
}

/// Thread-safe map from remote SKI to its connection.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    local_ski: String,
    entries: Arc<DashMap<String, ShipConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new(local_ski: &str) -> Self {
        Self {
            local_ski: local_ski.to_string(),
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Role of the connection that survives a simultaneous dial with `remote_ski`.
    pub fn preferred_role(&self, remote_ski: &str) -> ConnectionRole {
        if self.local_ski.as_str() > remote_ski {
            ConnectionRole::Client
        } else {
            ConnectionRole::Server
        }
    }

    /// Register a new connection, resolving a double connection if needed.
    pub fn register(&self, handle: ShipConnectionHandle) -> RegisterOutcome {
        let ski = handle.remote_ski().to_string();
        match self.entries.entry(ski) {
            Entry::Vacant(slot) => {
                slot.insert(handle);
                RegisterOutcome::Registered
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if !existing.is_alive() {
                    debug!(ski = %existing.remote_ski(), "SHIP: replacing dead connection entry");
                    slot.insert(handle);
                    return RegisterOutcome::Registered;
                }
                let new_wins = existing.role() == handle.role()
                    || handle.role() == self.preferred_role(handle.remote_ski());
                if new_wins {
                    info!(
                        ski = %handle.remote_ski(),
                        kept = %handle.role(),
                        "SHIP: double connection, keeping the new one"
                    );
                    RegisterOutcome::Replaced(slot.insert(handle))
                } else {
                    info!(
                        ski = %handle.remote_ski(),
                        kept = %existing.role(),
                        "SHIP: double connection, keeping the existing one"
                    );
                    RegisterOutcome::Rejected
                }
            }
        }
    }

    /// Remove the entry for `ski`, but only if it still belongs to connection `id`.
    pub fn unregister(&self, ski: &str, id: Uuid) -> bool {
        self.entries
            .remove_if(ski, |_, handle| handle.id() == id)
            .is_some()
    }

    pub fn lookup(&self, ski: &str) -> Option<ShipConnectionHandle> {
        self.entries.get(ski).map(|entry| entry.value().clone())
    }

    /// Snapshot of all registered connections.
    pub fn handles(&self) -> Vec<ShipConnectionHandle> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
