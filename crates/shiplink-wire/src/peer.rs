//! Upward interfaces between a SHIP connection and the application.
//!
//! [`TrustPolicy`] answers the trust questions a handshake asks;
//! [`ApplicationSink`] receives state changes, learned identities and
//! application payloads. Both are called from the connection's driver task,
//! so implementations must return quickly and must not block.

use shiplink_types::ShipState;
use std::collections::HashMap;
use std::sync::RwLock;

/// Trust decisions the handshake delegates to the application.
pub trait TrustPolicy: Send + Sync {
    /// Whether the peer is already paired. Untrusted peers enter the pending hello.
    fn is_trusted(&self, ski: &str) -> bool;

    /// Whether a pending hello for this peer may keep waiting for a trust decision.
    fn allow_waiting_for_trust(&self, ski: &str) -> bool;

    /// Called once when an untrusted peer enters the pending hello.
    ///
    /// Returning `true` approves the peer on the spot. Returning `false` keeps
    /// the handshake pending until the application calls
    /// `Hub::register_remote_ski` or `Hub::cancel_pairing`.
    fn trust_decision_needed(&self, _ski: &str) -> bool {
        false
    }

    /// SHIP ID previously stored for this peer, if any.
    fn pinned_ship_id(&self, _ski: &str) -> Option<String> {
        None
    }
}

/// Receives everything a connection reports upward.
pub trait ApplicationSink: Send + Sync {
    fn handshake_state_changed(&self, ski: &str, state: &ShipState);

    /// The peer announced its SHIP ID for the first time. Persist it to pin it.
    fn identity_learned(&self, ski: &str, ship_id: &str);

    /// Payload of a data message, as conventional JSON bytes.
    fn application_payload(&self, ski: &str, payload: Vec<u8>);

    /// The connection is gone. `completed` tells whether the handshake had finished.
    fn connection_closed(&self, _ski: &str, _completed: bool) {}
}

/// A [`TrustPolicy`] backed by an in-memory list of paired peers.
#[derive(Debug, Default)]
pub struct StaticTrust {
    paired: RwLock<HashMap<String, Option<String>>>,
    allow_waiting: bool,
}

impl StaticTrust {
    /// Create an empty policy. `allow_waiting` controls whether unknown
    /// peers may wait in the pending hello.
    pub fn new(allow_waiting: bool) -> Self {
        Self {
            paired: RwLock::new(HashMap::new()),
            allow_waiting,
        }
    }

    /// Trust a peer, optionally pinning its SHIP ID.
    pub fn trust(&self, ski: &str, ship_id: Option<&str>) {
        let mut paired = self.paired.write().unwrap_or_else(|e| e.into_inner());
        paired.insert(ski.to_string(), ship_id.map(String::from));
    }

    pub fn revoke(&self, ski: &str) {
        let mut paired = self.paired.write().unwrap_or_else(|e| e.into_inner());
        paired.remove(ski);
    }
}

impl TrustPolicy for StaticTrust {
    fn is_trusted(&self, ski: &str) -> bool {
        let paired = self.paired.read().unwrap_or_else(|e| e.into_inner());
        paired.contains_key(ski)
    }

    fn allow_waiting_for_trust(&self, _ski: &str) -> bool {
        self.allow_waiting
    }

    fn pinned_ship_id(&self, ski: &str) -> Option<String> {
        let paired = self.paired.read().unwrap_or_else(|e| e.into_inner());
        paired.get(ski).cloned().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_trust() {
        let trust = StaticTrust::new(true);
        assert!(!trust.is_trusted("aa"));
        assert!(trust.allow_waiting_for_trust("aa"));

        trust.trust("aa", Some("ship-aa"));
        trust.trust("bb", None);
        assert!(trust.is_trusted("aa"));
        assert_eq!(trust.pinned_ship_id("aa").as_deref(), Some("ship-aa"));
        assert_eq!(trust.pinned_ship_id("bb"), None);
        assert!(!trust.trust_decision_needed("bb"));

        trust.revoke("aa");
        assert!(!trust.is_trusted("aa"));
    }
}
