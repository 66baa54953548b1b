//! Connection hub: the node-level entry point.
//!
//! The [`Hub`] owns the connection registry and the local pairing list. It
//! builds a connection for every accepted or dialed transport, resolves
//! double connections, and exposes the pairing operations the application
//! drives: trusting a peer (which also releases a handshake waiting for
//! trust), cancelling a pairing, and disconnecting.

use crate::connection::{new_connection, ShipConnectionHandle};
use crate::handshake::ConnectionSetup;
use crate::peer::{ApplicationSink, TrustPolicy};
use crate::registry::{ConnectionRegistry, RegisterOutcome};
use crate::transport::{FrameTransport, TransportEvent, CLOSE_CODE_NORMAL};
use crate::ws;

use dashmap::DashMap;
use shiplink_types::ski::{normalize_ski, parse_ski};
use shiplink_types::{ConnectionRole, ShipConfig, ShipError, ShipResult, ShipState};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

/// Peers paired through the hub, layered over the application's policy.
struct HubTrust {
    /// SKI to pinned SHIP ID.
    paired: DashMap<String, Option<String>>,
    policy: Arc<dyn TrustPolicy>,
}

impl TrustPolicy for HubTrust {
    fn is_trusted(&self, ski: &str) -> bool {
        self.paired.contains_key(ski) || self.policy.is_trusted(ski)
    }

    fn allow_waiting_for_trust(&self, ski: &str) -> bool {
        self.policy.allow_waiting_for_trust(ski)
    }

    fn trust_decision_needed(&self, ski: &str) -> bool {
        self.policy.trust_decision_needed(ski)
    }

    fn pinned_ship_id(&self, ski: &str) -> Option<String> {
        self.paired
            .get(ski)
            .and_then(|entry| entry.value().clone())
            .or_else(|| self.policy.pinned_ship_id(ski))
    }
}

struct HubInner {
    config: ShipConfig,
    registry: ConnectionRegistry,
    trust: Arc<HubTrust>,
    sink: Arc<dyn ApplicationSink>,
}

/// Cloneable handle to a node's connections.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a hub. Fails if the configuration does not validate.
    pub fn new(
        config: ShipConfig,
        policy: Arc<dyn TrustPolicy>,
        sink: Arc<dyn ApplicationSink>,
    ) -> ShipResult<Self> {
        let config = config.validate()?;
        info!(ski = %config.local_ski, ship_id = %config.local_ship_id, "SHIP: hub ready");
        Ok(Self {
            inner: Arc::new(HubInner {
                registry: ConnectionRegistry::new(&config.local_ski),
                trust: Arc::new(HubTrust {
                    paired: DashMap::new(),
                    policy,
                }),
                sink,
                config,
            }),
        })
    }

    pub fn local_ski(&self) -> &str {
        &self.inner.config.local_ski
    }

    pub fn config(&self) -> &ShipConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Run the handshake as server on a transport the peer opened.
    pub async fn accept<T>(
        &self,
        transport: T,
        events: mpsc::Receiver<TransportEvent>,
        remote_ski: &str,
    ) -> ShipResult<ShipConnectionHandle>
    where
        T: FrameTransport + 'static,
    {
        self.attach(ConnectionRole::Server, Arc::new(transport), events, remote_ski)
            .await
    }

    /// Run the handshake as client on a transport we opened.
    pub async fn connect<T>(
        &self,
        transport: T,
        events: mpsc::Receiver<TransportEvent>,
        remote_ski: &str,
    ) -> ShipResult<ShipConnectionHandle>
    where
        T: FrameTransport + 'static,
    {
        self.attach(ConnectionRole::Client, Arc::new(transport), events, remote_ski)
            .await
    }

    /// Accept a SHIP WebSocket on an established (usually TLS) stream.
    pub async fn accept_websocket<S>(
        &self,
        stream: S,
        remote_ski: &str,
    ) -> ShipResult<ShipConnectionHandle>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = &self.inner.config;
        let (transport, events) =
            ws::accept(stream, &config.transport, config.handshake.close_grace()).await?;
        self.accept(transport, events, remote_ski).await
    }

    /// Open a SHIP WebSocket to `url` over an established stream.
    pub async fn connect_websocket<S>(
        &self,
        stream: S,
        url: &Url,
        remote_ski: &str,
    ) -> ShipResult<ShipConnectionHandle>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = &self.inner.config;
        let (transport, events) =
            ws::connect(stream, url, &config.transport, config.handshake.close_grace()).await?;
        self.connect(transport, events, remote_ski).await
    }

    async fn attach(
        &self,
        role: ConnectionRole,
        transport: Arc<dyn FrameTransport>,
        events: mpsc::Receiver<TransportEvent>,
        remote_ski: &str,
    ) -> ShipResult<ShipConnectionHandle> {
        let remote_ski = match parse_ski(remote_ski) {
            Ok(ski) if ski == self.inner.config.local_ski => Err(ShipError::ProtocolViolation(
                "remote SKI equals the local SKI".into(),
            )),
            other => other,
        };
        let remote_ski = match remote_ski {
            Ok(ski) => ski,
            Err(e) => {
                transport.close(CLOSE_CODE_NORMAL, "invalid peer identity").await;
                return Err(e);
            }
        };

        let config = &self.inner.config;
        let setup = ConnectionSetup {
            role,
            local_ski: config.local_ski.clone(),
            local_ship_id: config.local_ship_id.clone(),
            remote_ski: remote_ski.clone(),
            config: config.handshake,
            transport: transport.clone(),
            trust: self.inner.trust.clone(),
            sink: self.inner.sink.clone(),
        };
        let (handle, task) = new_connection(setup, events, config.transport.channel_capacity);

        match self.inner.registry.register(handle.clone()) {
            RegisterOutcome::Registered => {}
            RegisterOutcome::Replaced(old) => {
                tokio::spawn(async move {
                    let _ = old.close("replaced by a newer connection").await;
                });
            }
            RegisterOutcome::Rejected => {
                transport.close(CLOSE_CODE_NORMAL, "double connection").await;
                return Err(ShipError::ConnectionClosed(format!(
                    "already connected to {remote_ski}"
                )));
            }
        }

        info!(ski = %remote_ski, role = %role, id = %handle.id(), "SHIP: connection attached");
        let registry = self.inner.registry.clone();
        let id = handle.id();
        task.on_teardown(Box::new(move || {
            if registry.unregister(&remote_ski, id) {
                debug!(ski = %remote_ski, "SHIP: connection unregistered");
            }
        }))
        .spawn();
        Ok(handle)
    }

    pub fn lookup(&self, ski: &str) -> Option<ShipConnectionHandle> {
        self.inner.registry.lookup(&normalize_ski(ski))
    }

    pub fn allow_waiting_for_trust(&self, ski: &str) -> bool {
        self.inner.trust.allow_waiting_for_trust(&normalize_ski(ski))
    }

    /// Trust a peer, optionally pinning its SHIP ID.
    ///
    /// A handshake with that peer waiting in the pending hello continues at once.
    pub async fn register_remote_ski(&self, ski: &str, ship_id: Option<&str>) -> ShipResult<()> {
        let ski = parse_ski(ski)?;
        info!(ski = %ski, "SHIP: peer paired");
        self.inner
            .trust
            .paired
            .insert(ski.clone(), ship_id.map(String::from));
        if let Some(handle) = self.inner.registry.lookup(&ski) {
            if let Err(e) = handle.approve_pending().await {
                debug!(ski = %ski, error = %e, "SHIP: pending connection already gone");
            }
        }
        Ok(())
    }

    /// Forget a paired peer and drop any connection to it.
    pub async fn unregister_remote_ski(&self, ski: &str) {
        let ski = normalize_ski(ski);
        if self.inner.trust.paired.remove(&ski).is_some() {
            info!(ski = %ski, "SHIP: peer unpaired");
        }
        self.disconnect(&ski, "peer unpaired").await;
    }

    /// Reject a handshake that is still waiting in the hello phase.
    pub async fn cancel_pairing(&self, ski: &str) {
        if let Some(handle) = self.lookup(ski) {
            let _ = handle.abort_pending().await;
        }
    }

    pub async fn disconnect(&self, ski: &str, reason: &str) {
        if let Some(handle) = self.lookup(ski) {
            let _ = handle.close(reason).await;
        }
    }

    /// Send an application payload over the completed connection to `ski`.
    pub async fn send_payload(&self, ski: &str, payload: Vec<u8>) -> ShipResult<()> {
        let handle = self
            .lookup(ski)
            .ok_or_else(|| ShipError::ConnectionClosed(format!("no connection to {ski}")))?;
        handle.send_payload(payload).await
    }

    /// Current handshake state of the connection to `ski`.
    pub fn pairing_detail(&self, ski: &str) -> Option<ShipState> {
        self.lookup(ski).map(|handle| handle.state())
    }

    /// SKIs of all peers with a completed handshake.
    pub fn connected_skis(&self) -> Vec<String> {
        self.inner
            .registry
            .handles()
            .into_iter()
            .filter(|handle| handle.is_alive() && handle.state().is_complete())
            .map(|handle| handle.remote_ski().to_string())
            .collect()
    }
}
