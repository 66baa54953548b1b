//! Per-connection driver task and the handle the rest of the program holds.
//!
//! The driver owns the `ShipConnection` and is the only place its
//! transitions run. It selects over three inputs: transport events, control
//! commands from [`ShipConnectionHandle`]s, and timer firings. When the
//! machine asks for a shutdown the driver tears the connection down in a
//! fixed order: timer, registry entry, close exchange, transport, and
//! finally the application callback.

use crate::frame::{encode_frame, is_close_message, parse_close, MessageClass};
use crate::handshake::{ConnectionSetup, RemoteIdentity, ShipConnection, Shutdown};
use crate::timer::TimerFired;
use crate::transport::TransportEvent;

use chrono::{DateTime, Utc};
use shiplink_types::model::{ConnectionClose, ConnectionClosePhase, ShipMessage};
use shiplink_types::{ConnectionRole, HandshakeState, ShipError, ShipResult, ShipState};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Requests sent from a handle to the driver task.
#[derive(Debug)]
pub(crate) enum ControlCommand {
    ApprovePending,
    AbortPending,
    Close {
        reason: String,
    },
    Send {
        payload: Vec<u8>,
        reply: oneshot::Sender<ShipResult<()>>,
    },
}

/// Runs when the driver starts tearing down.
pub(crate) type TeardownHook = Box<dyn FnOnce() + Send + 'static>;

/// Cheap, cloneable reference to a running connection.
#[derive(Debug, Clone)]
pub struct ShipConnectionHandle {
    id: Uuid,
    remote_ski: String,
    role: ConnectionRole,
    connected_at: DateTime<Utc>,
    control: mpsc::Sender<ControlCommand>,
    state: watch::Receiver<ShipState>,
    identity: watch::Receiver<RemoteIdentity>,
}

impl ShipConnectionHandle {
    /// Identifies this connection instance, unlike the SKI which a newer connection may share.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_ski(&self) -> &str {
        &self.remote_ski
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Latest reported state.
    pub fn state(&self) -> ShipState {
        self.state.borrow().clone()
    }

    /// SHIP ID the peer announced, once the access-methods phase has run.
    pub fn remote_ship_id(&self) -> Option<String> {
        self.identity.borrow().ship_id.clone()
    }

    /// Protocol id carried by the peer's most recent data message.
    pub fn remote_protocol_id(&self) -> Option<String> {
        self.identity.borrow().protocol_id.clone()
    }

    /// Whether the driver task is still running.
    pub fn is_alive(&self) -> bool {
        !self.control.is_closed()
    }

    /// Send an application payload (conventional JSON) to the peer.
    pub async fn send_payload(&self, payload: Vec<u8>) -> ShipResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(ControlCommand::Send { payload, reply }).await?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Approve a handshake waiting in the pending hello.
    pub async fn approve_pending(&self) -> ShipResult<()> {
        self.command(ControlCommand::ApprovePending).await
    }

    /// Reject a handshake that is still in the hello phase.
    pub async fn abort_pending(&self) -> ShipResult<()> {
        self.command(ControlCommand::AbortPending).await
    }

    /// Close the connection, running the close exchange if the handshake completed.
    pub async fn close(&self, reason: &str) -> ShipResult<()> {
        self.command(ControlCommand::Close {
            reason: reason.to_string(),
        })
        .await
    }

    /// Wait until the reported state satisfies `predicate`.
    ///
    /// If the connection goes away first, the last reported state is returned.
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> ShipState
    where
        F: FnMut(&ShipState) -> bool,
    {
        let mut rx = self.state.clone();
        let result = rx.wait_for(|s| predicate(s)).await.map(|s| s.clone());
        match result {
            Ok(state) => state,
            Err(_) => rx.borrow().clone(),
        }
    }

    /// Resolves once the driver task has finished.
    pub async fn closed(&self) {
        self.control.closed().await
    }

    async fn command(&self, command: ControlCommand) -> ShipResult<()> {
        self.control.send(command).await.map_err(|_| self.gone())
    }

    fn gone(&self) -> ShipError {
        ShipError::ConnectionClosed(format!("connection to {} has ended", self.remote_ski))
    }

    /// A handle with no driver behind it, for registry tests.
    #[cfg(test)]
    pub(crate) fn detached(
        remote_ski: &str,
        role: ConnectionRole,
    ) -> (Self, mpsc::Receiver<ControlCommand>) {
        let (control, control_rx) = mpsc::channel(4);
        let (_, state) = watch::channel(ShipState::new(HandshakeState::CmiStateInitStart));
        let (_, identity) = watch::channel(RemoteIdentity::default());
        (
            Self {
                id: Uuid::new_v4(),
                remote_ski: remote_ski.to_string(),
                role,
                connected_at: Utc::now(),
                control,
                state,
                identity,
            },
            control_rx,
        )
    }
}

/// A connection that has been built but whose driver is not running yet.
pub(crate) struct ConnectionTask {
    connection: ShipConnection,
    events: mpsc::Receiver<TransportEvent>,
    control: mpsc::Receiver<ControlCommand>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    on_teardown: Option<TeardownHook>,
}

/// Build a connection and its handle.
pub(crate) fn new_connection(
    setup: ConnectionSetup,
    events: mpsc::Receiver<TransportEvent>,
    control_capacity: usize,
) -> (ShipConnectionHandle, ConnectionTask) {
    let (connection, outputs) = ShipConnection::new(setup);
    let (control, control_rx) = mpsc::channel(control_capacity);
    let handle = ShipConnectionHandle {
        id: connection.id(),
        remote_ski: connection.remote_ski().to_string(),
        role: connection.role(),
        connected_at: Utc::now(),
        control,
        state: outputs.state,
        identity: outputs.identity,
    };
    let task = ConnectionTask {
        connection,
        events,
        control: control_rx,
        timers: outputs.timers,
        on_teardown: None,
    };
    (handle, task)
}

impl ConnectionTask {
    pub(crate) fn on_teardown(mut self, hook: TeardownHook) -> Self {
        self.on_teardown = Some(hook);
        self
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(
            ski = %self.connection.remote_ski(),
            role = %self.connection.role(),
            "SHIP: connection started"
        );
        self.connection.start();

        loop {
            if let Some(shutdown) = self.connection.take_shutdown() {
                self.teardown(shutdown).await;
                return;
            }

            tokio::select! {
                event = self.events.recv() => match event {
                    Some(TransportEvent::Frame(frame)) => self.connection.handle_frame(&frame),
                    Some(TransportEvent::Closed { code, reason }) => {
                        self.connection.handle_transport_closed(code, &reason)
                    }
                    None => self
                        .connection
                        .handle_transport_closed(None, "transport event stream ended"),
                },
                Some(command) = self.control.recv() => {
                    dispatch_command(&mut self.connection, command)
                }
                Some(fired) = self.timers.recv() => {
                    if let Some(kind) = self.connection.accept_timer(fired) {
                        self.connection.handle_timeout(kind);
                    }
                }
            }
        }
    }

    async fn teardown(&mut self, shutdown: Shutdown) {
        self.connection.disarm_timer();
        if let Some(hook) = self.on_teardown.take() {
            hook();
        }

        let transport = self.connection.transport();
        if shutdown.announce && !transport.is_closed() {
            self.announce_close().await;
        }
        transport.close(shutdown.code, &shutdown.reason).await;

        let completed = self.connection.state() == HandshakeState::Complete;
        self.connection.notify_closed();
        info!(
            ski = %self.connection.remote_ski(),
            completed,
            reason = %shutdown.reason,
            "SHIP: connection closed"
        );
    }

    /// Send `connectionClose` announce and wait, bounded, for the confirm.
    async fn announce_close(&mut self) {
        let transport = self.connection.transport();
        let grace_ms = self.connection.config().close_grace_ms;
        let announce = ConnectionClose {
            phase: ConnectionClosePhase::Announce,
            max_time: Some(grace_ms),
            reason: None,
        };
        let sent = encode_frame(MessageClass::End, &ShipMessage::ConnectionClose(announce))
            .and_then(|frame| transport.send_frame(frame));
        if let Err(e) = sent {
            debug!(ski = %self.connection.remote_ski(), error = %e, "SHIP: close announce not sent");
            return;
        }

        let events = &mut self.events;
        let wait_confirm = async {
            while let Some(event) = events.recv().await {
                let frame = match event {
                    TransportEvent::Frame(frame) if is_close_message(&frame) => frame,
                    TransportEvent::Frame(_) => continue,
                    TransportEvent::Closed { .. } => return,
                };
                match parse_close(&frame) {
                    Ok(close) if close.phase == ConnectionClosePhase::Announce => {
                        // Both sides announced at once.
                        let confirm = ConnectionClose {
                            phase: ConnectionClosePhase::Confirm,
                            max_time: None,
                            reason: None,
                        };
                        let _ = encode_frame(
                            MessageClass::End,
                            &ShipMessage::ConnectionClose(confirm),
                        )
                        .and_then(|frame| transport.send_frame(frame));
                        return;
                    }
                    Ok(_) => return,
                    Err(e) => {
                        warn!(error = %e, "SHIP: unreadable close message");
                        return;
                    }
                }
            }
        };
        if tokio::time::timeout(self.connection.config().close_grace(), wait_confirm)
            .await
            .is_err()
        {
            debug!(ski = %self.connection.remote_ski(), "SHIP: no close confirm within grace period");
        }
    }
}

fn dispatch_command(connection: &mut ShipConnection, command: ControlCommand) {
    match command {
        ControlCommand::ApprovePending => connection.approve_pending(),
        ControlCommand::AbortPending => connection.abort_pending(),
        ControlCommand::Close { reason } => connection.close(&reason),
        ControlCommand::Send { payload, reply } => {
            let _ = reply.send(connection.send_payload(&payload));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::{parse_message, INIT_FRAME};
    use crate::peer::{ApplicationSink, StaticTrust, TrustPolicy};
    use crate::transport::{
        memory_pair, FrameTransport, MemoryTransport, CLOSE_CODE_NORMAL, CLOSE_CODE_REJECTED,
    };
    use shiplink_types::model::{
        AccessMethods, AccessMethodsRequest, ConnectionHello, ConnectionHelloPhase,
        ConnectionPinState, DataMessage, MessageProtocolHandshake, PinStateType,
        ProtocolHandshakeType, ProtocolVersion,
    };
    use shiplink_types::HandshakeConfig;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    pub(crate) const LOCAL_SKI: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    pub(crate) const REMOTE_SKI: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    /// Records everything reported upward.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub states: Mutex<Vec<ShipState>>,
        pub identities: Mutex<Vec<(String, String)>>,
        pub payloads: Mutex<Vec<(String, Vec<u8>)>>,
        pub closed: Mutex<Vec<(String, bool)>>,
    }

    impl RecordingSink {
        pub(crate) fn trace(&self) -> Vec<HandshakeState> {
            self.states.lock().unwrap().iter().map(|s| s.state).collect()
        }

        pub(crate) fn payload_count(&self) -> usize {
            self.payloads.lock().unwrap().len()
        }
    }

    impl ApplicationSink for RecordingSink {
        fn handshake_state_changed(&self, _ski: &str, state: &ShipState) {
            self.states.lock().unwrap().push(state.clone());
        }

        fn identity_learned(&self, ski: &str, ship_id: &str) {
            self.identities
                .lock()
                .unwrap()
                .push((ski.to_string(), ship_id.to_string()));
        }

        fn application_payload(&self, ski: &str, payload: Vec<u8>) {
            self.payloads
                .lock()
                .unwrap()
                .push((ski.to_string(), payload));
        }

        fn connection_closed(&self, ski: &str, completed: bool) {
            self.closed.lock().unwrap().push((ski.to_string(), completed));
        }
    }

    /// The remote end of a memory transport, driven by the test.
    struct ScriptedPeer {
        transport: MemoryTransport,
        events: mpsc::Receiver<TransportEvent>,
    }

    impl ScriptedPeer {
        async fn recv_event(&mut self) -> TransportEvent {
            tokio::time::timeout(Duration::from_secs(600), self.events.recv())
                .await
                .expect("peer timed out waiting")
                .expect("connection dropped the transport")
        }

        async fn recv_frame(&mut self) -> Vec<u8> {
            match self.recv_event().await {
                TransportEvent::Frame(frame) => frame,
                other => panic!("expected a frame, got {other:?}"),
            }
        }

        async fn expect(&mut self) -> ShipMessage {
            let frame = self.recv_frame().await;
            parse_message(&frame).unwrap().1
        }

        async fn expect_closed(&mut self) -> Option<u16> {
            loop {
                if let TransportEvent::Closed { code, .. } = self.recv_event().await {
                    return code;
                }
            }
        }

        fn send(&self, message: ShipMessage) {
            let frame = encode_frame(MessageClass::Control, &message).unwrap();
            self.transport.send_frame(frame).unwrap();
        }

        fn send_hello(&self, hello: ConnectionHello) {
            self.send(ShipMessage::ConnectionHello(hello));
        }

        fn send_protocol(&self, handshake_type: ProtocolHandshakeType, major: u8) {
            let mut message = MessageProtocolHandshake::local(handshake_type);
            message.version = ProtocolVersion { major, minor: 0 };
            self.send(ShipMessage::MessageProtocolHandshake(message));
        }

        fn send_pin_none(&self) {
            self.send(ShipMessage::ConnectionPinState(ConnectionPinState {
                pin_state: PinStateType::None,
                input_permission: None,
            }));
        }

        /// Play the remote side of CMI, hello and protocol handshake against a client.
        async fn handshake_as_server_until_pin(&mut self) {
            assert_eq!(self.recv_frame().await, INIT_FRAME.to_vec());
            self.transport.send_frame(INIT_FRAME.to_vec()).unwrap();

            assert_hello(self.expect().await, ConnectionHelloPhase::Ready);
            self.send_hello(ConnectionHello::new(ConnectionHelloPhase::Ready).with_waiting(60_000));

            match self.expect().await {
                ShipMessage::MessageProtocolHandshake(m) => {
                    assert_eq!(m.handshake_type, ProtocolHandshakeType::AnnounceMax)
                }
                other => panic!("expected announceMax, got {other:?}"),
            }
            self.send_protocol(ProtocolHandshakeType::Select, 1);
            match self.expect().await {
                ShipMessage::MessageProtocolHandshake(m) => {
                    assert_eq!(m.handshake_type, ProtocolHandshakeType::Select)
                }
                other => panic!("expected select, got {other:?}"),
            }
        }

        /// Play the server side of the whole handshake until both ends are complete.
        async fn complete_as_server(&mut self) {
            self.handshake_as_server_until_pin().await;
            match self.expect().await {
                ShipMessage::ConnectionPinState(pin) => assert_eq!(pin.pin_state, PinStateType::None),
                other => panic!("expected pin state, got {other:?}"),
            }
            self.send_pin_none();

            assert!(matches!(
                self.expect().await,
                ShipMessage::AccessMethodsRequest(_)
            ));
            self.send(ShipMessage::AccessMethodsRequest(AccessMethodsRequest {}));
            match self.expect().await {
                ShipMessage::AccessMethods(methods) => {
                    assert_eq!(methods.id.as_deref(), Some("local-ship"))
                }
                other => panic!("expected accessMethods, got {other:?}"),
            }
            self.send(ShipMessage::AccessMethods(AccessMethods {
                id: Some("remote-ship".into()),
                ..Default::default()
            }));
        }

        /// Play the client side of CMI and hello against a trusting server.
        async fn hello_as_client(&mut self) {
            self.transport.send_frame(INIT_FRAME.to_vec()).unwrap();
            assert_eq!(self.recv_frame().await, INIT_FRAME.to_vec());
            assert_hello(self.expect().await, ConnectionHelloPhase::Ready);
            self.send_hello(ConnectionHello::new(ConnectionHelloPhase::Ready).with_waiting(60_000));
        }

        fn send_close(&self, phase: ConnectionClosePhase) {
            let close = ConnectionClose {
                phase,
                max_time: None,
                reason: None,
            };
            let frame = encode_frame(MessageClass::End, &ShipMessage::ConnectionClose(close)).unwrap();
            self.transport.send_frame(frame).unwrap();
        }
    }

    fn assert_protocol_error(message: ShipMessage, code: u8) {
        match message {
            ShipMessage::MessageProtocolHandshakeError(e) => assert_eq!(e.error, code),
            other => panic!("expected protocol handshake error {code}, got {other:?}"),
        }
    }

    fn assert_hello(message: ShipMessage, phase: ConnectionHelloPhase) -> ConnectionHello {
        match message {
            ShipMessage::ConnectionHello(hello) => {
                assert_eq!(hello.phase, phase);
                hello
            }
            other => panic!("expected connectionHello, got {other:?}"),
        }
    }

    struct Harness {
        handle: ShipConnectionHandle,
        sink: Arc<RecordingSink>,
        peer: ScriptedPeer,
    }

    fn start(role: ConnectionRole, trust: Arc<dyn TrustPolicy>) -> Harness {
        let ((local, local_events), (remote, remote_events)) = memory_pair(1024, 64);
        let sink = Arc::new(RecordingSink::default());
        let setup = ConnectionSetup {
            role,
            local_ski: LOCAL_SKI.to_string(),
            local_ship_id: "local-ship".to_string(),
            remote_ski: REMOTE_SKI.to_string(),
            config: HandshakeConfig::default(),
            transport: Arc::new(local),
            trust,
            sink: sink.clone(),
        };
        let (handle, task) = new_connection(setup, local_events, 8);
        task.spawn();
        Harness {
            handle,
            sink,
            peer: ScriptedPeer {
                transport: remote,
                events: remote_events,
            },
        }
    }

    fn trusted() -> Arc<StaticTrust> {
        let trust = StaticTrust::new(true);
        trust.trust(REMOTE_SKI, None);
        Arc::new(trust)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_happy_path() {
        let Harness {
            handle,
            sink,
            mut peer,
        } = start(ConnectionRole::Client, trusted());

        peer.complete_as_server().await;

        let state = handle.wait_for_state(|s| s.state.is_terminal()).await;
        assert_eq!(state.state, HandshakeState::Complete);
        assert_eq!(handle.remote_ship_id().as_deref(), Some("remote-ship"));
        assert_eq!(handle.remote_protocol_id(), None);

        // Resting states appear in order.
        let trace = sink.trace();
        let expected = [
            HandshakeState::CmiStateClientWait,
            HandshakeState::HelloStateReadyListen,
            HandshakeState::ProtHStateClientListenChoice,
            HandshakeState::PinStateCheckListen,
            HandshakeState::AccessMethodsRequest,
            HandshakeState::Complete,
        ];
        let mut remaining = trace.iter();
        for want in expected {
            assert!(
                remaining.any(|s| *s == want),
                "{want:?} missing or out of order in {trace:?}"
            );
        }
        // Phases never go backwards and no state repeats.
        assert!(trace.windows(2).all(|w| w[0].phase() <= w[1].phase()));
        for (i, s) in trace.iter().enumerate() {
            assert!(!trace[i + 1..].contains(s), "{s:?} repeated in {trace:?}");
        }
        assert_eq!(
            *sink.identities.lock().unwrap(),
            vec![(REMOTE_SKI.to_string(), "remote-ship".to_string())]
        );

        // Data in both directions.
        let inbound = ShipMessage::Data(DataMessage::new(serde_json::json!({"cmd": {"value": 7}})));
        peer.transport
            .send_frame(encode_frame(MessageClass::Data, &inbound).unwrap())
            .unwrap();
        wait_until(|| sink.payload_count() == 1).await;
        let (ski, payload) = sink.payloads.lock().unwrap()[0].clone();
        assert_eq!(ski, REMOTE_SKI);
        assert_eq!(handle.remote_protocol_id().as_deref(), Some("ee1.0"));
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&payload).unwrap(),
            serde_json::json!({"cmd": {"value": 7}})
        );

        handle
            .send_payload(br#"{"reply":{"ok":true}}"#.to_vec())
            .await
            .unwrap();
        let frame = peer.recv_frame().await;
        assert_eq!(frame[0], MessageClass::Data as u8);
        match parse_message(&frame).unwrap().1 {
            ShipMessage::Data(data) => {
                assert_eq!(data.header.protocol_id, "ee1.0");
                assert_eq!(data.payload, serde_json::json!({"reply": {"ok": true}}));
            }
            other => panic!("expected data, got {other:?}"),
        }

        // Close exchange.
        handle.close("done").await.unwrap();
        let frame = peer.recv_frame().await;
        assert_eq!(frame[0], MessageClass::End as u8);
        assert_eq!(parse_close(&frame).unwrap().phase, ConnectionClosePhase::Announce);
        peer.send_close(ConnectionClosePhase::Confirm);
        assert_eq!(peer.expect_closed().await, Some(CLOSE_CODE_NORMAL));
        handle.closed().await;
        assert_eq!(
            *sink.closed.lock().unwrap(),
            vec![(REMOTE_SKI.to_string(), true)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_rejected_when_waiting_not_allowed() {
        let Harness {
            handle,
            sink,
            mut peer,
        } = start(ConnectionRole::Server, Arc::new(StaticTrust::new(false)));

        peer.transport.send_frame(INIT_FRAME.to_vec()).unwrap();
        assert_eq!(peer.recv_frame().await, INIT_FRAME.to_vec());
        assert_hello(peer.expect().await, ConnectionHelloPhase::Aborted);
        assert_eq!(peer.expect_closed().await, Some(CLOSE_CODE_REJECTED));

        handle.closed().await;
        let trace = sink.trace();
        let tail: Vec<_> = trace.iter().rev().take(3).rev().copied().collect();
        assert_eq!(
            tail,
            vec![
                HandshakeState::HelloStatePendingInit,
                HandshakeState::HelloStateAbort,
                HandshakeState::HelloStateAbortDone,
            ]
        );
        assert_eq!(handle.state().state, HandshakeState::HelloStateAbortDone);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_approved_by_application() {
        let Harness {
            handle, mut peer, ..
        } = start(ConnectionRole::Server, Arc::new(StaticTrust::new(true)));

        peer.transport.send_frame(INIT_FRAME.to_vec()).unwrap();
        assert_eq!(peer.recv_frame().await, INIT_FRAME.to_vec());
        let hello = assert_hello(peer.expect().await, ConnectionHelloPhase::Pending);
        assert_eq!(hello.waiting, Some(60_000));

        peer.send_hello(ConnectionHello::new(ConnectionHelloPhase::Ready).with_waiting(60_000));
        handle
            .wait_for_state(|s| s.state == HandshakeState::HelloStatePendingListen)
            .await;
        handle.approve_pending().await.unwrap();

        assert_hello(peer.expect().await, ConnectionHelloPhase::Ready);
        // The peer was already ready, so the server moves straight on.
        let state = handle
            .wait_for_state(|s| s.state == HandshakeState::ProtHStateServerListenProposal)
            .await;
        assert_eq!(state.state, HandshakeState::ProtHStateServerListenProposal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_prolongation_then_abort() {
        let Harness {
            handle, mut peer, ..
        } = start(ConnectionRole::Server, Arc::new(StaticTrust::new(true)));

        peer.transport.send_frame(INIT_FRAME.to_vec()).unwrap();
        assert_eq!(peer.recv_frame().await, INIT_FRAME.to_vec());
        assert_hello(peer.expect().await, ConnectionHelloPhase::Pending);

        let started = tokio::time::Instant::now();
        peer.send_hello(ConnectionHello::new(ConnectionHelloPhase::Ready).with_waiting(60_000));

        // 60 s remote waiting minus the 30 s threshold.
        let request = assert_hello(peer.expect().await, ConnectionHelloPhase::Pending);
        assert!(request.is_prolongation_request());
        assert_eq!(started.elapsed(), Duration::from_secs(30));

        // No answer within the waiting gap.
        assert_hello(peer.expect().await, ConnectionHelloPhase::Aborted);
        assert_eq!(started.elapsed(), Duration::from_secs(45));
        assert_eq!(peer.expect_closed().await, Some(CLOSE_CODE_REJECTED));
        handle.closed().await;
        assert_eq!(handle.state().state, HandshakeState::HelloStateAbortDone);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prolongation_below_floor_aborts() {
        let Harness {
            handle, mut peer, ..
        } = start(ConnectionRole::Server, Arc::new(StaticTrust::new(true)));

        peer.transport.send_frame(INIT_FRAME.to_vec()).unwrap();
        assert_eq!(peer.recv_frame().await, INIT_FRAME.to_vec());
        assert_hello(peer.expect().await, ConnectionHelloPhase::Pending);

        peer.send_hello(ConnectionHello::new(ConnectionHelloPhase::Ready).with_waiting(20_000));
        assert_hello(peer.expect().await, ConnectionHelloPhase::Aborted);
        handle.closed().await;
        assert_eq!(handle.state().state, HandshakeState::HelloStateAbortDone);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_listen_answers_prolongation_request() {
        let Harness {
            handle, mut peer, ..
        } = start(ConnectionRole::Client, trusted());

        assert_eq!(peer.recv_frame().await, INIT_FRAME.to_vec());
        peer.transport.send_frame(INIT_FRAME.to_vec()).unwrap();
        assert_hello(peer.expect().await, ConnectionHelloPhase::Ready);

        peer.send_hello(ConnectionHello::new(ConnectionHelloPhase::Pending).with_prolongation_request());
        let reply = assert_hello(peer.expect().await, ConnectionHelloPhase::Ready);
        assert_eq!(reply.waiting, Some(60_000));
        assert_eq!(handle.state().state, HandshakeState::HelloStateReadyListen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_abort() {
        let Harness {
            handle, mut peer, ..
        } = start(ConnectionRole::Client, trusted());

        assert_eq!(peer.recv_frame().await, INIT_FRAME.to_vec());
        peer.transport.send_frame(INIT_FRAME.to_vec()).unwrap();
        assert_hello(peer.expect().await, ConnectionHelloPhase::Ready);
        peer.send_hello(ConnectionHello::new(ConnectionHelloPhase::Aborted));

        assert_eq!(peer.expect_closed().await, Some(CLOSE_CODE_NORMAL));
        handle.closed().await;
        assert_eq!(
            handle.state().state,
            HandshakeState::HelloStateRemoteAbortDone
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_mismatch() {
        let Harness {
            handle, mut peer, ..
        } = start(ConnectionRole::Client, trusted());

        assert_eq!(peer.recv_frame().await, INIT_FRAME.to_vec());
        peer.transport.send_frame(INIT_FRAME.to_vec()).unwrap();
        assert_hello(peer.expect().await, ConnectionHelloPhase::Ready);
        peer.send_hello(ConnectionHello::new(ConnectionHelloPhase::Ready));
        assert!(matches!(
            peer.expect().await,
            ShipMessage::MessageProtocolHandshake(_)
        ));

        peer.send_protocol(ProtocolHandshakeType::Select, 2);
        match peer.expect().await {
            ShipMessage::MessageProtocolHandshakeError(e) => assert_eq!(e.error, 3),
            other => panic!("expected protocol error, got {other:?}"),
        }
        assert_eq!(peer.expect_closed().await, Some(CLOSE_CODE_NORMAL));

        handle.closed().await;
        let state = handle.state();
        assert_eq!(state.state, HandshakeState::Error);
        assert!(matches!(state.error, Some(ShipError::ProtocolViolation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_mismatch() {
        let trust = StaticTrust::new(true);
        trust.trust(REMOTE_SKI, Some("expected-ship"));
        let Harness {
            handle,
            sink,
            mut peer,
        } = start(ConnectionRole::Client, Arc::new(trust));

        peer.handshake_as_server_until_pin().await;
        assert!(matches!(
            peer.expect().await,
            ShipMessage::ConnectionPinState(_)
        ));
        peer.send_pin_none();
        assert!(matches!(
            peer.expect().await,
            ShipMessage::AccessMethodsRequest(_)
        ));
        peer.send(ShipMessage::AccessMethods(AccessMethods {
            id: Some("other-ship".into()),
            ..Default::default()
        }));

        assert_eq!(peer.expect_closed().await, Some(CLOSE_CODE_NORMAL));
        handle.closed().await;
        let state = handle.state();
        assert_eq!(state.state, HandshakeState::Error);
        assert_eq!(
            state.error,
            Some(ShipError::IdentityMismatch {
                expected: "expected-ship".into(),
                received: "other-ship".into(),
            })
        );
        assert!(sink.identities.lock().unwrap().is_empty());
        assert_eq!(
            *sink.closed.lock().unwrap(),
            vec![(REMOTE_SKI.to_string(), false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_in_ready_listen() {
        let Harness {
            handle, mut peer, ..
        } = start(ConnectionRole::Client, trusted());

        assert_eq!(peer.recv_frame().await, INIT_FRAME.to_vec());
        peer.transport.send_frame(INIT_FRAME.to_vec()).unwrap();
        assert_hello(peer.expect().await, ConnectionHelloPhase::Ready);

        let state = handle.wait_for_state(|s| s.state.is_terminal()).await;
        assert_eq!(state.state, HandshakeState::Error);
        assert!(matches!(state.error, Some(ShipError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_init_message() {
        let Harness {
            handle, mut peer, ..
        } = start(ConnectionRole::Server, trusted());

        peer.transport.send_frame(vec![0x00, 0x01]).unwrap();
        assert_eq!(peer.expect_closed().await, Some(CLOSE_CODE_NORMAL));
        let state = handle.wait_for_state(|s| s.state.is_terminal()).await;
        assert!(matches!(state.error, Some(ShipError::MalformedMessage(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_required_is_unsupported() {
        let Harness {
            handle, mut peer, ..
        } = start(ConnectionRole::Client, trusted());

        peer.handshake_as_server_until_pin().await;
        assert!(matches!(
            peer.expect().await,
            ShipMessage::ConnectionPinState(_)
        ));
        peer.send(ShipMessage::ConnectionPinState(ConnectionPinState {
            pin_state: PinStateType::Required,
            input_permission: None,
        }));

        let state = handle.wait_for_state(|s| s.state.is_terminal()).await;
        assert!(matches!(state.error, Some(ShipError::UnsupportedFeature(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_rejection_close_code() {
        let Harness {
            handle, mut peer, ..
        } = start(ConnectionRole::Client, trusted());

        assert_eq!(peer.recv_frame().await, INIT_FRAME.to_vec());
        peer.transport.send_frame(INIT_FRAME.to_vec()).unwrap();
        assert_hello(peer.expect().await, ConnectionHelloPhase::Ready);
        peer.transport
            .close(CLOSE_CODE_REJECTED, "Node rejected by application")
            .await;

        handle.closed().await;
        assert_eq!(handle.state().state, HandshakeState::HelloStateRejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_before_complete_fails() {
        let Harness {
            handle, peer: _peer, ..
        } = start(ConnectionRole::Client, trusted());
        let err = handle.send_payload(b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, ShipError::ProtocolViolation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_rejects_announce_without_json_format() {
        let Harness {
            handle, mut peer, ..
        } = start(ConnectionRole::Server, trusted());

        peer.hello_as_client().await;
        let mut announce = MessageProtocolHandshake::local(ProtocolHandshakeType::AnnounceMax);
        announce.formats.format = vec!["XML".to_string()];
        peer.send(ShipMessage::MessageProtocolHandshake(announce));

        assert_protocol_error(peer.expect().await, 3);
        assert_eq!(peer.expect_closed().await, Some(CLOSE_CODE_NORMAL));
        handle.closed().await;
        let state = handle.state();
        assert_eq!(state.state, HandshakeState::Error);
        assert!(matches!(state.error, Some(ShipError::ProtocolViolation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_unexpected_message_while_awaiting_confirm() {
        let Harness {
            handle,
            sink,
            mut peer,
        } = start(ConnectionRole::Server, trusted());

        peer.hello_as_client().await;
        peer.send_protocol(ProtocolHandshakeType::AnnounceMax, 1);
        match peer.expect().await {
            ShipMessage::MessageProtocolHandshake(m) => {
                assert_eq!(m.handshake_type, ProtocolHandshakeType::Select)
            }
            other => panic!("expected select, got {other:?}"),
        }
        assert_eq!(
            handle.state().state,
            HandshakeState::ProtHStateServerListenConfirm
        );

        // A PIN state instead of the confirming selection.
        peer.send_pin_none();
        assert_protocol_error(peer.expect().await, 2);
        assert_eq!(peer.expect_closed().await, Some(CLOSE_CODE_NORMAL));
        handle.closed().await;
        assert_eq!(handle.state().state, HandshakeState::Error);
        assert!(!sink.trace().contains(&HandshakeState::ProtHStateServerOk));
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_handshake_timeout_sends_error() {
        let Harness {
            handle, mut peer, ..
        } = start(ConnectionRole::Client, trusted());

        assert_eq!(peer.recv_frame().await, INIT_FRAME.to_vec());
        peer.transport.send_frame(INIT_FRAME.to_vec()).unwrap();
        assert_hello(peer.expect().await, ConnectionHelloPhase::Ready);
        peer.send_hello(ConnectionHello::new(ConnectionHelloPhase::Ready));
        assert!(matches!(
            peer.expect().await,
            ShipMessage::MessageProtocolHandshake(_)
        ));

        // The selection never comes.
        let started = tokio::time::Instant::now();
        assert_protocol_error(peer.expect().await, 1);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(peer.expect_closed().await, Some(CLOSE_CODE_NORMAL));

        handle.closed().await;
        let state = handle.state();
        assert_eq!(state.state, HandshakeState::Error);
        assert!(matches!(state.error, Some(ShipError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cmi_timeout() {
        let Harness {
            handle,
            sink,
            mut peer,
        } = start(ConnectionRole::Client, trusted());

        let started = tokio::time::Instant::now();
        assert_eq!(peer.recv_frame().await, INIT_FRAME.to_vec());
        assert_eq!(peer.expect_closed().await, Some(CLOSE_CODE_NORMAL));
        assert_eq!(started.elapsed(), Duration::from_secs(10));

        handle.closed().await;
        let state = handle.state();
        assert_eq!(state.state, HandshakeState::Error);
        assert!(matches!(state.error, Some(ShipError::Timeout(_))));
        assert!(!sink.trace().contains(&HandshakeState::HelloState));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_announce_after_complete() {
        let Harness {
            handle,
            sink,
            mut peer,
        } = start(ConnectionRole::Client, trusted());

        peer.complete_as_server().await;
        handle
            .wait_for_state(|s| s.state == HandshakeState::Complete)
            .await;

        peer.send_close(ConnectionClosePhase::Announce);
        let frame = peer.recv_frame().await;
        assert_eq!(frame[0], MessageClass::End as u8);
        assert_eq!(parse_close(&frame).unwrap().phase, ConnectionClosePhase::Confirm);
        assert_eq!(peer.expect_closed().await, Some(CLOSE_CODE_NORMAL));

        handle.closed().await;
        assert_eq!(handle.state().state, HandshakeState::Complete);
        assert_eq!(
            *sink.closed.lock().unwrap(),
            vec![(REMOTE_SKI.to_string(), true)]
        );
    }
}
