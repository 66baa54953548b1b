//! SHIP handshake state machine.
//!
//! A `ShipConnection` is driven by exactly one task (see `connection.rs`),
//! which feeds it inbound frames, timer firings and control commands one at a
//! time. Every transition is therefore serialized. The machine never awaits:
//! it writes frames through the [`FrameTransport`], reports upward through the
//! [`ApplicationSink`] and, when the connection has to go away, leaves a
//! [`Shutdown`] request for the driver to carry out.
//!
//! Phases, in order: connection mode initialisation (CMI), hello, protocol
//! handshake, PIN check, access methods. After `Complete` the machine only
//! routes data messages and the close exchange.

use crate::frame::{
    encode_frame, is_close_message, parse_close, parse_message, MessageClass, INIT_FRAME,
};
use crate::peer::{ApplicationSink, TrustPolicy};
use crate::timer::{HandshakeTimer, TimerFired, TimerKind};
use crate::transport::{
    FrameTransport, CLOSE_CODE_NORMAL, CLOSE_CODE_REJECTED, CLOSE_REASON_REJECTED,
};

use shiplink_types::model::{
    self, AccessMethods, ConnectionClose, ConnectionClosePhase, ConnectionHello,
    ConnectionHelloPhase, ConnectionPinState, DataMessage, MessageProtocolHandshake,
    PinStateType, ProtocolHandshakeErrorCode, ProtocolHandshakeType, ShipMessage,
    FORMAT_JSON_UTF8, PROTOCOL_VERSION,
};
use shiplink_types::{
    ConnectionRole, HandshakeConfig, HandshakeState, ShipError, ShipResult, ShipState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything needed to build a connection.
pub(crate) struct ConnectionSetup {
    pub role: ConnectionRole,
    pub local_ski: String,
    pub local_ship_id: String,
    pub remote_ski: String,
    pub config: HandshakeConfig,
    pub transport: Arc<dyn FrameTransport>,
    pub trust: Arc<dyn TrustPolicy>,
    pub sink: Arc<dyn ApplicationSink>,
}

/// How the driver should take the connection down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Shutdown {
    pub code: u16,
    pub reason: String,
    /// Run the close announce/confirm exchange first.
    pub announce: bool,
}

/// What the peer told us about itself.
#[derive(Debug, Clone, Default)]
pub(crate) struct RemoteIdentity {
    /// SHIP ID from the access-methods phase.
    pub ship_id: Option<String>,
    /// Protocol id of the last data message.
    pub protocol_id: Option<String>,
}

/// Receivers a new connection hands to its driver and handles.
pub(crate) struct ConnectionOutputs {
    pub state: watch::Receiver<ShipState>,
    pub identity: watch::Receiver<RemoteIdentity>,
    pub timers: mpsc::UnboundedReceiver<TimerFired>,
}

pub(crate) struct ShipConnection {
    id: Uuid,
    role: ConnectionRole,
    local_ski: String,
    local_ship_id: String,
    remote_ski: String,
    state: HandshakeState,
    timer: HandshakeTimer,
    /// Waiting in the pending hello for the application's verdict.
    trust_decision_pending: bool,
    /// The peer already said `ready` while we were still pending.
    remote_ready: bool,
    config: HandshakeConfig,
    transport: Arc<dyn FrameTransport>,
    trust: Arc<dyn TrustPolicy>,
    sink: Arc<dyn ApplicationSink>,
    state_tx: watch::Sender<ShipState>,
    identity_tx: watch::Sender<RemoteIdentity>,
    shutdown: Option<Shutdown>,
}

impl ShipConnection {
    pub(crate) fn new(setup: ConnectionSetup) -> (Self, ConnectionOutputs) {
        let (timer, timers) = HandshakeTimer::new();
        let (state_tx, state) = watch::channel(ShipState::new(HandshakeState::CmiStateInitStart));
        let (identity_tx, identity) = watch::channel(RemoteIdentity::default());
        let connection = Self {
            id: Uuid::new_v4(),
            role: setup.role,
            local_ski: setup.local_ski,
            local_ship_id: setup.local_ship_id,
            remote_ski: setup.remote_ski,
            state: HandshakeState::CmiStateInitStart,
            timer,
            trust_decision_pending: false,
            remote_ready: false,
            config: setup.config,
            transport: setup.transport,
            trust: setup.trust,
            sink: setup.sink,
            state_tx,
            identity_tx,
            shutdown: None,
        };
        let outputs = ConnectionOutputs {
            state,
            identity,
            timers,
        };
        (connection, outputs)
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn role(&self) -> ConnectionRole {
        self.role
    }

    pub(crate) fn remote_ski(&self) -> &str {
        &self.remote_ski
    }

    pub(crate) fn state(&self) -> HandshakeState {
        self.state
    }

    pub(crate) fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> Arc<dyn FrameTransport> {
        self.transport.clone()
    }

    pub(crate) fn take_shutdown(&mut self) -> Option<Shutdown> {
        self.shutdown.take()
    }

    pub(crate) fn accept_timer(&mut self, fired: TimerFired) -> Option<TimerKind> {
        self.timer.accept(fired)
    }

    pub(crate) fn disarm_timer(&mut self) {
        self.timer.disarm();
    }

    pub(crate) fn notify_closed(&self) {
        self.sink
            .connection_closed(&self.remote_ski, self.state == HandshakeState::Complete);
    }

    // --- Inputs ---

    /// Begin connection mode initialisation.
    pub(crate) fn start(&mut self) {
        match self.role {
            ConnectionRole::Client => {
                self.set_state(HandshakeState::CmiStateClientSend);
                if !self.send_raw(INIT_FRAME.to_vec()) {
                    return;
                }
                self.set_state(HandshakeState::CmiStateClientWait);
            }
            ConnectionRole::Server => self.set_state(HandshakeState::CmiStateServerWait),
        }
        self.timer
            .arm(TimerKind::WaitForReady, self.config.cmi_timeout());
    }

    pub(crate) fn handle_frame(&mut self, frame: &[u8]) {
        if self.shutdown.is_some() {
            return;
        }
        if is_close_message(frame) {
            self.handle_close_frame(frame);
            return;
        }

        match self.state {
            HandshakeState::CmiStateClientWait | HandshakeState::CmiStateServerWait => {
                self.handle_cmi(frame)
            }
            HandshakeState::Complete => self.handle_post_handshake(frame),
            state if state.is_terminal() => {
                debug!(ski = %self.remote_ski, state = ?state, "SHIP: dropping frame in terminal state");
            }
            state => match parse_message(frame) {
                Ok((_, message)) => self.handle_message(message),
                Err(e) if state.is_hello_listening() => {
                    warn!(ski = %self.remote_ski, error = %e, "SHIP: unreadable hello message");
                    self.abort_hello();
                }
                Err(e) => self.fail(e),
            },
        }
    }

    pub(crate) fn handle_timeout(&mut self, kind: TimerKind) {
        use HandshakeState::*;
        match (self.state, kind) {
            (CmiStateClientWait | CmiStateServerWait, _) => {
                self.fail(ShipError::Timeout("connection mode initialisation".into()))
            }
            (HelloStateReadyListen, _) => {
                self.fail(ShipError::Timeout("waiting for hello ready".into()))
            }
            (HelloStatePendingListen, TimerKind::WaitForReady)
            | (HelloStatePendingListen, TimerKind::SendProlongationRequest) => {
                self.request_prolongation()
            }
            (HelloStatePendingListen, TimerKind::ProlongRequestReply) => {
                warn!(ski = %self.remote_ski, "SHIP: prolongation request unanswered");
                self.abort_hello();
            }
            (
                ProtHStateClientListenChoice
                | ProtHStateServerListenProposal
                | ProtHStateServerListenConfirm,
                _,
            ) => self.protocol_error(
                ProtocolHandshakeErrorCode::Timeout,
                "protocol handshake".into(),
            ),
            (PinStateCheckListen, _) => self.fail(ShipError::Timeout("PIN state".into())),
            (AccessMethodsRequest, _) => {
                self.fail(ShipError::Timeout("access methods".into()))
            }
            (state, kind) => {
                debug!(ski = %self.remote_ski, state = ?state, kind = ?kind, "SHIP: ignoring timer");
            }
        }
    }

    pub(crate) fn handle_transport_closed(&mut self, code: Option<u16>, reason: &str) {
        self.timer.disarm();
        if !self.state.is_terminal() {
            if code == Some(CLOSE_CODE_REJECTED) {
                info!(ski = %self.remote_ski, "SHIP: peer rejected the connection");
                self.set_state(HandshakeState::HelloStateRejected);
            } else {
                self.record_error(ShipError::TransportFailure(format!(
                    "transport closed: {reason}"
                )));
            }
        }
        self.request_shutdown(code.unwrap_or(CLOSE_CODE_NORMAL), reason, false);
    }

    /// The application trusts the peer now; leave the pending hello.
    pub(crate) fn approve_pending(&mut self) {
        if !self.trust_decision_pending || self.state.is_terminal() {
            debug!(ski = %self.remote_ski, state = ?self.state, "SHIP: no pending hello to approve");
            return;
        }
        info!(ski = %self.remote_ski, "SHIP: pending connection approved");
        self.timer.disarm();
        self.hello_ready_init();
    }

    /// The application refuses the peer while the hello is still open.
    pub(crate) fn abort_pending(&mut self) {
        if !self.state.is_hello_listening() {
            debug!(ski = %self.remote_ski, state = ?self.state, "SHIP: no pending hello to abort");
            return;
        }
        self.abort_hello();
    }

    /// Local close request.
    pub(crate) fn close(&mut self, reason: &str) {
        self.timer.disarm();
        let announce = self.state == HandshakeState::Complete;
        self.request_shutdown(CLOSE_CODE_NORMAL, reason, announce);
    }

    /// Wrap an application payload in a data message and send it.
    pub(crate) fn send_payload(&mut self, payload: &[u8]) -> ShipResult<()> {
        if self.state != HandshakeState::Complete || self.shutdown.is_some() {
            return Err(ShipError::ProtocolViolation(format!(
                "cannot send data in state {}",
                self.state
            )));
        }
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        let frame = encode_frame(MessageClass::Data, &ShipMessage::Data(DataMessage::new(value)))?;
        self.transport.send_frame(frame)
    }

    // --- Connection mode initialisation ---

    fn handle_cmi(&mut self, frame: &[u8]) {
        self.timer.disarm();
        self.set_state(match self.role {
            ConnectionRole::Client => HandshakeState::CmiStateClientEvaluate,
            ConnectionRole::Server => HandshakeState::CmiStateServerEvaluate,
        });

        if frame != INIT_FRAME {
            let detail = if frame.len() != INIT_FRAME.len() {
                format!("init message has {} bytes", frame.len())
            } else if frame[0] != INIT_FRAME[0] {
                format!("unexpected message type 0x{:02x}", frame[0])
            } else {
                format!("unexpected init value 0x{:02x}", frame[1])
            };
            self.fail(ShipError::MalformedMessage(detail));
            return;
        }

        if self.role == ConnectionRole::Server && !self.send_raw(INIT_FRAME.to_vec()) {
            return;
        }
        self.enter_hello();
    }

    // --- Hello ---

    fn enter_hello(&mut self) {
        self.set_state(HandshakeState::HelloState);
        if self.role == ConnectionRole::Client || self.trust.is_trusted(&self.remote_ski) {
            self.hello_ready_init();
        } else {
            self.hello_pending_init();
        }
    }

    fn hello_ready_init(&mut self) {
        self.set_state(HandshakeState::HelloStateReadyInit);
        self.trust_decision_pending = false;
        let hello =
            ConnectionHello::new(ConnectionHelloPhase::Ready).with_waiting(self.config.hello_init_ms);
        if !self.send_control(ShipMessage::ConnectionHello(hello)) {
            return;
        }
        if self.remote_ready {
            self.hello_ok();
            return;
        }
        self.set_state(HandshakeState::HelloStateReadyListen);
        self.timer
            .arm(TimerKind::WaitForReady, self.config.hello_init());
    }

    fn hello_pending_init(&mut self) {
        self.set_state(HandshakeState::HelloStatePendingInit);
        if !self.trust.allow_waiting_for_trust(&self.remote_ski) {
            info!(ski = %self.remote_ski, "SHIP: untrusted peer may not wait for trust");
            self.abort_hello();
            return;
        }
        if self.trust.trust_decision_needed(&self.remote_ski) {
            info!(ski = %self.remote_ski, "SHIP: peer approved by application");
            self.hello_ready_init();
            return;
        }

        let hello = ConnectionHello::new(ConnectionHelloPhase::Pending)
            .with_waiting(self.config.hello_init_ms);
        if !self.send_control(ShipMessage::ConnectionHello(hello)) {
            return;
        }
        self.trust_decision_pending = true;
        self.set_state(HandshakeState::HelloStatePendingListen);
        self.timer
            .arm(TimerKind::WaitForReady, self.config.hello_init());
    }

    fn ready_listen_hello(&mut self, hello: ConnectionHello) {
        match hello.phase {
            ConnectionHelloPhase::Ready => self.hello_ok(),
            ConnectionHelloPhase::Pending if hello.is_prolongation_request() => {
                debug!(
                    ski = %self.remote_ski,
                    remaining_ms = ?self.timer.remaining().map(|d| d.as_millis() as u64),
                    "SHIP: peer asked for more time"
                );
                let reply = ConnectionHello::new(ConnectionHelloPhase::Ready)
                    .with_waiting(self.config.hello_inc_ms);
                if self.send_control(ShipMessage::ConnectionHello(reply)) {
                    self.timer
                        .arm(TimerKind::WaitForReady, self.config.hello_inc());
                }
            }
            ConnectionHelloPhase::Pending => {
                debug!(ski = %self.remote_ski, "SHIP: peer still pending");
            }
            ConnectionHelloPhase::Aborted => self.remote_abort(),
        }
    }

    fn pending_listen_hello(&mut self, hello: ConnectionHello) {
        match hello.phase {
            ConnectionHelloPhase::Ready => {
                self.remote_ready = true;
                self.schedule_prolongation(hello.waiting);
            }
            ConnectionHelloPhase::Pending if hello.is_prolongation_request() => {
                let reply = ConnectionHello::new(ConnectionHelloPhase::Pending)
                    .with_waiting(self.config.hello_inc_ms);
                self.send_control(ShipMessage::ConnectionHello(reply));
            }
            ConnectionHelloPhase::Pending => self.schedule_prolongation(hello.waiting),
            ConnectionHelloPhase::Aborted => self.remote_abort(),
        }
    }

    /// The peer told us how long it keeps waiting. Ask for more time one
    /// threshold before that runs out.
    fn schedule_prolongation(&mut self, waiting_ms: Option<u64>) {
        let Some(waiting_ms) = waiting_ms else {
            return;
        };
        let next = Duration::from_millis(waiting_ms).checked_sub(self.config.hello_prolong_thr_inc());
        match next {
            Some(next) if next >= self.config.hello_prolong_min() => {
                self.timer.arm(TimerKind::SendProlongationRequest, next);
            }
            _ => {
                warn!(
                    ski = %self.remote_ski,
                    waiting_ms,
                    "SHIP: remote waiting time too short for a prolongation"
                );
                self.abort_hello();
            }
        }
    }

    fn request_prolongation(&mut self) {
        if !self.trust.allow_waiting_for_trust(&self.remote_ski) {
            self.abort_hello();
            return;
        }
        debug!(ski = %self.remote_ski, "SHIP: requesting hello prolongation");
        let hello = ConnectionHello::new(ConnectionHelloPhase::Pending).with_prolongation_request();
        if self.send_control(ShipMessage::ConnectionHello(hello)) {
            self.timer.arm(
                TimerKind::ProlongRequestReply,
                self.config.hello_prolong_waiting_gap(),
            );
        }
    }

    fn hello_ok(&mut self) {
        self.timer.disarm();
        self.trust_decision_pending = false;
        self.set_state(HandshakeState::HelloStateOk);

        match self.role {
            ConnectionRole::Client => {
                self.set_state(HandshakeState::ProtHStateClientInit);
                let announce = MessageProtocolHandshake::local(ProtocolHandshakeType::AnnounceMax);
                if !self.send_control(ShipMessage::MessageProtocolHandshake(announce)) {
                    return;
                }
                self.set_state(HandshakeState::ProtHStateClientListenChoice);
            }
            ConnectionRole::Server => {
                self.set_state(HandshakeState::ProtHStateServerInit);
                self.set_state(HandshakeState::ProtHStateServerListenProposal);
            }
        }
        self.timer
            .arm(TimerKind::WaitForReady, self.config.protocol_timeout());
    }

    fn abort_hello(&mut self) {
        self.timer.disarm();
        self.trust_decision_pending = false;
        self.set_state(HandshakeState::HelloStateAbort);
        warn!(ski = %self.remote_ski, "SHIP: aborting hello");

        let hello = ConnectionHello::new(ConnectionHelloPhase::Aborted);
        if let Err(e) = encode_frame(MessageClass::Control, &ShipMessage::ConnectionHello(hello))
            .and_then(|frame| self.transport.send_frame(frame))
        {
            debug!(ski = %self.remote_ski, error = %e, "SHIP: could not send hello abort");
        }
        self.set_state(HandshakeState::HelloStateAbortDone);
        self.request_shutdown(CLOSE_CODE_REJECTED, CLOSE_REASON_REJECTED, false);
    }

    fn remote_abort(&mut self) {
        self.timer.disarm();
        self.trust_decision_pending = false;
        info!(ski = %self.remote_ski, "SHIP: peer aborted hello");
        self.set_state(HandshakeState::HelloStateRemoteAbortDone);
        self.request_shutdown(CLOSE_CODE_NORMAL, "hello aborted by peer", false);
    }

    // --- Protocol handshake ---

    fn client_choice(&mut self, message: MessageProtocolHandshake) {
        self.timer.disarm();
        if message.handshake_type != ProtocolHandshakeType::Select {
            self.protocol_error(
                ProtocolHandshakeErrorCode::UnexpectedMessage,
                "expected protocol selection".into(),
            );
            return;
        }
        if let Err(reason) = check_selection(&message) {
            self.protocol_error(ProtocolHandshakeErrorCode::SelectionMismatch, reason);
            return;
        }
        let select = MessageProtocolHandshake::local(ProtocolHandshakeType::Select);
        if !self.send_control(ShipMessage::MessageProtocolHandshake(select)) {
            return;
        }
        self.set_state(HandshakeState::ProtHStateClientOk);
        self.enter_pin();
    }

    fn server_proposal(&mut self, message: MessageProtocolHandshake) {
        self.timer.disarm();
        if message.handshake_type != ProtocolHandshakeType::AnnounceMax {
            self.protocol_error(
                ProtocolHandshakeErrorCode::UnexpectedMessage,
                "expected protocol announcement".into(),
            );
            return;
        }
        if message.version.major < PROTOCOL_VERSION.major {
            self.protocol_error(
                ProtocolHandshakeErrorCode::SelectionMismatch,
                format!(
                    "peer supports at most version {}.{}",
                    message.version.major, message.version.minor
                ),
            );
            return;
        }
        if !message.formats.format.iter().any(|f| f == FORMAT_JSON_UTF8) {
            self.protocol_error(
                ProtocolHandshakeErrorCode::SelectionMismatch,
                format!("no common format in {:?}", message.formats.format),
            );
            return;
        }

        let select = MessageProtocolHandshake::local(ProtocolHandshakeType::Select);
        if !self.send_control(ShipMessage::MessageProtocolHandshake(select)) {
            return;
        }
        self.set_state(HandshakeState::ProtHStateServerListenConfirm);
        self.timer
            .arm(TimerKind::WaitForReady, self.config.protocol_timeout());
    }

    fn server_confirm(&mut self, message: MessageProtocolHandshake) {
        self.timer.disarm();
        if message.handshake_type != ProtocolHandshakeType::Select {
            self.protocol_error(
                ProtocolHandshakeErrorCode::UnexpectedMessage,
                "expected protocol selection".into(),
            );
            return;
        }
        if let Err(reason) = check_selection(&message) {
            self.protocol_error(ProtocolHandshakeErrorCode::SelectionMismatch, reason);
            return;
        }
        self.set_state(HandshakeState::ProtHStateServerOk);
        self.enter_pin();
    }

    fn protocol_error(&mut self, code: ProtocolHandshakeErrorCode, reason: String) {
        self.timer.disarm();
        let message = ShipMessage::MessageProtocolHandshakeError(code.into());
        if let Err(e) = encode_frame(MessageClass::Control, &message)
            .and_then(|frame| self.transport.send_frame(frame))
        {
            debug!(ski = %self.remote_ski, error = %e, "SHIP: could not send protocol error");
        }
        let error = match code {
            ProtocolHandshakeErrorCode::Timeout => ShipError::Timeout(reason),
            _ => ShipError::ProtocolViolation(reason),
        };
        self.fail(error);
    }

    // --- PIN ---

    fn enter_pin(&mut self) {
        self.set_state(HandshakeState::PinStateCheckInit);
        let pin = ConnectionPinState {
            pin_state: PinStateType::None,
            input_permission: None,
        };
        if !self.send_control(ShipMessage::ConnectionPinState(pin)) {
            return;
        }
        self.set_state(HandshakeState::PinStateCheckListen);
        self.timer
            .arm(TimerKind::WaitForReady, self.config.protocol_timeout());
    }

    fn pin_state(&mut self, pin: ConnectionPinState) {
        self.timer.disarm();
        match pin.pin_state {
            PinStateType::None => {
                self.set_state(HandshakeState::PinStateCheckOk);
                self.enter_access_methods();
            }
            other => self.fail(ShipError::UnsupportedFeature(format!(
                "PIN verification ({other:?})"
            ))),
        }
    }

    // --- Access methods ---

    fn enter_access_methods(&mut self) {
        if !self.send_control(ShipMessage::AccessMethodsRequest(model::AccessMethodsRequest {})) {
            return;
        }
        self.set_state(HandshakeState::AccessMethodsRequest);
        self.timer
            .arm(TimerKind::WaitForReady, self.config.protocol_timeout());
    }

    fn answer_access_methods_request(&mut self) {
        let methods = AccessMethods {
            id: Some(self.local_ship_id.clone()),
            ..Default::default()
        };
        self.send_control(ShipMessage::AccessMethods(methods));
    }

    fn access_methods(&mut self, methods: AccessMethods) {
        let Some(received) = methods.id.filter(|id| !id.is_empty()) else {
            self.fail(ShipError::MalformedMessage("accessMethods without id".into()));
            return;
        };

        let pinned = self
            .trust
            .pinned_ship_id(&self.remote_ski)
            .or_else(|| self.identity_tx.borrow().ship_id.clone());
        match pinned {
            Some(expected) if expected != received => {
                self.fail(ShipError::IdentityMismatch { expected, received });
                return;
            }
            Some(_) => {}
            None => self.sink.identity_learned(&self.remote_ski, &received),
        }
        info!(
            ski = %self.remote_ski,
            local_ski = %self.local_ski,
            role = %self.role,
            ship_id = %received,
            "SHIP: handshake complete"
        );
        self.identity_tx.send_modify(|identity| identity.ship_id = Some(received));

        self.timer.disarm();
        self.set_state(HandshakeState::Approved);
        self.set_state(HandshakeState::Complete);
    }

    // --- Dispatch ---

    fn handle_message(&mut self, message: ShipMessage) {
        use HandshakeState::*;
        match (self.state, message) {
            (HelloStateReadyListen, ShipMessage::ConnectionHello(hello)) => {
                self.ready_listen_hello(hello)
            }
            (HelloStatePendingListen, ShipMessage::ConnectionHello(hello)) => {
                self.pending_listen_hello(hello)
            }
            (state, message) if state.is_hello_listening() => {
                warn!(ski = %self.remote_ski, kind = message.kind(), "SHIP: unexpected message during hello");
                self.abort_hello();
            }
            (_, ShipMessage::MessageProtocolHandshakeError(e)) => {
                self.fail(ShipError::ProtocolViolation(format!(
                    "peer reported protocol handshake error {}",
                    e.error
                )))
            }
            (ProtHStateClientListenChoice, ShipMessage::MessageProtocolHandshake(m)) => {
                self.client_choice(m)
            }
            (ProtHStateServerListenProposal, ShipMessage::MessageProtocolHandshake(m)) => {
                self.server_proposal(m)
            }
            (ProtHStateServerListenConfirm, ShipMessage::MessageProtocolHandshake(m)) => {
                self.server_confirm(m)
            }
            (
                ProtHStateClientListenChoice
                | ProtHStateServerListenProposal
                | ProtHStateServerListenConfirm,
                message,
            ) => self.protocol_error(
                ProtocolHandshakeErrorCode::UnexpectedMessage,
                format!("unexpected {} during protocol handshake", message.kind()),
            ),
            (PinStateCheckListen, ShipMessage::ConnectionPinState(pin)) => self.pin_state(pin),
            (
                PinStateCheckListen | AccessMethodsRequest,
                ShipMessage::AccessMethodsRequest(_),
            ) => self.answer_access_methods_request(),
            (AccessMethodsRequest, ShipMessage::AccessMethods(methods)) => {
                self.access_methods(methods)
            }
            (state, message) => self.fail(ShipError::ProtocolViolation(format!(
                "unexpected {} in state {state}",
                message.kind()
            ))),
        }
    }

    fn handle_post_handshake(&mut self, frame: &[u8]) {
        let message = match parse_message(frame) {
            Ok((_, message)) => message,
            Err(e) => {
                warn!(ski = %self.remote_ski, error = %e, "SHIP: dropping undecodable frame");
                return;
            }
        };
        match message {
            ShipMessage::Data(data) => {
                let protocol_id = &data.header.protocol_id;
                self.identity_tx.send_if_modified(|identity| {
                    if identity.protocol_id.as_ref() == Some(protocol_id) {
                        return false;
                    }
                    identity.protocol_id = Some(protocol_id.clone());
                    true
                });
                match serde_json::to_vec(&data.payload) {
                    Ok(payload) => self.sink.application_payload(&self.remote_ski, payload),
                    Err(e) => warn!(ski = %self.remote_ski, error = %e, "SHIP: bad data payload"),
                }
            }
            ShipMessage::AccessMethodsRequest(_) => self.answer_access_methods_request(),
            other => {
                debug!(ski = %self.remote_ski, kind = other.kind(), "SHIP: ignoring control message");
            }
        }
    }

    fn handle_close_frame(&mut self, frame: &[u8]) {
        let close = match parse_close(frame) {
            Ok(close) => close,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        match close.phase {
            ConnectionClosePhase::Announce => {
                let confirm = ConnectionClose {
                    phase: ConnectionClosePhase::Confirm,
                    max_time: None,
                    reason: None,
                };
                if let Err(e) =
                    encode_frame(MessageClass::End, &ShipMessage::ConnectionClose(confirm))
                        .and_then(|frame| self.transport.send_frame(frame))
                {
                    debug!(ski = %self.remote_ski, error = %e, "SHIP: could not confirm close");
                }
                self.remote_closed("peer closed the connection");
            }
            ConnectionClosePhase::Confirm => self.remote_closed("peer confirmed close"),
        }
    }

    fn remote_closed(&mut self, reason: &str) {
        self.timer.disarm();
        if !self.state.is_terminal() {
            self.record_error(ShipError::ConnectionClosed(reason.to_string()));
        }
        self.request_shutdown(CLOSE_CODE_NORMAL, reason, false);
    }

    // --- Helpers ---

    fn send_raw(&mut self, frame: Vec<u8>) -> bool {
        match self.transport.send_frame(frame) {
            Ok(()) => true,
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn send_control(&mut self, message: ShipMessage) -> bool {
        match encode_frame(MessageClass::Control, &message) {
            Ok(frame) => self.send_raw(frame),
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn fail(&mut self, error: ShipError) {
        if self.state.is_terminal() {
            return;
        }
        warn!(
            ski = %self.remote_ski,
            state = ?self.state,
            error = %error,
            "SHIP: handshake failed"
        );
        self.timer.disarm();
        let reason = error.to_string();
        self.record_error(error);
        self.request_shutdown(CLOSE_CODE_NORMAL, &reason, false);
    }

    fn record_error(&mut self, error: ShipError) {
        self.publish(ShipState::failed(error));
    }

    fn request_shutdown(&mut self, code: u16, reason: &str, announce: bool) {
        if self.shutdown.is_none() {
            self.shutdown = Some(Shutdown {
                code,
                reason: reason.to_string(),
                announce,
            });
        }
    }

    fn set_state(&mut self, state: HandshakeState) {
        self.publish(ShipState::new(state));
    }

    fn publish(&mut self, snapshot: ShipState) {
        let state = snapshot.state;
        if self.state.is_terminal() || self.state == state {
            return;
        }
        debug_assert!(
            state.phase() >= self.state.phase(),
            "handshake moved backwards from {:?} to {:?}",
            self.state,
            state
        );
        debug!(ski = %self.remote_ski, from = ?self.state, to = ?state, "SHIP: state change");
        self.state = state;
        self.state_tx.send_replace(snapshot.clone());
        self.sink
            .handshake_state_changed(&self.remote_ski, &snapshot);
    }
}

/// Validate a `select` message: exactly version 1.0 and JSON-UTF8.
fn check_selection(message: &MessageProtocolHandshake) -> Result<(), String> {
    if message.version != PROTOCOL_VERSION {
        return Err(format!(
            "unsupported protocol version {}.{}",
            message.version.major, message.version.minor
        ));
    }
    match message.formats.format.as_slice() {
        [format] if format == FORMAT_JSON_UTF8 => Ok(()),
        [format] => Err(format!("unsupported format {format}")),
        formats => Err(format!("expected exactly one format, got {}", formats.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiplink_types::model::{MessageProtocolFormats, ProtocolVersion};

    fn selection(major: u8, formats: &[&str]) -> MessageProtocolHandshake {
        MessageProtocolHandshake {
            handshake_type: ProtocolHandshakeType::Select,
            version: ProtocolVersion { major, minor: 0 },
            formats: MessageProtocolFormats {
                format: formats.iter().map(|f| f.to_string()).collect(),
            },
        }
    }

    #[test]
    fn test_check_selection() {
        assert!(check_selection(&selection(1, &["JSON-UTF8"])).is_ok());
        assert!(check_selection(&selection(2, &["JSON-UTF8"])).is_err());
        assert!(check_selection(&selection(1, &["JSON-UTF16"])).is_err());
        assert!(check_selection(&selection(1, &["JSON-UTF8", "JSON-UTF16"])).is_err());
        assert!(check_selection(&selection(1, &[])).is_err());
    }
}
