//! Handshake state graph.

use crate::error::ShipError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionRole {
    /// Locally initiated (we dialed).
    Client,
    /// Remotely initiated (we accepted).
    Server,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Client => write!(f, "client"),
            ConnectionRole::Server => write!(f, "server"),
        }
    }
}

/// Coarse handshake phase. Ordered: a successful handshake only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HandshakePhase {
    Init,
    Hello,
    Protocol,
    Pin,
    AccessMethods,
    Complete,
    Failed,
}

/// Every state a SHIP connection can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandshakeState {
    // Connection mode initialisation
    CmiStateInitStart,
    CmiStateClientSend,
    CmiStateClientWait,
    CmiStateClientEvaluate,
    CmiStateServerWait,
    CmiStateServerEvaluate,

    // Hello
    HelloState,
    HelloStateReadyInit,
    HelloStateReadyListen,
    HelloStatePendingInit,
    HelloStatePendingListen,
    HelloStateOk,
    HelloStateAbort,
    HelloStateAbortDone,
    HelloStateRemoteAbortDone,
    HelloStateRejected,

    // Protocol handshake
    ProtHStateServerInit,
    ProtHStateClientInit,
    ProtHStateServerListenProposal,
    ProtHStateServerListenConfirm,
    ProtHStateClientListenChoice,
    ProtHStateClientOk,
    ProtHStateServerOk,

    // PIN check
    PinStateCheckInit,
    PinStateCheckListen,
    PinStateCheckOk,

    // Access methods
    AccessMethodsRequest,
    Approved,

    Complete,
    Error,
}

impl HandshakeState {
    pub fn phase(self) -> HandshakePhase {
        use HandshakeState::*;
        match self {
            CmiStateInitStart
            | CmiStateClientSend
            | CmiStateClientWait
            | CmiStateClientEvaluate
            | CmiStateServerWait
            | CmiStateServerEvaluate => HandshakePhase::Init,
            HelloState
            | HelloStateReadyInit
            | HelloStateReadyListen
            | HelloStatePendingInit
            | HelloStatePendingListen
            | HelloStateOk => HandshakePhase::Hello,
            ProtHStateServerInit
            | ProtHStateClientInit
            | ProtHStateServerListenProposal
            | ProtHStateServerListenConfirm
            | ProtHStateClientListenChoice
            | ProtHStateClientOk
            | ProtHStateServerOk => HandshakePhase::Protocol,
            PinStateCheckInit | PinStateCheckListen | PinStateCheckOk => HandshakePhase::Pin,
            AccessMethodsRequest | Approved => HandshakePhase::AccessMethods,
            Complete => HandshakePhase::Complete,
            HelloStateAbort
            | HelloStateAbortDone
            | HelloStateRemoteAbortDone
            | HelloStateRejected
            | Error => HandshakePhase::Failed,
        }
    }

    /// No further handshake transitions happen from a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HandshakeState::Complete
                | HandshakeState::Error
                | HandshakeState::HelloStateAbortDone
                | HandshakeState::HelloStateRemoteAbortDone
                | HandshakeState::HelloStateRejected
        )
    }

    /// A hello state in which the local side still waits for the peer or for a trust decision.
    pub fn is_hello_listening(self) -> bool {
        matches!(
            self,
            HandshakeState::HelloStateReadyListen | HandshakeState::HelloStatePendingListen
        )
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State snapshot reported to the application on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipState {
    pub state: HandshakeState,
    pub error: Option<ShipError>,
}

impl ShipState {
    pub fn new(state: HandshakeState) -> Self {
        Self { state, error: None }
    }

    pub fn failed(error: ShipError) -> Self {
        Self {
            state: HandshakeState::Error,
            error: Some(error),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == HandshakeState::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        assert!(HandshakePhase::Init < HandshakePhase::Hello);
        assert!(HandshakePhase::Pin < HandshakePhase::AccessMethods);
        assert!(HandshakePhase::Complete < HandshakePhase::Failed);
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(HandshakeState::CmiStateClientWait.phase(), HandshakePhase::Init);
        assert_eq!(HandshakeState::HelloStatePendingListen.phase(), HandshakePhase::Hello);
        assert_eq!(
            HandshakeState::ProtHStateClientListenChoice.phase(),
            HandshakePhase::Protocol
        );
        assert_eq!(HandshakeState::Approved.phase(), HandshakePhase::AccessMethods);
        assert_eq!(HandshakeState::HelloStateAbortDone.phase(), HandshakePhase::Failed);
    }

    #[test]
    fn test_terminal_states() {
        assert!(HandshakeState::Complete.is_terminal());
        assert!(HandshakeState::HelloStateRejected.is_terminal());
        assert!(!HandshakeState::HelloStateAbort.is_terminal());
        assert!(!HandshakeState::Approved.is_terminal());
    }

    #[test]
    fn test_failed_state_carries_error() {
        let state = ShipState::failed(ShipError::Timeout("hello".into()));
        assert_eq!(state.state, HandshakeState::Error);
        assert!(!state.is_complete());
    }
}
