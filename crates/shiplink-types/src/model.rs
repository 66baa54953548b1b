//! SHIP control and data message models.
//!
//! These are the conventional-JSON shapes of the messages exchanged after the
//! init frame. Each message is a single-key object naming the message type,
//! which maps onto the externally tagged [`ShipMessage`] enum. The wire form
//! (arrays of single-key objects) is produced by the codec in `shiplink-wire`.

use serde::{Deserialize, Serialize};

/// Protocol id placed in the header of every data message.
pub const SHIP_PROTOCOL_ID: &str = "ee1.0";

/// The only message format this implementation speaks.
pub const FORMAT_JSON_UTF8: &str = "JSON-UTF8";

/// Protocol version negotiated in the protocol handshake.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// Any message exchanged after the init frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ShipMessage {
    ConnectionHello(ConnectionHello),
    MessageProtocolHandshake(MessageProtocolHandshake),
    MessageProtocolHandshakeError(MessageProtocolHandshakeError),
    ConnectionPinState(ConnectionPinState),
    AccessMethodsRequest(AccessMethodsRequest),
    AccessMethods(AccessMethods),
    ConnectionClose(ConnectionClose),
    Data(DataMessage),
}

impl ShipMessage {
    /// Name of the message as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ShipMessage::ConnectionHello(_) => "connectionHello",
            ShipMessage::MessageProtocolHandshake(_) => "messageProtocolHandshake",
            ShipMessage::MessageProtocolHandshakeError(_) => "messageProtocolHandshakeError",
            ShipMessage::ConnectionPinState(_) => "connectionPinState",
            ShipMessage::AccessMethodsRequest(_) => "accessMethodsRequest",
            ShipMessage::AccessMethods(_) => "accessMethods",
            ShipMessage::ConnectionClose(_) => "connectionClose",
            ShipMessage::Data(_) => "data",
        }
    }
}

// --- Hello ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionHelloPhase {
    Pending,
    Ready,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHello {
    pub phase: ConnectionHelloPhase,
    /// Milliseconds the sender is still willing to wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prolongation_request: Option<bool>,
}

impl ConnectionHello {
    pub fn new(phase: ConnectionHelloPhase) -> Self {
        Self {
            phase,
            waiting: None,
            prolongation_request: None,
        }
    }

    pub fn with_waiting(mut self, waiting_ms: u64) -> Self {
        self.waiting = Some(waiting_ms);
        self
    }

    pub fn with_prolongation_request(mut self) -> Self {
        self.prolongation_request = Some(true);
        self
    }

    pub fn is_prolongation_request(&self) -> bool {
        self.prolongation_request.unwrap_or(false)
    }
}

// --- Protocol handshake ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProtocolHandshakeType {
    AnnounceMax,
    Select,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProtocolFormats {
    #[serde(default)]
    pub format: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageProtocolHandshake {
    pub handshake_type: ProtocolHandshakeType,
    pub version: ProtocolVersion,
    pub formats: MessageProtocolFormats,
}

impl MessageProtocolHandshake {
    /// Our proposal or selection: version 1.0, JSON-UTF8 only.
    pub fn local(handshake_type: ProtocolHandshakeType) -> Self {
        Self {
            handshake_type,
            version: PROTOCOL_VERSION,
            formats: MessageProtocolFormats {
                format: vec![FORMAT_JSON_UTF8.to_string()],
            },
        }
    }
}

/// Error codes carried by `messageProtocolHandshakeError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolHandshakeErrorCode {
    Rfu = 0,
    Timeout = 1,
    UnexpectedMessage = 2,
    SelectionMismatch = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProtocolHandshakeError {
    pub error: u8,
}

impl From<ProtocolHandshakeErrorCode> for MessageProtocolHandshakeError {
    fn from(code: ProtocolHandshakeErrorCode) -> Self {
        Self { error: code as u8 }
    }
}

// --- PIN ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PinStateType {
    Required,
    Optional,
    PinOk,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PinInputPermission {
    Busy,
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPinState {
    pub pin_state: PinStateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_permission: Option<PinInputPermission>,
}

// --- Access methods ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessMethodsRequest {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSdMdns {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessMethodsDns {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessMethods {
    /// The sender's SHIP ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(
        rename = "dnsSd_mDns",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub dns_sd_mdns: Option<DnsSdMdns>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<AccessMethodsDns>,
}

// --- Close ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionClosePhase {
    Announce,
    Confirm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionCloseReason {
    Unspecific,
    RemovedConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionClose {
    pub phase: ConnectionClosePhase,
    /// Milliseconds the announcer waits for the confirm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConnectionCloseReason>,
}

// --- Data ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataHeader {
    pub protocol_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataExtension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub header: DataHeader,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<DataExtension>,
}

impl DataMessage {
    /// Wrap an application payload with the SHIP data header.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            header: DataHeader {
                protocol_id: SHIP_PROTOCOL_ID.to_string(),
            },
            payload,
            extension: None,
        }
    }
}
