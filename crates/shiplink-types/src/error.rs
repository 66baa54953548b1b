//! Shared error types for the shiplink crates.

use thiserror::Error;

/// Errors a SHIP connection can end with.
///
/// The type is `Clone` because the same value is stored on the connection,
/// published through the state watch and handed to the application sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShipError {
    /// A frame or message could not be parsed.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The peer sent a valid message that is not allowed in the current state.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A handshake deadline expired.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The peer presented a SHIP ID that differs from the pinned one.
    #[error("Identity mismatch: expected '{expected}', received '{received}'")]
    IdentityMismatch {
        /// The SHIP ID pinned for this SKI.
        expected: String,
        /// The SHIP ID the peer announced.
        received: String,
    },

    /// The underlying transport failed or closed unexpectedly.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// The peer requested a feature this implementation does not offer.
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// The connection is closed or was never established.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for ShipError {
    fn from(e: serde_json::Error) -> Self {
        ShipError::MalformedMessage(e.to_string())
    }
}

impl From<std::io::Error> for ShipError {
    fn from(e: std::io::Error) -> Self {
        ShipError::TransportFailure(e.to_string())
    }
}

/// Alias for Result with ShipError.
pub type ShipResult<T> = Result<T, ShipError>;
