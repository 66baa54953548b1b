//! Core types shared across the shiplink crates.
//!
//! This crate holds the data model of the SHIP connection layer: the error
//! taxonomy, the configuration file format, the control and data message
//! models exchanged during a handshake, and the handshake state enum. It
//! performs no network I/O.

pub mod config;
pub mod error;
pub mod model;
pub mod ski;
pub mod state;

pub use config::{load_config, HandshakeConfig, ShipConfig, TransportConfig};
pub use error::{ShipError, ShipResult};
pub use state::{ConnectionRole, HandshakePhase, HandshakeState, ShipState};
