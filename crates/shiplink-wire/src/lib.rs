//! SHIP connection layer: framing, trust handshake and connection hub.
//!
//! Brings two nodes from a fresh transport to a trusted, identified
//! connection that carries application payloads, the way SHIP (Smart Home
//! IP) does it for energy-management devices.
//!
//! ## Architecture
//!
//! - **codec**: wire JSON dialect (objects as arrays of one-key objects)
//! - **frame**: one-byte message class header plus codec payload
//! - **transport**: the `FrameTransport` seam, with an in-memory pair
//! - **ws**: WebSocket transport under the `ship` subprotocol
//! - **handshake**: the per-connection state machine
//! - **connection**: driver task and `ShipConnectionHandle`
//! - **registry** / **hub**: one connection per peer, pairing operations
//! - **peer**: `TrustPolicy` and `ApplicationSink`, implemented by the application

pub mod codec;
pub mod connection;
pub mod frame;
pub mod handshake;
pub mod hub;
pub mod peer;
pub mod registry;
pub mod timer;
pub mod transport;
pub mod ws;

pub use codec::{from_wire_format, to_wire_format, CodecError};
pub use connection::ShipConnectionHandle;
pub use frame::MessageClass;
pub use hub::Hub;
pub use peer::{ApplicationSink, StaticTrust, TrustPolicy};
pub use registry::{ConnectionRegistry, RegisterOutcome};
pub use transport::{memory_pair, FrameTransport, MemoryTransport, TransportEvent};
pub use ws::WebSocketTransport;
