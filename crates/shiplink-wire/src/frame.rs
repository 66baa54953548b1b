//! SHIP frame layout: one header byte followed by the payload.

use crate::codec::{from_wire_format, to_wire_format};
use shiplink_types::model::{ConnectionClose, ShipMessage};
use shiplink_types::{ShipError, ShipResult};

/// Message class carried in the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageClass {
    Init = 0x00,
    Control = 0x01,
    Data = 0x02,
    End = 0x03,
}

impl TryFrom<u8> for MessageClass {
    type Error = ShipError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageClass::Init),
            0x01 => Ok(MessageClass::Control),
            0x02 => Ok(MessageClass::Data),
            0x03 => Ok(MessageClass::End),
            other => Err(ShipError::MalformedMessage(format!(
                "unknown frame header 0x{other:02x}"
            ))),
        }
    }
}

/// The connection mode initialisation message: init header, value 0.
pub const INIT_FRAME: [u8; 2] = [MessageClass::Init as u8, 0x00];

/// Serialize a message and prefix it with its class byte.
pub fn encode_frame(class: MessageClass, message: &ShipMessage) -> ShipResult<Vec<u8>> {
    let json = serde_json::to_vec(message)?;
    let wire = to_wire_format(&json)?;
    let mut frame = Vec::with_capacity(wire.len() + 1);
    frame.push(class as u8);
    frame.extend_from_slice(wire.as_bytes());
    Ok(frame)
}

/// Split a frame into its class and conventional JSON payload.
pub fn decode_frame(frame: &[u8]) -> ShipResult<(MessageClass, Vec<u8>)> {
    let (&header, payload) = frame
        .split_first()
        .ok_or_else(|| ShipError::MalformedMessage("empty frame".into()))?;
    let class = MessageClass::try_from(header)?;
    if class == MessageClass::Init {
        return Ok((class, payload.to_vec()));
    }
    Ok((class, from_wire_format(payload)))
}

/// Decode a control, data or end frame into a typed message.
pub fn parse_message(frame: &[u8]) -> ShipResult<(MessageClass, ShipMessage)> {
    let (class, json) = decode_frame(frame)?;
    if class == MessageClass::Init {
        return Err(ShipError::ProtocolViolation(
            "init frame after connection mode initialisation".into(),
        ));
    }
    let message = serde_json::from_slice(&json)?;
    Ok((class, message))
}

/// Cheap check run on every frame before regular dispatch.
pub fn is_close_message(frame: &[u8]) -> bool {
    match frame.split_first() {
        Some((&header, _)) if header == MessageClass::End as u8 => true,
        Some((&header, payload)) if header == MessageClass::Control as u8 => payload
            .windows(CLOSE_KEY.len())
            .any(|w| w == CLOSE_KEY),
        _ => false,
    }
}

const CLOSE_KEY: &[u8] = b"\"connectionClose\"";

/// Decode a frame already identified by [`is_close_message`].
pub fn parse_close(frame: &[u8]) -> ShipResult<ConnectionClose> {
    match parse_message(frame)? {
        (_, ShipMessage::ConnectionClose(close)) => Ok(close),
        (_, other) => Err(ShipError::MalformedMessage(format!(
            "expected connectionClose, got {}",
            other.kind()
        ))),
    }
}
