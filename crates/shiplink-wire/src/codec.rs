//! SHIP wire codec.
//!
//! SHIP does not put JSON objects on the wire. Every object is instead sent
//! as an array of single-key objects, one per member, in member order:
//!
//! ```text
//! {"connectionHello":{"phase":"ready","waiting":60000}}
//! {"connectionHello":[{"phase":"ready"},{"waiting":60000}]}
//! ```
//!
//! Encoding walks the parsed value. Decoding is a byte-level rewrite, which
//! is safe for the regular shapes SHIP messages have.
//! [`from_wire_format_structural`] is the parse-based equivalent and is kept
//! as the reference the rewrite is tested against.

use serde_json::{Map, Value};
use shiplink_types::ShipError;
use thiserror::Error;

/// Errors from the wire codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),
}

impl From<CodecError> for ShipError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::MalformedInput(msg) => ShipError::MalformedMessage(msg),
        }
    }
}

/// Convert conventional JSON into SHIP wire JSON.
pub fn to_wire_format(json: &[u8]) -> Result<String, CodecError> {
    let value: Value =
        serde_json::from_slice(json).map_err(|e| CodecError::MalformedInput(e.to_string()))?;
    let root_is_object = value.is_object();
    let text = serde_json::to_string(&encode_value(value))
        .map_err(|e| CodecError::MalformedInput(e.to_string()))?;

    // A root object becomes a bare sequence of one-key objects.
    if root_is_object && text.starts_with('[') && text.ends_with(']') {
        return Ok(text[1..text.len() - 1].to_string());
    }
    Ok(text)
}

fn encode_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.is_empty() {
                return Value::Object(Map::new());
            }
            let members = map
                .into_iter()
                .map(|(key, inner)| {
                    let mut single = Map::new();
                    single.insert(key, encode_value(inner));
                    Value::Object(single)
                })
                .collect();
            Value::Array(members)
        }
        Value::Array(items) if items.is_empty() => Value::Object(Map::new()),
        Value::Array(items) => Value::Array(items.into_iter().map(encode_value).collect()),
        scalar => scalar,
    }
}

/// Convert SHIP wire JSON back into conventional JSON.
pub fn from_wire_format(wire: &[u8]) -> Vec<u8> {
    let out = replace_all(wire, b"[{", b"{");
    let out = replace_all(&out, b"},{", b",");
    let out = replace_all(&out, b"}]", b"}");
    replace_all(&out, b"[]", b"{}")
}

fn replace_all(haystack: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(from) {
            out.extend_from_slice(to);
            i += from.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

/// Parse-based decoder, equivalent to [`from_wire_format`] for message shapes.
pub fn from_wire_format_structural(wire: &[u8]) -> Result<Value, CodecError> {
    let mut wrapped = Vec::with_capacity(wire.len() + 2);
    wrapped.push(b'[');
    wrapped.extend_from_slice(wire);
    wrapped.push(b']');

    let root: Vec<Value> =
        serde_json::from_slice(&wrapped).map_err(|e| CodecError::MalformedInput(e.to_string()))?;

    if is_member_list(&root) {
        return Ok(collapse_members(root));
    }
    match <[Value; 1]>::try_from(root) {
        Ok([single]) => Ok(decode_value(single)),
        Err(items) => Err(CodecError::MalformedInput(format!(
            "expected one root value, found {}",
            items.len()
        ))),
    }
}

fn is_member_list(items: &[Value]) -> bool {
    !items.is_empty()
        && items
            .iter()
            .all(|item| matches!(item, Value::Object(map) if map.len() == 1))
}

fn collapse_members(items: Vec<Value>) -> Value {
    let mut map = Map::new();
    for item in items {
        if let Value::Object(single) = item {
            for (key, inner) in single {
                map.insert(key, decode_value(inner));
            }
        }
    }
    Value::Object(map)
}

fn decode_value(value: Value) -> Value {
    match value {
        Value::Array(items) if is_member_list(&items) => collapse_members(items),
        Value::Array(items) => Value::Array(items.into_iter().map(decode_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, inner)| (key, decode_value(inner)))
                .collect(),
        ),
        scalar => scalar,
    }
}
