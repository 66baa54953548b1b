//! Subject Key Identifier helpers.
//!
//! A SKI is the SHA-1 key identifier of a peer certificate and acts as the
//! peer's fingerprint. Tools print it in many shapes (`AB:CD:..`, grouped with
//! spaces or dashes, upper case); the connection layer only ever compares the
//! normalized form.

use crate::error::{ShipError, ShipResult};

/// Length of a SKI in bytes.
pub const SKI_LEN: usize = 20;

/// Lowercase the SKI and strip separator characters.
pub fn normalize_ski(ski: &str) -> String {
    ski.chars()
        .filter(|c| !matches!(c, ' ' | '-' | ':'))
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Normalize a SKI and check that it encodes exactly 20 bytes of hex.
pub fn parse_ski(ski: &str) -> ShipResult<String> {
    let normalized = normalize_ski(ski);
    let bytes = hex::decode(&normalized)
        .map_err(|e| ShipError::Config(format!("invalid SKI '{ski}': {e}")))?;
    if bytes.len() != SKI_LEN {
        return Err(ShipError::Config(format!(
            "invalid SKI '{ski}': expected {SKI_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(normalized)
}
