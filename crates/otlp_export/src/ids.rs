//! Fixed-width hex identifiers.
//!
//! OTLP carries trace ids as 16 bytes and span ids as 8 bytes. Internal trace
//! and observation identifiers are free-form strings (usually UUIDs), so they
//! are mapped onto the fixed widths deterministically:
//!
//! 1. Lower-case the identifier and drop `-` separators, so a UUID becomes its
//!    32 hex digits.
//! 2. If anything other than hex digits remains, hex-encode the raw
//!    identifier byte-wise instead.
//! 3. Left-pad with `0` when shorter than the target width, keep the leading
//!    characters when longer.
//!
//! 4. An all-zero result is invalid in OTLP, so its last digit becomes `1`.
//!
//! Step 3 is lossy: two identifiers sharing their first 16 (or 32) hex digits
//! map to the same span (or trace) id. That is accepted for export purposes.

use thiserror::Error;

/// Hex length of an OTLP trace id (16 bytes).
pub const TRACE_ID_HEX_LEN: usize = 32;
/// Hex length of an OTLP span id (8 bytes).
pub const SPAN_ID_HEX_LEN: usize = 16;

/// Error decoding a hex identifier into raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("invalid hex identifier {0:?}")]
    InvalidHex(String),
}

/// Derives the 32-character trace id for an internal identifier.
pub fn trace_id_hex(id: &str) -> String {
    fixed_width_hex(id, TRACE_ID_HEX_LEN)
}

/// Derives the 16-character span id for an internal identifier.
pub fn span_id_hex(id: &str) -> String {
    fixed_width_hex(id, SPAN_ID_HEX_LEN)
}

/// Pads or truncates a normalised identifier to exactly `width` hex digits.
///
/// Idempotent: feeding the output back in returns it unchanged.
pub fn fixed_width_hex(id: &str, width: usize) -> String {
    let normalized = normalize(id);
    let mut out = if normalized.len() >= width {
        normalized[..width].to_owned()
    } else {
        let mut padded = "0".repeat(width - normalized.len());
        padded.push_str(&normalized);
        padded
    };
    if width > 0 && out.bytes().all(|b| b == b'0') {
        out.replace_range(width - 1.., "1");
    }

    debug_assert_fixed_width!(out, width);
    out
}

/// Decodes an identifier into `N` raw bytes, normalising it to `2 * N` hex
/// digits first.
pub fn id_bytes<const N: usize>(id: &str) -> Result<[u8; N], IdError> {
    let hex_id = fixed_width_hex(id, N * 2);
    let mut out = [0u8; N];
    hex::decode_to_slice(&hex_id, &mut out).map_err(|_| IdError::InvalidHex(id.to_owned()))?;
    Ok(out)
}

/// Raw 16-byte trace id.
pub fn trace_id_bytes(id: &str) -> Result<[u8; 16], IdError> {
    id_bytes::<16>(id)
}

/// Raw 8-byte span id.
pub fn span_id_bytes(id: &str) -> Result<[u8; 8], IdError> {
    id_bytes::<8>(id)
}

fn normalize(id: &str) -> String {
    let stripped: String = id
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        stripped
    } else {
        hex::encode(id.as_bytes())
    }
}
