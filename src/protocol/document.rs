//! Document payloads carried inside wire messages.
//!
//! Documents are opaque to the codec: they are encoded with MessagePack and
//! prefixed with their payload length.

use crate::error::{DriverError, DriverResult};
use serde_json::Value;

/// A document exchanged with the server (commands, replies, change events).
pub type Document = Value;

/// Append `doc` as `[len: i32 LE][msgpack]`.
pub fn write_document(buf: &mut Vec<u8>, doc: &Document) -> DriverResult<()> {
    let payload = rmp_serde::to_vec_named(doc)?;
    let len = i32::try_from(payload.len())
        .map_err(|_| DriverError::MessageTooLarge(payload.len()))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Decode a MessagePack document payload (without its length prefix).
pub fn decode_document(payload: &[u8]) -> DriverResult<Document> {
    Ok(rmp_serde::from_slice(payload)?)
}

/// Read a field out of a reply document as an `i32`, accepting any integral
/// or float representation the server may use.
pub fn get_i32(doc: &Document, field: &str) -> Option<i32> {
    let value = doc.get(field)?;
    if let Some(v) = value.as_i64() {
        return i32::try_from(v).ok();
    }
    value.as_f64().map(|v| v as i32)
}

/// Name of the command held by `doc` (its first key, relying on
/// `serde_json`'s `preserve_order`).
pub fn command_name(doc: &Document) -> Option<&str> {
    doc.as_object()?.keys().next().map(String::as_str)
}
