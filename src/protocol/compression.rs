//! `OP_COMPRESSED` envelope
//!
//! Layout of the envelope body (little-endian):
//! `[original op code: i32][uncompressed size: i32][compressor id: u8][payload]`
//!
//! The uncompressed size is the length of the wrapped message's body, header
//! excluded. The envelope reuses the wrapped message's request id.

use super::codec::{decode_body, encode_body, ByteReader, HEADER_LEN, MAX_MESSAGE_SIZE};
use super::message::{Compressed, MessageBody, WireMessage};
use super::opcode::OpCode;
use crate::error::{DriverError, DriverResult};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::str::FromStr;

/// Registered compressors, keyed by their single-byte wire id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Compressor {
    Noop = 0,
    Snappy = 1,
    Zlib = 2,
}

impl Compressor {
    pub const ALL: [Compressor; 3] = [Compressor::Noop, Compressor::Snappy, Compressor::Zlib];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Compressor::Noop => "noop",
            Compressor::Snappy => "snappy",
            Compressor::Zlib => "zlib",
        }
    }

    fn compress(self, data: &[u8], level: Option<u32>) -> DriverResult<Vec<u8>> {
        match self {
            Compressor::Noop => Ok(data.to_vec()),
            Compressor::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| DriverError::Serialization(format!("snappy compression failed: {}", e))),
            Compressor::Zlib => {
                let level = flate2::Compression::new(level.unwrap_or(6).min(9));
                let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), level);
                encoder
                    .write_all(data)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| DriverError::Serialization(format!("zlib compression failed: {}", e)))
            }
        }
    }

    /// Inflate `data`, reading at most `expected + 1` bytes so a payload
    /// larger than declared is detected without inflating all of it.
    fn decompress(self, data: &[u8], expected: usize) -> DriverResult<Vec<u8>> {
        match self {
            Compressor::Noop => Ok(data.to_vec()),
            Compressor::Snappy => {
                let len = snap::raw::decompress_len(data)
                    .map_err(|e| DriverError::protocol(format!("Invalid snappy payload: {}", e)))?;
                if len != expected {
                    return Err(size_mismatch(expected, len));
                }
                snap::raw::Decoder::new()
                    .decompress_vec(data)
                    .map_err(|e| DriverError::protocol(format!("Invalid snappy payload: {}", e)))
            }
            Compressor::Zlib => {
                let mut out = Vec::with_capacity(expected);
                ZlibDecoder::new(data)
                    .take(expected as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| DriverError::protocol(format!("Invalid zlib payload: {}", e)))?;
                Ok(out)
            }
        }
    }
}

impl FromStr for Compressor {
    type Err = DriverError;

    /// Parse a compressor name. Unknown names are configuration errors.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Compressor::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| {
                DriverError::Configuration(format!(
                    "Unknown compressor '{}'. Supported: noop, snappy, zlib",
                    name
                ))
            })
    }
}

impl TryFrom<u8> for Compressor {
    type Error = DriverError;

    /// Resolve a wire id. Unknown ids are protocol errors.
    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Compressor::ALL
            .into_iter()
            .find(|c| c.id() == id)
            .ok_or(DriverError::UnknownCompressor(id))
    }
}

impl std::fmt::Display for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Wrap `message` in a compression envelope using the default level.
pub fn compress(message: &WireMessage, compressor: Compressor) -> DriverResult<WireMessage> {
    compress_with_level(message, compressor, None)
}

/// Wrap `message` in a compression envelope. `level` only applies to zlib.
pub fn compress_with_level(
    message: &WireMessage,
    compressor: Compressor,
    level: Option<u32>,
) -> DriverResult<WireMessage> {
    if matches!(message.body, MessageBody::Compressed(_)) {
        return Err(DriverError::Serialization(
            "Cannot compress an already compressed message".to_string(),
        ));
    }

    let mut body = Vec::new();
    encode_body(&message.body, &mut body)?;
    check_inflated_size(body.len())?;
    let uncompressed_size =
        i32::try_from(body.len()).map_err(|_| DriverError::MessageTooLarge(body.len()))?;
    let compressed_message = compressor.compress(&body, level)?;

    tracing::trace!(
        "Compressed {} with {}: {} -> {} bytes",
        message.op_code(),
        compressor,
        body.len(),
        compressed_message.len()
    );

    Ok(WireMessage {
        request_id: message.request_id,
        response_to: message.response_to,
        body: MessageBody::Compressed(Compressed {
            original_op_code: message.op_code().code(),
            uncompressed_size,
            compressor_id: compressor.id(),
            compressed_message,
        }),
    })
}

/// Restore the message wrapped by a compression envelope.
///
/// Fails with a protocol error if the compressor id or wrapped op code is
/// unknown, or if the inflated body is not exactly the declared size.
pub fn decompress(message: &WireMessage) -> DriverResult<WireMessage> {
    let envelope = match &message.body {
        MessageBody::Compressed(envelope) => envelope,
        other => {
            return Err(DriverError::protocol(format!(
                "Cannot decompress a {} message",
                other.op_code()
            )))
        }
    };

    let compressor = Compressor::try_from(envelope.compressor_id)?;
    let op_code = OpCode::try_from(envelope.original_op_code)?;
    if op_code == OpCode::Compressed {
        return Err(DriverError::protocol("Nested compression envelope"));
    }
    let expected = usize::try_from(envelope.uncompressed_size).map_err(|_| {
        DriverError::protocol(format!(
            "Negative uncompressed size {}",
            envelope.uncompressed_size
        ))
    })?;
    check_inflated_size(expected)?;

    let raw = compressor.decompress(&envelope.compressed_message, expected)?;
    if raw.len() != expected {
        return Err(size_mismatch(expected, raw.len()));
    }

    let mut reader = ByteReader::new(&raw);
    let body = decode_body(op_code, &mut reader)?;
    reader.finish(op_code)?;

    Ok(WireMessage {
        request_id: message.request_id,
        response_to: message.response_to,
        body,
    })
}

/// The inflated message, header included, must fit the frame limit.
fn check_inflated_size(body_len: usize) -> DriverResult<()> {
    let total = HEADER_LEN.saturating_add(body_len);
    if total > MAX_MESSAGE_SIZE {
        return Err(DriverError::MessageTooLarge(total));
    }
    Ok(())
}

fn size_mismatch(expected: usize, actual: usize) -> DriverError {
    DriverError::protocol(format!(
        "Decompressed size mismatch: declared {} bytes, got {}",
        expected, actual
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{deserialize, serialize};
    use crate::protocol::message::{Msg, Query};
    use serde_json::json;

    fn sample() -> WireMessage {
        WireMessage::request(Msg::new(json!({
            "aggregate": "events",
            "pipeline": [{"$match": {"kind": "insert"}}],
            "cursor": {},
            "$db": "app",
        })))
    }

    fn body_len(message: &WireMessage) -> usize {
        let mut body = Vec::new();
        encode_body(&message.body, &mut body).unwrap();
        body.len()
    }

    #[test]
    fn test_round_trip_every_compressor() {
        let original = sample();
        for compressor in Compressor::ALL {
            let wrapped = compress(&original, compressor).unwrap();
            assert_eq!(wrapped.request_id, original.request_id);

            match &wrapped.body {
                MessageBody::Compressed(envelope) => {
                    assert_eq!(envelope.original_op_code, 2013);
                    assert_eq!(envelope.uncompressed_size as usize, body_len(&original));
                    assert_eq!(envelope.compressor_id, compressor.id());
                }
                other => panic!("expected envelope, got {:?}", other),
            }

            assert_eq!(decompress(&wrapped).unwrap(), original);
        }
    }

    #[test]
    fn test_envelope_bytes_layout() {
        let original = sample();
        let wrapped = compress(&original, Compressor::Zlib).unwrap();
        let bytes = serialize(&wrapped).unwrap();

        let body = &bytes[16..];
        assert_eq!(i32::from_le_bytes(body[0..4].try_into().unwrap()), 2013);
        assert_eq!(
            i32::from_le_bytes(body[4..8].try_into().unwrap()) as usize,
            body_len(&original)
        );
        assert_eq!(body[8], 0x02);
    }

    #[test]
    fn test_deserialize_inflates_expected_kind() {
        let original = WireMessage::request(Query::command("app", json!({"ping": 1})));
        let bytes = serialize(&compress(&original, Compressor::Snappy).unwrap()).unwrap();

        let inflated = deserialize(&bytes, Some(OpCode::Query)).unwrap();
        assert_eq!(inflated, original);

        let envelope = deserialize(&bytes, Some(OpCode::Compressed)).unwrap();
        assert_eq!(envelope.op_code(), OpCode::Compressed);

        assert!(deserialize(&bytes, Some(OpCode::Msg)).is_err());
    }

    #[test]
    fn test_unknown_compressor_id() {
        let mut wrapped = compress(&sample(), Compressor::Zlib).unwrap();
        if let MessageBody::Compressed(envelope) = &mut wrapped.body {
            envelope.compressor_id = 0xFF;
        }
        assert_eq!(
            decompress(&wrapped).unwrap_err(),
            DriverError::UnknownCompressor(0xFF)
        );
    }

    #[test]
    fn test_declared_size_too_small() {
        let mut wrapped = compress(&sample(), Compressor::Zlib).unwrap();
        if let MessageBody::Compressed(envelope) = &mut wrapped.body {
            envelope.uncompressed_size -= 1;
        }
        let err = decompress(&wrapped).unwrap_err();
        assert!(err.to_string().contains("size mismatch"));
    }

    #[test]
    fn test_declared_size_too_large() {
        for compressor in Compressor::ALL {
            let mut wrapped = compress(&sample(), compressor).unwrap();
            if let MessageBody::Compressed(envelope) = &mut wrapped.body {
                envelope.uncompressed_size += 10;
            }
            assert!(decompress(&wrapped).unwrap_err().is_protocol_error());
        }
    }

    #[test]
    fn test_oversized_declared_size_rejected_before_inflating() {
        for compressor in Compressor::ALL {
            let mut wrapped = compress(&sample(), compressor).unwrap();
            if let MessageBody::Compressed(envelope) = &mut wrapped.body {
                envelope.uncompressed_size = i32::MAX;
            }
            assert!(matches!(
                decompress(&wrapped).unwrap_err(),
                DriverError::MessageTooLarge(_)
            ));
        }
    }

    #[test]
    fn test_oversized_body_is_not_compressed() {
        let filler = "x".repeat(MAX_MESSAGE_SIZE);
        let huge = WireMessage::request(Msg::new(json!({"insert": "events", "blob": filler})));
        assert!(serialize(&huge).is_err());
        assert!(matches!(
            compress(&huge, Compressor::Zlib).unwrap_err(),
            DriverError::MessageTooLarge(_)
        ));
    }

    #[test]
    fn test_inflated_limit_applies_through_deserialize() {
        let mut wrapped = compress(&sample(), Compressor::Snappy).unwrap();
        if let MessageBody::Compressed(envelope) = &mut wrapped.body {
            envelope.uncompressed_size = (MAX_MESSAGE_SIZE - HEADER_LEN + 1) as i32;
        }
        let bytes = serialize(&wrapped).unwrap();
        assert!(matches!(
            deserialize(&bytes, Some(OpCode::Msg)).unwrap_err(),
            DriverError::MessageTooLarge(_)
        ));
    }

    #[test]
    fn test_corrupt_zlib_payload() {
        let mut wrapped = compress(&sample(), Compressor::Zlib).unwrap();
        if let MessageBody::Compressed(envelope) = &mut wrapped.body {
            envelope.compressed_message = vec![0xde, 0xad, 0xbe, 0xef];
        }
        assert!(decompress(&wrapped).unwrap_err().is_protocol_error());
    }

    #[test]
    fn test_double_compression_rejected() {
        let wrapped = compress(&sample(), Compressor::Noop).unwrap();
        assert!(compress(&wrapped, Compressor::Zlib).is_err());
    }

    #[test]
    fn test_names_and_ids() {
        assert_eq!("zlib".parse::<Compressor>().unwrap(), Compressor::Zlib);
        assert_eq!(" Snappy ".parse::<Compressor>().unwrap(), Compressor::Snappy);
        assert!(matches!(
            "lzma".parse::<Compressor>(),
            Err(DriverError::Configuration(_))
        ));
        assert_eq!(Compressor::try_from(2).unwrap(), Compressor::Zlib);
        assert_eq!(Compressor::try_from(9).unwrap_err(), DriverError::UnknownCompressor(9));
    }

    #[test]
    fn test_zlib_level_is_clamped() {
        let original = sample();
        let wrapped = compress_with_level(&original, Compressor::Zlib, Some(42)).unwrap();
        assert_eq!(decompress(&wrapped).unwrap(), original);
    }
}
