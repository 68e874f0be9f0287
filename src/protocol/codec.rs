use super::compression;
use super::document::{decode_document, write_document, Document};
use super::message::{
    Compressed, DocumentSequence, GetMore, KillCursors, MessageBody, Msg, Query, Reply,
    WireMessage,
};
use super::opcode::OpCode;
use crate::error::{DriverError, DriverResult};

pub const HEADER_LEN: usize = 16;
pub const MAX_MESSAGE_SIZE: usize = 48 * 1000 * 1000;

/// Serialize a message into a complete frame (header included).
pub fn serialize(message: &WireMessage) -> DriverResult<Vec<u8>> {
    let mut body = Vec::new();
    encode_body(&message.body, &mut body)?;

    let total = HEADER_LEN + body.len();
    if total > MAX_MESSAGE_SIZE {
        return Err(DriverError::MessageTooLarge(total));
    }

    let mut buf = Vec::with_capacity(total);
    put_i32(&mut buf, total as i32);
    put_i32(&mut buf, message.request_id);
    put_i32(&mut buf, message.response_to);
    put_i32(&mut buf, message.op_code().code());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Deserialize a complete frame.
///
/// With `expected` set, the frame must be of that kind. A compressed frame
/// wrapping the expected kind is accepted and inflated; ask for
/// [`OpCode::Compressed`] to get the envelope itself.
pub fn deserialize(bytes: &[u8], expected: Option<OpCode>) -> DriverResult<WireMessage> {
    if bytes.len() < HEADER_LEN {
        return Err(DriverError::protocol(format!(
            "Frame of {} bytes is shorter than the header",
            bytes.len()
        )));
    }
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(DriverError::MessageTooLarge(bytes.len()));
    }

    let mut reader = ByteReader::new(bytes);
    let declared = reader.read_i32()?;
    if declared < 0 || declared as usize != bytes.len() {
        return Err(DriverError::protocol(format!(
            "Declared length {} does not match frame length {}",
            declared,
            bytes.len()
        )));
    }
    let request_id = reader.read_i32()?;
    let response_to = reader.read_i32()?;
    let op_code = OpCode::try_from(reader.read_i32()?)?;

    let body = decode_body(op_code, &mut reader)?;
    reader.finish(op_code)?;
    let message = WireMessage {
        request_id,
        response_to,
        body,
    };

    match expected {
        None => Ok(message),
        Some(kind) if kind == op_code => Ok(message),
        Some(kind) => match &message.body {
            MessageBody::Compressed(envelope) if envelope.original_op_code == kind.code() => {
                compression::decompress(&message)
            }
            _ => Err(DriverError::protocol(format!(
                "Expected {} but received {}",
                kind, op_code
            ))),
        },
    }
}

/// Encode only the body of a message (no header). This is the byte string a
/// compression envelope compresses.
pub(crate) fn encode_body(body: &MessageBody, buf: &mut Vec<u8>) -> DriverResult<()> {
    match body {
        MessageBody::Reply(reply) => {
            put_i32(buf, reply.response_flags);
            put_i64(buf, reply.cursor_id);
            put_i32(buf, reply.starting_from);
            put_i32(buf, reply.documents.len() as i32);
            for doc in &reply.documents {
                write_document(buf, doc)?;
            }
        }
        MessageBody::Query(query) => {
            put_i32(buf, query.flags);
            put_cstring(buf, &query.full_collection_name)?;
            put_i32(buf, query.number_to_skip);
            put_i32(buf, query.number_to_return);
            write_document(buf, &query.query)?;
            if let Some(selector) = &query.return_fields_selector {
                write_document(buf, selector)?;
            }
        }
        MessageBody::GetMore(get_more) => {
            put_i32(buf, 0);
            put_cstring(buf, &get_more.full_collection_name)?;
            put_i32(buf, get_more.number_to_return);
            put_i64(buf, get_more.cursor_id);
        }
        MessageBody::KillCursors(kill) => {
            put_i32(buf, 0);
            put_i32(buf, kill.cursor_ids.len() as i32);
            for id in &kill.cursor_ids {
                put_i64(buf, *id);
            }
        }
        MessageBody::Msg(msg) => {
            if msg.flags & Msg::CHECKSUM_PRESENT != 0 {
                return Err(DriverError::Serialization(
                    "OP_MSG checksums are not supported".to_string(),
                ));
            }
            buf.extend_from_slice(&msg.flags.to_le_bytes());
            buf.push(0);
            write_document(buf, &msg.body)?;
            for sequence in &msg.sequences {
                buf.push(1);
                let size_at = buf.len();
                put_i32(buf, 0);
                put_cstring(buf, &sequence.identifier)?;
                for doc in &sequence.documents {
                    write_document(buf, doc)?;
                }
                let size = (buf.len() - size_at) as i32;
                buf[size_at..size_at + 4].copy_from_slice(&size.to_le_bytes());
            }
        }
        MessageBody::Compressed(envelope) => {
            put_i32(buf, envelope.original_op_code);
            put_i32(buf, envelope.uncompressed_size);
            buf.push(envelope.compressor_id);
            buf.extend_from_slice(&envelope.compressed_message);
        }
    }
    Ok(())
}

/// Decode the body of a message of kind `op_code`, field by field.
pub(crate) fn decode_body(op_code: OpCode, reader: &mut ByteReader<'_>) -> DriverResult<MessageBody> {
    let body = match op_code {
        OpCode::Reply => {
            let response_flags = reader.read_i32()?;
            let cursor_id = reader.read_i64()?;
            let starting_from = reader.read_i32()?;
            let number_returned = reader.read_i32()?;
            if number_returned < 0 {
                return Err(DriverError::protocol(format!(
                    "Negative document count {}",
                    number_returned
                )));
            }
            let documents = (0..number_returned)
                .map(|_| reader.read_document())
                .collect::<DriverResult<Vec<_>>>()?;
            MessageBody::Reply(Reply {
                response_flags,
                cursor_id,
                starting_from,
                documents,
            })
        }
        OpCode::Query => {
            let flags = reader.read_i32()?;
            let full_collection_name = reader.read_cstring()?;
            let number_to_skip = reader.read_i32()?;
            let number_to_return = reader.read_i32()?;
            let query = reader.read_document()?;
            let return_fields_selector = if reader.is_empty() {
                None
            } else {
                Some(reader.read_document()?)
            };
            MessageBody::Query(Query {
                flags,
                full_collection_name,
                number_to_skip,
                number_to_return,
                query,
                return_fields_selector,
            })
        }
        OpCode::GetMore => {
            reader.read_i32()?;
            let full_collection_name = reader.read_cstring()?;
            let number_to_return = reader.read_i32()?;
            let cursor_id = reader.read_i64()?;
            MessageBody::GetMore(GetMore {
                full_collection_name,
                number_to_return,
                cursor_id,
            })
        }
        OpCode::KillCursors => {
            reader.read_i32()?;
            let count = reader.read_i32()?;
            if count < 0 {
                return Err(DriverError::protocol(format!("Negative cursor count {}", count)));
            }
            let cursor_ids = (0..count)
                .map(|_| reader.read_i64())
                .collect::<DriverResult<Vec<_>>>()?;
            MessageBody::KillCursors(KillCursors { cursor_ids })
        }
        OpCode::Msg => decode_msg(reader)?,
        OpCode::Compressed => {
            let original_op_code = reader.read_i32()?;
            let uncompressed_size = reader.read_i32()?;
            let compressor_id = reader.read_u8()?;
            let compressed_message = reader.read_rest().to_vec();
            MessageBody::Compressed(Compressed {
                original_op_code,
                uncompressed_size,
                compressor_id,
                compressed_message,
            })
        }
    };
    Ok(body)
}

fn decode_msg(reader: &mut ByteReader<'_>) -> DriverResult<MessageBody> {
    let flags = u32::from_le_bytes(reader.take_array::<4>()?);
    if flags & Msg::CHECKSUM_PRESENT != 0 {
        return Err(DriverError::protocol("OP_MSG checksums are not supported"));
    }

    let mut body: Option<Document> = None;
    let mut sequences = Vec::new();
    while !reader.is_empty() {
        match reader.read_u8()? {
            0 => {
                if body.is_some() {
                    return Err(DriverError::protocol("OP_MSG with more than one body section"));
                }
                body = Some(reader.read_document()?);
            }
            1 => {
                let size = reader.read_i32()?;
                if size < 4 {
                    return Err(DriverError::protocol(format!(
                        "Invalid document sequence size {}",
                        size
                    )));
                }
                let mut section = ByteReader::new(reader.take(size as usize - 4)?);
                let identifier = section.read_cstring()?;
                let mut documents = Vec::new();
                while !section.is_empty() {
                    documents.push(section.read_document()?);
                }
                sequences.push(DocumentSequence {
                    identifier,
                    documents,
                });
            }
            kind => {
                return Err(DriverError::protocol(format!(
                    "Unknown OP_MSG section kind {}",
                    kind
                )))
            }
        }
    }

    let body = body.ok_or_else(|| DriverError::protocol("OP_MSG without a body section"))?;
    Ok(MessageBody::Msg(Msg {
        flags,
        body,
        sequences,
    }))
}

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_cstring(buf: &mut Vec<u8>, value: &str) -> DriverResult<()> {
    if value.as_bytes().contains(&0) {
        return Err(DriverError::Serialization(format!(
            "String {:?} contains a NUL byte",
            value
        )));
    }
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    Ok(())
}

/// Bounds-checked little-endian cursor over a frame.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub(crate) fn take(&mut self, n: usize) -> DriverResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                DriverError::protocol(format!(
                    "Truncated message: wanted {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.buf.len() - self.pos
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> DriverResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self) -> DriverResult<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub(crate) fn read_i32(&mut self) -> DriverResult<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub(crate) fn read_i64(&mut self) -> DriverResult<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub(crate) fn read_cstring(&mut self) -> DriverResult<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| DriverError::protocol("Unterminated string"))?;
        let value = std::str::from_utf8(&rest[..nul])
            .map_err(|e| DriverError::protocol(format!("Invalid UTF-8 in string: {}", e)))?
            .to_string();
        self.pos += nul + 1;
        Ok(value)
    }

    pub(crate) fn read_document(&mut self) -> DriverResult<Document> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(DriverError::protocol(format!("Negative document length {}", len)));
        }
        decode_document(self.take(len as usize)?)
    }

    pub(crate) fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        rest
    }

    /// Fail if any bytes are left over after decoding a body.
    pub(crate) fn finish(&self, op_code: OpCode) -> DriverResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DriverError::protocol(format!(
                "{} trailing bytes after {} body",
                self.buf.len() - self.pos,
                op_code
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(message: WireMessage) {
        let bytes = serialize(&message).unwrap();
        let decoded = deserialize(&bytes, Some(message.op_code())).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_header_layout() {
        let message = WireMessage {
            request_id: 7,
            response_to: 3,
            body: MessageBody::KillCursors(KillCursors {
                cursor_ids: vec![42],
            }),
        };
        let bytes = serialize(&message).unwrap();

        assert_eq!(bytes.len(), HEADER_LEN + 4 + 4 + 8);
        assert_eq!(i32::from_le_bytes(bytes[0..4].try_into().unwrap()), bytes.len() as i32);
        assert_eq!(i32::from_le_bytes(bytes[4..8].try_into().unwrap()), 7);
        assert_eq!(i32::from_le_bytes(bytes[8..12].try_into().unwrap()), 3);
        assert_eq!(i32::from_le_bytes(bytes[12..16].try_into().unwrap()), 2007);
    }

    #[test]
    fn test_round_trip_each_kind() {
        round_trip(WireMessage::request(Query {
            flags: 4,
            full_collection_name: "app.events".into(),
            number_to_skip: 2,
            number_to_return: 10,
            query: json!({"status": "open"}),
            return_fields_selector: Some(json!({"_id": 1})),
        }));
        round_trip(WireMessage::reply_to(
            9,
            Reply {
                response_flags: 0,
                cursor_id: 12345,
                starting_from: 0,
                documents: vec![json!({"a": 1}), json!({"b": [1, 2, 3]})],
            },
        ));
        round_trip(WireMessage::request(GetMore {
            full_collection_name: "app.events".into(),
            number_to_return: 0,
            cursor_id: -77,
        }));
        round_trip(WireMessage::request(
            Msg::new(json!({"update": "users", "$db": "app"}))
                .with_sequence("updates", vec![json!({"q": {}, "u": {"$set": {"x": 1}}})]),
        ));
        round_trip(WireMessage::request(Compressed {
            original_op_code: 2013,
            uncompressed_size: 3,
            compressor_id: 0,
            compressed_message: vec![1, 2, 3],
        }));
    }

    #[test]
    fn test_msg_with_empty_sequence() {
        round_trip(WireMessage::request(
            Msg::new(json!({"delete": "users"})).with_sequence("deletes", vec![]),
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let bytes = serialize(&WireMessage::request(Msg::new(json!({"ping": 1})))).unwrap();
        let err = deserialize(&bytes[..bytes.len() - 1], None).unwrap_err();
        assert!(err.is_protocol_error());

        let err = deserialize(&bytes[..10], None).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_length_mismatch() {
        let mut bytes = serialize(&WireMessage::request(Msg::new(json!({"ping": 1})))).unwrap();
        bytes.push(0);
        assert!(matches!(
            deserialize(&bytes, None),
            Err(DriverError::Protocol(_))
        ));
    }

    #[test]
    fn test_unexpected_kind() {
        let bytes = serialize(&WireMessage::request(Msg::new(json!({"ping": 1})))).unwrap();
        let err = deserialize(&bytes, Some(OpCode::Reply)).unwrap_err();
        assert!(err.to_string().contains("Expected OP_REPLY(1)"));
    }

    #[test]
    fn test_unknown_op_code() {
        let mut bytes = serialize(&WireMessage::request(Msg::new(json!({"ping": 1})))).unwrap();
        bytes[12..16].copy_from_slice(&2222i32.to_le_bytes());
        assert!(deserialize(&bytes, None).unwrap_err().is_protocol_error());
    }

    #[test]
    fn test_nul_in_collection_name() {
        let message = WireMessage::request(GetMore {
            full_collection_name: "bad\0name".into(),
            number_to_return: 0,
            cursor_id: 1,
        });
        assert!(matches!(
            serialize(&message),
            Err(DriverError::Serialization(_))
        ));
    }

    #[test]
    fn test_msg_checksum_rejected() {
        let mut msg = Msg::new(json!({"ping": 1}));
        msg.flags = Msg::CHECKSUM_PRESENT;
        assert!(serialize(&WireMessage::request(msg)).is_err());
    }

    #[test]
    fn test_msg_without_body_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes());
        let mut reader = ByteReader::new(&body);
        assert!(decode_body(OpCode::Msg, &mut reader).is_err());
    }
}
