//! Request dispatch
//!
//! Turns command documents into wire messages suited to the target server,
//! applies negotiated compression, and decodes and classifies the reply.

pub mod write;

pub use write::{Delete, ToWireMessage, Update};

use crate::cluster::Server;
use crate::error::{DriverError, DriverResult};
use crate::protocol::document::{command_name, get_i32};
use crate::protocol::{
    self, compression, Compressor, Document, MessageBody, Msg, Query, WireMessage,
};
use std::sync::Arc;

/// Commands that must never be sent compressed (handshake and auth).
const UNCOMPRESSIBLE_COMMANDS: &[&str] = &[
    "hello",
    "isMaster",
    "ismaster",
    "saslStart",
    "saslContinue",
    "getnonce",
    "authenticate",
    "createUser",
    "updateUser",
];

/// Sends requests to a server with the client's compression preferences.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    compressors: Arc<[Compressor]>,
    zlib_level: Option<u32>,
}

impl Dispatcher {
    pub fn new(compressors: Vec<Compressor>, zlib_level: Option<u32>) -> Self {
        Self {
            compressors: compressors.into(),
            zlib_level,
        }
    }

    pub fn compressors(&self) -> &[Compressor] {
        &self.compressors
    }

    fn encode(
        &self,
        server: &dyn Server,
        message: &WireMessage,
        compressible: bool,
    ) -> DriverResult<Vec<u8>> {
        let negotiated = if compressible {
            server.features().negotiate(&self.compressors)
        } else {
            None
        };
        match negotiated {
            Some(compressor) => protocol::serialize(&compression::compress_with_level(
                message,
                compressor,
                self.zlib_level,
            )?),
            None => protocol::serialize(message),
        }
    }

    async fn send_message(
        &self,
        server: &dyn Server,
        message: WireMessage,
        compressible: bool,
    ) -> DriverResult<WireMessage> {
        let request_id = message.request_id;
        tracing::debug!(
            "Sending {} (request {}) to {}",
            message.op_code(),
            request_id,
            server.address()
        );

        let frame = self.encode(server, &message, compressible)?;
        let reply_frame = server.issue(frame).await?;
        let mut reply = protocol::deserialize(&reply_frame, None)?;
        if matches!(reply.body, MessageBody::Compressed(_)) {
            reply = compression::decompress(&reply)?;
        }

        if reply.response_to != request_id {
            return Err(DriverError::Protocol(format!(
                "Reply answers request {} but {} was sent",
                reply.response_to, request_id
            )));
        }
        Ok(reply)
    }

    /// Send a message and wait for its reply.
    pub async fn send(&self, server: &dyn Server, message: WireMessage) -> DriverResult<WireMessage> {
        self.send_message(server, message, true).await
    }

    /// Send a message the server does not answer.
    pub async fn send_unacknowledged(
        &self,
        server: &dyn Server,
        message: WireMessage,
    ) -> DriverResult<()> {
        tracing::debug!(
            "Sending {} (request {}, no reply) to {}",
            message.op_code(),
            message.request_id,
            server.address()
        );
        let frame = self.encode(server, &message, true)?;
        server.send_unacknowledged(frame).await
    }

    /// Run a command against `database` and return its reply document.
    /// A reply with `ok` other than 1 becomes an `OperationFailure`.
    pub async fn run_command(
        &self,
        server: &dyn Server,
        database: &str,
        command: Document,
    ) -> DriverResult<Document> {
        let compressible = command_name(&command)
            .map(|name| !UNCOMPRESSIBLE_COMMANDS.contains(&name))
            .unwrap_or(true);
        let message = command_message(server, database, command)?;
        let reply = self.send_message(server, message, compressible).await?;
        check_ok(reply_document(reply)?)
    }

    /// Run a prebuilt operation (write command builders).
    pub async fn execute(
        &self,
        server: &dyn Server,
        operation: &dyn ToWireMessage,
    ) -> DriverResult<Document> {
        let message = operation.to_wire_message(server)?;
        let reply = self.send(server, message).await?;
        check_ok(reply_document(reply)?)
    }
}

/// Wrap a command for `server`: `OP_MSG` with `$db` when supported, else a
/// legacy query on `<database>.$cmd`.
pub fn command_message(
    server: &dyn Server,
    database: &str,
    command: Document,
) -> DriverResult<WireMessage> {
    if !command.is_object() {
        return Err(DriverError::Configuration(format!(
            "Command must be a document, got {}",
            command
        )));
    }

    if server.features().supports_op_msg() {
        let mut command = command;
        if let Some(map) = command.as_object_mut() {
            map.insert("$db".to_string(), Document::String(database.to_string()));
        }
        Ok(WireMessage::request(Msg::new(command)))
    } else {
        Ok(WireMessage::request(Query::command(database, command)))
    }
}

/// Extract the single reply document of a command.
pub(crate) fn reply_document(reply: WireMessage) -> DriverResult<Document> {
    match reply.body {
        MessageBody::Msg(msg) => Ok(msg.body),
        MessageBody::Reply(reply) => {
            let failed = reply.query_failure();
            let doc = reply
                .documents
                .into_iter()
                .next()
                .ok_or_else(|| DriverError::protocol("Command reply without a document"))?;
            if failed {
                return Err(operation_failure(&doc, "$err"));
            }
            Ok(doc)
        }
        other => Err(DriverError::Protocol(format!(
            "Unexpected {} in reply to a command",
            other.op_code()
        ))),
    }
}

/// Turn a reply with a falsy `ok` into an error.
pub(crate) fn check_ok(doc: Document) -> DriverResult<Document> {
    let ok = match doc.get("ok") {
        Some(Document::Bool(b)) => *b,
        Some(v) => v.as_f64() == Some(1.0),
        None => false,
    };
    if ok {
        Ok(doc)
    } else {
        Err(operation_failure(&doc, "errmsg"))
    }
}

/// Build the failure for an error reply, reading the message from
/// `message_field` (`errmsg` for commands, `$err` for legacy replies).
pub(crate) fn operation_failure(doc: &Document, message_field: &str) -> DriverError {
    DriverError::OperationFailure {
        code: get_i32(doc, "code"),
        message: doc
            .get(message_field)
            .and_then(|v| v.as_str())
            .unwrap_or("unknown server error")
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Reply;
    use serde_json::json;

    #[test]
    fn test_check_ok_variants() {
        assert!(check_ok(json!({"ok": 1})).is_ok());
        assert!(check_ok(json!({"ok": 1.0})).is_ok());
        assert!(check_ok(json!({"ok": true})).is_ok());
        assert!(check_ok(json!({"n": 1})).is_err());
    }

    #[test]
    fn test_check_ok_failure_details() {
        let err = check_ok(json!({"ok": 0, "code": 10107, "errmsg": "not primary"})).unwrap_err();
        assert_eq!(
            err,
            DriverError::OperationFailure {
                code: Some(10107),
                message: "not primary".into()
            }
        );
        assert!(err.is_resumable());
    }

    #[test]
    fn test_legacy_query_failure() {
        let reply = WireMessage::reply_to(
            1,
            Reply {
                response_flags: Reply::QUERY_FAILURE,
                cursor_id: 0,
                starting_from: 0,
                documents: vec![json!({"$err": "not master", "code": 10107})],
            },
        );
        let err = reply_document(reply).unwrap_err();
        assert!(err.is_not_primary());
    }

    #[test]
    fn test_empty_legacy_reply() {
        let reply = WireMessage::reply_to(
            1,
            Reply {
                response_flags: 0,
                cursor_id: 0,
                starting_from: 0,
                documents: vec![],
            },
        );
        assert!(reply_document(reply).unwrap_err().is_protocol_error());
    }
}
