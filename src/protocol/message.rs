use super::document::Document;
use super::opcode::OpCode;
use std::sync::atomic::{AtomicI32, Ordering};

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Allocate the next request id. Ids are process-wide and strictly increasing
/// until they wrap.
pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// A framed protocol message: header identifiers plus a typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub request_id: i32,
    pub response_to: i32,
    pub body: MessageBody,
}

impl WireMessage {
    /// Build a request with a freshly allocated request id.
    pub fn request(body: impl Into<MessageBody>) -> Self {
        Self {
            request_id: next_request_id(),
            response_to: 0,
            body: body.into(),
        }
    }

    /// Build a reply to `request_id`.
    pub fn reply_to(request_id: i32, body: impl Into<MessageBody>) -> Self {
        Self {
            request_id: next_request_id(),
            response_to: request_id,
            body: body.into(),
        }
    }

    pub fn op_code(&self) -> OpCode {
        self.body.op_code()
    }
}

/// The closed set of message kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Reply(Reply),
    Query(Query),
    GetMore(GetMore),
    KillCursors(KillCursors),
    Compressed(Compressed),
    Msg(Msg),
}

impl MessageBody {
    pub fn op_code(&self) -> OpCode {
        match self {
            MessageBody::Reply(_) => OpCode::Reply,
            MessageBody::Query(_) => OpCode::Query,
            MessageBody::GetMore(_) => OpCode::GetMore,
            MessageBody::KillCursors(_) => OpCode::KillCursors,
            MessageBody::Compressed(_) => OpCode::Compressed,
            MessageBody::Msg(_) => OpCode::Msg,
        }
    }
}

/// Legacy query, used for commands against `<db>.$cmd` on servers without
/// `OP_MSG` support.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub flags: i32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields_selector: Option<Document>,
}

impl Query {
    /// A command query: `{db}.$cmd`, single reply document.
    pub fn command(database: &str, command: Document) -> Self {
        Self {
            flags: 0,
            full_collection_name: format!("{}.$cmd", database),
            number_to_skip: 0,
            number_to_return: -1,
            query: command,
            return_fields_selector: None,
        }
    }
}

/// Legacy reply to `OP_QUERY` and `OP_GET_MORE`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub response_flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    pub const CURSOR_NOT_FOUND: i32 = 1;
    pub const QUERY_FAILURE: i32 = 1 << 1;

    pub fn cursor_not_found(&self) -> bool {
        self.response_flags & Self::CURSOR_NOT_FOUND != 0
    }

    pub fn query_failure(&self) -> bool {
        self.response_flags & Self::QUERY_FAILURE != 0
    }
}

/// Legacy get-more on an open cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct GetMore {
    pub full_collection_name: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

/// Legacy kill-cursors. The server never replies to it.
#[derive(Debug, Clone, PartialEq)]
pub struct KillCursors {
    pub cursor_ids: Vec<i64>,
}

/// A document sequence section of an `OP_MSG` (kind 1), e.g. the `updates`
/// array of an update command.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Document>,
}

/// Modern envelope: one body document plus optional document sequences.
#[derive(Debug, Clone, PartialEq)]
pub struct Msg {
    pub flags: u32,
    pub body: Document,
    pub sequences: Vec<DocumentSequence>,
}

impl Msg {
    pub const CHECKSUM_PRESENT: u32 = 1;
    pub const MORE_TO_COME: u32 = 1 << 1;

    pub fn new(body: Document) -> Self {
        Self {
            flags: 0,
            body,
            sequences: Vec::new(),
        }
    }

    pub fn with_sequence(mut self, identifier: impl Into<String>, documents: Vec<Document>) -> Self {
        self.sequences.push(DocumentSequence {
            identifier: identifier.into(),
            documents,
        });
        self
    }
}

/// Compression envelope around another message's body.
///
/// `original_op_code` and `compressor_id` are kept as raw wire values so an
/// envelope naming an unregistered op code or compressor can still be
/// framed and is only rejected when inflated.
#[derive(Debug, Clone, PartialEq)]
pub struct Compressed {
    pub original_op_code: i32,
    pub uncompressed_size: i32,
    pub compressor_id: u8,
    pub compressed_message: Vec<u8>,
}

macro_rules! impl_into_body {
    ($($kind:ident),*) => {
        $(
            impl From<$kind> for MessageBody {
                fn from(body: $kind) -> Self {
                    MessageBody::$kind(body)
                }
            }
        )*
    };
}

impl_into_body!(Reply, Query, GetMore, KillCursors, Compressed, Msg);
