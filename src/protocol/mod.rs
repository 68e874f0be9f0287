//! Wire protocol definitions
//!
//! Every message is framed with a 16 byte little-endian header:
//! - **messageLength** (`i32`): total frame length including the header
//! - **requestId** (`i32`): monotonically assigned per process
//! - **responseTo** (`i32`): request id this message answers, 0 for requests
//! - **opCode** (`i32`): kind of the body that follows
//!
//! Documents inside bodies are carried as `[len: i32 LE][msgpack payload]`.
//! Any body except another compressed envelope can be wrapped in an
//! `OP_COMPRESSED` message, see [`compression`].

pub mod codec;
pub mod compression;
pub mod document;
pub mod message;
pub mod opcode;

pub use codec::{deserialize, serialize, HEADER_LEN, MAX_MESSAGE_SIZE};
pub use compression::{compress, compress_with_level, decompress, Compressor};
pub use document::Document;
pub use message::{
    next_request_id, Compressed, DocumentSequence, GetMore, KillCursors, MessageBody, Msg, Query,
    Reply, WireMessage,
};
pub use opcode::OpCode;
