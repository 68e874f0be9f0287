//! Write command builders
//!
//! Each builder produces the plain command document and knows how to frame
//! itself for a server: a document-sequence `OP_MSG` where supported, a
//! legacy command query otherwise.

use crate::cluster::Server;
use crate::error::DriverResult;
use crate::namespace::Namespace;
use crate::protocol::{Document, Msg, Query, WireMessage};
use serde_json::{json, Map, Value};

/// Anything that can frame itself as a wire message for a given server.
pub trait ToWireMessage: Send + Sync {
    fn to_wire_message(&self, server: &dyn Server) -> DriverResult<WireMessage>;
}

/// Options shared by the write commands.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub ordered: bool,
    pub write_concern: Option<Document>,
    pub collation: Option<Document>,
}

impl WriteOptions {
    fn append(&self, map: &mut Map<String, Value>) {
        map.insert("ordered".into(), Value::Bool(self.ordered));
        if let Some(wc) = &self.write_concern {
            map.insert("writeConcern".into(), wc.clone());
        }
        if let Some(collation) = &self.collation {
            map.insert("collation".into(), collation.clone());
        }
    }
}

fn frame(
    server: &dyn Server,
    namespace: &Namespace,
    command: &str,
    sequence: &str,
    documents: &[Document],
    options: Map<String, Value>,
) -> WireMessage {
    let mut head = Map::new();
    head.insert(command.to_string(), Value::String(namespace.coll.clone()));

    if server.features().supports_op_msg() {
        head.insert("$db".into(), Value::String(namespace.db.clone()));
        head.extend(options);
        WireMessage::request(Msg::new(Value::Object(head)).with_sequence(sequence, documents.to_vec()))
    } else {
        head.insert(sequence.to_string(), Value::Array(documents.to_vec()));
        head.extend(options);
        WireMessage::request(Query::command(&namespace.db, Value::Object(head)))
    }
}

/// An `update` command.
#[derive(Debug, Clone)]
pub struct Update {
    pub namespace: Namespace,
    pub updates: Vec<Document>,
    pub options: WriteOptions,
    pub bypass_document_validation: bool,
}

impl Update {
    pub fn new(namespace: Namespace, updates: Vec<Document>) -> Self {
        Self {
            namespace,
            updates,
            options: WriteOptions {
                ordered: true,
                ..WriteOptions::default()
            },
            bypass_document_validation: false,
        }
    }

    /// A single `{q, u}` update statement.
    pub fn statement(filter: Document, update: Document, multi: bool, upsert: bool) -> Document {
        json!({ "q": filter, "u": update, "multi": multi, "upsert": upsert })
    }

    fn command_options(&self) -> Map<String, Value> {
        let mut map = Map::new();
        self.options.append(&mut map);
        if self.bypass_document_validation {
            map.insert("bypassDocumentValidation".into(), Value::Bool(true));
        }
        map
    }

    /// The full command document as sent to a legacy server.
    pub fn selector(&self) -> Document {
        let mut map = Map::new();
        map.insert("update".into(), Value::String(self.namespace.coll.clone()));
        map.insert("updates".into(), Value::Array(self.updates.clone()));
        map.extend(self.command_options());
        Value::Object(map)
    }
}

impl ToWireMessage for Update {
    fn to_wire_message(&self, server: &dyn Server) -> DriverResult<WireMessage> {
        Ok(frame(
            server,
            &self.namespace,
            "update",
            "updates",
            &self.updates,
            self.command_options(),
        ))
    }
}

/// A `delete` command.
#[derive(Debug, Clone)]
pub struct Delete {
    pub namespace: Namespace,
    pub deletes: Vec<Document>,
    pub options: WriteOptions,
}

impl Delete {
    pub fn new(namespace: Namespace, deletes: Vec<Document>) -> Self {
        Self {
            namespace,
            deletes,
            options: WriteOptions {
                ordered: true,
                ..WriteOptions::default()
            },
        }
    }

    /// A single `{q, limit}` delete statement; `limit` 0 removes all matches.
    pub fn statement(filter: Document, limit: i32) -> Document {
        json!({ "q": filter, "limit": limit })
    }

    fn command_options(&self) -> Map<String, Value> {
        let mut map = Map::new();
        self.options.append(&mut map);
        map
    }

    /// The full command document as sent to a legacy server.
    pub fn selector(&self) -> Document {
        let mut map = Map::new();
        map.insert("delete".into(), Value::String(self.namespace.coll.clone()));
        map.insert("deletes".into(), Value::Array(self.deletes.clone()));
        map.extend(self.command_options());
        Value::Object(map)
    }
}

impl ToWireMessage for Delete {
    fn to_wire_message(&self, server: &dyn Server) -> DriverResult<WireMessage> {
        Ok(frame(
            server,
            &self.namespace,
            "delete",
            "deletes",
            &self.deletes,
            self.command_options(),
        ))
    }
}
