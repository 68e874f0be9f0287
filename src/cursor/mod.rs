//! Server-side cursors
//!
//! A [`Cursor`] remembers which server holds the cursor, its id and
//! namespace, and the first batch that came back with the opening command.
//! Every follow-up fetch goes to that same server. Exhaustion is signalled by
//! the server returning cursor id 0, never by an empty batch.

pub mod reaper;

pub use reaper::CursorReaper;

use crate::cluster::Server;
use crate::error::{DriverError, DriverResult};
use crate::namespace::Namespace;
use crate::operation::{operation_failure, Dispatcher};
use crate::protocol::{Document, GetMore, KillCursors, MessageBody, WireMessage};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Server error code for a cursor id the server no longer knows.
pub const CURSOR_NOT_FOUND_CODE: i32 = 43;

#[derive(Debug, Deserialize)]
struct CursorReply {
    cursor: CursorInfo,
}

#[derive(Debug, Deserialize)]
struct CursorInfo {
    id: i64,
    #[serde(default)]
    ns: Option<String>,
    #[serde(rename = "firstBatch", alias = "nextBatch", default)]
    batch: Vec<Document>,
}

pub struct Cursor {
    server: Arc<dyn Server>,
    dispatcher: Dispatcher,
    namespace: Namespace,
    cursor_id: i64,
    initial_batch: Option<Vec<Document>>,
    batch_size: Option<i32>,
    lsid: Option<Document>,
    reaper: Option<Arc<CursorReaper>>,
}

impl Cursor {
    pub fn new(
        server: Arc<dyn Server>,
        dispatcher: Dispatcher,
        namespace: Namespace,
        cursor_id: i64,
        first_batch: Vec<Document>,
    ) -> Self {
        Self {
            server,
            dispatcher,
            namespace,
            cursor_id,
            initial_batch: Some(first_batch),
            batch_size: None,
            lsid: None,
            reaper: None,
        }
    }

    /// Build a cursor from a `{cursor: {id, ns, firstBatch}}` command reply.
    /// The reply's `ns` wins over `namespace` when present.
    pub fn from_reply(
        server: Arc<dyn Server>,
        dispatcher: Dispatcher,
        namespace: Namespace,
        reply: Document,
    ) -> DriverResult<Self> {
        let reply: CursorReply = serde_json::from_value(reply)?;
        let namespace = match reply.cursor.ns.as_deref().map(str::parse::<Namespace>) {
            Some(Ok(ns)) => ns,
            _ => namespace,
        };
        tracing::debug!(
            "Opened cursor {} on {} at {} ({} documents)",
            reply.cursor.id,
            namespace,
            server.address(),
            reply.cursor.batch.len()
        );
        Ok(Self::new(
            server,
            dispatcher,
            namespace,
            reply.cursor.id,
            reply.cursor.batch,
        ))
    }

    pub fn with_batch_size(mut self, batch_size: Option<i32>) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Attach the logical session the cursor was opened under.
    pub fn with_session(mut self, lsid: Option<Document>) -> Self {
        self.lsid = lsid;
        self
    }

    /// Hand the cursor to `reaper` if it is dropped while still open.
    pub fn with_reaper(mut self, reaper: Arc<CursorReaper>) -> Self {
        self.reaper = Some(reaper);
        self
    }

    pub fn id(&self) -> i64 {
        self.cursor_id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn server(&self) -> &Arc<dyn Server> {
        &self.server
    }

    /// True once the initial batch is consumed and the server reported id 0.
    pub fn is_exhausted(&self) -> bool {
        self.cursor_id == 0 && self.initial_batch.is_none()
    }

    /// Return the next batch, or `None` once the cursor is exhausted.
    ///
    /// The batch returned with the opening command comes first and costs
    /// no round trip. A returned batch may be empty while the cursor stays
    /// open (tailable cursors with nothing new).
    pub async fn advance(&mut self) -> DriverResult<Option<Vec<Document>>> {
        if let Some(batch) = self.initial_batch.take() {
            return Ok(Some(batch));
        }
        if self.cursor_id == 0 {
            return Ok(None);
        }

        let batch = if self.server.features().supports_cursor_commands() {
            self.get_more_command().await?
        } else {
            self.get_more_legacy().await?
        };
        Ok(Some(batch))
    }

    async fn get_more_command(&mut self) -> DriverResult<Vec<Document>> {
        let mut command = Map::new();
        command.insert("getMore".into(), json!(self.cursor_id));
        command.insert("collection".into(), Value::String(self.namespace.coll.clone()));
        if let Some(size) = self.batch_size {
            command.insert("batchSize".into(), json!(size));
        }
        if let Some(lsid) = &self.lsid {
            command.insert("lsid".into(), lsid.clone());
        }

        let reply = self
            .dispatcher
            .run_command(self.server.as_ref(), &self.namespace.db, Value::Object(command))
            .await?;
        let reply: CursorReply = serde_json::from_value(reply)?;
        self.cursor_id = reply.cursor.id;
        Ok(reply.cursor.batch)
    }

    async fn get_more_legacy(&mut self) -> DriverResult<Vec<Document>> {
        let message = WireMessage::request(GetMore {
            full_collection_name: self.namespace.to_string(),
            number_to_return: self.batch_size.unwrap_or(0),
            cursor_id: self.cursor_id,
        });
        let reply = self.dispatcher.send(self.server.as_ref(), message).await?;

        match reply.body {
            MessageBody::Reply(reply) => {
                if reply.cursor_not_found() {
                    let id = std::mem::replace(&mut self.cursor_id, 0);
                    return Err(DriverError::OperationFailure {
                        code: Some(CURSOR_NOT_FOUND_CODE),
                        message: format!("cursor id {} not found", id),
                    });
                }
                if reply.query_failure() {
                    return Err(match reply.documents.first() {
                        Some(doc) => operation_failure(doc, "$err"),
                        None => DriverError::protocol("Query failure without error document"),
                    });
                }
                self.cursor_id = reply.cursor_id;
                Ok(reply.documents)
            }
            other => Err(DriverError::Protocol(format!(
                "Unexpected {} in reply to get-more",
                other.op_code()
            ))),
        }
    }

    /// Kill the cursor on its server. Failures are logged and swallowed;
    /// closing an exhausted or already closed cursor sends nothing.
    pub async fn close(&mut self) {
        self.initial_batch = None;
        if self.cursor_id == 0 {
            return;
        }
        let id = std::mem::replace(&mut self.cursor_id, 0);
        if let Err(e) = kill_cursors(
            &self.dispatcher,
            self.server.as_ref(),
            &self.namespace,
            vec![id],
        )
        .await
        {
            tracing::warn!(
                "Failed to kill cursor {} on {}: {}",
                id,
                self.server.address(),
                e
            );
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("server", &self.server.address())
            .field("namespace", &self.namespace)
            .field("cursor_id", &self.cursor_id)
            .finish()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.cursor_id == 0 {
            return;
        }
        match &self.reaper {
            Some(reaper) => {
                reaper.schedule(self.server.clone(), self.namespace.clone(), self.cursor_id)
            }
            None => tracing::debug!(
                "Cursor {} on {} dropped while open",
                self.cursor_id,
                self.server.address()
            ),
        }
    }
}

/// Kill `cursor_ids` on `server`: the `killCursors` command where cursor
/// commands are supported, the unanswered legacy message otherwise.
pub(crate) async fn kill_cursors(
    dispatcher: &Dispatcher,
    server: &dyn Server,
    namespace: &Namespace,
    cursor_ids: Vec<i64>,
) -> DriverResult<()> {
    tracing::debug!(
        "Killing cursors {:?} on {} at {}",
        cursor_ids,
        namespace,
        server.address()
    );
    if server.features().supports_cursor_commands() {
        let command = json!({ "killCursors": namespace.coll, "cursors": cursor_ids });
        dispatcher.run_command(server, &namespace.db, command).await?;
        Ok(())
    } else {
        let message = WireMessage::request(KillCursors { cursor_ids });
        dispatcher.send_unacknowledged(server, message).await
    }
}
