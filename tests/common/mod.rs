//! Common test utilities for driver tests
//!
//! Provides:
//! - `MockServer`: an in-memory `Server` that decodes requests with the real
//!   codec, answers them through a command handler and can be told to fail
//! - `ChangeFeed`: a scripted change log serving `aggregate`, `getMore` and
//!   `killCursors`, shareable between servers like a replicated log
//! - tracing setup

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use solidb_driver::cluster::{Server, ServerFeatures};
use solidb_driver::protocol::document::command_name;
use solidb_driver::protocol::{
    compress, decompress, deserialize, serialize, Compressor, Document, MessageBody, Msg, Reply,
    WireMessage,
};
use solidb_driver::{DriverError, DriverResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

type Handler = dyn Fn(&Document) -> Document + Send + Sync;

/// A request as the server saw it.
#[derive(Debug, Clone)]
pub struct Logged {
    pub command: Document,
    /// Compressor id of the envelope, if the request was compressed
    pub compressor: Option<u8>,
    /// Whether the request arrived as a legacy message
    pub legacy: bool,
}

pub struct MockServer {
    address: String,
    features: ServerFeatures,
    handler: Box<Handler>,
    failures: Mutex<VecDeque<(String, DriverError)>>,
    log: Mutex<Vec<Logged>>,
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer")
            .field("address", &self.address)
            .finish()
    }
}

impl MockServer {
    pub fn new(
        address: &str,
        features: ServerFeatures,
        handler: impl Fn(&Document) -> Document + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            features,
            handler: Box::new(handler),
            failures: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    /// A server answering from `feed`.
    pub fn with_feed(address: &str, features: ServerFeatures, feed: Arc<ChangeFeed>) -> Arc<Self> {
        Self::new(address, features, move |command| feed.handle(command))
    }

    /// Fail the next command named `command`. Operation failures become an
    /// `ok: 0` reply; anything else is returned as a transport error.
    pub fn fail_next(&self, command: &str, error: DriverError) {
        self.failures.lock().push_back((command.to_string(), error));
    }

    pub fn log(&self) -> Vec<Logged> {
        self.log.lock().clone()
    }

    /// Commands received with the given name, in arrival order.
    pub fn commands_named(&self, name: &str) -> Vec<Document> {
        self.log
            .lock()
            .iter()
            .filter(|l| command_name(&l.command) == Some(name))
            .map(|l| l.command.clone())
            .collect()
    }

    fn take_failure(&self, name: &str) -> Option<DriverError> {
        let mut failures = self.failures.lock();
        let index = failures.iter().position(|(n, _)| n == name)?;
        failures.remove(index).map(|(_, e)| e)
    }

    /// Decode a request frame, unwrapping compression.
    fn decode(&self, frame: &[u8]) -> DriverResult<(WireMessage, Option<u8>)> {
        let message = deserialize(frame, None)?;
        match &message.body {
            MessageBody::Compressed(envelope) => {
                let id = envelope.compressor_id;
                Ok((decompress(&message)?, Some(id)))
            }
            _ => Ok((message, None)),
        }
    }

    fn answer(&self, command: &Document) -> DriverResult<Document> {
        let name = command_name(command).unwrap_or_default().to_string();
        match self.take_failure(&name) {
            Some(DriverError::OperationFailure { code, message }) => {
                let mut reply = json!({ "ok": 0, "errmsg": message });
                if let Some(code) = code {
                    reply["code"] = json!(code);
                }
                Ok(reply)
            }
            Some(other) => Err(other),
            None => Ok((self.handler)(command)),
        }
    }

    fn record(&self, command: &Document, compressor: Option<u8>, legacy: bool) {
        self.log.lock().push(Logged {
            command: command.clone(),
            compressor,
            legacy,
        });
    }
}

/// Translate a legacy message into the equivalent command document.
fn legacy_command(body: &MessageBody) -> Option<Document> {
    match body {
        MessageBody::GetMore(get_more) => {
            let coll = get_more
                .full_collection_name
                .split_once('.')
                .map(|(_, c)| c.to_string())
                .unwrap_or_default();
            Some(json!({
                "getMore": get_more.cursor_id,
                "collection": coll,
                "batchSize": get_more.number_to_return,
            }))
        }
        MessageBody::KillCursors(kill) => Some(json!({ "killCursors": "", "cursors": kill.cursor_ids })),
        _ => None,
    }
}

#[async_trait]
impl Server for MockServer {
    fn address(&self) -> &str {
        &self.address
    }

    fn features(&self) -> &ServerFeatures {
        &self.features
    }

    async fn issue(&self, request: Vec<u8>) -> DriverResult<Vec<u8>> {
        let (message, compressor) = self.decode(&request)?;

        let body: MessageBody = match &message.body {
            MessageBody::Msg(msg) => {
                self.record(&msg.body, compressor, false);
                Msg::new(self.answer(&msg.body)?).into()
            }
            MessageBody::Query(query) => {
                self.record(&query.query, compressor, true);
                Reply {
                    response_flags: 0,
                    cursor_id: 0,
                    starting_from: 0,
                    documents: vec![self.answer(&query.query)?],
                }
                .into()
            }
            MessageBody::GetMore(_) => {
                let command = legacy_command(&message.body).unwrap_or(Value::Null);
                self.record(&command, compressor, true);
                let reply = self.answer(&command)?;
                if reply["code"] == json!(43) {
                    Reply {
                        response_flags: Reply::CURSOR_NOT_FOUND,
                        cursor_id: 0,
                        starting_from: 0,
                        documents: vec![],
                    }
                    .into()
                } else {
                    Reply {
                        response_flags: 0,
                        cursor_id: reply["cursor"]["id"].as_i64().unwrap_or(0),
                        starting_from: 0,
                        documents: reply["cursor"]["nextBatch"]
                            .as_array()
                            .cloned()
                            .unwrap_or_default(),
                    }
                    .into()
                }
            }
            other => {
                return Err(DriverError::Protocol(format!(
                    "mock server cannot answer {}",
                    other.op_code()
                )))
            }
        };

        let reply = WireMessage::reply_to(message.request_id, body);
        let reply = match compressor {
            Some(id) => compress(&reply, Compressor::try_from(id)?)?,
            None => reply,
        };
        serialize(&reply)
    }

    async fn send_unacknowledged(&self, request: Vec<u8>) -> DriverResult<()> {
        let (message, compressor) = self.decode(&request)?;
        let command = legacy_command(&message.body).ok_or_else(|| {
            DriverError::Protocol(format!("unexpected unacknowledged {}", message.op_code()))
        })?;
        self.record(&command, compressor, true);
        self.answer(&command).map(|_| ())
    }
}

/// A change log with server-side cursors over it.
///
/// Events are `{_id: n, operationType: "insert", documentKey: {_id: n}}`
/// with `n` counting from 1. `aggregate` opens a cursor positioned after the
/// `resumeAfter` event (or at the start) and returns an empty first batch;
/// each `getMore` returns up to `batch_size` events.
pub struct ChangeFeed {
    events: Mutex<Vec<Document>>,
    cursors: Mutex<HashMap<i64, usize>>,
    next_cursor_id: AtomicI64,
    batch_size: usize,
}

impl ChangeFeed {
    pub fn new(batch_size: usize) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            cursors: Mutex::new(HashMap::new()),
            next_cursor_id: AtomicI64::new(1000),
            batch_size,
        })
    }

    /// Append `count` insert events and return their ids.
    pub fn insert(&self, count: usize) -> Vec<i64> {
        let mut events = self.events.lock();
        (0..count)
            .map(|_| {
                let id = events.len() as i64 + 1;
                events.push(json!({
                    "_id": id,
                    "operationType": "insert",
                    "documentKey": {"_id": id},
                }));
                id
            })
            .collect()
    }

    /// Append an arbitrary raw event.
    pub fn push_raw(&self, event: Document) {
        self.events.lock().push(event);
    }

    pub fn open_cursors(&self) -> usize {
        self.cursors.lock().len()
    }

    pub fn handle(&self, command: &Document) -> Document {
        match command_name(command) {
            Some("hello") => json!({ "ok": 1, "isWritablePrimary": true }),
            Some("aggregate") => self.aggregate(command),
            Some("getMore") => self.get_more(command),
            Some("killCursors") => {
                let ids: Vec<i64> = command["cursors"]
                    .as_array()
                    .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
                    .unwrap_or_default();
                let mut cursors = self.cursors.lock();
                for id in &ids {
                    cursors.remove(id);
                }
                json!({ "ok": 1, "cursorsKilled": ids })
            }
            _ => json!({ "ok": 0, "code": 59, "errmsg": "no such command" }),
        }
    }

    fn aggregate(&self, command: &Document) -> Document {
        let stage = &command["pipeline"][0]["$changeStream"];
        let start = match stage.get("resumeAfter") {
            Some(token) => {
                let events = self.events.lock();
                match events.iter().position(|e| &e["_id"] == token) {
                    Some(index) => index + 1,
                    None => {
                        return json!({ "ok": 0, "code": 280, "errmsg": "resume token not found" })
                    }
                }
            }
            None => 0,
        };

        let id = self.next_cursor_id.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().insert(id, start);
        json!({
            "cursor": {"id": id, "ns": format!("app.{}", command["aggregate"].as_str().unwrap_or("")), "firstBatch": []},
            "ok": 1
        })
    }

    fn get_more(&self, command: &Document) -> Document {
        let id = command["getMore"].as_i64().unwrap_or(0);
        let mut cursors = self.cursors.lock();
        let Some(position) = cursors.get_mut(&id) else {
            return json!({ "ok": 0, "code": 43, "errmsg": format!("cursor id {} not found", id) });
        };

        let events = self.events.lock();
        let end = (*position + self.batch_size).min(events.len());
        let batch: Vec<Document> = events[*position..end].to_vec();
        *position = end;

        json!({
            "cursor": {"id": id, "ns": "app.events", "nextBatch": batch},
            "ok": 1
        })
    }
}

pub fn event_ids(batch: &[Document]) -> Vec<i64> {
    batch.iter().filter_map(|e| e["_id"].as_i64()).collect()
}
