//! Resumable change streams
//!
//! A [`ChangeStream`] is an aggregate cursor over a `$changeStream` pipeline
//! that survives one transient failure per fetch: the cursor is closed, a
//! server is reselected and the aggregate is reissued with `resumeAfter` set
//! to the `_id` of the last event handed to the caller. The caller never sees
//! the interruption and never sees an event twice.

use crate::cluster::{ServerSelector, ServerSession, SessionPool};
use crate::cursor::{Cursor, CursorReaper};
use crate::error::{DriverError, DriverResult};
use crate::namespace::Namespace;
use crate::operation::Dispatcher;
use crate::protocol::Document;
use crate::retry::{Resumable, RetryPolicy};
use async_trait::async_trait;
use futures::{FutureExt, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;

const CHANGE_STREAM_STAGE: &str = "$changeStream";

/// What an update event carries in its `fullDocument` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FullDocument {
    /// Only the delta for updates.
    #[default]
    Default,
    /// The current majority-committed document, looked up at event time.
    UpdateLookup,
}

impl FullDocument {
    pub fn as_str(self) -> &'static str {
        match self {
            FullDocument::Default => "default",
            FullDocument::UpdateLookup => "updateLookup",
        }
    }
}

/// Opaque position in the change log, taken from an event's `_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(Document);

impl ResumeToken {
    pub fn as_document(&self) -> &Document {
        &self.0
    }

    pub fn into_document(self) -> Document {
        self.0
    }

    fn from_event(event: &Document) -> DriverResult<Self> {
        event
            .get("_id")
            .cloned()
            .map(ResumeToken)
            .ok_or_else(|| {
                DriverError::protocol("Change event has no _id, the stream cannot be resumed")
            })
    }
}

impl From<Document> for ResumeToken {
    fn from(doc: Document) -> Self {
        ResumeToken(doc)
    }
}

/// Options fixed when the stream is created.
#[derive(Debug, Clone, Default)]
pub struct ChangeStreamOptions {
    full_document: FullDocument,
    resume_after: Option<ResumeToken>,
    batch_size: Option<i32>,
}

impl ChangeStreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn full_document(mut self, policy: FullDocument) -> Self {
        self.full_document = policy;
        self
    }

    pub fn resume_after(mut self, token: ResumeToken) -> Self {
        self.resume_after = Some(token);
        self
    }

    pub fn batch_size(mut self, size: i32) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn full_document_policy(&self) -> FullDocument {
        self.full_document
    }

    pub fn start_token(&self) -> Option<&ResumeToken> {
        self.resume_after.as_ref()
    }

    pub fn cursor_batch_size(&self) -> Option<i32> {
        self.batch_size
    }
}

enum StreamState {
    Uninitialized,
    Active(Cursor),
    Resuming,
    Closed,
}

pub struct ChangeStream {
    selector: Arc<dyn ServerSelector>,
    dispatcher: Dispatcher,
    namespace: Namespace,
    pipeline: Vec<Document>,
    options: ChangeStreamOptions,
    resume_token: Option<ResumeToken>,
    state: StreamState,
    buffered: VecDeque<Document>,
    server_address: Option<String>,
    session: Option<(Arc<SessionPool>, ServerSession)>,
    cursor_reaper: Option<Arc<CursorReaper>>,
    retry: RetryPolicy,
}

impl ChangeStream {
    /// Create a stream over `namespace`. Nothing is sent until the first
    /// [`open`](Self::open) or [`advance`](Self::advance).
    ///
    /// Fails with `InvalidPipeline` if a stage is not a single-operator
    /// document or is itself a `$changeStream` stage.
    pub fn new(
        selector: Arc<dyn ServerSelector>,
        dispatcher: Dispatcher,
        namespace: Namespace,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
    ) -> DriverResult<Self> {
        validate_pipeline(&pipeline)?;
        Ok(Self {
            selector,
            dispatcher,
            namespace,
            pipeline,
            resume_token: options.resume_after.clone(),
            options,
            state: StreamState::Uninitialized,
            buffered: VecDeque::new(),
            server_address: None,
            session: None,
            cursor_reaper: None,
            retry: RetryPolicy::new(),
        })
    }

    /// Run the stream's commands under a session checked out of `pool`.
    pub fn with_sessions(mut self, pool: Arc<SessionPool>) -> Self {
        let session = pool.checkout();
        self.session = Some((pool, session));
        self
    }

    /// Let `reaper` kill the server cursor if the stream is dropped open.
    pub fn with_cursor_reaper(mut self, reaper: Arc<CursorReaper>) -> Self {
        self.cursor_reaper = Some(reaper);
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn options(&self) -> &ChangeStreamOptions {
        &self.options
    }

    /// The `_id` of the last event handed out, or the `resume_after` token
    /// the stream was created with.
    pub fn resume_token(&self) -> Option<&ResumeToken> {
        self.resume_token.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, StreamState::Closed)
    }

    /// The pipeline sent to the server: the `$changeStream` stage, carrying
    /// the current resume token, followed by the user's stages.
    pub fn full_pipeline(&self) -> Vec<Document> {
        let mut stage = Map::new();
        stage.insert(
            "fullDocument".into(),
            Value::String(self.options.full_document.as_str().to_string()),
        );
        if let Some(token) = &self.resume_token {
            stage.insert("resumeAfter".into(), token.as_document().clone());
        }

        let mut first = Map::new();
        first.insert(CHANGE_STREAM_STAGE.into(), Value::Object(stage));

        let mut pipeline = Vec::with_capacity(self.pipeline.len() + 1);
        pipeline.push(Value::Object(first));
        pipeline.extend(self.pipeline.iter().cloned());
        pipeline
    }

    fn aggregate_command(&self) -> Document {
        let mut cursor = Map::new();
        if let Some(size) = self.options.batch_size {
            cursor.insert("batchSize".into(), json!(size));
        }

        let mut command = Map::new();
        command.insert("aggregate".into(), Value::String(self.namespace.coll.clone()));
        command.insert("pipeline".into(), Value::Array(self.full_pipeline()));
        command.insert("cursor".into(), Value::Object(cursor));
        if let Some((_, session)) = &self.session {
            command.insert("lsid".into(), session.lsid());
        }
        Value::Object(command)
    }

    /// Select a server and issue the aggregate, replacing any cursor.
    async fn initialize(&mut self) -> DriverResult<()> {
        let server = self.selector.select_server(false)?;
        self.server_address = Some(server.address().to_string());

        tracing::debug!(
            "Opening change stream on {} at {} (resume token: {:?})",
            self.namespace,
            server.address(),
            self.resume_token
        );
        let reply = self
            .dispatcher
            .run_command(server.as_ref(), &self.namespace.db, self.aggregate_command())
            .await?;

        let mut cursor =
            Cursor::from_reply(server, self.dispatcher.clone(), self.namespace.clone(), reply)?
                .with_batch_size(self.options.batch_size)
                .with_session(self.session.as_ref().map(|(_, s)| s.lsid()));
        if let Some(reaper) = &self.cursor_reaper {
            cursor = cursor.with_reaper(reaper.clone());
        }
        self.state = StreamState::Active(cursor);
        Ok(())
    }

    async fn ensure_initialized(&mut self) -> DriverResult<()> {
        if matches!(self.state, StreamState::Active(_)) {
            return Ok(());
        }
        self.initialize().await
    }

    async fn fetch_batch(&mut self) -> DriverResult<Option<Vec<Document>>> {
        self.ensure_initialized().await?;
        match &mut self.state {
            StreamState::Active(cursor) => cursor.advance().await,
            _ => Err(DriverError::StreamClosed),
        }
    }

    /// Open the server cursor now instead of on the first advance.
    pub async fn open(&mut self) -> DriverResult<()> {
        match self.state {
            StreamState::Closed => return Err(DriverError::StreamClosed),
            StreamState::Active(_) => return Ok(()),
            StreamState::Uninitialized | StreamState::Resuming => {}
        }
        let retry = self.retry;
        let opened = retry
            .run(self, |stream: &mut ChangeStream| stream.ensure_initialized().boxed())
            .await;
        if let Err(e) = &opened {
            tracing::warn!("Failed to open change stream on {}: {}", self.namespace, e);
            self.close().await;
        }
        opened
    }

    async fn fill_buffer(&mut self) -> DriverResult<()> {
        let retry = self.retry;
        let fetched = retry
            .run(self, |stream: &mut ChangeStream| stream.fetch_batch().boxed())
            .await;

        match fetched {
            Ok(Some(batch)) => {
                if let Some(Err(e)) = batch
                    .iter()
                    .map(ResumeToken::from_event)
                    .find(|token| token.is_err())
                {
                    tracing::warn!("Closing change stream on {}: {}", self.namespace, e);
                    self.close().await;
                    return Err(e);
                }
                self.buffered.extend(batch);
                Ok(())
            }
            Ok(None) => {
                tracing::info!("Change stream cursor on {} exhausted", self.namespace);
                self.close().await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Closing change stream on {}: {}", self.namespace, e);
                self.close().await;
                Err(e)
            }
        }
    }

    /// Fetch the next batch of events. The resume token is set to the last
    /// event's `_id` before the batch is returned.
    ///
    /// An empty batch means nothing new happened yet. If the server ends the
    /// cursor the stream closes and an empty batch is returned.
    pub async fn advance(&mut self) -> DriverResult<Vec<Document>> {
        if self.is_closed() {
            return Err(DriverError::StreamClosed);
        }
        if self.buffered.is_empty() {
            self.fill_buffer().await?;
        }

        let batch: Vec<Document> = self.buffered.drain(..).collect();
        if let Some(last) = batch.last() {
            self.resume_token = Some(ResumeToken::from_event(last)?);
        }
        Ok(batch)
    }

    /// Wait for the next event. Returns `None` once the server ends the
    /// stream.
    pub async fn next_event(&mut self) -> DriverResult<Option<Document>> {
        if self.is_closed() {
            return Err(DriverError::StreamClosed);
        }
        loop {
            if let Some(event) = self.buffered.pop_front() {
                self.resume_token = Some(ResumeToken::from_event(&event)?);
                return Ok(Some(event));
            }
            self.fill_buffer().await?;
            if self.is_closed() && self.buffered.is_empty() {
                return Ok(None);
            }
        }
    }

    /// Kill the server cursor and release the session. Never fails.
    pub async fn close(&mut self) {
        self.buffered.clear();
        if let StreamState::Active(mut cursor) =
            std::mem::replace(&mut self.state, StreamState::Closed)
        {
            cursor.close().await;
        }
        self.release_session();
    }

    /// Consume the stream as a `futures::Stream` of events. The stream ends
    /// after the first error.
    pub fn into_stream(mut self) -> impl Stream<Item = DriverResult<Document>> + Send {
        async_stream::stream! {
            loop {
                match self.next_event().await {
                    Ok(Some(event)) => yield Ok(event),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }

    fn release_session(&mut self) {
        if let Some((pool, session)) = self.session.take() {
            pool.checkin(session);
        }
    }
}

#[async_trait]
impl Resumable for ChangeStream {
    async fn close_cursor(&mut self, error: &DriverError) {
        if let StreamState::Active(mut cursor) =
            std::mem::replace(&mut self.state, StreamState::Resuming)
        {
            cursor.close().await;
        }
        if let Some(address) = &self.server_address {
            self.selector.report_failure(address, error);
        }
        tracing::info!("Resuming change stream on {} after: {}", self.namespace, error);
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.release_session();
    }
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("namespace", &self.namespace)
            .field("resume_token", &self.resume_token)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn validate_pipeline(pipeline: &[Document]) -> DriverResult<()> {
    for (index, stage) in pipeline.iter().enumerate() {
        let Some(map) = stage.as_object() else {
            return Err(DriverError::InvalidPipeline(format!(
                "stage {} is not a document",
                index
            )));
        };
        let mut keys = map.keys();
        let operator = match (keys.next(), keys.next()) {
            (Some(key), None) if key.starts_with('$') => key,
            _ => {
                return Err(DriverError::InvalidPipeline(format!(
                    "stage {} must have exactly one $-prefixed operator",
                    index
                )))
            }
        };
        if operator == CHANGE_STREAM_STAGE {
            return Err(DriverError::InvalidPipeline(format!(
                "stage {} is a {} stage, which is added automatically",
                index, CHANGE_STREAM_STAGE
            )));
        }
    }
    Ok(())
}
