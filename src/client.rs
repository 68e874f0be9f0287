//! Client entry point
//!
//! A [`Client`] owns the cluster view, the negotiated compression settings,
//! the session pool and the background executor that keeps all three fresh.
//! The executor is started on construction and stopped by [`Client::close`].

use crate::change_stream::{ChangeStream, ChangeStreamOptions};
use crate::cluster::{
    Cluster, PeriodicExecutor, Reaper, ServerMonitor, ServerSelector, SessionPool, SessionReaper,
};
use crate::config::ClientConfig;
use crate::cursor::CursorReaper;
use crate::error::DriverResult;
use crate::namespace::Namespace;
use crate::operation::{Dispatcher, ToWireMessage};
use crate::protocol::Document;
use std::sync::Arc;

pub struct Client {
    cluster: Arc<Cluster>,
    dispatcher: Dispatcher,
    sessions: Arc<SessionPool>,
    cursor_reaper: Arc<CursorReaper>,
    executor: PeriodicExecutor,
    config: ClientConfig,
}

impl Client {
    /// Build a client over `cluster` and start its background executor.
    ///
    /// Fails with a configuration error (before any I/O) on an unknown
    /// compressor name, an out-of-range setting, or when no Tokio runtime
    /// is running.
    pub fn new(config: ClientConfig, cluster: Arc<Cluster>) -> DriverResult<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(
            config.resolved_compressors()?,
            config.zlib_compression_level,
        );
        let sessions = Arc::new(SessionPool::new(config.session_idle_timeout()));
        let cursor_reaper = Arc::new(CursorReaper::new(dispatcher.clone()));

        let reapers: Vec<Arc<dyn Reaper>> = vec![
            Arc::new(ServerMonitor::new(
                cluster.clone(),
                dispatcher.clone(),
                config.health(),
            )),
            Arc::new(SessionReaper::new(sessions.clone())),
            cursor_reaper.clone(),
        ];
        let executor = PeriodicExecutor::new(reapers).with_interval(config.executor_interval());
        executor.start()?;

        tracing::info!(
            "Client started ({} servers, compressors: {:?})",
            cluster.servers().len(),
            dispatcher.compressors()
        );

        Ok(Self {
            cluster,
            dispatcher,
            sessions,
            cursor_reaper,
            executor,
            config,
        })
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &Arc<SessionPool> {
        &self.sessions
    }

    pub fn executor(&self) -> &PeriodicExecutor {
        &self.executor
    }

    /// Create a change stream on `namespace`. The server cursor is opened
    /// lazily by the stream's first advance.
    pub fn watch(
        &self,
        namespace: Namespace,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
    ) -> DriverResult<ChangeStream> {
        Ok(ChangeStream::new(
            self.cluster.clone(),
            self.dispatcher.clone(),
            namespace,
            pipeline,
            options,
        )?
        .with_sessions(self.sessions.clone())
        .with_cursor_reaper(self.cursor_reaper.clone()))
    }

    /// Run a command on a selected server. No retry.
    pub async fn run_command(
        &self,
        database: &str,
        command: Document,
        for_write: bool,
    ) -> DriverResult<Document> {
        let server = self.cluster.select_server(for_write)?;
        let result = self
            .dispatcher
            .run_command(server.as_ref(), database, command)
            .await;
        if let Err(e) = &result {
            self.cluster.report_failure(server.address(), e);
        }
        result
    }

    /// Send a write command (e.g. [`Update`](crate::operation::Update)) to
    /// the primary. No retry.
    pub async fn execute_write(&self, operation: &dyn ToWireMessage) -> DriverResult<Document> {
        let server = self.cluster.select_server(true)?;
        let result = self.dispatcher.execute(server.as_ref(), operation).await;
        if let Err(e) = &result {
            self.cluster.report_failure(server.address(), e);
        }
        result
    }

    /// Stop background maintenance and kill cursors still queued for reaping.
    pub async fn close(&self) {
        self.executor.stop().await;
        if let Err(e) = self.cursor_reaper.execute().await {
            tracing::warn!("Final cursor reaping failed: {}", e);
        }
        tracing::info!("Client closed");
    }
}
