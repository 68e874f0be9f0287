use super::kill_cursors;
use crate::cluster::{Reaper, Server};
use crate::error::{DriverError, DriverResult};
use crate::namespace::Namespace;
use crate::operation::Dispatcher;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct PendingKill {
    server: Arc<dyn Server>,
    namespace: Namespace,
    cursor_id: i64,
}

/// Kills cursors that were dropped while still open on the server.
///
/// Dropping a [`Cursor`](super::Cursor) cannot await, so it only queues the
/// id here; each executor pass sends one kill per server and namespace.
pub struct CursorReaper {
    dispatcher: Dispatcher,
    pending: Mutex<Vec<PendingKill>>,
}

impl CursorReaper {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn schedule(&self, server: Arc<dyn Server>, namespace: Namespace, cursor_id: i64) {
        if cursor_id == 0 {
            return;
        }
        self.pending.lock().push(PendingKill {
            server,
            namespace,
            cursor_id,
        });
    }

    /// Number of cursors waiting to be killed.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl Reaper for CursorReaper {
    fn name(&self) -> &str {
        "cursor-reaper"
    }

    async fn execute(&self) -> DriverResult<()> {
        let drained = std::mem::take(&mut *self.pending.lock());
        if drained.is_empty() {
            return Ok(());
        }

        let mut groups: HashMap<(String, Namespace), (Arc<dyn Server>, Vec<i64>)> =
            HashMap::new();
        for kill in drained {
            groups
                .entry((kill.server.address().to_string(), kill.namespace))
                .or_insert_with(|| (kill.server.clone(), Vec::new()))
                .1
                .push(kill.cursor_id);
        }

        let mut failed = 0;
        for ((_, namespace), (server, ids)) in groups {
            if let Err(e) = kill_cursors(&self.dispatcher, server.as_ref(), &namespace, ids).await {
                // Server-side cursor timeouts clean these up eventually.
                tracing::warn!("Failed to reap cursors on {}: {}", server.address(), e);
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(DriverError::Connection(format!(
                "{} cursor kill requests failed",
                failed
            )));
        }
        Ok(())
    }
}
