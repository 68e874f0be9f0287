use super::periodic_executor::Reaper;
use crate::error::DriverResult;
use crate::protocol::Document;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Servers time idle sessions out after 30 minutes.
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Sessions are treated as expired this long before the server would
/// expire them, so a request never races the server-side timeout.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// A logical session id attached to the commands of one operation.
#[derive(Debug, Clone)]
pub struct ServerSession {
    id: Uuid,
    last_used: Instant,
}

impl ServerSession {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            last_used: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The `lsid` document sent with each command.
    pub fn lsid(&self) -> Document {
        json!({ "id": self.id.to_string() })
    }

    fn is_stale(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() >= idle_timeout.saturating_sub(EXPIRY_MARGIN)
    }
}

/// Pool of reusable server sessions, most recently used first.
pub struct SessionPool {
    sessions: Mutex<Vec<ServerSession>>,
    idle_timeout: Duration,
}

impl SessionPool {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            idle_timeout,
        }
    }

    /// Take the most recently used live session, or start a new one.
    pub fn checkout(&self) -> ServerSession {
        let mut sessions = self.sessions.lock();
        while let Some(session) = sessions.pop() {
            if !session.is_stale(self.idle_timeout) {
                return session;
            }
        }
        ServerSession::new()
    }

    pub fn checkin(&self, mut session: ServerSession) {
        session.last_used = Instant::now();
        self.sessions.lock().push(session);
    }

    /// Drop every stale session. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|s| !s.is_stale(self.idle_timeout));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_IDLE_TIMEOUT)
    }
}

/// Periodically prunes expired sessions out of a pool.
pub struct SessionReaper {
    pool: Arc<SessionPool>,
}

impl SessionReaper {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Reaper for SessionReaper {
    fn name(&self) -> &str {
        "session-reaper"
    }

    async fn execute(&self) -> DriverResult<()> {
        let pruned = self.pool.prune();
        if pruned > 0 {
            tracing::debug!("Pruned {} expired sessions", pruned);
        }
        Ok(())
    }
}
