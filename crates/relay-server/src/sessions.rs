//! Process-wide session registry, tracked only as far as graceful shutdown
//! needs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::session::Session;

/// Registry of live sessions plus the root teardown token.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    root: CancellationToken,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    /// Derive a teardown token for a new session.
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Track a session.
    pub fn add(&self, session: Arc<Session>) {
        let _ = self
            .sessions
            .write()
            .insert(session.id.clone(), session);
    }

    /// Stop tracking a session.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().remove(id)
    }

    /// Look up a session by id.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Calls in flight across all sessions.
    pub fn in_flight_total(&self) -> usize {
        self.sessions.read().values().map(|s| s.in_flight()).sum()
    }

    /// Initiate shutdown: cancels every session (and every call) token.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    /// Whether shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Shut down and wait up to `grace` for sessions to drain.
    pub async fn graceful_shutdown(&self, grace: Duration) {
        self.shutdown();
        info!(
            sessions = self.count(),
            grace_secs = grace.as_secs(),
            "draining sessions"
        );

        let deadline = tokio::time::Instant::now() + grace;
        while self.count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.count(),
                    "shutdown grace elapsed with sessions still open"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
