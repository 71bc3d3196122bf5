//! [`SessionRegistry`] – client sessions and their heartbeats.
//!
//! A session is renewed every time it issues a command.  Sessions silent for
//! longer than the idle timeout are reported by [`SessionRegistry::idle_sessions`]
//! so the gate can close them and release their locks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use benchguard_types::{BenchError, SessionId, SessionInfo};
use chrono::Utc;
use parking_lot::RwLock;
use tracing::info;

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct SessionEntry {
    info: SessionInfo,
    last_seen: Instant,
}

// ────────────────────────────────────────────────────────────────────────────
// SessionRegistry
// ────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```
/// use benchguard_kernel::session::SessionRegistry;
///
/// let sessions = SessionRegistry::new();
/// let info = sessions.open("operator@bench-3");
/// assert!(sessions.touch(&info.id).is_ok());
/// assert!(sessions.close(&info.id));
/// assert!(sessions.touch(&info.id).is_err());
/// ```
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for `identity`.  The identity is recorded as presented.
    pub fn open(&self, identity: impl Into<String>) -> SessionInfo {
        self.open_at(identity, Instant::now())
    }

    pub fn open_at(&self, identity: impl Into<String>, now: Instant) -> SessionInfo {
        let created = Utc::now();
        let info = SessionInfo {
            id: SessionId::generate(),
            identity: identity.into(),
            created_at: created,
            last_renewed: created,
        };
        self.sessions.write().insert(
            info.id.clone(),
            SessionEntry {
                info: info.clone(),
                last_seen: now,
            },
        );
        info!(session = %info.id, identity = %info.identity, "session opened");
        info
    }

    /// Record activity for `id`.
    ///
    /// # Errors
    ///
    /// [`BenchError::UnknownSession`] if the session was never opened or has
    /// been closed.
    pub fn touch(&self, id: &SessionId) -> Result<(), BenchError> {
        self.touch_at(id, Instant::now())
    }

    pub fn touch_at(&self, id: &SessionId, now: Instant) -> Result<(), BenchError> {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| BenchError::UnknownSession(id.clone()))?;
        entry.last_seen = entry.last_seen.max(now);
        entry.info.last_renewed = Utc::now();
        Ok(())
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.read().get(id).map(|e| e.info.clone())
    }

    pub fn is_open(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Returns `false` if the session was not open.
    pub fn close(&self, id: &SessionId) -> bool {
        let closed = self.sessions.write().remove(id).is_some();
        if closed {
            info!(session = %id, "session closed");
        }
        closed
    }

    /// All open sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut all: Vec<SessionInfo> = self.sessions.read().values().map(|e| e.info.clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Sessions that have not been touched for longer than `idle_timeout`.
    pub fn idle_sessions(&self, idle_timeout: Duration) -> Vec<SessionId> {
        self.idle_sessions_at(idle_timeout, Instant::now())
    }

    pub fn idle_sessions_at(&self, idle_timeout: Duration, now: Instant) -> Vec<SessionId> {
        self.sessions
            .read()
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > idle_timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
