//! Session persistence for resume.
//!
//! The latest `{token, session_id, sequence, resume url}` is written on
//! every READY, RESUMED, and sequence advance. On connect, an existing
//! session makes the client dial the resume url and send RESUME instead of
//! identifying from zero.
//!
//! Persistence is best-effort: a failed write is logged, never fatal. The
//! worst case is a full re-identify on the next connect.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// A resumable gateway session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    /// The token the session was opened with.
    pub token: String,
    /// Server-assigned session id.
    pub session_id: String,
    /// Last acknowledged dispatch sequence.
    pub sequence: u64,
    /// URL to dial for a resume.
    pub resume_gateway_url: String,
    /// When this record was written, ms since the epoch.
    pub timestamp: i64,
    /// The authenticated user, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Pluggable store for the latest session.
pub trait SessionStore: Send + Sync {
    /// The stored session, if any.
    fn load(&self) -> Option<SessionData>;

    /// Replace the stored session.
    fn save(&self, session: &SessionData);

    /// Forget the stored session.
    fn clear(&self);
}

/// Keeps the session in process memory only.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: Mutex<Option<SessionData>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Option<SessionData> {
        self.inner.lock().expect("session lock").clone()
    }

    fn save(&self, session: &SessionData) {
        *self.inner.lock().expect("session lock") = Some(session.clone());
    }

    fn clear(&self) {
        *self.inner.lock().expect("session lock") = None;
    }
}

/// Persists the session as a JSON file, surviving process restarts.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    /// Store sessions at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Option<SessionData> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                log::warn!("[FileSessionStore] ignoring corrupt session file: {}", e);
                None
            }
        }
    }

    fn save(&self, session: &SessionData) {
        let raw = match serde_json::to_string_pretty(session) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("[FileSessionStore] failed to serialize session: {}", e);
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, raw) {
            log::warn!("[FileSessionStore] failed to write session: {}", e);
        }
    }

    fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("[FileSessionStore] failed to remove session: {}", e),
        }
    }
}
