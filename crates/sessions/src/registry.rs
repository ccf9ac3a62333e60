//! Process-wide registry of live chat-session tokens.
//!
//! One entry per in-flight chat turn, keyed by chat-session id. The
//! registry is the single source of truth a `cancel` frame resolves
//! against.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use weft_domain::{Error, Result};

use crate::token::CancellationToken;

/// Default cap on concurrent chat sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 100;

/// Tracks active cancellation tokens by chat-session id, capped at a
/// configured maximum.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<CancellationToken>>>,
    max_sessions: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}

/// Diagnostic snapshot of one registered session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub state: &'static str,
    pub stage: Option<u8>,
    pub age_secs: f64,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        tracing::info!(max_sessions, "session registry ready");
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Register a new chat session and return its token, already in the
    /// active state. Fails if the id is taken or the cap is reached.
    pub fn register(
        &self,
        session_id: &str,
        conversation_id: Option<String>,
    ) -> Result<Arc<CancellationToken>> {
        let mut sessions = self.sessions.lock();

        if sessions.contains_key(session_id) {
            return Err(Error::Session(format!(
                "session {session_id} already registered"
            )));
        }
        if sessions.len() >= self.max_sessions {
            return Err(Error::Session(format!(
                "maximum concurrent sessions ({}) exceeded",
                self.max_sessions
            )));
        }

        let token = Arc::new(CancellationToken::new(session_id, conversation_id));
        token.activate();
        sessions.insert(session_id.to_owned(), Arc::clone(&token));
        tracing::debug!(
            session_id,
            total_active = sessions.len(),
            "registered chat session"
        );
        Ok(token)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<CancellationToken>> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Cancel a session's token. Returns false when the session is unknown
    /// or already finished.
    pub fn cancel(&self, session_id: &str) -> bool {
        let token = match self.get(session_id) {
            Some(t) => t,
            None => {
                tracing::warn!(session_id, "cannot cancel: session not found");
                return false;
            }
        };
        if token.is_finished() {
            tracing::debug!(session_id, state = token.state().as_str(), "already finished");
            return false;
        }
        token.cancel()
    }

    /// Mark a session completed. Returns false when unknown or cancelled.
    pub fn complete(&self, session_id: &str) -> bool {
        match self.get(session_id) {
            Some(token) => token.complete(),
            None => false,
        }
    }

    /// Drop a session from tracking (after it finished).
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().remove(session_id).is_some();
        if removed {
            tracing::debug!(session_id, "removed chat session");
        }
        removed
    }

    /// Sweep sessions whose tokens reached a terminal state.
    pub fn cleanup_finished(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, token| !token.is_finished());
        let cleaned = before - sessions.len();
        if cleaned > 0 {
            tracing::info!(cleaned, remaining = sessions.len(), "swept finished sessions");
        }
        cleaned
    }

    /// Cancel every live session. Used at shutdown.
    pub fn cancel_all(&self) -> usize {
        let sessions = self.sessions.lock();
        let mut cancelled = 0;
        for token in sessions.values() {
            if token.cancel() {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::warn!(cancelled, "cancelled all active sessions");
        }
        cancelled
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Diagnostic snapshot of every tracked session.
    pub fn summary(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, token)| SessionSnapshot {
                session_id: id.clone(),
                conversation_id: token.conversation_id().map(str::to_owned),
                state: token.state().as_str(),
                stage: token.current_stage(),
                age_secs: token.age().as_secs_f64(),
            })
            .collect()
    }
}
