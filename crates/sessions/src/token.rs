//! Per-turn cancellation tokens.
//!
//! One token lives for one chat turn (one `chat` frame through
//! `done`/`cancelled`/`error`). Cancellation is a cooperative signal, not
//! a preemptive kill: pipeline code must poll [`CancellationToken::check`]
//! or acquire an operation guard at its suspension points.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use weft_domain::{Error, Result};

/// Token lifecycle state.
///
/// `Cancelled` and `Completed` are absorbing: once a token is finished it
/// never transitions again, so concurrent `cancel`/`complete` races have a
/// deterministic first-to-acquire winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Created,
    Active,
    Cancelled,
    Completed,
}

impl TokenState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TokenState::Cancelled | TokenState::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TokenState::Created => "created",
            TokenState::Active => "active",
            TokenState::Cancelled => "cancelled",
            TokenState::Completed => "completed",
        }
    }
}

struct Inner {
    state: TokenState,
    /// Reference count of in-flight scoped operations.
    active_operations: usize,
    /// Pipeline stage currently executing (1–5), for diagnostics.
    current_stage: Option<u8>,
}

/// Cancellation token shared by every operation of one chat turn.
pub struct CancellationToken {
    session_id: String,
    conversation_id: Option<String>,
    created_at: DateTime<Utc>,
    inner: Mutex<Inner>,
}

impl CancellationToken {
    pub fn new(session_id: impl Into<String>, conversation_id: Option<String>) -> Self {
        let session_id = session_id.into();
        tracing::debug!(session_id = %session_id, "created cancellation token");
        Self {
            session_id,
            conversation_id,
            created_at: Utc::now(),
            inner: Mutex::new(Inner {
                state: TokenState::Created,
                active_operations: 0,
                current_stage: None,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> TokenState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == TokenState::Active
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TokenState::Cancelled
    }

    pub fn is_completed(&self) -> bool {
        self.state() == TokenState::Completed
    }

    /// True once the token has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// `Created → Active`. Returns false from any other state.
    pub fn activate(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TokenState::Created {
            inner.state = TokenState::Active;
            true
        } else {
            tracing::warn!(
                session_id = %self.session_id,
                state = inner.state.as_str(),
                "cannot activate token"
            );
            false
        }
    }

    /// Signal cancellation. Idempotent no-op from terminal states: returns
    /// false if already cancelled or completed.
    pub fn cancel(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            tracing::debug!(
                session_id = %self.session_id,
                state = inner.state.as_str(),
                "cancel ignored in terminal state"
            );
            return false;
        }
        let old = inner.state;
        inner.state = TokenState::Cancelled;
        tracing::info!(
            session_id = %self.session_id,
            was = old.as_str(),
            "cancelled token"
        );
        true
    }

    /// Mark the turn as completed. Cannot overwrite `Cancelled`.
    pub fn complete(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = TokenState::Completed;
        true
    }

    /// Fail with [`Error::Cancelled`] if cancellation has been signalled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            tracing::debug!(session_id = %self.session_id, "cancellation check failed");
            return Err(Error::Cancelled {
                session_id: self.session_id.clone(),
            });
        }
        Ok(())
    }

    /// Begin a nested scoped operation. Performs a cancellation check and
    /// increments the operation counter; the returned guard decrements it
    /// on drop.
    pub fn enter_operation(self: &Arc<Self>) -> Result<OperationGuard> {
        let mut inner = self.inner.lock();
        if inner.state == TokenState::Cancelled {
            return Err(Error::Cancelled {
                session_id: self.session_id.clone(),
            });
        }
        inner.active_operations += 1;
        Ok(OperationGuard {
            token: Arc::clone(self),
        })
    }

    pub fn has_active_operations(&self) -> bool {
        self.inner.lock().active_operations > 0
    }

    pub fn set_stage(&self, stage: u8) {
        self.inner.lock().current_stage = Some(stage);
    }

    pub fn current_stage(&self) -> Option<u8> {
        self.inner.lock().current_stage
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    fn exit_operation(&self) {
        let mut inner = self.inner.lock();
        inner.active_operations = inner.active_operations.saturating_sub(1);
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CancellationToken")
            .field("session_id", &self.session_id)
            .field("state", &inner.state)
            .field("stage", &inner.current_stage)
            .finish()
    }
}

/// RAII guard for a nested operation; decrements the token's operation
/// counter when dropped.
pub struct OperationGuard {
    token: Arc<CancellationToken>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.token.exit_operation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> Arc<CancellationToken> {
        Arc::new(CancellationToken::new("s1", None))
    }

    #[test]
    fn lifecycle_created_active_completed() {
        let t = token();
        assert_eq!(t.state(), TokenState::Created);
        assert!(t.activate());
        assert!(t.is_active());
        assert!(t.complete());
        assert!(t.is_completed());
        assert!(t.is_finished());
    }

    #[test]
    fn cancel_from_created_and_active() {
        let t = token();
        assert!(t.cancel());
        assert!(t.is_cancelled());

        let t = token();
        t.activate();
        assert!(t.cancel());
        assert!(t.is_cancelled());
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let t = token();
        t.activate();
        assert!(t.cancel());
        // Cancelled cannot be completed.
        assert!(!t.complete());
        assert!(t.is_cancelled());
        // Cancel again is a no-op.
        assert!(!t.cancel());

        let t = token();
        t.activate();
        assert!(t.complete());
        // Completed cannot be cancelled.
        assert!(!t.cancel());
        assert!(t.is_completed());
    }

    #[test]
    fn activate_only_from_created() {
        let t = token();
        t.activate();
        assert!(!t.activate());

        let t = token();
        t.cancel();
        assert!(!t.activate());
    }

    #[test]
    fn check_fails_only_when_cancelled() {
        let t = token();
        t.activate();
        assert!(t.check().is_ok());
        t.cancel();
        let err = t.check().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn operation_guard_counts_and_releases() {
        let t = token();
        t.activate();
        assert!(!t.has_active_operations());
        {
            let _g1 = t.enter_operation().unwrap();
            let _g2 = t.enter_operation().unwrap();
            assert!(t.has_active_operations());
        }
        assert!(!t.has_active_operations());
    }

    #[test]
    fn enter_operation_fails_after_cancel() {
        let t = token();
        t.activate();
        t.cancel();
        assert!(t.enter_operation().is_err());
    }

    #[test]
    fn stage_tracking() {
        let t = token();
        assert_eq!(t.current_stage(), None);
        t.set_stage(3);
        assert_eq!(t.current_stage(), Some(3));
    }

    #[test]
    fn concurrent_cancel_complete_has_single_winner() {
        // First-to-acquire wins; the loser's call returns false.
        for _ in 0..64 {
            let t = token();
            t.activate();
            let t1 = Arc::clone(&t);
            let t2 = Arc::clone(&t);
            let h1 = std::thread::spawn(move || t1.cancel());
            let h2 = std::thread::spawn(move || t2.complete());
            let cancelled = h1.join().unwrap();
            let completed = h2.join().unwrap();
            assert!(cancelled ^ completed, "exactly one transition must win");
            assert!(t.is_finished());
        }
    }
}
