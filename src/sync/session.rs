//! Connection session lifecycle.
//!
//! One `Session` per live connection, never persisted. The state machine
//! is `Connecting -> Joined -> (Active <-> Idle) -> Disconnected`; there
//! is deliberately no server-side reconnecting state - a reconnect looks
//! like a fresh connection and the client resyncs itself. Teardown must
//! run exactly once even when transport close, explicit leave, and the
//! staleness sweep race each other; `begin_teardown` is the gate.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{SessionId, UserId, WorkspaceId};

/// Per-connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport is up, no workspace joined yet.
    Connecting,
    /// Joined a workspace, no activity observed yet.
    Joined,
    /// Recent heartbeat or message traffic.
    Active,
    /// No activity within the idle interval; still delivered to.
    Idle,
    /// Torn down; terminal.
    Disconnected,
}

/// Workspace membership recorded at join time.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub workspace_id: WorkspaceId,
    pub user_id: UserId,
    pub user_name: String,
    pub joined_at: i64,
}

/// One live connection's server-side state.
pub struct Session {
    pub session_id: SessionId,
    state: RwLock<SessionState>,
    joined: RwLock<Option<JoinInfo>>,
    last_seen: RwLock<Instant>,
    teardown_started: AtomicBool,
    pub connected_at: Instant,
}

impl Session {
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            state: RwLock::new(SessionState::Connecting),
            joined: RwLock::new(None),
            last_seen: RwLock::new(Instant::now()),
            teardown_started: AtomicBool::new(false),
            connected_at: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn join_info(&self) -> Option<JoinInfo> {
        self.joined.read().clone()
    }

    pub fn workspace_id(&self) -> Option<WorkspaceId> {
        self.joined.read().as_ref().map(|j| j.workspace_id.clone())
    }

    /// Record the workspace membership; `Connecting -> Joined`.
    pub fn mark_joined(&self, info: JoinInfo) {
        *self.joined.write() = Some(info);
        *self.state.write() = SessionState::Joined;
        self.touch();
    }

    /// Clear membership after an explicit leave, back to `Connecting`.
    pub fn mark_left(&self) {
        *self.joined.write() = None;
        let mut state = self.state.write();
        if *state != SessionState::Disconnected {
            *state = SessionState::Connecting;
        }
    }

    /// Heartbeat or message traffic; `Idle -> Active`.
    pub fn touch(&self) {
        *self.last_seen.write() = Instant::now();
        let mut state = self.state.write();
        if matches!(*state, SessionState::Joined | SessionState::Idle) {
            *state = SessionState::Active;
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.read().elapsed()
    }

    /// `Active -> Idle` once past the idle interval. No-op otherwise.
    pub fn mark_idle_if_stale(&self, idle_timeout: Duration) {
        if self.idle_for() > idle_timeout {
            let mut state = self.state.write();
            if *state == SessionState::Active {
                *state = SessionState::Idle;
            }
        }
    }

    pub fn is_expired(&self, session_timeout: Duration) -> bool {
        self.idle_for() > session_timeout
    }

    /// Returns true exactly once; all teardown work must be gated on it
    /// so racing disconnect signals collapse into a single cleanup.
    pub fn begin_teardown(&self) -> bool {
        let first = !self.teardown_started.swap(true, Ordering::SeqCst);
        if first {
            *self.state.write() = SessionState::Disconnected;
        }
        first
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of live sessions.
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn register(&self) -> Arc<Session> {
        let session = Arc::new(Session::new());
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        debug!("Session registered: {}", session.session_id);
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Mark idle sessions and collect the ones past the heartbeat timeout
    /// for teardown by the caller.
    pub fn sweep(&self, idle_timeout: Duration, session_timeout: Duration) -> Vec<Arc<Session>> {
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            entry.mark_idle_if_stale(idle_timeout);
            if entry.is_expired(session_timeout) {
                expired.push(entry.value().clone());
            }
        }
        expired
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_info(workspace: &str, user: &str) -> JoinInfo {
        JoinInfo {
            workspace_id: workspace.to_string(),
            user_id: user.to_string(),
            user_name: user.to_string(),
            joined_at: chrono::Utc::now().timestamp(),
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Connecting);

        session.mark_joined(join_info("ws-1", "user-1"));
        // touch inside mark_joined promotes Joined to Active
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.workspace_id(), Some("ws-1".to_string()));

        session.mark_left();
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.join_info().is_none());
    }

    #[test]
    fn test_teardown_runs_exactly_once() {
        let session = Session::new();
        session.mark_joined(join_info("ws-1", "user-1"));

        assert!(session.begin_teardown());
        assert!(!session.begin_teardown());
        assert!(!session.begin_teardown());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_teardown_wins_over_leave() {
        let session = Session::new();
        session.mark_joined(join_info("ws-1", "user-1"));
        session.begin_teardown();

        session.mark_left();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_idle_marking() {
        let session = Session::new();
        session.mark_joined(join_info("ws-1", "user-1"));

        session.mark_idle_if_stale(Duration::from_secs(60));
        assert_eq!(session.state(), SessionState::Active);

        session.mark_idle_if_stale(Duration::ZERO);
        assert_eq!(session.state(), SessionState::Idle);

        session.touch();
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_manager_register_and_sweep() {
        let manager = SessionManager::new();
        let session = manager.register();
        assert_eq!(manager.count(), 1);
        assert!(manager.get(&session.session_id).is_some());

        let expired = manager.sweep(Duration::from_secs(60), Duration::from_secs(300));
        assert!(expired.is_empty());

        let expired = manager.sweep(Duration::ZERO, Duration::ZERO);
        assert_eq!(expired.len(), 1);

        manager.remove(&session.session_id);
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.session_id, b.session_id);
    }
}
