//! Presence tracking for workspace rooms.
//!
//! Tracks which users are currently connected to each workspace. A user
//! may hold several sessions at once (two browser tabs), so the tracker
//! keeps one entry per session and de-duplicates by user id when building
//! the roster. Presence is informational only and never feeds into entity
//! conflict resolution.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::protocol::PresenceUser;
use super::{SessionId, UserId, WorkspaceId};

/// One session's contribution to a workspace's user multiset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub user_name: String,
    pub joined_at: i64,
}

impl PresenceEntry {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            joined_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Per-workspace presence state: session-keyed entries forming a user
/// multiset.
#[derive(Debug)]
pub struct WorkspacePresence {
    sessions: DashMap<SessionId, PresenceEntry>,
}

impl WorkspacePresence {
    fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Add one session's entry. Idempotent per session id.
    pub fn add_session(&self, session_id: &str, entry: PresenceEntry) {
        self.sessions.insert(session_id.to_string(), entry);
    }

    /// Remove exactly one session's entry. Returns the entry along with
    /// whether that user still has other live sessions here.
    pub fn remove_session(&self, session_id: &str) -> Option<(PresenceEntry, bool)> {
        let (_, removed) = self.sessions.remove(session_id)?;
        let user_still_present = self
            .sessions
            .iter()
            .any(|e| e.user_id == removed.user_id);
        Some((removed, user_still_present))
    }

    /// Number of live sessions for one user.
    pub fn session_count_for(&self, user_id: &str) -> usize {
        self.sessions.iter().filter(|e| e.user_id == user_id).count()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// De-duplicated user list, ordered by earliest join so the roster is
    /// stable across broadcasts.
    pub fn roster(&self) -> Vec<PresenceUser> {
        let mut entries: Vec<PresenceEntry> = self.sessions.iter().map(|e| e.clone()).collect();
        entries.sort_by_key(|e| e.joined_at);

        let mut users: Vec<PresenceUser> = Vec::new();
        for entry in entries {
            if !users.iter().any(|u| u.user_id == entry.user_id) {
                users.push(PresenceUser {
                    user_id: entry.user_id,
                    user_name: entry.user_name,
                });
            }
        }
        users
    }
}

/// Presence across all workspaces; state is partitioned per workspace so
/// there is never a cross-workspace lock.
pub struct PresenceTracker {
    workspaces: DashMap<WorkspaceId, Arc<WorkspacePresence>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            workspaces: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, workspace_id: &str) -> Arc<WorkspacePresence> {
        self.workspaces
            .entry(workspace_id.to_string())
            .or_insert_with(|| Arc::new(WorkspacePresence::new()))
            .clone()
    }

    pub fn get(&self, workspace_id: &str) -> Option<Arc<WorkspacePresence>> {
        self.workspaces.get(workspace_id).map(|p| p.clone())
    }

    /// Current de-duplicated roster; empty if the workspace has no sessions.
    pub fn roster(&self, workspace_id: &str) -> Vec<PresenceUser> {
        self.get(workspace_id)
            .map(|p| p.roster())
            .unwrap_or_default()
    }

    pub fn total_session_count(&self) -> usize {
        self.workspaces.iter().map(|p| p.session_count()).sum()
    }

    pub fn workspace_count(&self) -> usize {
        self.workspaces.len()
    }

    /// Drop per-workspace state once the last session leaves.
    pub fn cleanup_empty(&self) {
        let empty: Vec<WorkspaceId> = self
            .workspaces
            .iter()
            .filter(|p| p.is_empty())
            .map(|p| p.key().clone())
            .collect();

        for workspace_id in empty {
            self.workspaces.remove(&workspace_id);
        }
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
