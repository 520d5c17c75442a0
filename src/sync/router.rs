//! Workspace broadcast router.
//!
//! Maintains `workspace_id -> set<session_id>` membership and fans change
//! events out to every session currently joined to that room. Delivery is
//! best-effort: the router attempts delivery to all current members and
//! never blocks the mutating request on a slow receiver. Each session has
//! a bounded outbound queue; a full queue disconnects that session rather
//! than stalling the writer, forcing the laggard through the resync path.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::protocol::ServerMessage;
use super::{SessionId, WorkspaceId};

/// Outbound handle for one session's bounded queue.
#[derive(Clone)]
pub struct SessionSender {
    session_id: SessionId,
    tx: mpsc::Sender<ServerMessage>,
}

impl SessionSender {
    pub fn new(session_id: impl Into<String>, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            session_id: session_id.into(),
            tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Non-blocking send. `false` means the queue is full or closed and
    /// the session should be disconnected.
    pub fn try_send(&self, msg: ServerMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }
}

/// One workspace room's membership.
struct WorkspaceRoom {
    members: DashMap<SessionId, SessionSender>,
    /// Stamped on every membership change; drives empty-room GC.
    last_active: RwLock<Instant>,
}

impl WorkspaceRoom {
    fn new() -> Self {
        Self {
            members: DashMap::new(),
            last_active: RwLock::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_active.write() = Instant::now();
    }
}

/// Fan-out router over per-workspace rooms. Join and leave are idempotent
/// by session id; rooms are created on demand and garbage collected once
/// empty past a grace period.
pub struct BroadcastRouter {
    rooms: DashMap<WorkspaceId, Arc<WorkspaceRoom>>,
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Add a session to a workspace room. Re-joining with the same
    /// session id replaces the sender and is otherwise a no-op.
    pub fn join(&self, workspace_id: &str, sender: SessionSender) {
        let room = self
            .rooms
            .entry(workspace_id.to_string())
            .or_insert_with(|| Arc::new(WorkspaceRoom::new()))
            .clone();

        room.members.insert(sender.session_id.clone(), sender);
        room.touch();
    }

    /// Remove a session from a workspace room. Unknown sessions and
    /// unknown workspaces are no-ops.
    pub fn leave(&self, workspace_id: &str, session_id: &str) {
        if let Some(room) = self.rooms.get(workspace_id) {
            room.members.remove(session_id);
            room.touch();
        }
    }

    pub fn is_member(&self, workspace_id: &str, session_id: &str) -> bool {
        self.rooms
            .get(workspace_id)
            .map(|room| room.members.contains_key(session_id))
            .unwrap_or(false)
    }

    pub fn member_count(&self, workspace_id: &str) -> usize {
        self.rooms
            .get(workspace_id)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Deliver a message to every member of the room except `exclude`.
    /// Members whose queues overflow are removed from the room and their
    /// session ids returned so the caller can tear them down.
    pub fn broadcast(
        &self,
        workspace_id: &str,
        exclude: Option<&str>,
        msg: &ServerMessage,
    ) -> Vec<SessionId> {
        let Some(room) = self.rooms.get(workspace_id) else {
            return Vec::new();
        };

        let mut overflowed = Vec::new();
        for member in room.members.iter() {
            if exclude == Some(member.key().as_str()) {
                continue;
            }
            if !member.value().try_send(msg.clone()) {
                warn!(
                    "Outbound queue overflow for session {} in {}; disconnecting",
                    member.key(),
                    workspace_id
                );
                overflowed.push(member.key().clone());
            }
        }

        for session_id in &overflowed {
            room.members.remove(session_id);
        }

        overflowed
    }

    /// Deliver a message to one member of the room, if present.
    pub fn send_to(&self, workspace_id: &str, session_id: &str, msg: ServerMessage) -> bool {
        self.rooms
            .get(workspace_id)
            .and_then(|room| room.members.get(session_id).map(|m| m.try_send(msg)))
            .unwrap_or(false)
    }

    /// Drop rooms that have been empty longer than the grace period.
    pub fn gc_empty_rooms(&self, grace: Duration) {
        let expired: Vec<WorkspaceId> = self
            .rooms
            .iter()
            .filter(|entry| {
                entry.members.is_empty() && entry.last_active.read().elapsed() > grace
            })
            .map(|entry| entry.key().clone())
            .collect();

        for workspace_id in expired {
            self.rooms.remove(&workspace_id);
            debug!("Removed empty room: {}", workspace_id);
        }
    }
}

impl Default for BroadcastRouter {
    fn default() -> Self {
        Self::new()
    }
}
