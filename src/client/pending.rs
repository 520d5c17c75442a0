//! Explicit tracking of optimistic local mutations.
//!
//! Each speculative write is a tracked record that moves through exactly
//! one of two transitions: `Pending -> Confirmed` when the server ack
//! arrives, or `Pending -> RolledBack` on any failure, conflicts
//! included. Rollback restores the prior local state; there is never a
//! silent retry. Conflicts are handed back to the caller for an explicit
//! user decision.

use std::collections::HashMap;
use tracing::debug;

use super::mirror::WorkspaceMirror;
use crate::store::{Entity, Identity};

/// Lifecycle of one optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Pending,
    Confirmed,
    RolledBack,
}

/// One speculative mutation awaiting its server outcome.
#[derive(Debug, Clone)]
struct PendingMutation {
    state: PendingState,
    /// Identity shown locally while pending. For creates this is a
    /// client-generated placeholder replaced by the server-assigned
    /// identity on confirm.
    speculative_identity: Identity,
    /// Local state to restore on rollback; `None` for speculative creates.
    prior: Option<Entity>,
}

/// Request-id-keyed tracker for in-flight optimistic mutations.
#[derive(Default)]
pub struct PendingTracker {
    in_flight: HashMap<String, PendingMutation>,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.in_flight
            .values()
            .filter(|p| p.state == PendingState::Pending)
            .count()
    }

    pub fn state_of(&self, request_id: &str) -> Option<PendingState> {
        self.in_flight.get(request_id).map(|p| p.state)
    }

    /// Stage a speculative entity in the mirror and start tracking it.
    /// The prior local state (if any) is captured for rollback.
    pub fn begin(
        &mut self,
        mirror: &mut WorkspaceMirror,
        request_id: impl Into<String>,
        speculative: Entity,
    ) {
        let request_id = request_id.into();
        let speculative_identity = speculative.identity.clone();
        let prior = mirror.stage(speculative);

        self.in_flight.insert(
            request_id.clone(),
            PendingMutation {
                state: PendingState::Pending,
                speculative_identity,
                prior,
            },
        );
        debug!("Optimistic mutation {} staged", request_id);
    }

    /// Server accepted the mutation: swap the speculative entry for the
    /// authoritative entity (replacing a placeholder identity with the
    /// server-assigned one) and record its version.
    pub fn confirm(&mut self, mirror: &mut WorkspaceMirror, request_id: &str, entity: Entity) {
        let Some(pending) = self.in_flight.get_mut(request_id) else {
            // Unknown request id: a resync already superseded this ack.
            mirror.commit(entity);
            return;
        };
        if pending.state != PendingState::Pending {
            return;
        }

        if pending.speculative_identity != entity.identity {
            mirror.unstage(&pending.speculative_identity);
        }
        mirror.commit(entity);
        pending.state = PendingState::Confirmed;
        debug!("Optimistic mutation {} confirmed", request_id);
    }

    /// Server rejected the mutation (conflict, not-found, transport
    /// failure): undo the speculative change and restore the prior state.
    /// The caller surfaces the reason; nothing is retried here.
    pub fn roll_back(&mut self, mirror: &mut WorkspaceMirror, request_id: &str) {
        let Some(pending) = self.in_flight.get_mut(request_id) else {
            return;
        };
        if pending.state != PendingState::Pending {
            return;
        }

        mirror.unstage(&pending.speculative_identity);
        if let Some(prior) = pending.prior.take() {
            mirror.stage(prior);
        }
        pending.state = PendingState::RolledBack;
        debug!("Optimistic mutation {} rolled back", request_id);
    }

    /// Drop settled records; called after the UI has consumed outcomes.
    pub fn prune_settled(&mut self) {
        self.in_flight
            .retain(|_, p| p.state == PendingState::Pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityType;
    use serde_json::json;

    fn entity(identity: &str, version: u64, status: &str) -> Entity {
        Entity {
            identity: identity.to_string(),
            display_key: "Camera A".to_string(),
            workspace_id: "ws-1".to_string(),
            entity_type: EntityType::Equipment,
            version,
            is_deleted: false,
            updated_at: 0,
            last_modified_by: "user-1".to_string(),
            payload: json!({ "status": status }),
        }
    }

    #[test]
    fn test_create_confirm_swaps_placeholder_identity() {
        let mut mirror = WorkspaceMirror::new("ws-1");
        let mut tracker = PendingTracker::new();

        // Speculative create under a client-generated placeholder.
        tracker.begin(&mut mirror, "req-1", entity("local-tmp", 0, "new"));
        assert!(mirror.contains("local-tmp"));
        assert_eq!(tracker.state_of("req-1"), Some(PendingState::Pending));

        tracker.confirm(&mut mirror, "req-1", entity("srv-1", 1, "new"));

        assert!(!mirror.contains("local-tmp"));
        assert_eq!(mirror.get("srv-1").unwrap().version, 1);
        assert_eq!(tracker.state_of("req-1"), Some(PendingState::Confirmed));
    }

    #[test]
    fn test_update_rollback_restores_prior() {
        let mut mirror = WorkspaceMirror::new("ws-1");
        let mut tracker = PendingTracker::new();
        mirror.commit(entity("e1", 2, "available"));

        tracker.begin(&mut mirror, "req-1", entity("e1", 2, "checked_out"));
        assert_eq!(mirror.get("e1").unwrap().payload["status"], "checked_out");

        tracker.roll_back(&mut mirror, "req-1");

        assert_eq!(mirror.get("e1").unwrap().payload["status"], "available");
        assert_eq!(mirror.get("e1").unwrap().version, 2);
        assert_eq!(tracker.state_of("req-1"), Some(PendingState::RolledBack));
    }

    #[test]
    fn test_create_rollback_removes_speculative_entry() {
        let mut mirror = WorkspaceMirror::new("ws-1");
        let mut tracker = PendingTracker::new();

        tracker.begin(&mut mirror, "req-1", entity("local-tmp", 0, "new"));
        tracker.roll_back(&mut mirror, "req-1");

        assert!(mirror.is_empty());
    }

    #[test]
    fn test_settled_mutations_ignore_late_signals() {
        let mut mirror = WorkspaceMirror::new("ws-1");
        let mut tracker = PendingTracker::new();
        mirror.commit(entity("e1", 1, "available"));

        tracker.begin(&mut mirror, "req-1", entity("e1", 1, "checked_out"));
        tracker.confirm(&mut mirror, "req-1", entity("e1", 2, "checked_out"));

        // A racing rollback signal after confirmation must not undo it.
        tracker.roll_back(&mut mirror, "req-1");
        assert_eq!(mirror.get("e1").unwrap().version, 2);
        assert_eq!(tracker.state_of("req-1"), Some(PendingState::Confirmed));
    }

    #[test]
    fn test_confirm_for_unknown_request_commits_authoritatively() {
        let mut mirror = WorkspaceMirror::new("ws-1");
        let mut tracker = PendingTracker::new();

        tracker.confirm(&mut mirror, "req-gone", entity("e1", 3, "available"));
        assert_eq!(mirror.get("e1").unwrap().version, 3);
    }

    #[test]
    fn test_prune_settled_keeps_pending() {
        let mut mirror = WorkspaceMirror::new("ws-1");
        let mut tracker = PendingTracker::new();

        tracker.begin(&mut mirror, "req-1", entity("a", 0, "new"));
        tracker.begin(&mut mirror, "req-2", entity("b", 0, "new"));
        tracker.roll_back(&mut mirror, "req-2");
        tracker.prune_settled();

        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(tracker.state_of("req-1"), Some(PendingState::Pending));
        assert!(tracker.state_of("req-2").is_none());
    }
}
