//! Local workspace mirror with version-gated event application.
//!
//! The mirror converges to the server's state under any interleaving,
//! reordering, or duplication of change events for a single identity:
//! highest version wins, everything else is a no-op. Version memory is
//! retained across deletes so a stale re-create of a deleted identity is
//! recognized and discarded.

use std::collections::HashMap;
use tracing::debug;

use crate::store::{Entity, EntityOp, Identity};
use crate::sync::protocol::ChangeEvent;
use crate::sync::WorkspaceId;

/// Outcome of applying one change event to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated,
    Removed,
    /// Duplicate, stale, or otherwise superseded; the mirror is unchanged.
    Ignored,
}

/// Identity-level difference produced by a full resync, for minimal UI
/// churn.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MirrorDiff {
    pub added: Vec<Identity>,
    pub updated: Vec<Identity>,
    pub removed: Vec<Identity>,
}

impl MirrorDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Local mirror of one workspace's entities.
pub struct WorkspaceMirror {
    workspace_id: WorkspaceId,
    entities: HashMap<Identity, Entity>,
    /// Highest version ever seen per identity. Survives deletion so a
    /// resurrected identity at a lower version is rejected.
    seen_versions: HashMap<Identity, u64>,
    /// Set while disconnected; local edits must not be treated as saved
    /// until a resync clears it.
    degraded: bool,
}

impl WorkspaceMirror {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            entities: HashMap::new(),
            seen_versions: HashMap::new(),
            degraded: false,
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn get(&self, identity: &str) -> Option<&Entity> {
        self.entities.get(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entities.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Highest version observed for an identity, deletes included.
    pub fn seen_version(&self, identity: &str) -> Option<u64> {
        self.seen_versions.get(identity).copied()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Mark the mirror stale on disconnect. Only a resync clears this.
    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    /// Apply one change event. All decisions key on `identity`; the
    /// display key is never consulted.
    pub fn apply(&mut self, event: &ChangeEvent) -> Applied {
        let entity = &event.entity;
        let identity = entity.identity.clone();
        let seen = self.seen_versions.get(&identity).copied().unwrap_or(0);

        match event.operation {
            EntityOp::Create => {
                // Duplicate delivery, a race with a local optimistic
                // insert, or a stale re-create after deletion.
                if entity.version <= seen || self.entities.contains_key(&identity) {
                    debug!("Ignoring duplicate create for {}", identity);
                    return Applied::Ignored;
                }
                self.seen_versions.insert(identity.clone(), entity.version);
                self.entities.insert(identity, entity.clone());
                Applied::Inserted
            }
            EntityOp::Update => {
                if entity.version <= seen {
                    debug!(
                        "Ignoring stale update for {} (v{} <= v{})",
                        identity, entity.version, seen
                    );
                    return Applied::Ignored;
                }
                self.seen_versions.insert(identity.clone(), entity.version);
                // An update for an unknown identity is a create we missed.
                let existed = self
                    .entities
                    .insert(identity, entity.clone())
                    .is_some();
                if existed {
                    Applied::Updated
                } else {
                    Applied::Inserted
                }
            }
            EntityOp::Delete => {
                if entity.version <= seen && !self.entities.contains_key(&identity) {
                    return Applied::Ignored;
                }
                if entity.version < seen {
                    // A newer revision is already visible locally; this
                    // delete was superseded before it arrived.
                    return Applied::Ignored;
                }
                self.seen_versions.insert(identity.clone(), entity.version);
                if self.entities.remove(&identity).is_some() {
                    Applied::Removed
                } else {
                    Applied::Ignored
                }
            }
        }
    }

    /// Wholesale replacement from an authoritative snapshot - the
    /// reconnect path. Buffered events from the disconnection window are
    /// not trusted; the snapshot wins. Returns the identity-level diff.
    pub fn resync(&mut self, snapshot: Vec<Entity>) -> MirrorDiff {
        let mut diff = MirrorDiff::default();
        let mut fresh: HashMap<Identity, Entity> = HashMap::new();

        for entity in snapshot {
            if entity.is_deleted {
                // Tombstones only feed version memory.
                let slot = self.seen_versions.entry(entity.identity.clone()).or_insert(0);
                *slot = (*slot).max(entity.version);
                continue;
            }
            match self.entities.get(&entity.identity) {
                None => diff.added.push(entity.identity.clone()),
                Some(local) if local.version != entity.version => {
                    diff.updated.push(entity.identity.clone())
                }
                Some(_) => {}
            }
            let slot = self.seen_versions.entry(entity.identity.clone()).or_insert(0);
            *slot = (*slot).max(entity.version);
            fresh.insert(entity.identity.clone(), entity);
        }

        for identity in self.entities.keys() {
            if !fresh.contains_key(identity) {
                diff.removed.push(identity.clone());
            }
        }

        self.entities = fresh;
        self.degraded = false;
        diff
    }

    /// Insert a speculative local entity ahead of server confirmation.
    /// Used by the pending tracker; does not touch version memory.
    pub(crate) fn stage(&mut self, entity: Entity) -> Option<Entity> {
        self.entities.insert(entity.identity.clone(), entity)
    }

    /// Remove a speculative local entity during rollback.
    pub(crate) fn unstage(&mut self, identity: &str) -> Option<Entity> {
        self.entities.remove(identity)
    }

    /// Replace a confirmed entity with the authoritative server copy and
    /// record its version.
    pub(crate) fn commit(&mut self, entity: Entity) {
        self.seen_versions
            .insert(entity.identity.clone(), entity.version);
        if entity.is_deleted {
            self.entities.remove(&entity.identity);
        } else {
            self.entities.insert(entity.identity.clone(), entity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityType;
    use crate::sync::protocol::Actor;
    use serde_json::json;

    fn actor() -> Actor {
        Actor {
            user_id: "user-1".to_string(),
            user_name: "Alice".to_string(),
        }
    }

    fn entity_at(identity: &str, version: u64, deleted: bool) -> Entity {
        Entity {
            identity: identity.to_string(),
            display_key: "Camera A".to_string(),
            workspace_id: "ws-1".to_string(),
            entity_type: EntityType::Equipment,
            version,
            is_deleted: deleted,
            updated_at: 0,
            last_modified_by: "user-1".to_string(),
            payload: json!({"v": version}),
        }
    }

    fn event(op: EntityOp, identity: &str, version: u64) -> ChangeEvent {
        ChangeEvent {
            entity_type: EntityType::Equipment,
            operation: op,
            entity: entity_at(identity, version, op == EntityOp::Delete),
            actor: actor(),
        }
    }

    #[test]
    fn test_duplicate_create_is_noop() {
        let mut mirror = WorkspaceMirror::new("ws-1");

        assert_eq!(
            mirror.apply(&event(EntityOp::Create, "e1", 1)),
            Applied::Inserted
        );
        assert_eq!(
            mirror.apply(&event(EntityOp::Create, "e1", 1)),
            Applied::Ignored
        );
        assert_eq!(mirror.len(), 1);
    }

    #[test]
    fn test_stale_update_discarded() {
        let mut mirror = WorkspaceMirror::new("ws-1");
        mirror.apply(&event(EntityOp::Create, "e1", 1));
        mirror.apply(&event(EntityOp::Update, "e1", 3));

        assert_eq!(
            mirror.apply(&event(EntityOp::Update, "e1", 2)),
            Applied::Ignored
        );
        assert_eq!(mirror.get("e1").unwrap().version, 3);
    }

    #[test]
    fn test_update_for_unknown_identity_becomes_create() {
        let mut mirror = WorkspaceMirror::new("ws-1");

        assert_eq!(
            mirror.apply(&event(EntityOp::Update, "e1", 4)),
            Applied::Inserted
        );
        assert_eq!(mirror.get("e1").unwrap().version, 4);
    }

    #[test]
    fn test_delete_applies_across_missed_versions() {
        // Client saw v2, missed v3, receives the delete at v4.
        let mut mirror = WorkspaceMirror::new("ws-1");
        mirror.apply(&event(EntityOp::Create, "e1", 1));
        mirror.apply(&event(EntityOp::Update, "e1", 2));

        assert_eq!(
            mirror.apply(&event(EntityOp::Delete, "e1", 4)),
            Applied::Removed
        );
        assert!(!mirror.contains("e1"));
        assert_eq!(mirror.seen_version("e1"), Some(4));
    }

    #[test]
    fn test_recreate_after_delete_is_rejected() {
        let mut mirror = WorkspaceMirror::new("ws-1");
        mirror.apply(&event(EntityOp::Create, "e1", 1));
        mirror.apply(&event(EntityOp::Delete, "e1", 2));

        // A redelivered create from before the delete must stay dead.
        assert_eq!(
            mirror.apply(&event(EntityOp::Create, "e1", 1)),
            Applied::Ignored
        );
        assert!(!mirror.contains("e1"));
    }

    #[test]
    fn test_convergence_under_reordering_and_duplication() {
        // The same event set in two different orders, with duplicates,
        // must converge to the same final state.
        let events = vec![
            event(EntityOp::Create, "e1", 1),
            event(EntityOp::Update, "e1", 2),
            event(EntityOp::Update, "e1", 3),
        ];

        let mut in_order = WorkspaceMirror::new("ws-1");
        for e in &events {
            in_order.apply(e);
        }

        let mut scrambled = WorkspaceMirror::new("ws-1");
        scrambled.apply(&events[2]);
        scrambled.apply(&events[0]);
        scrambled.apply(&events[1]);
        scrambled.apply(&events[2]);
        scrambled.apply(&events[1]);

        assert_eq!(in_order.get("e1"), scrambled.get("e1"));
        assert_eq!(in_order.get("e1").unwrap().version, 3);
    }

    #[test]
    fn test_display_key_collisions_do_not_confuse_the_mirror() {
        let mut mirror = WorkspaceMirror::new("ws-1");
        let mut a = entity_at("e1", 1, false);
        let mut b = entity_at("e2", 1, false);
        a.display_key = "Camera".to_string();
        b.display_key = "Camera".to_string();

        mirror.apply(&ChangeEvent {
            entity_type: EntityType::Equipment,
            operation: EntityOp::Create,
            entity: a,
            actor: actor(),
        });
        mirror.apply(&ChangeEvent {
            entity_type: EntityType::Equipment,
            operation: EntityOp::Create,
            entity: b,
            actor: actor(),
        });

        assert_eq!(mirror.len(), 2);
    }

    #[test]
    fn test_resync_replaces_wholesale_with_diff() {
        let mut mirror = WorkspaceMirror::new("ws-1");
        mirror.apply(&event(EntityOp::Create, "stays", 1));
        mirror.apply(&event(EntityOp::Create, "goes", 1));
        mirror.apply(&event(EntityOp::Create, "moves", 1));
        mirror.mark_degraded();

        let snapshot = vec![
            entity_at("stays", 1, false),
            entity_at("moves", 3, false),
            entity_at("arrives", 2, false),
        ];
        let diff = mirror.resync(snapshot);

        assert_eq!(diff.added, vec!["arrives".to_string()]);
        assert_eq!(diff.updated, vec!["moves".to_string()]);
        assert_eq!(diff.removed, vec!["goes".to_string()]);

        assert!(!mirror.is_degraded());
        assert_eq!(mirror.len(), 3);
        assert_eq!(mirror.get("moves").unwrap().version, 3);
        assert!(!mirror.contains("goes"));
    }

    #[test]
    fn test_resync_tombstones_feed_version_memory() {
        let mut mirror = WorkspaceMirror::new("ws-1");

        let diff = mirror.resync(vec![entity_at("dead", 5, true)]);
        assert!(diff.is_empty());
        assert!(!mirror.contains("dead"));

        // Late create from before the delete stays dead.
        assert_eq!(
            mirror.apply(&event(EntityOp::Create, "dead", 1)),
            Applied::Ignored
        );
    }

    #[test]
    fn test_resync_then_replay_matches_connected_client() {
        // A client that resyncs and then replays later events must end up
        // identical to one that saw everything live.
        let live_events = vec![
            event(EntityOp::Create, "e1", 1),
            event(EntityOp::Update, "e1", 2),
            event(EntityOp::Update, "e1", 3),
            event(EntityOp::Create, "e2", 1),
        ];

        let mut connected = WorkspaceMirror::new("ws-1");
        for e in &live_events {
            connected.apply(e);
        }

        // Reconnector missed everything up to v2 of e1, resyncs there,
        // then replays the tail (plus a duplicate).
        let mut reconnector = WorkspaceMirror::new("ws-1");
        reconnector.mark_degraded();
        reconnector.resync(vec![entity_at("e1", 2, false)]);
        reconnector.apply(&live_events[2]);
        reconnector.apply(&live_events[3]);
        reconnector.apply(&live_events[2]);

        assert_eq!(connected.get("e1"), reconnector.get("e1"));
        assert_eq!(connected.get("e2"), reconnector.get("e2"));
        assert_eq!(connected.len(), reconnector.len());
    }
}
