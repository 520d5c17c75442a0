//! Versioned entity storage for production workspaces.
//!
//! Every record carries a monotonically increasing version number and a
//! soft-delete tombstone. The store itself is generic over entity types:
//! it only understands `{identity, workspace, version, payload}`. Conflict
//! decisions live in the OCC layer; the store's job is to make the
//! version-conditional write atomic per identity.

mod sled_store;

pub use sled_store::{SledEntityStore, StorageConfig};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Immutable, globally unique entity key. The only valid target for
/// lookup, dedupe, and mutation.
pub type Identity = String;

/// Workspace ("production") identifier - the partition and broadcast scope.
pub type WorkspaceId = String;

/// Known entity types in a production workspace.
///
/// The sync core never looks inside `payload`; the tag exists so the
/// broadcast and reconciliation layers can route without dynamic dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Equipment,
    Device,
    ChecklistItem,
    Note,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Equipment => "equipment",
            EntityType::Device => "device",
            EntityType::ChecklistItem => "checklist_item",
            EntityType::Note => "note",
        }
    }
}

/// Mutation kind carried on change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityOp {
    Create,
    Update,
    Delete,
}

/// A mutable record belonging to exactly one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Immutable unique key; never reassigned, never reused.
    pub identity: Identity,
    /// Human-assigned label. Mutable, may collide; never used for lookup.
    pub display_key: String,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Tagged type for routing; opaque to the sync core otherwise.
    pub entity_type: EntityType,
    /// Starts at 1, +1 per accepted mutation. Authoritative for conflicts.
    pub version: u64,
    /// Soft-delete tombstone; deletion is a version-incrementing mutation.
    pub is_deleted: bool,
    /// Provenance, advisory only.
    pub updated_at: i64,
    pub last_modified_by: String,
    /// Entity-type-specific fields, opaque to the sync core.
    pub payload: serde_json::Value,
}

impl Entity {
    /// Build a fresh entity at version 1.
    pub fn new(
        workspace_id: impl Into<String>,
        entity_type: EntityType,
        display_key: impl Into<String>,
        payload: serde_json::Value,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            identity: uuid::Uuid::new_v4().to_string(),
            display_key: display_key.into(),
            workspace_id: workspace_id.into(),
            entity_type,
            version: 1,
            is_deleted: false,
            updated_at: chrono::Utc::now().timestamp_millis(),
            last_modified_by: created_by.into(),
            payload,
        }
    }

    /// Next revision with the given payload applied.
    pub fn with_update(
        &self,
        display_key: Option<String>,
        payload: serde_json::Value,
        actor: impl Into<String>,
    ) -> Self {
        let mut next = self.clone();
        next.version += 1;
        if let Some(key) = display_key {
            next.display_key = key;
        }
        next.payload = payload;
        next.updated_at = chrono::Utc::now().timestamp_millis();
        next.last_modified_by = actor.into();
        next
    }

    /// Next revision as a tombstone. Payload is retained so the final
    /// snapshot in the delete event is complete.
    pub fn with_tombstone(&self, actor: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next.is_deleted = true;
        next.updated_at = chrono::Utc::now().timestamp_millis();
        next.last_modified_by = actor.into();
        next
    }
}

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Entity not found: {0}")]
    NotFound(Identity),

    #[error("Entity already exists: {0}")]
    AlreadyExists(Identity),

    #[error("Version check failed for {identity}: stored version is {current_version}")]
    CasFailed {
        identity: Identity,
        current_version: u64,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

impl StoreError {
    /// Backend failures are safe to retry with backoff; everything else
    /// is a definitive answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Keyed persistence collaborator consumed by the OCC.
///
/// `conditional_update` must be atomic with respect to concurrent callers
/// on the same identity. The sled implementation uses native
/// compare-and-swap; the OCC additionally serializes same-identity
/// mutations through a per-identity lock.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch a record by identity, tombstones included.
    async fn get_by_identity(&self, identity: &str) -> StoreResult<Option<Entity>>;

    /// Insert a fresh record at version 1. Fails with `AlreadyExists` if
    /// the identity is live - that is a programming error, not a conflict.
    async fn insert(&self, entity: &Entity) -> StoreResult<()>;

    /// Replace the record only if the stored version equals
    /// `expected_version`. Fails with `CasFailed` otherwise.
    async fn conditional_update(&self, expected_version: u64, entity: &Entity) -> StoreResult<()>;

    /// Full current set for one workspace, each with its authoritative
    /// version. Tombstones are filtered unless requested.
    async fn list_by_workspace(
        &self,
        workspace_id: &str,
        include_deleted: bool,
    ) -> StoreResult<Vec<Entity>>;
}

/// In-memory store used by tests and as a reference implementation of the
/// `conditional_update` contract.
#[derive(Default)]
pub struct MemoryEntityStore {
    entities: DashMap<Identity, Entity>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get_by_identity(&self, identity: &str) -> StoreResult<Option<Entity>> {
        Ok(self.entities.get(identity).map(|e| e.clone()))
    }

    async fn insert(&self, entity: &Entity) -> StoreResult<()> {
        match self.entities.entry(entity.identity.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::AlreadyExists(entity.identity.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entity.clone());
                Ok(())
            }
        }
    }

    async fn conditional_update(&self, expected_version: u64, entity: &Entity) -> StoreResult<()> {
        // The entry guard makes read-check-write atomic per identity.
        let mut current = self
            .entities
            .get_mut(&entity.identity)
            .ok_or_else(|| StoreError::NotFound(entity.identity.clone()))?;

        if current.version != expected_version {
            return Err(StoreError::CasFailed {
                identity: entity.identity.clone(),
                current_version: current.version,
            });
        }

        *current = entity.clone();
        Ok(())
    }

    async fn list_by_workspace(
        &self,
        workspace_id: &str,
        include_deleted: bool,
    ) -> StoreResult<Vec<Entity>> {
        Ok(self
            .entities
            .iter()
            .filter(|e| e.workspace_id == workspace_id && (include_deleted || !e.is_deleted))
            .map(|e| e.clone())
            .collect())
    }
}
