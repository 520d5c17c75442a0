//! Sled-backed entity store.
//!
//! Records are stored as JSON bytes keyed by identity, with a secondary
//! tree indexing `workspace_id -> identity` for workspace listing. The
//! version-conditional write maps onto sled's native compare-and-swap,
//! so concurrent writers racing on one identity are resolved atomically
//! at the storage layer.

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::{Entity, EntityStore, StoreError, StoreResult};

/// Tree names for different data types
const TREE_ENTITIES: &str = "entities";
const TREE_WORKSPACE_INDEX: &str = "workspace_index";

/// Separator between workspace id and identity in index keys. NUL cannot
/// appear in either, so prefix scans never bleed across workspaces.
const INDEX_SEP: u8 = 0;

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the sled database directory
    pub path: String,
    /// Cache size in bytes
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = sled default)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/prodsync.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Sled-based entity store.
#[derive(Clone)]
pub struct SledEntityStore {
    _db: Arc<Db>,
    entities: Tree,
    workspace_index: Tree,
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl SledEntityStore {
    /// Open or create a store at the configured path.
    pub fn open(config: StorageConfig) -> StoreResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let entities = db.open_tree(TREE_ENTITIES)?;
        let workspace_index = db.open_tree(TREE_WORKSPACE_INDEX)?;

        Ok(Self {
            _db: Arc::new(db),
            entities,
            workspace_index,
        })
    }

    /// Open with default configuration
    pub fn open_default() -> StoreResult<Self> {
        Self::open(StorageConfig::default())
    }

    fn index_key(workspace_id: &str, identity: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(workspace_id.len() + 1 + identity.len());
        key.extend_from_slice(workspace_id.as_bytes());
        key.push(INDEX_SEP);
        key.extend_from_slice(identity.as_bytes());
        key
    }

    fn index_prefix(workspace_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(workspace_id.len() + 1);
        prefix.extend_from_slice(workspace_id.as_bytes());
        prefix.push(INDEX_SEP);
        prefix
    }

    fn decode(bytes: &[u8]) -> StoreResult<Entity> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[async_trait]
impl EntityStore for SledEntityStore {
    async fn get_by_identity(&self, identity: &str) -> StoreResult<Option<Entity>> {
        match self.entities.get(identity.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, entity: &Entity) -> StoreResult<()> {
        let bytes = serde_json::to_vec(entity)?;

        // CAS from None guarantees identity uniqueness.
        self.entities
            .compare_and_swap(
                entity.identity.as_bytes(),
                None as Option<&[u8]>,
                Some(bytes),
            )?
            .map_err(|_| StoreError::AlreadyExists(entity.identity.clone()))?;

        self.workspace_index.insert(
            Self::index_key(&entity.workspace_id, &entity.identity),
            entity.identity.as_bytes(),
        )?;

        debug!(
            "Inserted {} {} in workspace {}",
            entity.entity_type.as_str(),
            entity.identity,
            entity.workspace_id
        );
        Ok(())
    }

    async fn conditional_update(&self, expected_version: u64, entity: &Entity) -> StoreResult<()> {
        let key = entity.identity.as_bytes();

        let current_bytes = self
            .entities
            .get(key)?
            .ok_or_else(|| StoreError::NotFound(entity.identity.clone()))?;
        let current = Self::decode(&current_bytes)?;

        if current.version != expected_version {
            return Err(StoreError::CasFailed {
                identity: entity.identity.clone(),
                current_version: current.version,
            });
        }

        let next_bytes = serde_json::to_vec(entity)?;

        // Swap against the exact bytes we read; a concurrent writer that
        // slipped in between read and write makes the CAS fail.
        match self
            .entities
            .compare_and_swap(key, Some(current_bytes), Some(next_bytes))?
        {
            Ok(()) => Ok(()),
            Err(cas) => {
                let current_version = cas
                    .current
                    .as_deref()
                    .map(Self::decode)
                    .transpose()?
                    .map(|e| e.version)
                    .unwrap_or(0);
                Err(StoreError::CasFailed {
                    identity: entity.identity.clone(),
                    current_version,
                })
            }
        }
    }

    async fn list_by_workspace(
        &self,
        workspace_id: &str,
        include_deleted: bool,
    ) -> StoreResult<Vec<Entity>> {
        let mut entities = Vec::new();

        for item in self.workspace_index.scan_prefix(Self::index_prefix(workspace_id)) {
            let (_, identity_bytes) = item?;
            if let Some(bytes) = self.entities.get(&identity_bytes)? {
                let entity = Self::decode(&bytes)?;
                if include_deleted || !entity.is_deleted {
                    entities.push(entity);
                }
            }
        }

        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityType;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_store() -> (SledEntityStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        (SledEntityStore::open(config).unwrap(), dir)
    }

    fn sample_entity(workspace: &str) -> Entity {
        Entity::new(
            workspace,
            EntityType::Device,
            "Console 1",
            json!({"channels": 64}),
            "user-1",
        )
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let (store, _dir) = test_store();
        let entity = sample_entity("ws-1");

        store.insert(&entity).await.unwrap();
        let fetched = store.get_by_identity(&entity.identity).await.unwrap();
        assert_eq!(fetched, Some(entity));
    }

    #[tokio::test]
    async fn test_insert_rejects_existing_identity() {
        let (store, _dir) = test_store();
        let entity = sample_entity("ws-1");

        store.insert(&entity).await.unwrap();
        let result = store.insert(&entity).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_conditional_update_happy_path() {
        let (store, _dir) = test_store();
        let entity = sample_entity("ws-1");
        store.insert(&entity).await.unwrap();

        let next = entity.with_update(None, json!({"channels": 48}), "user-2");
        store.conditional_update(1, &next).await.unwrap();

        let fetched = store
            .get_by_identity(&entity.identity)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.version, 2);
        assert_eq!(fetched.payload, json!({"channels": 48}));
    }

    #[tokio::test]
    async fn test_conditional_update_stale_version() {
        let (store, _dir) = test_store();
        let entity = sample_entity("ws-1");
        store.insert(&entity).await.unwrap();

        let first = entity.with_update(None, json!({"channels": 48}), "user-2");
        store.conditional_update(1, &first).await.unwrap();

        let stale = entity.with_update(None, json!({"channels": 32}), "user-3");
        let result = store.conditional_update(1, &stale).await;
        assert!(matches!(
            result,
            Err(StoreError::CasFailed {
                current_version: 2,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_conditional_update_unknown_identity() {
        let (store, _dir) = test_store();
        let entity = sample_entity("ws-1");

        let result = store.conditional_update(1, &entity).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_by_workspace_scoping() {
        let (store, _dir) = test_store();
        let a = sample_entity("ws-1");
        let b = sample_entity("ws-1");
        let other = sample_entity("ws-2");

        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();
        store.insert(&other).await.unwrap();

        let listed = store.list_by_workspace("ws-1", false).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|e| e.workspace_id == "ws-1"));
    }

    #[tokio::test]
    async fn test_list_tombstone_visibility() {
        let (store, _dir) = test_store();
        let entity = sample_entity("ws-1");
        store.insert(&entity).await.unwrap();

        let deleted = entity.with_tombstone("user-2");
        store.conditional_update(1, &deleted).await.unwrap();

        assert!(store
            .list_by_workspace("ws-1", false)
            .await
            .unwrap()
            .is_empty());

        let with_deleted = store.list_by_workspace("ws-1", true).await.unwrap();
        assert_eq!(with_deleted.len(), 1);
        assert!(with_deleted[0].is_deleted);
        assert_eq!(with_deleted[0].version, 2);
    }
}
