//! Optimistic concurrency controller.
//!
//! Single chokepoint for all mutations. Same-identity mutations are
//! serialized through a per-identity async lock so the read-check-write is
//! atomic within this process; the store's compare-and-swap backs that up
//! at the persistence layer. Unrelated identities mutate fully in parallel.
//!
//! Conflicts are never retried or merged here: the first writer to pass
//! the version check wins, the loser gets the winner's current state back.
//! Transient store failures are retried a bounded number of times with
//! doubling backoff; a mutation that cannot complete within the configured
//! timeout surfaces as `Timeout`, which is a transient kind, never a
//! conflict.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::store::{Entity, EntityOp, EntityStore, EntityType, Identity, StoreError};
use crate::sync::protocol::Actor;
use crate::sync::{SyncConfig, SyncError, SyncResult, WorkspaceId};

/// One validated mutation request, normalized from the wire shape.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub workspace_id: WorkspaceId,
    pub entity_type: EntityType,
    pub operation: EntityOp,
    /// Required for UPDATE/DELETE, ignored for CREATE.
    pub identity: Option<Identity>,
    /// The caller's last-known version; required for UPDATE/DELETE.
    pub expected_version: Option<u64>,
    pub display_key: Option<String>,
    pub payload: serde_json::Value,
    pub actor: Actor,
}

/// Mutation chokepoint enforcing per-identity version monotonicity.
pub struct OccController {
    store: Arc<dyn EntityStore>,
    /// Per-identity write locks; entries are created on demand and live
    /// for the process lifetime (identities are never reused).
    locks: DashMap<Identity, Arc<tokio::sync::Mutex<()>>>,
    config: SyncConfig,
}

impl OccController {
    pub fn new(store: Arc<dyn EntityStore>, config: SyncConfig) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            config,
        }
    }

    /// Validate and apply one mutation. Returns the post-mutation entity
    /// on success; `Conflict` carries the winner's state on a lost race.
    pub async fn apply(&self, request: MutationRequest) -> SyncResult<Entity> {
        match tokio::time::timeout(self.config.mutation_timeout, self.apply_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout),
        }
    }

    async fn apply_inner(&self, request: MutationRequest) -> SyncResult<Entity> {
        match request.operation {
            EntityOp::Create => self.apply_create(request).await,
            EntityOp::Update | EntityOp::Delete => self.apply_versioned(request).await,
        }
    }

    async fn apply_create(&self, request: MutationRequest) -> SyncResult<Entity> {
        let entity = Entity::new(
            &request.workspace_id,
            request.entity_type,
            request.display_key.unwrap_or_default(),
            request.payload,
            &request.actor.user_id,
        );

        self.with_transient_retry(|| {
            let entity = entity.clone();
            async move { self.store.insert(&entity).await }
        })
        .await
        .map_err(|err| match err {
            StoreError::AlreadyExists(identity) => {
                // Identities are server-assigned UUIDs; a collision here
                // means a caller bug, not a concurrent edit.
                error!("CREATE hit a live identity: {}", identity);
                SyncError::AlreadyExists(identity)
            }
            other => map_store_error(other),
        })?;

        debug!(
            "Created {} {} v1 in {}",
            entity.entity_type.as_str(),
            entity.identity,
            entity.workspace_id
        );
        Ok(entity)
    }

    async fn apply_versioned(&self, request: MutationRequest) -> SyncResult<Entity> {
        let identity = request
            .identity
            .clone()
            .ok_or_else(|| SyncError::Protocol("mutation is missing identity".into()))?;
        let expected_version = request
            .expected_version
            .ok_or_else(|| SyncError::Protocol("mutation is missing expected_version".into()))?;

        let lock = self.lock_for(&identity);
        let _guard = lock.lock().await;

        let current = self
            .with_transient_retry(|| {
                let identity = identity.clone();
                async move { self.store.get_by_identity(&identity).await }
            })
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| SyncError::NotFound(identity.clone()))?;

        if current.version != expected_version {
            warn!(
                "Conflict on {}: expected v{}, stored v{}",
                identity, expected_version, current.version
            );
            return Err(SyncError::Conflict {
                identity,
                current_version: current.version,
                current_entity: Box::new(current),
            });
        }

        let next = match request.operation {
            EntityOp::Update => current.with_update(
                request.display_key,
                request.payload,
                &request.actor.user_id,
            ),
            EntityOp::Delete => current.with_tombstone(&request.actor.user_id),
            EntityOp::Create => unreachable!("create handled separately"),
        };

        let write_result = self
            .with_transient_retry(|| {
                let next = next.clone();
                async move { self.store.conditional_update(expected_version, &next).await }
            })
            .await;

        match write_result {
            Ok(()) => {
                debug!(
                    "Applied {:?} on {} -> v{}",
                    request.operation, next.identity, next.version
                );
                Ok(next)
            }
            // The per-identity lock makes an in-process race impossible,
            // but an external writer can still lose us the CAS. Re-read
            // and report the winner.
            Err(StoreError::CasFailed { identity, .. }) => {
                let current = self
                    .store
                    .get_by_identity(&identity)
                    .await
                    .map_err(map_store_error)?
                    .ok_or_else(|| SyncError::NotFound(identity.clone()))?;
                Err(SyncError::Conflict {
                    identity,
                    current_version: current.version,
                    current_entity: Box::new(current),
                })
            }
            Err(other) => Err(map_store_error(other)),
        }
    }

    fn lock_for(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run a store operation, retrying transient backend failures with
    /// doubling backoff. Definitive answers pass through untouched.
    async fn with_transient_retry<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;

        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt < self.config.transient_retries => {
                    attempt += 1;
                    warn!(
                        "Transient store failure (attempt {}/{}): {}",
                        attempt, self.config.transient_retries, err
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                other => return other,
            }
        }
    }
}

fn map_store_error(err: StoreError) -> SyncError {
    match err {
        StoreError::NotFound(identity) => SyncError::NotFound(identity),
        StoreError::AlreadyExists(identity) => SyncError::AlreadyExists(identity),
        StoreError::CasFailed { identity, .. } => {
            // Callers that care about the winner re-read before mapping;
            // reaching this arm means the race context was lost.
            SyncError::Internal(format!("unhandled CAS failure on {}", identity))
        }
        StoreError::Backend(msg) => SyncError::TransientStore(msg),
        StoreError::Serialization(msg) | StoreError::InitFailed(msg) => SyncError::Internal(msg),
    }
}
