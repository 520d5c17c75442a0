//! Real-time synchronization core.
//!
//! This module owns everything between the versioned entity store and the
//! wire: optimistic-concurrency conflict detection, workspace-scoped
//! broadcast fan-out, presence, and session lifecycle. Conflict policy is
//! last-writer-detects-conflict with user-visible reconciliation; there is
//! deliberately no field-level merge.

pub mod presence;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;

pub use server::SyncServer;

use std::time::Duration;
use thiserror::Error;

use crate::store::{Entity, Identity};

/// Unique identifier for a workspace ("production")
pub type WorkspaceId = String;

/// Unique identifier for one live connection
pub type SessionId = String;

/// Unique identifier for a user (may own several sessions)
pub type UserId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization.
///
/// `Conflict` and `NotFound` go straight back to the requesting client for
/// a user-level decision. `TransientStore` and `Timeout` are retryable and
/// must never be conflated with `Conflict`.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Expected version does not match the stored version. Carries the
    /// winner's current state so the client can reconcile.
    #[error("Version conflict on {identity}: stored version is {current_version}")]
    Conflict {
        identity: Identity,
        current_version: u64,
        current_entity: Box<Entity>,
    },

    /// Mutation targets an unknown identity.
    #[error("Entity not found: {0}")]
    NotFound(Identity),

    /// CREATE against a live identity. A programming error, not a conflict.
    #[error("Entity already exists: {0}")]
    AlreadyExists(Identity),

    /// Persistence collaborator unavailable after bounded retries.
    #[error("Transient store failure: {0}")]
    TransientStore(String),

    /// The mutation could not complete within the configured bound.
    #[error("Mutation timed out")]
    Timeout,

    /// Session not found or not joined to a workspace.
    #[error("Session error: {0}")]
    Session(String),

    /// Join rejected because the workspace is at its session cap.
    #[error("Workspace {0} is full")]
    WorkspaceFull(WorkspaceId),

    /// Transport-level failure; the mutation outcome is discoverable via resync.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed or out-of-sequence client message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invariant violation on the server side.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether the caller may safely retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientStore(_) | SyncError::Timeout)
    }
}

/// Tunables for the sync core.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on one OCC mutation, including store retries.
    pub mutation_timeout: Duration,
    /// Internal retries for transient store failures.
    pub transient_retries: u32,
    /// Initial backoff between transient retries (doubles each attempt).
    pub retry_backoff: Duration,
    /// Bounded per-session outbound queue depth. A full queue disconnects
    /// the session rather than stalling the writer.
    pub outbound_queue_size: usize,
    /// Maximum sessions joined to one workspace.
    pub max_sessions_per_workspace: usize,
    /// No heartbeat within this interval tears the session down.
    pub session_timeout: Duration,
    /// Inactivity before a session is marked idle.
    pub idle_timeout: Duration,
    /// Background sweep cadence.
    pub sweep_interval: Duration,
    /// Empty rooms are kept around this long before garbage collection.
    pub empty_room_grace: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mutation_timeout: Duration::from_secs(5),
            transient_retries: 3,
            retry_backoff: Duration::from_millis(50),
            outbound_queue_size: 256,
            max_sessions_per_workspace: 100,
            session_timeout: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            empty_room_grace: Duration::from_secs(300),
        }
    }
}
