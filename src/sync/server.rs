//! SyncServer: the orchestrator tying store, OCC, router, presence, and
//! sessions together.
//!
//! One instance per process. All mutations flow through `handle_mutate`,
//! which runs the OCC check and, on success, fans the change event out to
//! every other session in the workspace room. Conflict responses go only
//! to the mutating caller; fan-out failures never do - delivery is
//! best-effort and decoupled from the mutation outcome.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::presence::{PresenceEntry, PresenceTracker};
use super::protocol::{Actor, ChangeEvent, ServerMessage};
use super::router::{BroadcastRouter, SessionSender};
use super::session::{JoinInfo, Session, SessionManager};
use super::{SyncConfig, SyncError, SyncResult, WorkspaceId};
use crate::occ::{MutationRequest, OccController};
use crate::store::{Entity, EntityOp, EntityStore, EntityType, Identity};

/// Fields of a client `Mutate` message, minus the correlation id.
#[derive(Debug, Clone)]
pub struct MutateParams {
    pub entity_type: EntityType,
    pub operation: EntityOp,
    pub identity: Option<Identity>,
    pub expected_version: Option<u64>,
    pub display_key: Option<String>,
    pub payload: serde_json::Value,
}

/// The main synchronization server
pub struct SyncServer {
    config: SyncConfig,
    store: Arc<dyn EntityStore>,
    occ: OccController,
    router: BroadcastRouter,
    presence: PresenceTracker,
    sessions: SessionManager,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    pub fn new(store: Arc<dyn EntityStore>, config: SyncConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            occ: OccController::new(store.clone(), config.clone()),
            store,
            router: BroadcastRouter::new(),
            presence: PresenceTracker::new(),
            sessions: SessionManager::new(),
            started_at: Instant::now(),
            shutdown_tx,
            config,
        }
    }

    /// Create with default configuration
    pub fn with_store(store: Arc<dyn EntityStore>) -> Self {
        Self::new(store, SyncConfig::default())
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Register a fresh connection; CONNECTING until it joins a workspace.
    pub fn connect(&self) -> Arc<Session> {
        self.sessions.register()
    }

    /// Join a workspace room. Registers the session with the router and
    /// presence tracker, broadcasts the updated roster to the room, and
    /// returns the `Joined` ack carrying the current roster.
    pub fn join_workspace(
        &self,
        session_id: &str,
        workspace_id: &str,
        user_id: &str,
        user_name: &str,
        sender: mpsc::Sender<ServerMessage>,
    ) -> SyncResult<ServerMessage> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| SyncError::Session(format!("Unknown session: {}", session_id)))?;

        if self.router.member_count(workspace_id) >= self.config.max_sessions_per_workspace
            && !self.router.is_member(workspace_id, session_id)
        {
            return Err(SyncError::WorkspaceFull(workspace_id.to_string()));
        }

        // A session that joins a second workspace implicitly leaves the
        // first; one room per connection keeps resync semantics simple.
        if let Some(previous) = session.workspace_id() {
            if previous != workspace_id {
                self.leave_workspace(session_id);
            }
        }

        self.router
            .join(workspace_id, SessionSender::new(session_id, sender));

        self.presence
            .get_or_create(workspace_id)
            .add_session(session_id, PresenceEntry::new(user_id, user_name));

        session.mark_joined(JoinInfo {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            joined_at: chrono::Utc::now().timestamp(),
        });

        info!(
            "Session {} joined workspace {} as {} ({})",
            session_id, workspace_id, user_name, user_id
        );

        self.broadcast_roster(workspace_id, Some(session_id));

        Ok(ServerMessage::Joined {
            workspace_id: workspace_id.to_string(),
            users: self.presence.roster(workspace_id),
        })
    }

    /// Leave the joined workspace room, if any. Idempotent; returns the
    /// workspace left.
    pub fn leave_workspace(&self, session_id: &str) -> Option<WorkspaceId> {
        let session = self.sessions.get(session_id)?;
        let info = session.join_info()?;

        self.router.leave(&info.workspace_id, session_id);
        if let Some(presence) = self.presence.get(&info.workspace_id) {
            presence.remove_session(session_id);
        }
        session.mark_left();

        self.broadcast_roster(&info.workspace_id, None);

        info!(
            "Session {} left workspace {}",
            session_id, info.workspace_id
        );
        Some(info.workspace_id)
    }

    /// Tear one session down. Safe to call from transport close, explicit
    /// goodbye, and the staleness sweep concurrently; cleanup runs once.
    pub fn disconnect(&self, session_id: &str) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        if !session.begin_teardown() {
            return;
        }

        if let Some(info) = session.join_info() {
            self.router.leave(&info.workspace_id, session_id);
            if let Some(presence) = self.presence.get(&info.workspace_id) {
                presence.remove_session(session_id);
            }
            self.broadcast_roster(&info.workspace_id, None);
        }

        self.sessions.remove(session_id);
        info!("Session {} disconnected", session_id);
    }

    /// Record inbound traffic for heartbeat accounting.
    pub fn touch_session(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            session.touch();
        }
    }

    /// Run one mutation through the OCC and fan the resulting change event
    /// out to the rest of the room. The returned ack carries the
    /// authoritative post-mutation entity for the caller's own
    /// reconciliation; errors (including `Conflict`) are the caller's to
    /// surface.
    pub async fn handle_mutate(
        &self,
        session_id: &str,
        request_id: &str,
        params: MutateParams,
    ) -> SyncResult<ServerMessage> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| SyncError::Session(format!("Unknown session: {}", session_id)))?;
        let info = session
            .join_info()
            .ok_or_else(|| SyncError::Session("Session has not joined a workspace".into()))?;
        session.touch();

        let actor = Actor {
            user_id: info.user_id.clone(),
            user_name: info.user_name.clone(),
        };

        let entity = self
            .occ
            .apply(MutationRequest {
                workspace_id: info.workspace_id.clone(),
                entity_type: params.entity_type,
                operation: params.operation,
                identity: params.identity,
                expected_version: params.expected_version,
                display_key: params.display_key,
                payload: params.payload,
                actor: actor.clone(),
            })
            .await?;

        let event = ChangeEvent {
            entity_type: params.entity_type,
            operation: params.operation,
            entity: entity.clone(),
            actor,
        };

        // Best-effort fan-out; the mutation is already committed and its
        // outcome never depends on delivery.
        let overflowed = self.router.broadcast(
            &info.workspace_id,
            Some(session_id),
            &ServerMessage::Change { event },
        );
        for victim in overflowed {
            warn!("Disconnecting overflowed session {}", victim);
            self.disconnect(&victim);
        }

        debug!(
            "Mutation {} by {} committed at v{}",
            request_id, session_id, entity.version
        );

        Ok(ServerMessage::MutateAck {
            request_id: request_id.to_string(),
            entity,
        })
    }

    /// Full authoritative entity set for a workspace - the reconnect path.
    pub async fn resync(
        &self,
        workspace_id: &str,
        include_deleted: bool,
    ) -> SyncResult<Vec<Entity>> {
        self.store
            .list_by_workspace(workspace_id, include_deleted)
            .await
            .map_err(|e| SyncError::TransientStore(e.to_string()))
    }

    /// Current de-duplicated roster for a workspace.
    pub fn roster(&self, workspace_id: &str) -> Vec<super::protocol::PresenceUser> {
        self.presence.roster(workspace_id)
    }

    fn broadcast_roster(&self, workspace_id: &str, exclude: Option<&str>) {
        let msg = ServerMessage::Presence {
            workspace_id: workspace_id.to_string(),
            users: self.presence.roster(workspace_id),
        };
        let overflowed = self.router.broadcast(workspace_id, exclude, &msg);
        for victim in overflowed {
            self.disconnect(&victim);
        }
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_workspaces: self.router.room_count(),
            active_sessions: self.sessions.count(),
            sessions_in_rooms: self.presence.total_session_count(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Start the background staleness sweep. Marks idle sessions, tears
    /// down sessions past the heartbeat timeout, and garbage collects
    /// empty rooms.
    pub fn start_background_tasks(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(server.config.sweep_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        server.sweep();
                    }
                    _ = shutdown.recv() => {
                        info!("Sweep task shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn sweep(&self) {
        let expired = self
            .sessions
            .sweep(self.config.idle_timeout, self.config.session_timeout);
        for session in expired {
            warn!("Session {} timed out without heartbeat", session.session_id);
            self.disconnect(&session.session_id);
        }

        self.router.gc_empty_rooms(self.config.empty_room_grace);
        self.presence.cleanup_empty();
    }
}

/// Server statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerStats {
    pub active_workspaces: usize,
    pub active_sessions: usize,
    pub sessions_in_rooms: usize,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEntityStore;
    use serde_json::json;

    fn server() -> Arc<SyncServer> {
        Arc::new(SyncServer::with_store(Arc::new(MemoryEntityStore::new())))
    }

    fn join(
        server: &SyncServer,
        workspace: &str,
        user: &str,
    ) -> (String, mpsc::Receiver<ServerMessage>) {
        let session = server.connect();
        let (tx, rx) = mpsc::channel(64);
        server
            .join_workspace(&session.session_id, workspace, user, user, tx)
            .unwrap();
        (session.session_id.clone(), rx)
    }

    fn create_params() -> MutateParams {
        MutateParams {
            entity_type: EntityType::Equipment,
            operation: EntityOp::Create,
            identity: None,
            expected_version: None,
            display_key: Some("Camera A".to_string()),
            payload: json!({"status": "available"}),
        }
    }

    fn update_params(identity: &str, expected: u64) -> MutateParams {
        MutateParams {
            entity_type: EntityType::Equipment,
            operation: EntityOp::Update,
            identity: Some(identity.to_string()),
            expected_version: Some(expected),
            display_key: None,
            payload: json!({"status": "checked_out"}),
        }
    }

    async fn created_entity(server: &SyncServer, session_id: &str) -> Entity {
        match server
            .handle_mutate(session_id, "req-create", create_params())
            .await
            .unwrap()
        {
            ServerMessage::MutateAck { entity, .. } => entity,
            other => panic!("Expected ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mutation_fans_out_to_other_sessions() {
        let server = server();
        let (alice, _rx_alice) = join(&server, "ws-1", "alice");
        let (_bob, mut rx_bob) = join(&server, "ws-1", "bob");

        // Drain bob's presence broadcast from alice... bob joined after
        // alice, so bob has no queued presence yet. Create as alice.
        let entity = created_entity(&server, &alice).await;

        let received = rx_bob.recv().await.unwrap();
        match received {
            ServerMessage::Change { event } => {
                assert_eq!(event.operation, EntityOp::Create);
                assert_eq!(event.entity.identity, entity.identity);
                assert_eq!(event.actor.user_id, "alice");
            }
            other => panic!("Expected change event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conflict_goes_only_to_loser() {
        let server = server();
        let (alice, _rx_alice) = join(&server, "ws-1", "alice");
        let (bob, mut rx_bob) = join(&server, "ws-1", "bob");

        let entity = created_entity(&server, &alice).await;
        let _ = rx_bob.recv().await; // bob sees the create

        // Alice commits v2; bob then mutates against the stale v1.
        server
            .handle_mutate(&alice, "req-2", update_params(&entity.identity, 1))
            .await
            .unwrap();
        let _ = rx_bob.recv().await; // bob sees alice's update

        let result = server
            .handle_mutate(&bob, "req-3", update_params(&entity.identity, 1))
            .await;

        match result {
            Err(SyncError::Conflict {
                current_version, ..
            }) => assert_eq!(current_version, 2),
            other => panic!("Expected conflict, got {:?}", other.is_ok()),
        }

        // The failed mutation must not have produced a change event.
        assert!(rx_bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_presence_roster_dedupes_two_tabs() {
        let server = server();
        let (_tab1, _rx1) = join(&server, "ws-1", "alice");
        let (tab2, _rx2) = join(&server, "ws-1", "alice");
        let (_bob, _rx3) = join(&server, "ws-1", "bob");

        let roster = server.roster("ws-1");
        assert_eq!(roster.len(), 2);

        // Closing one of alice's tabs keeps her in the roster.
        server.disconnect(&tab2);
        let roster = server.roster("ws-1");
        assert!(roster.iter().any(|u| u.user_id == "alice"));
        assert_eq!(roster.len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let server = server();
        let (alice, _rx) = join(&server, "ws-1", "alice");

        server.disconnect(&alice);
        server.disconnect(&alice);

        assert_eq!(server.stats().active_sessions, 0);
        assert_eq!(server.roster("ws-1").len(), 0);
    }

    #[tokio::test]
    async fn test_join_rejected_when_workspace_full() {
        let config = SyncConfig {
            max_sessions_per_workspace: 1,
            ..SyncConfig::default()
        };
        let server = SyncServer::new(Arc::new(MemoryEntityStore::new()), config);
        let (_alice, _rx) = join(&server, "ws-1", "alice");

        let session = server.connect();
        let (tx, _rx) = mpsc::channel(64);
        let result = server.join_workspace(&session.session_id, "ws-1", "bob", "bob", tx);

        match result {
            Err(SyncError::WorkspaceFull(workspace_id)) => assert_eq!(workspace_id, "ws-1"),
            other => panic!("Expected full workspace, got {:?}", other.is_ok()),
        }

        // A different workspace is unaffected by ws-1 being at capacity.
        let (tx, _rx) = mpsc::channel(64);
        assert!(server
            .join_workspace(&session.session_id, "ws-2", "bob", "bob", tx)
            .is_ok());
    }

    #[tokio::test]
    async fn test_mutate_requires_join() {
        let server = server();
        let session = server.connect();

        let result = server
            .handle_mutate(&session.session_id, "req-1", create_params())
            .await;
        assert!(matches!(result, Err(SyncError::Session(_))));
    }

    #[tokio::test]
    async fn test_resync_returns_authoritative_versions() {
        let server = server();
        let (alice, _rx) = join(&server, "ws-1", "alice");

        let entity = created_entity(&server, &alice).await;
        server
            .handle_mutate(&alice, "req-2", update_params(&entity.identity, 1))
            .await
            .unwrap();

        let entities = server.resync("ws-1", false).await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].version, 2);
    }

    #[tokio::test]
    async fn test_resync_excludes_tombstones_by_default() {
        let server = server();
        let (alice, _rx) = join(&server, "ws-1", "alice");
        let entity = created_entity(&server, &alice).await;

        let mut params = update_params(&entity.identity, 1);
        params.operation = EntityOp::Delete;
        server.handle_mutate(&alice, "req-2", params).await.unwrap();

        assert!(server.resync("ws-1", false).await.unwrap().is_empty());

        let with_deleted = server.resync("ws-1", true).await.unwrap();
        assert_eq!(with_deleted.len(), 1);
        assert!(with_deleted[0].is_deleted);
        assert_eq!(with_deleted[0].version, 2);
    }

    #[tokio::test]
    async fn test_workspace_isolation() {
        let server = server();
        let (alice, _rx_alice) = join(&server, "ws-1", "alice");
        let (_carol, mut rx_carol) = join(&server, "ws-2", "carol");

        created_entity(&server, &alice).await;

        // Carol is in a different workspace and must see nothing.
        assert!(rx_carol.try_recv().is_err());
        assert!(server.resync("ws-2", false).await.unwrap().is_empty());
    }
}
