//! prodsync server - real-time sync for shared production workspaces.
//!
//! A long-lived server process using:
//! - Optimistic concurrency control over a versioned entity store
//! - Sled embedded database for entity persistence
//! - Axum with WebSocket for live change propagation
//! - Binary-framed protocol with a JSON text fallback

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use prodsync::store::{Entity, EntityStore, SledEntityStore, StorageConfig};
use prodsync::sync::protocol::{
    ClientMessage, ErrorCode, PresenceUser, ServerMessage, WireCodec, PROTOCOL_VERSION,
};
use prodsync::sync::server::MutateParams;
use prodsync::sync::{SyncConfig, SyncError, SyncServer};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Synchronization server
    sync: Arc<SyncServer>,
    /// Server start time
    started_at: std::time::Instant,
}

impl AppState {
    pub fn new(store: Arc<dyn EntityStore>, config: SyncConfig) -> Self {
        Self {
            sync: Arc::new(SyncServer::new(store, config)),
            started_at: std::time::Instant::now(),
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    active_workspaces: usize,
    active_sessions: usize,
}

#[derive(Debug, Deserialize)]
struct ListEntitiesQuery {
    #[serde(default)]
    include_deleted: bool,
}

#[derive(Debug, Serialize)]
struct EntityListResponse {
    workspace_id: String,
    entities: Vec<Entity>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct WorkspacePresenceResponse {
    workspace_id: String,
    users: Vec<PresenceUser>,
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.sync.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_workspaces: stats.active_workspaces,
        active_sessions: stats.active_sessions,
    })
}

/// Read-resync endpoint: the full authoritative entity set for one
/// workspace, each record carrying its current version. Used by clients
/// to rebuild their local mirror after reconnecting.
async fn list_entities(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    Query(query): Query<ListEntitiesQuery>,
) -> Result<Json<EntityListResponse>, StatusCode> {
    match state.sync.resync(&workspace_id, query.include_deleted).await {
        Ok(entities) => {
            let total = entities.len();
            Ok(Json(EntityListResponse {
                workspace_id,
                entities,
                total,
            }))
        }
        Err(e) => {
            error!("Failed to list entities for {}: {}", workspace_id, e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// Current de-duplicated presence roster for a workspace
async fn get_presence(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
) -> impl IntoResponse {
    Json(WorkspacePresenceResponse {
        users: state.sync.roster(&workspace_id),
        workspace_id,
    })
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle one WebSocket connection for its whole lifetime
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let session = state.sync.connect();
    let session_id = session.session_id.clone();

    info!("New WebSocket connection: session={}", session_id);

    // Bounded outbound queue; the router disconnects us if it overflows.
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.sync.config().outbound_queue_size);

    let welcome = ServerMessage::Welcome {
        protocol_version: PROTOCOL_VERSION,
        session_id: session_id.clone(),
        server_time: chrono::Utc::now().timestamp(),
    };

    if let Err(e) = send_server_message(&mut ws_sender, &welcome).await {
        error!("Failed to send welcome: {}", e);
        state.sync.disconnect(&session_id);
        return;
    }

    let session_id_recv = session_id.clone();
    let session_id_send = session_id.clone();
    let state_recv = state.clone();

    // Task to forward messages from the outbound queue to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match WireCodec::encode_server(&msg) {
                Ok(bytes) => {
                    if ws_sender.send(Message::Binary(bytes.to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                }
            }
        }
        debug!("Send task ended for session {}", session_id_send);
    });

    // Task to handle incoming WebSocket messages
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => match WireCodec::decode_client(&data) {
                    Ok(client_msg) => {
                        if !handle_client_message(client_msg, &session_id_recv, &state_recv, &tx)
                            .await
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to decode binary message: {}", e);
                        let _ = tx.try_send(ServerMessage::Error {
                            code: ErrorCode::InvalidMessage,
                            message: e.to_string(),
                        });
                    }
                },
                Message::Text(text) => {
                    // JSON fallback for debugging clients
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => {
                            if !handle_client_message(
                                client_msg,
                                &session_id_recv,
                                &state_recv,
                                &tx,
                            )
                            .await
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to decode text message: {}", e);
                            let _ = tx.try_send(ServerMessage::Error {
                                code: ErrorCode::InvalidMessage,
                                message: e.to_string(),
                            });
                        }
                    }
                }
                Message::Ping(_) => {
                    // Pong is handled by axum automatically
                }
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", session_id_recv);
                    break;
                }
                _ => {}
            }
        }
        debug!("Receive task ended for session {}", session_id_recv);
    });

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    // Exactly-once cleanup regardless of which side dropped first
    state.sync.disconnect(&session_id);
    info!("Session {} disconnected", session_id);
}

/// Handle a decoded client message. Returns false when the connection
/// should close.
async fn handle_client_message(
    msg: ClientMessage,
    session_id: &str,
    state: &Arc<AppState>,
    tx: &mpsc::Sender<ServerMessage>,
) -> bool {
    match msg {
        ClientMessage::Hello { client_name, .. } => {
            state.sync.touch_session(session_id);
            debug!(
                "Hello from session {}: {}",
                session_id,
                client_name.unwrap_or_default()
            );
        }

        ClientMessage::Join {
            workspace_id,
            user_id,
            user_name,
        } => {
            match state
                .sync
                .join_workspace(session_id, &workspace_id, &user_id, &user_name, tx.clone())
            {
                Ok(ack) => {
                    let _ = tx.try_send(ack);
                }
                Err(e) => {
                    let _ = tx.try_send(error_message(&e));
                }
            }
        }

        ClientMessage::Leave { workspace_id } => {
            state.sync.leave_workspace(session_id);
            let _ = tx.try_send(ServerMessage::Left { workspace_id });
        }

        ClientMessage::Mutate {
            request_id,
            entity_type,
            operation,
            identity,
            expected_version,
            display_key,
            payload,
        } => {
            let params = MutateParams {
                entity_type,
                operation,
                identity,
                expected_version,
                display_key,
                payload,
            };
            match state.sync.handle_mutate(session_id, &request_id, params).await {
                Ok(ack) => {
                    let _ = tx.try_send(ack);
                }
                Err(SyncError::Conflict {
                    identity,
                    current_version,
                    current_entity,
                }) => {
                    // The loser gets the winner's state and must make an
                    // explicit choice; nothing is retried server-side.
                    let _ = tx.try_send(ServerMessage::Conflict {
                        request_id,
                        identity,
                        current_version,
                        current_entity: *current_entity,
                    });
                }
                Err(e) => {
                    warn!("Mutation {} failed: {}", request_id, e);
                    let _ = tx.try_send(error_message(&e));
                }
            }
        }

        ClientMessage::Resync { workspace_id } => {
            state.sync.touch_session(session_id);
            match state.sync.resync(&workspace_id, false).await {
                Ok(entities) => {
                    let _ = tx.try_send(ServerMessage::ResyncState {
                        workspace_id,
                        entities,
                    });
                }
                Err(e) => {
                    let _ = tx.try_send(error_message(&e));
                }
            }
        }

        ClientMessage::Ping { timestamp } => {
            state.sync.touch_session(session_id);
            let _ = tx.try_send(ServerMessage::Pong {
                timestamp,
                server_time: chrono::Utc::now().timestamp(),
            });
        }

        ClientMessage::Goodbye { reason } => {
            info!(
                "Session {} saying goodbye: {}",
                session_id,
                reason.unwrap_or_default()
            );
            let _ = tx.try_send(ServerMessage::Goodbye { reason: None });
            return false;
        }
    }

    true
}

/// Map a sync error onto the wire error shape. Conflicts are handled
/// separately because they carry the winning entity.
fn error_message(err: &SyncError) -> ServerMessage {
    let code = match err {
        SyncError::Conflict { .. } => ErrorCode::VersionMismatch,
        SyncError::NotFound(_) => ErrorCode::NotFound,
        SyncError::AlreadyExists(_) => ErrorCode::AlreadyExists,
        SyncError::TransientStore(_) => ErrorCode::StoreUnavailable,
        SyncError::Timeout => ErrorCode::Timeout,
        SyncError::Session(_) => ErrorCode::NotJoined,
        SyncError::WorkspaceFull(_) => ErrorCode::WorkspaceFull,
        SyncError::Protocol(_) => ErrorCode::InvalidMessage,
        SyncError::Connection(_) | SyncError::Internal(_) => ErrorCode::ServerError,
    };
    ServerMessage::Error {
        code,
        message: err.to_string(),
    }
}

/// Send a server message over WebSocket
async fn send_server_message(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bytes = WireCodec::encode_server(msg)?;
    sender.send(Message::Binary(bytes.to_vec())).await?;
    Ok(())
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prodsync=info,tower_http=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize storage
    let storage_path =
        std::env::var("STORAGE_PATH").unwrap_or_else(|_| "./data/prodsync.sled".to_string());

    info!("Initializing storage at: {}", storage_path);

    let store = SledEntityStore::open(StorageConfig::new(&storage_path))
        .expect("Failed to open storage");

    // Create application state
    let state = Arc::new(AppState::new(Arc::new(store), SyncConfig::default()));

    // Start the background staleness sweep
    let _sweep_handle = state.sync.clone().start_background_tasks();

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health_check))
        // Read-resync and presence
        .route(
            "/api/workspaces/:workspace_id/entities",
            get(list_entities),
        )
        .route(
            "/api/workspaces/:workspace_id/presence",
            get(get_presence),
        )
        // WebSocket endpoint
        .route("/ws", get(ws_handler))
        // Add state and middleware
        .with_state(state)
        .layer(cors);

    // Start server
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("prodsync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app).await.expect("Server error");
}
