//! WebSocket wire protocol for workspace synchronization.
//!
//! Frames are length-prefixed binary envelopes: one protocol-version byte,
//! one message-type byte, a u24 payload length, then the JSON-encoded
//! message body. JSON is used for the body because entity payloads are
//! opaque, self-describing documents; plain JSON text frames are also
//! accepted at the socket layer for debugging.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use super::{SessionId, UserId, WorkspaceId};
use crate::store::{Entity, EntityOp, EntityType, Identity};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Message type identifiers for the binary envelope
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection lifecycle
    Hello = 0x01,
    Welcome = 0x02,
    Goodbye = 0x03,
    Error = 0x04,

    // Workspace membership
    Join = 0x10,
    Joined = 0x11,
    Leave = 0x12,
    Left = 0x13,

    // Mutations and change propagation
    Mutate = 0x20,
    MutateAck = 0x21,
    Conflict = 0x22,
    Change = 0x23,

    // Full-state resync
    Resync = 0x30,
    ResyncState = 0x31,

    // Presence
    Presence = 0x40,

    // Keepalive
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::Welcome),
            0x03 => Ok(MessageType::Goodbye),
            0x04 => Ok(MessageType::Error),
            0x10 => Ok(MessageType::Join),
            0x11 => Ok(MessageType::Joined),
            0x12 => Ok(MessageType::Leave),
            0x13 => Ok(MessageType::Left),
            0x20 => Ok(MessageType::Mutate),
            0x21 => Ok(MessageType::MutateAck),
            0x22 => Ok(MessageType::Conflict),
            0x23 => Ok(MessageType::Change),
            0x30 => Ok(MessageType::Resync),
            0x31 => Ok(MessageType::ResyncState),
            0x40 => Ok(MessageType::Presence),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// The user behind a mutation, attached to every change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub user_name: String,
}

/// The wire unit broadcast after an accepted mutation. Immutable once
/// emitted; consumers must tolerate duplicates and reordering across
/// different identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_type: EntityType,
    pub operation: EntityOp,
    /// Full post-mutation snapshot, tombstone included for deletes.
    pub entity: Entity,
    pub actor: Actor,
}

/// A user entry in a presence roster, de-duplicated across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub user_id: UserId,
    pub user_name: String,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Initial handshake with client info
    Hello {
        protocol_version: u8,
        client_name: Option<String>,
    },

    /// Join a workspace room
    Join {
        workspace_id: WorkspaceId,
        user_id: UserId,
        user_name: String,
    },

    /// Leave a workspace room
    Leave {
        workspace_id: WorkspaceId,
    },

    /// Submit a mutation against the caller's last-known version.
    /// `identity` and `expected_version` are required for UPDATE/DELETE
    /// and absent for CREATE.
    Mutate {
        /// Client-generated correlation id for optimistic reconciliation
        request_id: String,
        entity_type: EntityType,
        operation: EntityOp,
        identity: Option<Identity>,
        expected_version: Option<u64>,
        display_key: Option<String>,
        payload: serde_json::Value,
    },

    /// Request the full authoritative entity set (reconnect path)
    Resync {
        workspace_id: WorkspaceId,
    },

    /// Ping for keepalive
    Ping {
        timestamp: u64,
    },

    /// Graceful disconnect
    Goodbye {
        reason: Option<String>,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Welcome response with the assigned session id
    Welcome {
        protocol_version: u8,
        session_id: SessionId,
        server_time: i64,
    },

    /// Confirmation of joining a workspace, with the current roster
    Joined {
        workspace_id: WorkspaceId,
        users: Vec<PresenceUser>,
    },

    /// Confirmation of leaving a workspace
    Left {
        workspace_id: WorkspaceId,
    },

    /// A mutation somewhere in the workspace was accepted
    Change {
        event: ChangeEvent,
    },

    /// De-duplicated user roster for a workspace; informational only
    Presence {
        workspace_id: WorkspaceId,
        users: Vec<PresenceUser>,
    },

    /// The caller's mutation was accepted; carries the authoritative entity
    MutateAck {
        request_id: String,
        entity: Entity,
    },

    /// The caller's expected version lost the race. Carries the winner's
    /// state; the client must present it and require an explicit choice.
    Conflict {
        request_id: String,
        identity: Identity,
        current_version: u64,
        current_entity: Entity,
    },

    /// Full authoritative entity set for wholesale mirror replacement
    ResyncState {
        workspace_id: WorkspaceId,
        entities: Vec<Entity>,
    },

    /// Error response
    Error {
        code: ErrorCode,
        message: String,
    },

    /// Pong response
    Pong {
        timestamp: u64,
        server_time: i64,
    },

    /// Graceful disconnect acknowledgment
    Goodbye {
        reason: Option<String>,
    },
}

/// Error codes for server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidMessage = 1,
    NotJoined = 2,
    NotFound = 3,
    AlreadyExists = 4,
    StoreUnavailable = 5,
    Timeout = 6,
    WorkspaceFull = 7,
    ServerError = 8,
    VersionMismatch = 9,
}

/// Codec for the binary envelope
pub struct WireCodec;

impl WireCodec {
    /// Encode a client message to bytes
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = match msg {
            ClientMessage::Hello { .. } => MessageType::Hello,
            ClientMessage::Join { .. } => MessageType::Join,
            ClientMessage::Leave { .. } => MessageType::Leave,
            ClientMessage::Mutate { .. } => MessageType::Mutate,
            ClientMessage::Resync { .. } => MessageType::Resync,
            ClientMessage::Ping { .. } => MessageType::Ping,
            ClientMessage::Goodbye { .. } => MessageType::Goodbye,
        };

        Self::encode(msg_type, msg)
    }

    /// Encode a server message to bytes
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = match msg {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::Joined { .. } => MessageType::Joined,
            ServerMessage::Left { .. } => MessageType::Left,
            ServerMessage::Change { .. } => MessageType::Change,
            ServerMessage::Presence { .. } => MessageType::Presence,
            ServerMessage::MutateAck { .. } => MessageType::MutateAck,
            ServerMessage::Conflict { .. } => MessageType::Conflict,
            ServerMessage::ResyncState { .. } => MessageType::ResyncState,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Pong { .. } => MessageType::Pong,
            ServerMessage::Goodbye { .. } => MessageType::Goodbye,
        };

        Self::encode(msg_type, msg)
    }

    fn encode<T: Serialize>(msg_type: MessageType, msg: &T) -> Result<Bytes, ProtocolError> {
        let payload = serde_json::to_vec(msg)?;

        if payload.len() + 5 > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + 5,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(5 + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(msg_type as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a client message from bytes
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let payload = Self::decode_envelope(data)?;
        Ok(serde_json::from_slice(payload)?)
    }

    /// Decode a server message from bytes
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let payload = Self::decode_envelope(data)?;
        Ok(serde_json::from_slice(payload)?)
    }

    fn decode_envelope(data: &[u8]) -> Result<&[u8], ProtocolError> {
        if data.len() < 5 {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        // Validate the type byte even though dispatch happens on the body.
        MessageType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < 5 + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                5 + payload_len,
                data.len()
            )));
        }

        Ok(&data[5..5 + payload_len])
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}
