//! Wire protocol between sync sessions and the relay hub.
//!
//! Every frame is one bincode-encoded [`SyncMessage`]:
//! ```text
//! ┌───────────┬──────────┬──────────────────────────────────────┐
//! │ peer_id   │ doc_id   │ payload (tagged enum)                │
//! │ 16 bytes  │ 16 bytes │ Join | SyncStep1 | SyncStep2 | Delta │
//! │           │          │ Awareness | AwarenessLeave | Ping/Pong│
//! └───────────┴──────────┴──────────────────────────────────────┘
//! ```
//!
//! Payloads belong to one of three logical channels ([`Channel`]). Document
//! and awareness traffic never share a payload, so a lost awareness frame
//! cannot stall document convergence.
//!
//! Handshake (either side may initiate, the hub only answers):
//! ```text
//! session                          hub
//!    │── Join ──────────────────────►│  bind connection to doc room
//!    │── SyncStep1(sv_s) ───────────►│
//!    │◄──────────── SyncStep2(sv_h, ops ∉ sv_s)
//!    │── Delta(ops ∉ sv_h) ─────────►│  only if non-empty
//!    │            Synced             │
//! ```

use quire_core::{AwarenessMessage, AwarenessState, Operation, StateVector, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Logical channel a payload travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Document,
    Awareness,
    Control,
}

/// Payload discriminant, mostly for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Join = 1,
    SyncStep1 = 2,
    SyncStep2 = 3,
    Delta = 4,
    Awareness = 5,
    AwarenessLeave = 6,
    Ping = 7,
    Pong = 8,
}

impl MessageType {
    pub fn channel(self) -> Channel {
        match self {
            MessageType::SyncStep1 | MessageType::SyncStep2 | MessageType::Delta => Channel::Document,
            MessageType::Awareness | MessageType::AwarenessLeave => Channel::Awareness,
            MessageType::Join | MessageType::Ping | MessageType::Pong => Channel::Control,
        }
    }
}

/// Peer identity announced on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// `#RRGGBB` color for cursor/selection rendering
    pub color: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id. The color is derived from the id, so it
    /// matches the color the awareness table assigns.
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: quire_core::awareness::color_for(peer_id).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPayload {
    /// First frame on a connection: binds it to a document room.
    Join { info: PeerInfo },
    /// "Here is what I have."
    SyncStep1 { state_vector: StateVector },
    /// "Here is what I have, and everything you lack."
    SyncStep2 { state_vector: StateVector, operations: Vec<Operation> },
    /// Live operations. The digest is the sender's state vector digest after
    /// applying them; receivers use it only as a hint.
    Delta { operations: Vec<Operation>, source_state_vector_digest: u64 },
    Awareness { user_id: UserId, state: AwarenessState, timestamp: u64 },
    AwarenessLeave { user_id: UserId },
    Ping,
    Pong,
}

impl SyncPayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            SyncPayload::Join { .. } => MessageType::Join,
            SyncPayload::SyncStep1 { .. } => MessageType::SyncStep1,
            SyncPayload::SyncStep2 { .. } => MessageType::SyncStep2,
            SyncPayload::Delta { .. } => MessageType::Delta,
            SyncPayload::Awareness { .. } => MessageType::Awareness,
            SyncPayload::AwarenessLeave { .. } => MessageType::AwarenessLeave,
            SyncPayload::Ping => MessageType::Ping,
            SyncPayload::Pong => MessageType::Pong,
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    pub payload: SyncPayload,
}

impl SyncMessage {
    pub fn new(peer_id: Uuid, doc_id: Uuid, payload: SyncPayload) -> Self {
        Self { peer_id, doc_id, payload }
    }

    pub fn join(doc_id: Uuid, info: PeerInfo) -> Self {
        Self::new(info.peer_id, doc_id, SyncPayload::Join { info })
    }

    pub fn sync_step1(peer_id: Uuid, doc_id: Uuid, state_vector: StateVector) -> Self {
        Self::new(peer_id, doc_id, SyncPayload::SyncStep1 { state_vector })
    }

    pub fn sync_step2(peer_id: Uuid, doc_id: Uuid, state_vector: StateVector, operations: Vec<Operation>) -> Self {
        Self::new(peer_id, doc_id, SyncPayload::SyncStep2 { state_vector, operations })
    }

    pub fn delta(peer_id: Uuid, doc_id: Uuid, operations: Vec<Operation>, source_state_vector_digest: u64) -> Self {
        Self::new(
            peer_id,
            doc_id,
            SyncPayload::Delta { operations, source_state_vector_digest },
        )
    }

    /// Wrap an awareness-table message for the wire.
    pub fn awareness(peer_id: Uuid, doc_id: Uuid, message: AwarenessMessage) -> Self {
        let payload = match message {
            AwarenessMessage::Update { user_id, state, timestamp } => SyncPayload::Awareness { user_id, state, timestamp },
            AwarenessMessage::Leave { user_id } => SyncPayload::AwarenessLeave { user_id },
        };
        Self::new(peer_id, doc_id, payload)
    }

    pub fn ping(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::new(peer_id, doc_id, SyncPayload::Ping)
    }

    pub fn pong(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::new(peer_id, doc_id, SyncPayload::Pong)
    }

    pub fn msg_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn channel(&self) -> Channel {
        self.msg_type().channel()
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Unwrap an awareness payload back into the table's message type.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        match &self.payload {
            SyncPayload::Awareness { user_id, state, timestamp } => Ok(AwarenessMessage::Update {
                user_id: *user_id,
                state: state.clone(),
                timestamp: *timestamp,
            }),
            SyncPayload::AwarenessLeave { user_id } => Ok(AwarenessMessage::Leave { user_id: *user_id }),
            _ => Err(ProtocolError::InvalidMessageType {
                expected: MessageType::Awareness,
                actual: self.msg_type(),
            }),
        }
    }

    /// Operations carried by a document-channel payload.
    pub fn operations(&self) -> &[Operation] {
        match &self.payload {
            SyncPayload::SyncStep2 { operations, .. } | SyncPayload::Delta { operations, .. } => operations,
            _ => &[],
        }
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Invalid message type: expected {expected:?}, got {actual:?}")]
    InvalidMessageType { expected: MessageType, actual: MessageType },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,
}
