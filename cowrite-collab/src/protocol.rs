//! Wire protocol for room synchronization.
//!
//! Every frame on the WebSocket is one bincode-encoded [`WireMessage`].
//! The message set is a closed enum with exhaustive handling on both
//! ends: an unexpected payload is a decode error that gets logged and
//! dropped, never a silent catch-all. Frames that fail to decode never
//! crash the connection.
//!
//! ```text
//! ┌───────────────┬──────────────────────────────────────────┐
//! │ variant tag   │ variant fields (bincode, standard config) │
//! └───────────────┴──────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ownership::OwnershipRecord;
use crate::presence::{ClientPresence, PresenceColor};
use crate::replica::Operation;

/// Peer identity with display metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub client_id: Uuid,
    pub name: String,
    pub color: PresenceColor,
}

impl ParticipantInfo {
    pub fn new(name: impl Into<String>) -> Self {
        let client_id = Uuid::new_v4();
        Self {
            client_id,
            name: name.into(),
            color: PresenceColor::from_uuid(client_id),
        }
    }

    /// Create with explicit client id (for testing).
    pub fn with_id(client_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            client_id,
            name: name.into(),
            color: PresenceColor::from_uuid(client_id),
        }
    }
}

/// Everything that can cross the wire. One room per document; every
/// variant names its room so the server can route it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Join a room (first message on a connection).
    JoinRoom {
        room_id: String,
        participant: ParticipantInfo,
    },
    /// Clean leave; the server also synthesizes this on disconnect.
    LeaveRoom { room_id: String, client_id: Uuid },
    /// A batch of replicated edits. `seq` is the sender's monotone batch
    /// counter — a single sender's batches apply in send order.
    OperationBatch {
        room_id: String,
        client_id: Uuid,
        seq: u64,
        ops: Vec<Operation>,
    },
    /// Ephemeral presence, overwritten wholesale (last write wins).
    PresenceUpdate {
        room_id: String,
        state: ClientPresence,
    },
    /// Advisory ownership claim for a file. Last write wins.
    OwnershipClaim {
        room_id: String,
        file_id: String,
        record: OwnershipRecord,
    },
    /// Release of a claim; honored only from the current owner.
    OwnershipRelease {
        room_id: String,
        file_id: String,
        client_id: Uuid,
    },
    /// Membership snapshot, broadcast on every join/leave.
    RoomStatus {
        room_id: String,
        members: Vec<ParticipantInfo>,
    },
    /// Full operation history for a (re)joining client, with a checksum
    /// of the text the history renders to.
    Resync {
        room_id: String,
        ops: Vec<Operation>,
        text_hash: u64,
    },
    /// Heartbeat.
    Ping { client_id: Uuid },
    Pong { client_id: Uuid },
}

impl WireMessage {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }

    /// The room this message belongs to (heartbeats have none).
    pub fn room_id(&self) -> Option<&str> {
        match self {
            WireMessage::JoinRoom { room_id, .. }
            | WireMessage::LeaveRoom { room_id, .. }
            | WireMessage::OperationBatch { room_id, .. }
            | WireMessage::PresenceUpdate { room_id, .. }
            | WireMessage::OwnershipClaim { room_id, .. }
            | WireMessage::OwnershipRelease { room_id, .. }
            | WireMessage::RoomStatus { room_id, .. }
            | WireMessage::Resync { room_id, .. } => Some(room_id),
            WireMessage::Ping { .. } | WireMessage::Pong { .. } => None,
        }
    }

    /// The client that authored this message, where one exists. Used to
    /// filter a sender's own frames out of the room fan-out.
    pub fn sender(&self) -> Option<Uuid> {
        match self {
            WireMessage::JoinRoom { participant, .. } => Some(participant.client_id),
            WireMessage::LeaveRoom { client_id, .. }
            | WireMessage::OperationBatch { client_id, .. }
            | WireMessage::OwnershipRelease { client_id, .. }
            | WireMessage::Ping { client_id }
            | WireMessage::Pong { client_id } => Some(*client_id),
            WireMessage::PresenceUpdate { state, .. } => Some(state.client_id),
            WireMessage::OwnershipClaim { record, .. } => Some(record.owner),
            // Server-authored; every member should see these.
            WireMessage::RoomStatus { .. } | WireMessage::Resync { .. } => None,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Encode error: {e}"),
            Self::Decode(e) => write!(f, "Decode error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
