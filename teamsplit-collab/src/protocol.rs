//! Binary wire protocol between [`SyncClient`](crate::client::SyncClient)
//! and [`SyncServer`](crate::server::SyncServer).
//!
//! Every WebSocket binary frame carries one bincode-encoded message:
//! ```text
//! client ──► server   ClientMessage::Request { request_id, op }
//!                     ClientMessage::Ping
//! server ──► client   ServerMessage::Welcome { session, snapshot }   first frame
//!                     ServerMessage::Reply   { request_id, result }
//!                     ServerMessage::Snapshot(snapshot)              every commit
//!                     ServerMessage::Resync  { skipped, snapshot }   after lag
//!                     ServerMessage::Pong
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use teamsplit_core::{
    ContactChannel, EngineError, Match, MatchId, ParticipantId, RoomId, SessionId,
};

use crate::admin::{NewParticipant, NewRoom, ParticipantPatch, RoomPatch};
use crate::lifecycle::JoinOutcome;
use crate::store::Snapshot;

/// An engine operation requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    // Presence
    RequestCode { participant: ParticipantId },
    VerifyCode { participant: ParticipantId, code: String },
    /// Unverified claim; only honoured when verification is disabled
    Claim { participant: ParticipantId },
    /// Release whatever this session holds
    Release,
    ReleaseParticipant { participant: ParticipantId },
    IsOnline { participant: ParticipantId },

    // Matches
    CreateMatch { room: RoomId },
    Join { match_id: MatchId, participant: ParticipantId },
    JoinRoom { room: RoomId, participant: ParticipantId },
    DeleteRoom { room: RoomId },

    // Administration
    AddParticipant(NewParticipant),
    UpdateParticipant { id: ParticipantId, patch: ParticipantPatch },
    DeleteParticipant { id: ParticipantId },
    AddRoom(NewRoom),
    UpdateRoom { id: RoomId, patch: RoomPatch },
    SetCredentialHashes { shared: Option<String>, admin: Option<String> },
    Export,
    Import { json: String },
}

impl Operation {
    /// Short label for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::RequestCode { .. } => "request_code",
            Operation::VerifyCode { .. } => "verify_code",
            Operation::Claim { .. } => "claim",
            Operation::Release => "release",
            Operation::ReleaseParticipant { .. } => "release_participant",
            Operation::IsOnline { .. } => "is_online",
            Operation::CreateMatch { .. } => "create_match",
            Operation::Join { .. } => "join",
            Operation::JoinRoom { .. } => "join_room",
            Operation::DeleteRoom { .. } => "delete_room",
            Operation::AddParticipant(_) => "add_participant",
            Operation::UpdateParticipant { .. } => "update_participant",
            Operation::DeleteParticipant { .. } => "delete_participant",
            Operation::AddRoom(_) => "add_room",
            Operation::UpdateRoom { .. } => "update_room",
            Operation::SetCredentialHashes { .. } => "set_credential_hashes",
            Operation::Export => "export",
            Operation::Import { .. } => "import",
        }
    }
}

/// Successful result of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// Applied (or no-op); document is at `version`
    Ack { version: u64 },
    CodeSent(ContactChannel),
    Online(bool),
    Match(Match),
    Joined { entry: Match, outcome: JoinOutcome },
    RoomDeleted { matches_removed: usize },
    ParticipantAdded(ParticipantId),
    RoomAdded(RoomId),
    Exported(String),
}

/// Client → server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    Request { request_id: u64, op: Operation },
    Ping,
}

/// Server → client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    Welcome { session: SessionId, snapshot: Arc<Snapshot> },
    Reply { request_id: u64, result: Result<Reply, EngineError> },
    Snapshot(Arc<Snapshot>),
    Resync { skipped: u64, snapshot: Arc<Snapshot> },
    Pong,
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    UnexpectedMessage(&'static str),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedMessage(what) => write!(f, "Unexpected message: {what}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<ProtocolError> for EngineError {
    fn from(e: ProtocolError) -> Self {
        EngineError::StoreUnavailable(e.to_string())
    }
}
