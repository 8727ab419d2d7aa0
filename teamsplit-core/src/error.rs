//! Engine error taxonomy.
//!
//! Every fallible engine call returns [`EngineError`]. Callers that only care
//! about the broad class (retry, show "not found", …) match on
//! [`EngineError::kind`].

use serde::{Deserialize, Serialize};

use crate::model::{MatchId, ParticipantId, RoomId};

/// Broad classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    CapacityExceeded,
    Conflict,
    PreconditionFailed,
    StoreUnavailable,
}

/// Errors returned by engine operations.
///
/// Serializable so the server can hand them to remote clients unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineError {
    /// Unknown room id
    NoSuchRoom(RoomId),
    /// Unknown match id
    NoSuchMatch(MatchId),
    /// Unknown participant id
    NoSuchParticipant(ParticipantId),

    /// Match already holds `requiredPlayers` participants
    MatchFull(MatchId),
    /// Roster already holds the maximum number of participants
    RosterFull { limit: usize },

    /// Participant is claimed by another session
    AlreadyClaimed(ParticipantId),
    /// Room already has a `waiting` match
    MatchAlreadyActive { room: RoomId, active: MatchId },
    /// Participant sits in a `waiting` match and cannot be removed
    ParticipantInActiveMatch { participant: ParticipantId, match_id: MatchId },
    /// Team size cannot change while a match is waiting
    TeamSizeLocked(RoomId),
    /// An id is already in use
    DuplicateId(String),
    /// Optimistic write lost the race too many times
    WriteContention { attempts: u32 },

    /// Participant is not claimed by any session
    NotOnline(ParticipantId),
    /// Fewer real participants than the match requires
    InsufficientPlayers { required: usize, available: usize },
    /// Malformed argument (level 0, team size 0, …)
    InvalidInput(String),
    /// A document that breaks an invariant
    InvalidState(String),
    /// Raw claims are disabled; a verification code is required
    VerificationRequired,
    /// Participant has no contact channel to send a code to
    NoContactChannel(ParticipantId),
    /// Verification code does not match
    InvalidCode,
    /// Verification code is past its expiry
    CodeExpired,

    /// Backing store or transport failed; nothing was applied
    StoreUnavailable(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NoSuchRoom(_)
            | EngineError::NoSuchMatch(_)
            | EngineError::NoSuchParticipant(_) => ErrorKind::NotFound,

            EngineError::MatchFull(_) | EngineError::RosterFull { .. } => {
                ErrorKind::CapacityExceeded
            }

            EngineError::AlreadyClaimed(_)
            | EngineError::MatchAlreadyActive { .. }
            | EngineError::ParticipantInActiveMatch { .. }
            | EngineError::TeamSizeLocked(_)
            | EngineError::DuplicateId(_)
            | EngineError::WriteContention { .. } => ErrorKind::Conflict,

            EngineError::NotOnline(_)
            | EngineError::InsufficientPlayers { .. }
            | EngineError::InvalidInput(_)
            | EngineError::InvalidState(_)
            | EngineError::VerificationRequired
            | EngineError::NoContactChannel(_)
            | EngineError::InvalidCode
            | EngineError::CodeExpired => ErrorKind::PreconditionFailed,

            EngineError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NoSuchRoom(id) => write!(f, "Room not found: {id}"),
            EngineError::NoSuchMatch(id) => write!(f, "Match not found: {id}"),
            EngineError::NoSuchParticipant(id) => write!(f, "Participant not found: {id}"),
            EngineError::MatchFull(id) => write!(f, "Match {id} is full"),
            EngineError::RosterFull { limit } => {
                write!(f, "Roster is full (maximum {limit} participants)")
            }
            EngineError::AlreadyClaimed(id) => {
                write!(f, "Participant {id} is already claimed by another session")
            }
            EngineError::MatchAlreadyActive { room, active } => {
                write!(f, "Room {room} already has waiting match {active}")
            }
            EngineError::ParticipantInActiveMatch { participant, match_id } => {
                write!(f, "Participant {participant} is in waiting match {match_id}")
            }
            EngineError::TeamSizeLocked(id) => {
                write!(f, "Team size of room {id} is locked by a waiting match")
            }
            EngineError::DuplicateId(id) => write!(f, "Duplicate id: {id}"),
            EngineError::WriteContention { attempts } => {
                write!(f, "Write conflict persisted after {attempts} attempts")
            }
            EngineError::NotOnline(id) => write!(f, "Participant {id} is not online"),
            EngineError::InsufficientPlayers { required, available } => {
                write!(f, "Insufficient players: {available} of {required} required")
            }
            EngineError::InvalidInput(e) => write!(f, "Invalid input: {e}"),
            EngineError::InvalidState(e) => write!(f, "Invalid state: {e}"),
            EngineError::VerificationRequired => write!(f, "Verification code required"),
            EngineError::NoContactChannel(id) => {
                write!(f, "Participant {id} has no contact channel")
            }
            EngineError::InvalidCode => write!(f, "Invalid verification code"),
            EngineError::CodeExpired => write!(f, "Verification code expired"),
            EngineError::StoreUnavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(EngineError::NoSuchMatch(MatchId(3)).kind(), ErrorKind::NotFound);
        assert_eq!(EngineError::MatchFull(MatchId(3)).kind(), ErrorKind::CapacityExceeded);
        assert_eq!(EngineError::RosterFull { limit: 12 }.kind(), ErrorKind::CapacityExceeded);
        assert_eq!(
            EngineError::AlreadyClaimed(ParticipantId::new("p1")).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(EngineError::WriteContention { attempts: 8 }.kind(), ErrorKind::Conflict);
        assert_eq!(
            EngineError::NotOnline(ParticipantId::new("p1")).kind(),
            ErrorKind::PreconditionFailed
        );
        assert_eq!(
            EngineError::StoreUnavailable("down".into()).kind(),
            ErrorKind::StoreUnavailable
        );
    }

    #[test]
    fn test_display_mentions_ids() {
        let err = EngineError::MatchAlreadyActive {
            room: RoomId::new("r1"),
            active: MatchId(4),
        };
        assert_eq!(err.to_string(), "Room r1 already has waiting match 4");

        let err = EngineError::InsufficientPlayers { required: 4, available: 3 };
        assert_eq!(err.to_string(), "Insufficient players: 3 of 4 required");
    }
}
