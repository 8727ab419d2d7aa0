//! # teamsplit-core: Shared document model and team balancing
//!
//! Everything here is synchronous and free of I/O. The collaboration layer
//! (`teamsplit-collab`) wraps [`State`] in a versioned store and drives the
//! lifecycle; this crate only knows what a valid document looks like and how
//! to split a full match into two teams.
//!
//! ```text
//! ┌──────────────────────────── State ────────────────────────────┐
//! │ site      { nextMatchId, credential hashes }                  │
//! │ players   [ Participant { id, gameName, level, role, … } ]    │
//! │ rooms     [ Room { id, name, sizePerTeam } ]                  │
//! │ matches   [ Match { id, roomId, playersJoined, assignments } ]│
//! │ presence  { participant → session }                           │
//! └───────────────────────────────────────────────────────────────┘
//!                              │ full match
//!                              ▼
//!                     balance::balance()
//!                  greedy seed → local search
//! ```
//!
//! ## Modules
//!
//! - [`model`]: document types, invariant checks, JSON export/import
//! - [`balance`]: two-way partition by level, then role
//! - [`error`]: engine error taxonomy shared by every crate

pub mod balance;
pub mod error;
pub mod model;

pub use balance::{balance, greedy_seed, Balance, BalanceError, BalanceStats, RoleCounts};
pub use error::{EngineError, ErrorKind};
pub use model::{
    ContactChannel, Match, MatchId, MatchStatus, Participant, ParticipantId, Role, Room, RoomId,
    SessionId, SiteSettings, State, Team, MAX_ROSTER,
};
