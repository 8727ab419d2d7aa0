//! # teamsplit-collab: Shared-state coordination for team matches
//!
//! Many sessions claim participants, open matches and join them against one
//! versioned document. Every write is a compare-and-swap mutation of that
//! document; every accepted version is pushed to every session in order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (replica)   │     Binary Proto    │ (sessions)  │
//! └─────────────┘                     └──────┬──────┘
//!                                            │ Operation
//!                                            ▼
//!                                     ┌─────────────┐
//!                                     │ Coordinator │
//!                                     └──────┬──────┘
//!        ┌──────────────┬────────────────────┼───────────────┐
//!        ▼              ▼                    ▼               ▼
//!  PresenceRegistry  MatchLifecycle     RosterAdmin   VerificationGate
//!        └──────────────┴─────────┬──────────┴───────────────┘
//!                                 ▼ mutate / read / subscribe
//!                       ┌───────────────────┐      ┌───────────────┐
//!                       │ SharedStateStore  │ ───► │ BroadcastGroup│
//!                       └─────────┬─────────┘      │ (fan-out)     │
//!                                 ▼                └───────────────┘
//!                          Backend (file / memory)
//! ```
//!
//! ## Modules
//!
//! - [`store`]: versioned document, optimistic mutate, ordered subscriptions
//! - [`storage`]: durable snapshot backends
//! - [`broadcast`]: snapshot fan-out with lag accounting
//! - [`presence`]: one session per participant
//! - [`lifecycle`]: create, join and assign matches
//! - [`admin`]: roster and room maintenance, JSON export/import
//! - [`verification`]: one-time codes gating presence claims
//! - [`coordinator`]: executes wire operations for a session
//! - [`protocol`]: bincode-encoded client/server messages
//! - [`server`] / [`client`]: WebSocket transport

pub mod admin;
pub mod broadcast;
pub mod client;
pub mod coordinator;
pub mod lifecycle;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod store;
pub mod verification;

// Re-exports for convenience
pub use admin::{NewParticipant, NewRoom, ParticipantPatch, RoomPatch, RosterAdmin};
pub use broadcast::{BroadcastGroup, BroadcastStats, SessionInfo};
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use coordinator::Coordinator;
pub use lifecycle::{JoinOutcome, MatchLifecycle};
pub use presence::{ClaimOutcome, PresenceRegistry};
pub use protocol::{ClientMessage, Operation, ProtocolError, Reply, ServerMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{Backend, MemoryBackend, SnapshotFile, StoreError};
pub use store::{SharedStateStore, Snapshot, StoreConfig, StoreStats, Subscription, Update};
pub use verification::{
    ChannelDispatcher, DispatchedCode, LogDispatcher, VerificationConfig, VerificationDispatcher,
    VerificationGate,
};
