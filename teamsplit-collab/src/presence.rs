//! Exclusive participant claims.
//!
//! A session claims one roster participant at a time; no participant is
//! ever held by two sessions. Claims live in the shared document
//! (`State::presence`), so every change reaches subscribers like any other
//! mutation.

use std::sync::Arc;

use teamsplit_core::{EngineError, ParticipantId, SessionId, State};

use crate::store::{SharedStateStore, Snapshot};

/// Outcome of a claim attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// New claim recorded
    Claimed,
    /// Session already held this participant
    AlreadyHeld,
}

/// Record `session` as the holder of `participant`.
///
/// Any other participant the session held is released in the same step.
pub fn claim_in(
    state: &mut State,
    participant: &ParticipantId,
    session: SessionId,
) -> Result<ClaimOutcome, EngineError> {
    if state.participant(participant).is_none() {
        return Err(EngineError::NoSuchParticipant(participant.clone()));
    }
    match state.claimant(participant) {
        Some(holder) if holder == session => return Ok(ClaimOutcome::AlreadyHeld),
        Some(_) => return Err(EngineError::AlreadyClaimed(participant.clone())),
        None => {}
    }
    state.presence.retain(|_, holder| *holder != session);
    state.presence.insert(participant.clone(), session);
    Ok(ClaimOutcome::Claimed)
}

/// Drop any claim on `participant`. Returns whether one existed.
pub fn release_in(state: &mut State, participant: &ParticipantId) -> bool {
    state.presence.remove(participant).is_some()
}

/// Drop whatever `session` holds.
pub fn release_session_in(state: &mut State, session: SessionId) -> Option<ParticipantId> {
    let held = state.claim_of(session).cloned()?;
    state.presence.remove(&held);
    Some(held)
}

/// Claim registry backed by the shared store.
#[derive(Clone)]
pub struct PresenceRegistry {
    store: Arc<SharedStateStore>,
}

impl PresenceRegistry {
    pub fn new(store: Arc<SharedStateStore>) -> Self {
        Self { store }
    }

    pub async fn claim(
        &self,
        participant: &ParticipantId,
        session: SessionId,
    ) -> Result<(ClaimOutcome, Arc<Snapshot>), EngineError> {
        let result = self
            .store
            .mutate(|state| claim_in(state, participant, session))
            .await?;
        if result.0 == ClaimOutcome::Claimed {
            log::info!("Session {session} claimed participant {participant}");
        }
        Ok(result)
    }

    /// Idempotent.
    pub async fn release(&self, participant: &ParticipantId) -> Result<Arc<Snapshot>, EngineError> {
        let (released, snapshot) = self
            .store
            .mutate(|state| Ok(release_in(state, participant)))
            .await?;
        if released {
            log::info!("Released participant {participant}");
        }
        Ok(snapshot)
    }

    /// Idempotent. Used when a connection goes away.
    pub async fn release_session(
        &self,
        session: SessionId,
    ) -> Result<(Option<ParticipantId>, Arc<Snapshot>), EngineError> {
        let result = self
            .store
            .mutate(|state| Ok(release_session_in(state, session)))
            .await?;
        if let Some(ref participant) = result.0 {
            log::info!("Session {session} released participant {participant}");
        }
        Ok(result)
    }

    pub async fn is_online(&self, participant: &ParticipantId) -> bool {
        self.store.read().await.state.is_online(participant)
    }

    /// All claimed participants.
    pub async fn online(&self) -> Vec<ParticipantId> {
        self.store.read().await.state.presence.keys().cloned().collect()
    }
}
