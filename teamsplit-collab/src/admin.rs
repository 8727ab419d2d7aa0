//! Roster and room administration, plus whole-document export/import.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use teamsplit_core::{
    EngineError, Participant, ParticipantId, Role, Room, RoomId, State, MAX_ROSTER,
};

use crate::store::{SharedStateStore, Snapshot};

/// Fields for a new roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewParticipant {
    pub name: String,
    pub level: u32,
    pub role: Role,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Partial update of a roster entry. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantPatch {
    pub name: Option<String>,
    pub level: Option<u32>,
    pub role: Option<Role>,
    /// `Some(None)` clears the address
    pub email: Option<Option<String>>,
    pub phone: Option<Option<String>>,
}

/// Fields for a new room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRoom {
    pub name: String,
    pub team_size: usize,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub team_size: Option<usize>,
    pub description: Option<Option<String>>,
}

fn clean_name(name: &str) -> Result<String, EngineError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidInput("name must not be empty".into()));
    }
    Ok(trimmed.to_string())
}

fn check_level(level: u32) -> Result<u32, EngineError> {
    if level == 0 {
        return Err(EngineError::InvalidInput("level must be at least 1".into()));
    }
    Ok(level)
}

fn check_team_size(team_size: usize) -> Result<usize, EngineError> {
    if team_size == 0 {
        return Err(EngineError::InvalidInput("team size must be at least 1".into()));
    }
    Ok(team_size)
}

fn clean_contact(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ─── State transitions ─────────────────────────────────────────────

pub fn add_participant_in(
    state: &mut State,
    id: ParticipantId,
    new: &NewParticipant,
) -> Result<ParticipantId, EngineError> {
    if state.participants.len() >= MAX_ROSTER {
        return Err(EngineError::RosterFull { limit: MAX_ROSTER });
    }
    if state.participant(&id).is_some() {
        return Err(EngineError::DuplicateId(id.to_string()));
    }
    let mut participant = Participant::new(
        id.clone(),
        clean_name(&new.name)?,
        check_level(new.level)?,
        new.role,
    );
    participant.email = clean_contact(new.email.clone());
    participant.phone = clean_contact(new.phone.clone());
    state.participants.push(participant);
    Ok(id)
}

/// Edit a participant's record.
///
/// Refused while the participant sits in a `waiting` match: the balancer
/// must see the roster as it was when they joined.
pub fn update_participant_in(
    state: &mut State,
    id: &ParticipantId,
    patch: &ParticipantPatch,
) -> Result<(), EngineError> {
    if let Some(match_id) = state.waiting_match_of(id) {
        return Err(EngineError::ParticipantInActiveMatch {
            participant: id.clone(),
            match_id,
        });
    }
    let participant = state
        .participant_mut(id)
        .ok_or_else(|| EngineError::NoSuchParticipant(id.clone()))?;
    if let Some(name) = &patch.name {
        participant.name = clean_name(name)?;
    }
    if let Some(level) = patch.level {
        participant.level = check_level(level)?;
    }
    if let Some(role) = patch.role {
        participant.role = role;
    }
    if let Some(email) = &patch.email {
        participant.email = clean_contact(email.clone());
    }
    if let Some(phone) = &patch.phone {
        participant.phone = clean_contact(phone.clone());
    }
    Ok(())
}

/// Remove a participant and any claim on it.
///
/// Refused while the participant sits in a `waiting` match.
pub fn delete_participant_in(state: &mut State, id: &ParticipantId) -> Result<(), EngineError> {
    if state.participant(id).is_none() {
        return Err(EngineError::NoSuchParticipant(id.clone()));
    }
    if let Some(match_id) = state.waiting_match_of(id) {
        return Err(EngineError::ParticipantInActiveMatch {
            participant: id.clone(),
            match_id,
        });
    }
    state.participants.retain(|p| &p.id != id);
    state.presence.remove(id);
    Ok(())
}

pub fn add_room_in(state: &mut State, id: RoomId, new: &NewRoom) -> Result<RoomId, EngineError> {
    if state.room(&id).is_some() {
        return Err(EngineError::DuplicateId(id.to_string()));
    }
    let mut room = Room::new(id.clone(), clean_name(&new.name)?, check_team_size(new.team_size)?);
    room.description = clean_contact(new.description.clone());
    state.rooms.push(room);
    Ok(id)
}

/// Team size is fixed while the room has a `waiting` match.
pub fn update_room_in(state: &mut State, id: &RoomId, patch: &RoomPatch) -> Result<(), EngineError> {
    let locked = state.active_match(id).is_some();
    let room = state
        .room_mut(id)
        .ok_or_else(|| EngineError::NoSuchRoom(id.clone()))?;
    if let Some(team_size) = patch.team_size {
        let team_size = check_team_size(team_size)?;
        if team_size != room.team_size && locked {
            return Err(EngineError::TeamSizeLocked(id.clone()));
        }
        room.team_size = team_size;
    }
    if let Some(name) = &patch.name {
        room.name = clean_name(name)?;
    }
    if let Some(description) = &patch.description {
        room.description = clean_contact(description.clone());
    }
    Ok(())
}

/// Store opaque credential hashes. `None` clears one.
pub fn set_credential_hashes_in(state: &mut State, shared: Option<String>, admin: Option<String>) {
    state.site.shared_password_hash = shared;
    state.site.admin_password_hash = admin;
}

// ─── Store-backed surface ──────────────────────────────────────────

/// Administrative operations against the shared store.
///
/// Authentication against the credential hashes is the caller's job.
#[derive(Clone)]
pub struct RosterAdmin {
    store: Arc<SharedStateStore>,
}

impl RosterAdmin {
    pub fn new(store: Arc<SharedStateStore>) -> Self {
        Self { store }
    }

    pub async fn add_participant(&self, new: &NewParticipant) -> Result<ParticipantId, EngineError> {
        let id = ParticipantId::generate();
        let (id, _) = self
            .store
            .mutate(|state| add_participant_in(state, id.clone(), new))
            .await?;
        log::info!("Participant {id} ({}) added", new.name.trim());
        Ok(id)
    }

    pub async fn update_participant(
        &self,
        id: &ParticipantId,
        patch: &ParticipantPatch,
    ) -> Result<Arc<Snapshot>, EngineError> {
        let (_, snapshot) = self
            .store
            .mutate(|state| update_participant_in(state, id, patch))
            .await?;
        log::debug!("Participant {id} updated");
        Ok(snapshot)
    }

    pub async fn delete_participant(&self, id: &ParticipantId) -> Result<Arc<Snapshot>, EngineError> {
        let (_, snapshot) = self
            .store
            .mutate(|state| delete_participant_in(state, id))
            .await?;
        log::info!("Participant {id} deleted");
        Ok(snapshot)
    }

    pub async fn add_room(&self, new: &NewRoom) -> Result<RoomId, EngineError> {
        let id = RoomId::generate();
        let (id, _) = self
            .store
            .mutate(|state| add_room_in(state, id.clone(), new))
            .await?;
        log::info!("Room {id} ({}, {}v{}) added", new.name.trim(), new.team_size, new.team_size);
        Ok(id)
    }

    pub async fn update_room(&self, id: &RoomId, patch: &RoomPatch) -> Result<Arc<Snapshot>, EngineError> {
        let (_, snapshot) = self
            .store
            .mutate(|state| update_room_in(state, id, patch))
            .await?;
        log::debug!("Room {id} updated");
        Ok(snapshot)
    }

    pub async fn set_credential_hashes(
        &self,
        shared: Option<String>,
        admin: Option<String>,
    ) -> Result<Arc<Snapshot>, EngineError> {
        let (_, snapshot) = self
            .store
            .mutate(|state| {
                set_credential_hashes_in(state, shared.clone(), admin.clone());
                Ok(())
            })
            .await?;
        Ok(snapshot)
    }

    /// Pretty JSON of the current document.
    pub async fn export_state(&self) -> Result<String, EngineError> {
        self.store.read().await.state.to_json()
    }

    /// Replace the whole document with `json`.
    ///
    /// Claims in the imported document are dropped; they belong to sessions
    /// of whichever server wrote the export.
    pub async fn import_state(&self, json: &str) -> Result<Arc<Snapshot>, EngineError> {
        let mut imported = State::from_json(json)?;
        imported.presence.clear();
        let (_, snapshot) = self
            .store
            .mutate(|state| {
                *state = imported.clone();
                Ok(())
            })
            .await?;
        log::info!(
            "Imported state: {} participants, {} rooms, {} matches",
            snapshot.state.participants.len(),
            snapshot.state.rooms.len(),
            snapshot.state.matches.len()
        );
        Ok(snapshot)
    }
}
