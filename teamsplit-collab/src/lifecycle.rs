//! Match lifecycle: create → join → assign.
//!
//! ```text
//!            create_match          join (fills last slot)
//!   (none) ───────────────► waiting ──────────────────────► assigned
//!                             ▲  │ join                       (terminal)
//!                             └──┘
//! ```
//!
//! Every transition is one store mutation. The join that fills a match runs
//! the balancer inside the same mutation, so a full match is never
//! observable in `waiting`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use teamsplit_core::{
    balance, Balance, BalanceStats, EngineError, Match, MatchId, MatchStatus, Participant,
    ParticipantId, Room, RoomId, State,
};

use crate::store::{SharedStateStore, Snapshot};

/// What a successful join did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinOutcome {
    /// Participant was already in the match; nothing changed
    AlreadyJoined,
    /// Participant added; match still waiting
    Joined { open_slots: usize },
    /// Participant filled the match and teams were assigned
    Assigned(BalanceStats),
}

// ─── State transitions ─────────────────────────────────────────────

/// Open a new `waiting` match for `room`.
pub fn create_match_in(state: &mut State, room: &RoomId) -> Result<MatchId, EngineError> {
    let room = state
        .room(room)
        .cloned()
        .ok_or_else(|| EngineError::NoSuchRoom(room.clone()))?;
    if let Some(active) = state.active_match(&room.id) {
        return Err(EngineError::MatchAlreadyActive {
            room: room.id.clone(),
            active: active.id,
        });
    }
    let id = state.allocate_match_id();
    state.matches.push(Match::new(id, &room));
    Ok(id)
}

/// Add `participant` to `match_id`, assigning teams if that fills it.
pub fn join_in(
    state: &mut State,
    match_id: MatchId,
    participant: &ParticipantId,
) -> Result<JoinOutcome, EngineError> {
    let entry = state
        .find_match(match_id)
        .ok_or(EngineError::NoSuchMatch(match_id))?;
    if entry.has_joined(participant) {
        return Ok(JoinOutcome::AlreadyJoined);
    }
    if !entry.is_waiting() || entry.is_full() {
        return Err(EngineError::MatchFull(match_id));
    }
    if !state.is_online(participant) {
        return Err(EngineError::NotOnline(participant.clone()));
    }

    let entry = state
        .find_match_mut(match_id)
        .ok_or(EngineError::NoSuchMatch(match_id))?;
    entry.joined.push(participant.clone());
    if !entry.is_full() {
        return Ok(JoinOutcome::Joined {
            open_slots: entry.open_slots(),
        });
    }

    let result = assign_in(state, match_id)?;
    Ok(JoinOutcome::Assigned(result.stats))
}

/// Join the room's waiting match, opening one if there is none.
pub fn join_room_in(
    state: &mut State,
    room: &RoomId,
    participant: &ParticipantId,
) -> Result<(MatchId, JoinOutcome), EngineError> {
    let match_id = match state.active_match(room) {
        Some(active) => active.id,
        None => create_match_in(state, room)?,
    };
    let outcome = join_in(state, match_id, participant)?;
    Ok((match_id, outcome))
}

/// Split a full `waiting` match into teams.
///
/// Fails without touching the match unless it is still `waiting`.
pub fn assign_in(state: &mut State, match_id: MatchId) -> Result<Balance, EngineError> {
    let entry = state
        .find_match(match_id)
        .ok_or(EngineError::NoSuchMatch(match_id))?;
    if entry.status != MatchStatus::Waiting {
        return Err(EngineError::InvalidState(format!(
            "match {match_id} is already assigned"
        )));
    }
    let team_size = state
        .room(&entry.room_id)
        .map(|r| r.team_size)
        .ok_or_else(|| EngineError::NoSuchRoom(entry.room_id.clone()))?;

    let players: Vec<Participant> = entry
        .joined
        .iter()
        .filter_map(|id| state.participant(id).cloned())
        .collect();
    if players.len() < entry.required_players {
        return Err(EngineError::InsufficientPlayers {
            required: entry.required_players,
            available: players.len(),
        });
    }

    let result = balance(&players, team_size)?;

    let entry = state
        .find_match_mut(match_id)
        .ok_or(EngineError::NoSuchMatch(match_id))?;
    entry.assignments = result.assignments.clone();
    entry.status = MatchStatus::Assigned;
    Ok(result)
}

/// Remove `room` and every match in it. Returns the number of matches removed.
pub fn delete_room_in(state: &mut State, room: &RoomId) -> Result<usize, EngineError> {
    if state.room(room).is_none() {
        return Err(EngineError::NoSuchRoom(room.clone()));
    }
    state.rooms.retain(|r| &r.id != room);
    let before = state.matches.len();
    state.matches.retain(|m| &m.room_id != room);
    Ok(before - state.matches.len())
}

// ─── Store-backed surface ──────────────────────────────────────────

/// Lifecycle operations against the shared store.
#[derive(Clone)]
pub struct MatchLifecycle {
    store: Arc<SharedStateStore>,
}

impl MatchLifecycle {
    pub fn new(store: Arc<SharedStateStore>) -> Self {
        Self { store }
    }

    pub async fn create_match(&self, room: &RoomId) -> Result<Match, EngineError> {
        let (id, snapshot) = self.store.mutate(|state| create_match_in(state, room)).await?;
        log::info!("Match {id} opened in room {room}");
        Self::match_from(&snapshot, id)
    }

    pub async fn join(
        &self,
        match_id: MatchId,
        participant: &ParticipantId,
    ) -> Result<(Match, JoinOutcome), EngineError> {
        let (outcome, snapshot) = self
            .store
            .mutate(|state| join_in(state, match_id, participant))
            .await?;
        Self::log_join(match_id, participant, &outcome);
        Ok((Self::match_from(&snapshot, match_id)?, outcome))
    }

    pub async fn join_room(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(Match, JoinOutcome), EngineError> {
        let ((match_id, outcome), snapshot) = self
            .store
            .mutate(|state| join_room_in(state, room, participant))
            .await?;
        Self::log_join(match_id, participant, &outcome);
        Ok((Self::match_from(&snapshot, match_id)?, outcome))
    }

    pub async fn delete_room(&self, room: &RoomId) -> Result<usize, EngineError> {
        let (removed, _) = self.store.mutate(|state| delete_room_in(state, room)).await?;
        log::info!("Room {room} deleted with {removed} matches");
        Ok(removed)
    }

    pub async fn rooms(&self) -> Vec<Room> {
        self.store.read().await.state.rooms.clone()
    }

    pub async fn matches(&self) -> Vec<Match> {
        self.store.read().await.state.matches.clone()
    }

    pub async fn active_match(&self, room: &RoomId) -> Option<Match> {
        self.store.read().await.state.active_match(room).cloned()
    }

    pub async fn find_match(&self, match_id: MatchId) -> Option<Match> {
        self.store.read().await.state.find_match(match_id).cloned()
    }

    fn match_from(snapshot: &Snapshot, id: MatchId) -> Result<Match, EngineError> {
        snapshot
            .state
            .find_match(id)
            .cloned()
            .ok_or(EngineError::NoSuchMatch(id))
    }

    fn log_join(match_id: MatchId, participant: &ParticipantId, outcome: &JoinOutcome) {
        match outcome {
            JoinOutcome::AlreadyJoined => {
                log::debug!("{participant} already in match {match_id}");
            }
            JoinOutcome::Joined { open_slots } => {
                log::info!("{participant} joined match {match_id} ({open_slots} slots open)");
            }
            JoinOutcome::Assigned(stats) => {
                log::info!(
                    "Match {match_id} assigned: levels {} vs {} (diff {}), role spread {}",
                    stats.team_a_level,
                    stats.team_b_level,
                    stats.level_diff,
                    stats.role_imbalance()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::claim_in;
    use teamsplit_core::{Role, SessionId, Team};

    fn roster() -> State {
        let mut state = State::new();
        state.participants = vec![
            Participant::new("p1", "Ash", 80, Role::Pro),
            Participant::new("p2", "Brook", 70, Role::Mid),
            Participant::new("p3", "Cole", 60, Role::Rusher),
            Participant::new("p4", "Dana", 50, Role::Mid),
            Participant::new("p5", "Eli", 40, Role::Pro),
        ];
        state.rooms = vec![Room::new("r1", "Duo", 2), Room::new("r2", "Solo", 1)];
        for id in ["p1", "p2", "p3", "p4", "p5"] {
            claim_in(&mut state, &id.into(), SessionId::new()).unwrap();
        }
        state
    }

    async fn store_with(state: State) -> Arc<SharedStateStore> {
        let store = Arc::new(SharedStateStore::in_memory());
        store
            .mutate(|s| {
                *s = state.clone();
                Ok(())
            })
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_create_match_allocates_ids() {
        let mut state = roster();
        let r1 = RoomId::new("r1");
        let id = create_match_in(&mut state, &r1).unwrap();
        assert_eq!(id, MatchId(1));
        let m = state.find_match(id).unwrap();
        assert_eq!(m.required_players, 4);
        assert!(m.is_waiting());

        assert_eq!(
            create_match_in(&mut state, &r1),
            Err(EngineError::MatchAlreadyActive { room: r1, active: MatchId(1) })
        );
        assert_eq!(create_match_in(&mut state, &"r2".into()), Ok(MatchId(2)));
    }

    #[test]
    fn test_create_match_unknown_room() {
        let mut state = roster();
        assert!(matches!(
            create_match_in(&mut state, &"nope".into()),
            Err(EngineError::NoSuchRoom(_))
        ));
    }

    #[test]
    fn test_join_fills_and_assigns() {
        let mut state = roster();
        let id = create_match_in(&mut state, &"r1".into()).unwrap();

        for (i, p) in ["p1", "p2", "p3"].iter().enumerate() {
            let outcome = join_in(&mut state, id, &(*p).into()).unwrap();
            assert_eq!(outcome, JoinOutcome::Joined { open_slots: 3 - i });
        }
        let outcome = join_in(&mut state, id, &"p4".into()).unwrap();
        let stats = match outcome {
            JoinOutcome::Assigned(stats) => stats,
            other => panic!("expected assignment, got {other:?}"),
        };
        assert_eq!(stats.level_diff, 0);

        let m = state.find_match(id).unwrap();
        assert_eq!(m.status, MatchStatus::Assigned);
        assert_eq!(m.assignments.len(), 4);
        assert_eq!(m.team_of(&"p1".into()), Some(Team::One));
        assert_eq!(m.team_of(&"p4".into()), Some(Team::One));
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_double_join_is_noop() {
        let mut state = roster();
        let id = create_match_in(&mut state, &"r1".into()).unwrap();
        join_in(&mut state, id, &"p1".into()).unwrap();
        let before = state.clone();

        assert_eq!(join_in(&mut state, id, &"p1".into()), Ok(JoinOutcome::AlreadyJoined));
        assert_eq!(state, before);
    }

    #[test]
    fn test_join_full_match() {
        let mut state = roster();
        let id = create_match_in(&mut state, &"r2".into()).unwrap();
        join_in(&mut state, id, &"p1".into()).unwrap();
        join_in(&mut state, id, &"p2".into()).unwrap();
        assert_eq!(join_in(&mut state, id, &"p3".into()), Err(EngineError::MatchFull(id)));
        // Members of an assigned match still get the idempotent answer
        assert_eq!(join_in(&mut state, id, &"p2".into()), Ok(JoinOutcome::AlreadyJoined));
    }

    #[test]
    fn test_join_requires_claim() {
        let mut state = roster();
        state.presence.clear();
        let id = create_match_in(&mut state, &"r1".into()).unwrap();
        assert_eq!(
            join_in(&mut state, id, &"p1".into()),
            Err(EngineError::NotOnline("p1".into()))
        );
        assert_eq!(
            join_in(&mut state, MatchId(99), &"p1".into()),
            Err(EngineError::NoSuchMatch(MatchId(99)))
        );
    }

    #[test]
    fn test_join_room_creates_match_on_demand() {
        let mut state = roster();
        let r2 = RoomId::new("r2");
        let (first, _) = join_room_in(&mut state, &r2, &"p1".into()).unwrap();
        let (second, outcome) = join_room_in(&mut state, &r2, &"p2".into()).unwrap();
        assert_eq!(first, second);
        assert!(matches!(outcome, JoinOutcome::Assigned(_)));

        let (third, _) = join_room_in(&mut state, &r2, &"p3".into()).unwrap();
        assert_ne!(third, first);
        assert_eq!(state.active_match(&r2).unwrap().id, third);
    }

    #[test]
    fn test_assign_with_missing_participant_fails() {
        let mut state = roster();
        let id = create_match_in(&mut state, &"r2".into()).unwrap();
        state.find_match_mut(id).unwrap().joined.push("gone".into());
        assert_eq!(
            join_in(&mut state, id, &"p1".into()),
            Err(EngineError::InsufficientPlayers { required: 2, available: 1 })
        );
    }

    #[test]
    fn test_assign_guarded_on_waiting() {
        let mut state = roster();
        let (id, _) = join_room_in(&mut state, &"r2".into(), &"p1".into()).unwrap();
        join_in(&mut state, id, &"p2".into()).unwrap();
        assert!(matches!(assign_in(&mut state, id), Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn test_delete_room_cascades() {
        let mut state = roster();
        let r2 = RoomId::new("r2");
        join_room_in(&mut state, &r2, &"p1".into()).unwrap();
        join_room_in(&mut state, &r2, &"p2".into()).unwrap();
        join_room_in(&mut state, &r2, &"p3".into()).unwrap();
        create_match_in(&mut state, &"r1".into()).unwrap();

        assert_eq!(delete_room_in(&mut state, &r2), Ok(2));
        assert!(state.room(&r2).is_none());
        assert_eq!(state.matches.len(), 1);
        assert!(state.validate().is_ok());
        assert!(matches!(delete_room_in(&mut state, &r2), Err(EngineError::NoSuchRoom(_))));
    }

    #[tokio::test]
    async fn test_failed_assignment_persists_nothing() {
        let mut state = roster();
        let id = create_match_in(&mut state, &"r2".into()).unwrap();
        state.find_match_mut(id).unwrap().joined.push("gone".into());
        let store = store_with(state).await;
        let lifecycle = MatchLifecycle::new(store.clone());
        let before = store.read().await;

        let err = lifecycle.join(id, &"p1".into()).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientPlayers { .. }));
        let after = store.read().await;
        assert_eq!(after.version, before.version);
        assert_eq!(after.state.find_match(id).unwrap().joined.len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_surface() {
        let store = store_with(roster()).await;
        let lifecycle = MatchLifecycle::new(store.clone());
        let r1 = RoomId::new("r1");

        let created = lifecycle.create_match(&r1).await.unwrap();
        assert_eq!(lifecycle.active_match(&r1).await, Some(created.clone()));

        let (m, outcome) = lifecycle.join(created.id, &"p1".into()).await.unwrap();
        assert_eq!(m.joined, vec![ParticipantId::new("p1")]);
        assert_eq!(outcome, JoinOutcome::Joined { open_slots: 3 });

        let (m, _) = lifecycle.join_room(&r1, &"p2".into()).await.unwrap();
        assert_eq!(m.id, created.id);
        assert_eq!(lifecycle.matches().await.len(), 1);
        assert_eq!(lifecycle.find_match(created.id).await.unwrap().joined.len(), 2);

        assert_eq!(lifecycle.delete_room(&r1).await.unwrap(), 1);
        assert_eq!(lifecycle.rooms().await.len(), 1);
        assert!(lifecycle.find_match(created.id).await.is_none());
    }
}
