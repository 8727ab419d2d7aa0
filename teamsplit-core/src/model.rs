//! Document model: roster, rooms, matches and presence claims.
//!
//! [`State`] is the whole shared document. It is a plain value: cloning it
//! is how the store stages a mutation, and [`State::validate`] is the single
//! place the document invariants are spelled out.
//!
//! JSON field names follow the exported snapshot format (`players`,
//! `gameName`, `sizePerTeam`, `playersJoined`, `nextMatchId`), so snapshots
//! written by older deployments import unchanged.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::error::EngineError;

/// Maximum roster size.
pub const MAX_ROSTER: usize = 12;

// ───────────────────────────────────────────────────────────────────
// Identifiers
// ───────────────────────────────────────────────────────────────────

/// Participant identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id (`p-<uuid>`).
    pub fn generate() -> Self {
        Self(format!("p-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Room identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id (`r-<uuid>`).
    pub fn generate() -> Self {
        Self(format!("r-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Match identity, allocated from `site.nextMatchId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(pub u64);

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque per-client session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Roster
// ───────────────────────────────────────────────────────────────────

/// Playing role. Fixed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Rusher,
    Mid,
    Pro,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Rusher, Role::Mid, Role::Pro];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Rusher => "rusher",
            Role::Mid => "mid",
            Role::Pro => "pro",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a verification code can be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactChannel {
    Email(String),
    Phone(String),
}

impl fmt::Display for ContactChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContactChannel::Email(addr) => write!(f, "email:{addr}"),
            ContactChannel::Phone(number) => write!(f, "phone:{number}"),
        }
    }
}

/// A roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    #[serde(rename = "gameName")]
    pub name: String,
    /// Always ≥ 1
    pub level: u32,
    pub role: Role,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, name: impl Into<String>, level: u32, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            level,
            role,
            email: None,
            phone: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Every non-empty channel a code could be sent to.
    pub fn contact_channels(&self) -> Vec<ContactChannel> {
        let mut channels = Vec::new();
        if let Some(email) = self.email.as_ref().filter(|e| !e.trim().is_empty()) {
            channels.push(ContactChannel::Email(email.clone()));
        }
        if let Some(phone) = self.phone.as_ref().filter(|p| !p.trim().is_empty()) {
            channels.push(ContactChannel::Phone(phone.clone()));
        }
        channels
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ───────────────────────────────────────────────────────────────────
// Rooms and matches
// ───────────────────────────────────────────────────────────────────

/// A room: a team size and a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    /// Players per team (N ≥ 1)
    #[serde(rename = "sizePerTeam")]
    pub team_size: usize,
    #[serde(default)]
    pub description: Option<String>,
}

impl Room {
    pub fn new(id: impl Into<RoomId>, name: impl Into<String>, team_size: usize) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            team_size,
            description: None,
        }
    }

    /// `2N`
    pub fn required_players(&self) -> usize {
        self.team_size * 2
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Team number in an assignment map. Serialized as `1` / `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Team {
    One,
    Two,
}

impl From<Team> for u8 {
    fn from(team: Team) -> u8 {
        match team {
            Team::One => 1,
            Team::Two => 2,
        }
    }
}

impl TryFrom<u8> for Team {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(Team::One),
            2 => Ok(Team::Two),
            other => Err(format!("team number must be 1 or 2, got {other}")),
        }
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Team {}", u8::from(*self))
    }
}

/// Match lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Waiting,
    Assigned,
}

/// One join → assign cycle of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub id: MatchId,
    pub room_id: RoomId,
    pub required_players: usize,
    /// Join order, no duplicates
    #[serde(rename = "playersJoined")]
    pub joined: Vec<ParticipantId>,
    /// Empty until assigned
    #[serde(default)]
    pub assignments: BTreeMap<ParticipantId, Team>,
    pub status: MatchStatus,
}

impl Match {
    pub fn new(id: MatchId, room: &Room) -> Self {
        Self {
            id,
            room_id: room.id.clone(),
            required_players: room.required_players(),
            joined: Vec::new(),
            assignments: BTreeMap::new(),
            status: MatchStatus::Waiting,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.status == MatchStatus::Waiting
    }

    pub fn is_full(&self) -> bool {
        self.joined.len() >= self.required_players
    }

    pub fn has_joined(&self, participant: &ParticipantId) -> bool {
        self.joined.contains(participant)
    }

    pub fn open_slots(&self) -> usize {
        self.required_players.saturating_sub(self.joined.len())
    }

    pub fn team_of(&self, participant: &ParticipantId) -> Option<Team> {
        self.assignments.get(participant).copied()
    }

    /// Members of `team`, in join order.
    pub fn members(&self, team: Team) -> Vec<&ParticipantId> {
        self.joined
            .iter()
            .filter(|id| self.team_of(id) == Some(team))
            .collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// Whole document
// ───────────────────────────────────────────────────────────────────

/// Site-wide settings.
///
/// The credential hashes are opaque to the engine; verification happens in
/// an outer layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteSettings {
    #[serde(default)]
    pub shared_password_hash: Option<String>,
    #[serde(default)]
    pub admin_password_hash: Option<String>,
    pub next_match_id: u64,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            shared_password_hash: None,
            admin_password_hash: None,
            next_match_id: 1,
        }
    }
}

/// The shared document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(default)]
    pub site: SiteSettings,
    #[serde(rename = "players", default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub rooms: Vec<Room>,
    #[serde(default)]
    pub matches: Vec<Match>,
    /// Claimed participant → claiming session
    #[serde(default)]
    pub presence: BTreeMap<ParticipantId, SessionId>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id == id)
    }

    pub fn participant_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.id == id)
    }

    pub fn room(&self, id: &RoomId) -> Option<&Room> {
        self.rooms.iter().find(|r| &r.id == id)
    }

    pub fn room_mut(&mut self, id: &RoomId) -> Option<&mut Room> {
        self.rooms.iter_mut().find(|r| &r.id == id)
    }

    pub fn find_match(&self, id: MatchId) -> Option<&Match> {
        self.matches.iter().find(|m| m.id == id)
    }

    pub fn find_match_mut(&mut self, id: MatchId) -> Option<&mut Match> {
        self.matches.iter_mut().find(|m| m.id == id)
    }

    /// The room's `waiting` match, if any.
    pub fn active_match(&self, room: &RoomId) -> Option<&Match> {
        self.matches
            .iter()
            .find(|m| &m.room_id == room && m.is_waiting())
    }

    /// The `waiting` match `participant` has joined, if any.
    pub fn waiting_match_of(&self, participant: &ParticipantId) -> Option<MatchId> {
        self.matches
            .iter()
            .find(|m| m.is_waiting() && m.has_joined(participant))
            .map(|m| m.id)
    }

    pub fn claimant(&self, participant: &ParticipantId) -> Option<SessionId> {
        self.presence.get(participant).copied()
    }

    pub fn is_online(&self, participant: &ParticipantId) -> bool {
        self.presence.contains_key(participant)
    }

    /// The participant `session` currently holds, if any.
    pub fn claim_of(&self, session: SessionId) -> Option<&ParticipantId> {
        self.presence
            .iter()
            .find(|(_, holder)| **holder == session)
            .map(|(id, _)| id)
    }

    /// Take the next match id.
    pub fn allocate_match_id(&mut self) -> MatchId {
        let id = MatchId(self.site.next_match_id);
        self.site.next_match_id += 1;
        id
    }

    /// Check every document invariant.
    pub fn validate(&self) -> Result<(), EngineError> {
        fn invalid(msg: String) -> Result<(), EngineError> {
            Err(EngineError::InvalidState(msg))
        }

        if self.participants.len() > MAX_ROSTER {
            return invalid(format!(
                "roster has {} participants, maximum is {MAX_ROSTER}",
                self.participants.len()
            ));
        }

        let mut participant_ids = BTreeSet::new();
        for p in &self.participants {
            if !participant_ids.insert(&p.id) {
                return invalid(format!("duplicate participant id {}", p.id));
            }
            if p.level == 0 {
                return invalid(format!("participant {} has level 0", p.id));
            }
        }

        let mut room_ids = BTreeSet::new();
        for r in &self.rooms {
            if !room_ids.insert(&r.id) {
                return invalid(format!("duplicate room id {}", r.id));
            }
            if r.team_size == 0 {
                return invalid(format!("room {} has team size 0", r.id));
            }
        }

        let mut match_ids = BTreeSet::new();
        let mut waiting_rooms = BTreeSet::new();
        for m in &self.matches {
            if !match_ids.insert(m.id) {
                return invalid(format!("duplicate match id {}", m.id));
            }
            if m.id.0 >= self.site.next_match_id {
                return invalid(format!(
                    "match id {} is not below nextMatchId {}",
                    m.id, self.site.next_match_id
                ));
            }
            if !room_ids.contains(&m.room_id) {
                return invalid(format!("match {} refers to unknown room {}", m.id, m.room_id));
            }
            if m.required_players == 0 {
                return invalid(format!("match {} requires no players", m.id));
            }
            if m.joined.len() > m.required_players {
                return invalid(format!(
                    "match {} has {} joined, only {} allowed",
                    m.id,
                    m.joined.len(),
                    m.required_players
                ));
            }
            let joined: BTreeSet<&ParticipantId> = m.joined.iter().collect();
            if joined.len() != m.joined.len() {
                return invalid(format!("match {} lists a participant twice", m.id));
            }
            match m.status {
                MatchStatus::Waiting => {
                    if !m.assignments.is_empty() {
                        return invalid(format!("waiting match {} has assignments", m.id));
                    }
                    // A full match is assigned in the same commit that fills it
                    if m.joined.len() >= m.required_players {
                        return invalid(format!("waiting match {} is full but unassigned", m.id));
                    }
                    if !waiting_rooms.insert(&m.room_id) {
                        return invalid(format!("room {} has two waiting matches", m.room_id));
                    }
                }
                MatchStatus::Assigned => {
                    let assigned: BTreeSet<&ParticipantId> = m.assignments.keys().collect();
                    if assigned.is_empty() || assigned != joined {
                        return invalid(format!(
                            "assigned match {} does not assign exactly its joined players",
                            m.id
                        ));
                    }
                }
            }
        }

        let mut sessions = BTreeSet::new();
        for (participant, session) in &self.presence {
            if !participant_ids.contains(participant) {
                return invalid(format!("presence claim on unknown participant {participant}"));
            }
            if !sessions.insert(session) {
                return invalid(format!("session {session} holds more than one claim"));
            }
        }

        Ok(())
    }

    /// Pretty JSON snapshot.
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::InvalidState(e.to_string()))
    }

    /// Parse and validate a JSON snapshot.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let state: State = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidInput(format!("malformed snapshot: {e}")))?;
        state.validate()?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> State {
        let mut state = State::new();
        state.participants = vec![
            Participant::new("p1", "Ash", 80, Role::Pro).with_email("ash@example.com"),
            Participant::new("p2", "Brook", 70, Role::Mid),
            Participant::new("p3", "Cole", 60, Role::Rusher).with_phone("+100"),
            Participant::new("p4", "Dana", 50, Role::Mid),
        ];
        state.rooms = vec![Room::new("r1", "Arena", 2)];
        let id = state.allocate_match_id();
        let room = state.rooms[0].clone();
        let mut m = Match::new(id, &room);
        m.joined = vec!["p1".into(), "p2".into()];
        state.matches.push(m);
        state.presence.insert("p1".into(), SessionId::new());
        state
    }

    #[test]
    fn test_sample_state_is_valid() {
        assert!(sample_state().validate().is_ok());
        assert!(State::new().validate().is_ok());
    }

    #[test]
    fn test_allocate_match_id_monotonic() {
        let mut state = State::new();
        assert_eq!(state.allocate_match_id(), MatchId(1));
        assert_eq!(state.allocate_match_id(), MatchId(2));
        assert_eq!(state.site.next_match_id, 3);
    }

    #[test]
    fn test_active_match_lookup() {
        let state = sample_state();
        let active = state.active_match(&RoomId::new("r1")).unwrap();
        assert_eq!(active.id, MatchId(1));
        assert_eq!(active.open_slots(), 2);
        assert_eq!(state.waiting_match_of(&"p2".into()), Some(MatchId(1)));
        assert_eq!(state.waiting_match_of(&"p3".into()), None);
    }

    #[test]
    fn test_validate_rejects_overfull_match() {
        let mut state = sample_state();
        state.matches[0].joined = vec!["p1".into(), "p2".into(), "p3".into(), "p4".into(), "p5".into()];
        assert!(matches!(state.validate(), Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn test_validate_rejects_full_waiting_match() {
        let mut state = sample_state();
        state.matches[0].joined = vec!["p1".into(), "p2".into(), "p3".into(), "p4".into()];
        assert!(matches!(state.validate(), Err(EngineError::InvalidState(_))));

        // Nor can such a document be imported
        let json = state.to_json().unwrap();
        assert!(matches!(State::from_json(&json), Err(EngineError::InvalidState(_))));

        state.matches[0].joined.pop();
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_join() {
        let mut state = sample_state();
        state.matches[0].joined = vec!["p1".into(), "p1".into()];
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_assignment_mismatch() {
        let mut state = sample_state();
        state.matches[0].status = MatchStatus::Assigned;
        state.matches[0].assignments.insert("p1".into(), Team::One);
        // p2 joined but is not assigned
        assert!(state.validate().is_err());

        state.matches[0].assignments.insert("p2".into(), Team::Two);
        assert!(state.validate().is_ok());

        // waiting matches must not carry assignments
        state.matches[0].status = MatchStatus::Waiting;
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_two_waiting_matches() {
        let mut state = sample_state();
        let room = state.rooms[0].clone();
        let id = state.allocate_match_id();
        state.matches.push(Match::new(id, &room));
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_session_with_two_claims() {
        let mut state = sample_state();
        let session = state.claimant(&"p1".into()).unwrap();
        state.presence.insert("p2".into(), session);
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_references() {
        let mut state = sample_state();
        state.matches[0].room_id = RoomId::new("missing");
        assert!(state.validate().is_err());

        let mut state = sample_state();
        state.presence.insert("ghost".into(), SessionId::new());
        assert!(state.validate().is_err());

        let mut state = sample_state();
        state.site.next_match_id = 1;
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_roster_overflow() {
        let mut state = State::new();
        for i in 0..=MAX_ROSTER {
            state
                .participants
                .push(Participant::new(format!("p{i}"), format!("P{i}"), 10, Role::Mid));
        }
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_reproduces_state() {
        let state = sample_state();
        let json = state.to_json().unwrap();
        let restored = State::from_json(&json).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_import_legacy_snapshot_format() {
        let json = r#"{
            "site": { "sharedPasswordHash": "abc", "adminPasswordHash": null, "nextMatchId": 3 },
            "players": [
                { "id": "p1700000000001", "gameName": "Ash", "level": 42, "role": "pro",
                  "email": "ash@example.com", "profileImageBase64": null },
                { "id": "p1700000000002", "gameName": "Brook", "level": 17, "role": "rusher" }
            ],
            "rooms": [ { "id": "r1700000000000", "name": "Arena", "sizePerTeam": 1, "description": "" } ],
            "matches": [
                { "id": 2, "roomId": "r1700000000000", "requiredPlayers": 2,
                  "playersJoined": ["p1700000000001", "p1700000000002"],
                  "assignments": { "p1700000000001": 1, "p1700000000002": 2 },
                  "status": "assigned" }
            ],
            "onlinePlayers": ["p1700000000001"]
        }"#;

        let state = State::from_json(json).unwrap();
        assert_eq!(state.participants.len(), 2);
        assert_eq!(state.site.next_match_id, 3);
        let m = state.find_match(MatchId(2)).unwrap();
        assert_eq!(m.team_of(&"p1700000000002".into()), Some(Team::Two));
        assert_eq!(m.members(Team::One), vec![&ParticipantId::new("p1700000000001")]);
    }

    #[test]
    fn test_import_rejects_bad_team_number() {
        let json = r#"{
            "site": { "nextMatchId": 2 },
            "players": [ { "id": "p1", "gameName": "Ash", "level": 1, "role": "mid" } ],
            "rooms": [ { "id": "r1", "name": "Duel", "sizePerTeam": 1 } ],
            "matches": [ { "id": 1, "roomId": "r1", "requiredPlayers": 2,
                           "playersJoined": ["p1"], "assignments": { "p1": 3 }, "status": "assigned" } ]
        }"#;
        assert!(matches!(State::from_json(json), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn test_contact_channels_skip_blank() {
        let p = Participant::new("p1", "Ash", 1, Role::Pro)
            .with_email("  ")
            .with_phone("+4912345");
        assert_eq!(p.contact_channels(), vec![ContactChannel::Phone("+4912345".into())]);
    }

    #[test]
    fn test_claim_of_session() {
        let state = sample_state();
        let session = state.claimant(&"p1".into()).unwrap();
        assert_eq!(state.claim_of(session), Some(&ParticipantId::new("p1")));
        assert_eq!(state.claim_of(SessionId::new()), None);
    }
}
