//! Two-team partition of a full match.
//!
//! ```text
//!   joined (2N) ──sort by level desc──▶ greedy seed ──swap search──▶ Balance
//!                  (stable)              lower sum     ≤ 20 scans
//!                                        takes next    first improvement
//! ```
//!
//! The objective is lexicographic: level-sum difference first, role spread
//! second. The search is deterministic for a given input order.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::{Participant, ParticipantId, Role, Team};

/// Upper bound on full scans of the swap search.
pub const MAX_REFINEMENT_SCANS: usize = 20;

// ─── Stats ─────────────────────────────────────────────────────────

/// Per-role head count of one team.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCounts {
    pub rusher: usize,
    pub mid: usize,
    pub pro: usize,
}

impl RoleCounts {
    pub fn of<'a>(members: impl IntoIterator<Item = &'a Participant>) -> Self {
        let mut counts = Self::default();
        for p in members {
            counts.add(p.role);
        }
        counts
    }

    pub fn get(&self, role: Role) -> usize {
        match role {
            Role::Rusher => self.rusher,
            Role::Mid => self.mid,
            Role::Pro => self.pro,
        }
    }

    fn slot(&mut self, role: Role) -> &mut usize {
        match role {
            Role::Rusher => &mut self.rusher,
            Role::Mid => &mut self.mid,
            Role::Pro => &mut self.pro,
        }
    }

    pub fn add(&mut self, role: Role) {
        *self.slot(role) += 1;
    }

    pub fn remove(&mut self, role: Role) {
        let slot = self.slot(role);
        *slot = slot.saturating_sub(1);
    }

    /// `Σ_role |self(role) − other(role)|`
    pub fn imbalance(&self, other: &RoleCounts) -> usize {
        Role::ALL
            .iter()
            .map(|&r| self.get(r).abs_diff(other.get(r)))
            .sum()
    }
}

/// Summary of a finished partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceStats {
    pub team_a_level: u64,
    pub team_b_level: u64,
    pub level_diff: u64,
    pub team_a_roles: RoleCounts,
    pub team_b_roles: RoleCounts,
}

impl BalanceStats {
    pub fn role_imbalance(&self) -> usize {
        self.team_a_roles.imbalance(&self.team_b_roles)
    }
}

/// Result of [`balance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance {
    pub team_a: Vec<ParticipantId>,
    pub team_b: Vec<ParticipantId>,
    pub assignments: BTreeMap<ParticipantId, Team>,
    pub stats: BalanceStats,
    /// Swaps accepted by the search
    pub swaps: usize,
}

// ─── Errors ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceError {
    InvalidTeamSize,
    InsufficientPlayers { required: usize, available: usize },
    TooManyPlayers { required: usize, available: usize },
    DuplicateParticipant(ParticipantId),
}

impl std::fmt::Display for BalanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BalanceError::InvalidTeamSize => write!(f, "Team size must be at least 1"),
            BalanceError::InsufficientPlayers { required, available } => {
                write!(f, "Need {required} players, got {available}")
            }
            BalanceError::TooManyPlayers { required, available } => {
                write!(f, "Expected exactly {required} players, got {available}")
            }
            BalanceError::DuplicateParticipant(id) => {
                write!(f, "Participant {id} listed twice")
            }
        }
    }
}

impl std::error::Error for BalanceError {}

impl From<BalanceError> for EngineError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::InsufficientPlayers { required, available } => {
                EngineError::InsufficientPlayers { required, available }
            }
            other => EngineError::InvalidInput(other.to_string()),
        }
    }
}

// ─── Partition ─────────────────────────────────────────────────────

struct Split<'a> {
    a: Vec<&'a Participant>,
    b: Vec<&'a Participant>,
    sum_a: u64,
    sum_b: u64,
    roles_a: RoleCounts,
    roles_b: RoleCounts,
}

impl<'a> Split<'a> {
    fn diff(&self) -> u64 {
        self.sum_a.abs_diff(self.sum_b)
    }

    fn into_balance(self, swaps: usize) -> Balance {
        let mut assignments = BTreeMap::new();
        for p in &self.a {
            assignments.insert(p.id.clone(), Team::One);
        }
        for p in &self.b {
            assignments.insert(p.id.clone(), Team::Two);
        }
        let stats = BalanceStats {
            team_a_level: self.sum_a,
            team_b_level: self.sum_b,
            level_diff: self.diff(),
            team_a_roles: self.roles_a,
            team_b_roles: self.roles_b,
        };
        Balance {
            team_a: self.a.iter().map(|p| p.id.clone()).collect(),
            team_b: self.b.iter().map(|p| p.id.clone()).collect(),
            assignments,
            stats,
            swaps,
        }
    }

    /// Try one full scan; apply the first improving swap found.
    fn improve_once(&mut self) -> bool {
        let diff = self.diff();
        let roles = self.roles_a.imbalance(&self.roles_b);

        for i in 0..self.a.len() {
            for j in 0..self.b.len() {
                let (pa, pb) = (self.a[i], self.b[j]);
                let new_a = self.sum_a - u64::from(pa.level) + u64::from(pb.level);
                let new_b = self.sum_b - u64::from(pb.level) + u64::from(pa.level);
                let new_diff = new_a.abs_diff(new_b);

                let mut roles_a = self.roles_a;
                let mut roles_b = self.roles_b;
                roles_a.remove(pa.role);
                roles_a.add(pb.role);
                roles_b.remove(pb.role);
                roles_b.add(pa.role);
                let new_roles = roles_a.imbalance(&roles_b);

                if new_diff < diff || (new_diff == diff && new_roles < roles) {
                    self.a[i] = pb;
                    self.b[j] = pa;
                    self.sum_a = new_a;
                    self.sum_b = new_b;
                    self.roles_a = roles_a;
                    self.roles_b = roles_b;
                    return true;
                }
            }
        }
        false
    }
}

fn check_input(participants: &[Participant], team_size: usize) -> Result<(), BalanceError> {
    if team_size == 0 {
        return Err(BalanceError::InvalidTeamSize);
    }
    let required = team_size * 2;
    let available = participants.len();
    if available < required {
        return Err(BalanceError::InsufficientPlayers { required, available });
    }
    if available > required {
        return Err(BalanceError::TooManyPlayers { required, available });
    }
    let mut seen = BTreeSet::new();
    for p in participants {
        if !seen.insert(&p.id) {
            return Err(BalanceError::DuplicateParticipant(p.id.clone()));
        }
    }
    Ok(())
}

fn seed(participants: &[Participant]) -> Split<'_> {
    let mut sorted: Vec<&Participant> = participants.iter().collect();
    // Vec::sort_by is stable: equal levels keep join order
    sorted.sort_by(|x, y| y.level.cmp(&x.level));

    let mut split = Split {
        a: Vec::new(),
        b: Vec::new(),
        sum_a: 0,
        sum_b: 0,
        roles_a: RoleCounts::default(),
        roles_b: RoleCounts::default(),
    };

    for p in sorted {
        // Equal sums give the same diff either way; team A takes the tie
        if split.sum_a <= split.sum_b {
            split.a.push(p);
            split.sum_a += u64::from(p.level);
            split.roles_a.add(p.role);
        } else {
            split.b.push(p);
            split.sum_b += u64::from(p.level);
            split.roles_b.add(p.role);
        }
    }
    split
}

/// Greedy partition only, without the swap search.
pub fn greedy_seed(participants: &[Participant], team_size: usize) -> Result<Balance, BalanceError> {
    check_input(participants, team_size)?;
    Ok(seed(participants).into_balance(0))
}

/// Split exactly `2 × team_size` participants into two teams.
///
/// `participants` is in join order; that order breaks level ties. The seed
/// only looks at running level sums, so a skewed roster can leave the teams
/// with different head counts. Swaps keep those counts.
pub fn balance(participants: &[Participant], team_size: usize) -> Result<Balance, BalanceError> {
    check_input(participants, team_size)?;

    let mut split = seed(participants);
    let mut swaps = 0;
    for _ in 0..MAX_REFINEMENT_SCANS {
        if !split.improve_once() {
            break;
        }
        swaps += 1;
    }
    log::debug!(
        "Balanced {} players: diff {} after {} swaps",
        participants.len(),
        split.diff(),
        swaps
    );

    Ok(split.into_balance(swaps))
}
