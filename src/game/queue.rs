//! Match queue tickets and the process-wide entry map
//!
//! One `MatchEntry` per character wanting a match. The map mirrors the world
//! process's authoritative queue: local joins are pushed out through the sync
//! layer, and world-originated updates land back here via
//! `MatchManager::update_match_entries`.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::game::{CharacterId, MatchId, MatchType, TeamId};
use crate::net::FailCode;

/// A queue ticket for one character
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchEntry {
    pub character_id: CharacterId,
    /// Team leader for team queues, self for solo
    pub owner_id: CharacterId,
    pub match_type: MatchType,
    pub team_id: Option<TeamId>,
    /// Set once the world process assigns a match
    pub match_id: Option<MatchId>,
    /// Server time (microseconds) the assigned match is ready
    pub ready_time: Option<u64>,
}

impl MatchEntry {
    pub fn new(
        character_id: CharacterId,
        owner_id: CharacterId,
        match_type: MatchType,
        team_id: Option<TeamId>,
    ) -> Self {
        Self {
            character_id,
            owner_id,
            match_type,
            team_id,
            match_id: None,
            ready_time: None,
        }
    }
}

/// Queue validation failures. All checks run before any mutation.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("character {0} is not the team leader")]
    NotTeamLeader(CharacterId),

    #[error("team category {category:?} does not admit {requested}")]
    WrongTeamCategory {
        category: TeamCategory,
        requested: MatchType,
    },

    #[error("character {0} already has a queue entry")]
    AlreadyQueued(CharacterId),

    #[error("character {0} already has a pending match")]
    AlreadyInMatch(CharacterId),

    #[error("penalty count {count} at or over limit {limit}")]
    PenaltyLimit { count: u32, limit: u32 },

    #[error("join attempts rate limited")]
    RateLimited,
}

impl QueueError {
    /// Reason code for the client-facing refusal notice
    pub fn fail_code(&self) -> FailCode {
        match self {
            QueueError::NotTeamLeader(_) => FailCode::NotTeamLeader,
            QueueError::WrongTeamCategory { .. } => FailCode::WrongTeamCategory,
            QueueError::AlreadyQueued(_) => FailCode::AlreadyQueued,
            QueueError::AlreadyInMatch(_) => FailCode::AlreadyInMatch,
            QueueError::PenaltyLimit { .. } => FailCode::PenaltyLimit,
            QueueError::RateLimited => FailCode::RateLimited,
        }
    }
}

/// The process-wide queue entry map (a cache of the world's queue)
pub struct QueueMap {
    entries: DashMap<CharacterId, MatchEntry>,
}

impl QueueMap {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn contains(&self, character_id: CharacterId) -> bool {
        self.entries.contains_key(&character_id)
    }

    pub fn get(&self, character_id: CharacterId) -> Option<MatchEntry> {
        self.entries
            .get(&character_id)
            .map(|entry| entry.value().clone())
    }

    /// Insert a batch of entries all-or-nothing: if any character already has
    /// an entry, earlier inserts are rolled back and the clash is returned.
    pub fn insert_all(&self, entries: Vec<MatchEntry>) -> Result<(), QueueError> {
        let mut inserted: Vec<CharacterId> = Vec::with_capacity(entries.len());
        for entry in entries {
            let character_id = entry.character_id;
            // the entry guard must drop before any rollback removal, which
            // may land on the same shard
            let clash = {
                match self.entries.entry(character_id) {
                    dashmap::mapref::entry::Entry::Occupied(_) => true,
                    dashmap::mapref::entry::Entry::Vacant(slot) => {
                        slot.insert(entry);
                        false
                    }
                }
            };
            if clash {
                for id in inserted {
                    self.entries.remove(&id);
                }
                return Err(QueueError::AlreadyQueued(character_id));
            }
            inserted.push(character_id);
        }
        Ok(())
    }

    pub fn remove(&self, character_id: CharacterId) -> Option<MatchEntry> {
        self.entries.remove(&character_id).map(|(_, entry)| entry)
    }

    /// Remove every entry owned by `owner_id` (the team cancel path)
    pub fn remove_owned_by(&self, owner_id: CharacterId) -> Vec<MatchEntry> {
        let owned: Vec<CharacterId> = self
            .entries
            .iter()
            .filter(|entry| entry.value().owner_id == owner_id)
            .map(|entry| *entry.key())
            .collect();

        owned
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    /// Replace an entry with a world-originated update
    pub fn apply_update(&self, entry: MatchEntry) {
        self.entries.insert(entry.character_id, entry);
    }

    /// Record a match assignment on an existing entry
    pub fn assign_match(&self, character_id: CharacterId, match_id: MatchId, ready_time: u64) {
        if let Some(mut entry) = self.entries.get_mut(&character_id) {
            entry.match_id = Some(match_id);
            entry.ready_time = Some(ready_time);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for QueueMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Team categories the world process assigns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamCategory {
    /// Ordinary party; not admitted to competitive queues
    Party,
    Fate,
    Valhalla,
    Diaspora,
    Pentalpha,
}

impl TeamCategory {
    /// Whether a team of this category may queue for `match_type`
    pub fn admits(self, match_type: MatchType) -> bool {
        matches!(
            (self, match_type),
            (TeamCategory::Fate, MatchType::Fate)
                | (TeamCategory::Valhalla, MatchType::Valhalla)
                | (TeamCategory::Diaspora, MatchType::Diaspora)
                | (TeamCategory::Pentalpha, MatchType::Pentalpha)
        )
    }
}

/// A team as mirrored from the world process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub leader: CharacterId,
    pub members: Vec<CharacterId>,
    pub category: TeamCategory,
}

/// Local cache of world-owned teams
pub struct TeamRoster {
    teams: DashMap<TeamId, Team>,
    by_member: DashMap<CharacterId, TeamId>,
}

impl TeamRoster {
    pub fn new() -> Self {
        Self {
            teams: DashMap::new(),
            by_member: DashMap::new(),
        }
    }

    pub fn upsert(&self, team: Team) {
        for member in &team.members {
            self.by_member.insert(*member, team.id);
        }
        self.teams.insert(team.id, team);
    }

    pub fn remove(&self, team_id: TeamId) {
        if let Some((_, team)) = self.teams.remove(&team_id) {
            for member in team.members {
                self.by_member.remove(&member);
            }
        }
    }

    pub fn team(&self, team_id: TeamId) -> Option<Team> {
        self.teams.get(&team_id).map(|entry| entry.value().clone())
    }

    pub fn team_of(&self, character_id: CharacterId) -> Option<Team> {
        let team_id = *self.by_member.get(&character_id)?.value();
        self.team(team_id)
    }
}

impl Default for TeamRoster {
    fn default() -> Self {
        Self::new()
    }
}
