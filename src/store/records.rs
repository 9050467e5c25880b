//! Persisted record shapes for match bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::game::CharacterId;

/// GP totals at which each competitive rank is reached. A player's GP never
/// regresses below the threshold of a rank already held.
pub const RANK_THRESHOLDS: [i32; 8] = [0, 100, 300, 600, 1000, 1500, 2100, 2800];

/// Rank implied by a GP total
pub fn rank_for_gp(gp: i32) -> u8 {
    let mut rank = 0;
    for (index, threshold) in RANK_THRESHOLDS.iter().enumerate() {
        if gp >= *threshold {
            rank = index as u8;
        }
    }
    rank
}

/// The GP floor for a held rank
pub fn threshold_for_rank(rank: u8) -> i32 {
    let index = (rank as usize).min(RANK_THRESHOLDS.len() - 1);
    RANK_THRESHOLDS[index]
}

/// A character's competitive PvP record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvpRecord {
    pub character_id: CharacterId,
    /// Persistent ranking score
    pub gp: i32,
    /// Earned reward currency
    pub bp: i64,
    pub kills: u32,
    pub deaths: u32,
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
    /// Accumulated decline penalties; gates queue entry
    pub penalty_count: u32,
    pub rank: u8,
    pub updated_at: DateTime<Utc>,
}

impl PvpRecord {
    pub fn new(character_id: CharacterId) -> Self {
        Self {
            character_id,
            gp: 0,
            bp: 0,
            kills: 0,
            deaths: 0,
            wins: 0,
            losses: 0,
            draws: 0,
            penalty_count: 0,
            rank: 0,
            updated_at: Utc::now(),
        }
    }

    /// GP floor implied by the currently held rank
    pub fn rank_threshold(&self) -> i32 {
        threshold_for_rank(self.rank)
    }

    /// Re-derive rank after a GP change (ranks are never lost)
    pub fn refresh_rank(&mut self) {
        let implied = rank_for_gp(self.gp);
        if implied > self.rank {
            self.rank = implied;
        }
    }
}

/// A character's cooperative-mode ranking record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UltimateRecord {
    pub character_id: CharacterId,
    /// Cumulative points across all matches
    pub total_points: i64,
    /// Best single-match score
    pub best_points: i64,
    pub matches_played: u32,
    pub updated_at: DateTime<Utc>,
}

impl UltimateRecord {
    pub fn new(character_id: CharacterId) -> Self {
        Self {
            character_id,
            total_points: 0,
            best_points: 0,
            matches_played: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Fire-and-forget experience grant issued after match settlement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceGrant {
    pub character_id: CharacterId,
    pub amount: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_derivation_matches_thresholds() {
        assert_eq!(rank_for_gp(0), 0);
        assert_eq!(rank_for_gp(99), 0);
        assert_eq!(rank_for_gp(100), 1);
        assert_eq!(rank_for_gp(2799), 6);
        assert_eq!(rank_for_gp(2800), 7);
        assert_eq!(threshold_for_rank(3), 600);
        // out-of-range rank clamps to the top threshold
        assert_eq!(threshold_for_rank(200), 2800);
    }

    #[test]
    fn ranks_are_never_lost() {
        let mut record = PvpRecord::new(CharacterId(1));
        record.gp = 350;
        record.refresh_rank();
        assert_eq!(record.rank, 2);

        record.gp = 300;
        record.refresh_rank();
        assert_eq!(record.rank, 2);
        assert_eq!(record.rank_threshold(), 300);
    }
}
