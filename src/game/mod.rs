//! Match lifecycle modules

pub mod base;
pub mod manager;
pub mod pvp;
pub mod queue;
pub mod scoring;
pub mod trophy;
pub mod ultimate;

pub use manager::MatchManager;

use serde::{Deserialize, Serialize};

/// World-wide character id. The world process owns the character; this
/// process only ever refers to it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CharacterId(pub u64);

impl std::fmt::Display for CharacterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric match id. PvP ids are assigned by the world process; cooperative
/// matches use locally allocated ids.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MatchId(pub u64);

impl std::fmt::Display for MatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Team id assigned by the world process
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TeamId(pub u64);

impl std::fmt::Display for TeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Match families supported by the queue and state machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Adversarial team battle with bases
    Fate,
    /// Adversarial variant with loss-oriented trophies
    Valhalla,
    /// Cooperative boss-gauge mode
    UltimateBattle,
    /// Base-capture objective mode
    Diaspora,
    /// Five-point objective mode
    Pentalpha,
}

impl MatchType {
    /// Adversarial families run through the PvP state machine
    pub fn is_adversarial(self) -> bool {
        matches!(self, MatchType::Fate | MatchType::Valhalla)
    }

    /// Highest numeric phase a match of this type may reach
    pub fn max_phase(self) -> u8 {
        match self {
            MatchType::Fate | MatchType::Valhalla => 3,
            MatchType::UltimateBattle => 5,
            MatchType::Diaspora => 4,
            MatchType::Pentalpha => 5,
        }
    }
}

impl std::fmt::Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MatchType::Fate => "fate",
            MatchType::Valhalla => "valhalla",
            MatchType::UltimateBattle => "ultimate_battle",
            MatchType::Diaspora => "diaspora",
            MatchType::Pentalpha => "pentalpha",
        };
        f.write_str(name)
    }
}

/// The two sides of an adversarial match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamSide {
    Alpha,
    Beta,
}

impl TeamSide {
    pub const BOTH: [TeamSide; 2] = [TeamSide::Alpha, TeamSide::Beta];

    pub fn opponent(self) -> TeamSide {
        match self {
            TeamSide::Alpha => TeamSide::Beta,
            TeamSide::Beta => TeamSide::Alpha,
        }
    }

    /// Index into per-side arrays
    pub fn index(self) -> usize {
        match self {
            TeamSide::Alpha => 0,
            TeamSide::Beta => 1,
        }
    }

    pub fn from_index(index: usize) -> TeamSide {
        if index == 0 {
            TeamSide::Alpha
        } else {
            TeamSide::Beta
        }
    }
}

/// Final team placement in an adversarial match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Win,
    Lose,
    Draw,
}

/// Match operation failures
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("unknown match {0}")]
    UnknownMatch(MatchId),

    #[error("character {0} is not a participant")]
    NotParticipant(CharacterId),

    #[error("unknown entity {0} in match scope")]
    UnknownEntity(crate::zone::entity::EntityId),

    #[error("unknown base {0}")]
    UnknownBase(crate::zone::entity::EntityId),

    #[error("base {0} is already claimed")]
    BaseBusy(crate::zone::entity::EntityId),

    #[error("match is not active")]
    NotActive,

    #[error("match timer is still running")]
    TimerRunning,

    #[error("phase {requested} is behind current phase {current}")]
    PhaseRegression { current: u8, requested: u8 },

    #[error("phase {requested} exceeds cap {cap}")]
    PhaseCapExceeded { cap: u8, requested: u8 },

    #[error("variant {0} does not resolve locally")]
    InstanceUnavailable(u32),

    #[error("invariant violated: {0}")]
    InvariantViolated(&'static str),
}

impl MatchError {
    /// Reason code for the client-facing refusal notice
    pub fn fail_code(&self) -> crate::net::FailCode {
        use crate::net::FailCode;
        match self {
            MatchError::UnknownMatch(_) => FailCode::UnknownMatch,
            MatchError::NotParticipant(_) => FailCode::NotParticipant,
            MatchError::UnknownEntity(_) => FailCode::NotParticipant,
            MatchError::UnknownBase(_) => FailCode::UnknownBase,
            MatchError::BaseBusy(_) => FailCode::BaseBusy,
            MatchError::NotActive | MatchError::TimerRunning => FailCode::MatchNotActive,
            MatchError::PhaseRegression { .. } | MatchError::PhaseCapExceeded { .. } => {
                FailCode::PhaseRegression
            }
            MatchError::InstanceUnavailable(_) => FailCode::InstanceUnavailable,
            MatchError::InvariantViolated(_) => FailCode::InvariantViolated,
        }
    }
}
