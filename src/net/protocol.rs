//! Outbound notification definitions
//!
//! Every state transition in the match core has exactly one notice type,
//! delivered to one client or broadcast to a client list. The byte layout on
//! the wire is owned by the protocol layer; these are the payload shapes it
//! encodes.

use serde::{Deserialize, Serialize};

use crate::game::{CharacterId, MatchId, MatchType, Placement, TeamSide};
use crate::zone::entity::EntityId;

/// Reason codes for player-initiated actions that fail validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailCode {
    NotTeamLeader,
    WrongTeamCategory,
    AlreadyQueued,
    AlreadyInMatch,
    PenaltyLimit,
    RateLimited,
    UnknownMatch,
    NotParticipant,
    MatchNotActive,
    UnknownBase,
    BaseBusy,
    PhaseRegression,
    InstanceUnavailable,
    InvariantViolated,
}

/// Final standing of one team, for the result notice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementEntry {
    pub team: TeamSide,
    pub placement: Placement,
    pub score: i32,
}

/// Per-player reward line in the result notice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardEntry {
    pub character_id: CharacterId,
    /// Ranking-point change (may be negative)
    pub gp_delta: i32,
    /// Reward currency earned (zero for players who dropped)
    pub bp_earned: i64,
    pub trophies: Vec<u16>,
}

/// Messages sent from the match core to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// Queue ticket accepted
    QueueEntered { match_type: MatchType },

    /// No longer queued (cancel, decline, or assignment expiry)
    QueueCanceled { reason: String },

    /// A player-initiated action failed validation
    Refused { code: FailCode },

    /// Match assigned; reply before the deadline
    ConfirmPrompt {
        match_id: MatchId,
        match_type: MatchType,
        /// Server time (microseconds) after which silence counts as decline
        deadline: u64,
    },

    /// Confirmation registered
    MatchConfirmed { match_id: MatchId },

    /// A participant declined (or timed out)
    MatchDeclined {
        match_id: MatchId,
        character_id: CharacterId,
    },

    /// Match transitioned to active play
    MatchStarted { match_id: MatchId },

    /// Match torn down before active play (one side absent)
    MatchCanceled { match_id: MatchId },

    /// Team score changed
    PointsDelta {
        match_id: MatchId,
        team: TeamSide,
        delta: i32,
        totals: [i32; 2],
    },

    /// An entity began capturing a base
    BaseCaptureStarted { base: EntityId, by: EntityId },

    /// Base ownership finalized
    BaseCaptured { base: EntityId, team: TeamSide },

    /// The occupier left before capture finalized
    BaseLeft { base: EntityId },

    /// Final placements and rewards
    MatchResult {
        match_id: MatchId,
        placements: Vec<PlacementEntry>,
        rewards: Vec<RewardEntry>,
    },

    /// Cooperative recruitment window opened
    RecruitOpen {
        /// Server time (microseconds) the lottery draws
        closes_at: u64,
        /// Wall-clock milliseconds, for client-side countdown display
        server_time: u64,
    },

    /// Selected by the recruitment lottery
    RecruitSelected { match_id: MatchId },

    /// Not selected; re-queued for the next window
    RecruitPassed {
        /// Server time (microseconds) of the next draw
        next_window: u64,
    },

    /// Cooperative round began
    RoundStarted { match_id: MatchId },

    /// Shared gauge update
    GaugeUpdate {
        match_id: MatchId,
        value: i64,
        /// Gauge has crossed the configured dark threshold
        dark: bool,
    },

    /// A configured gauge trigger fired
    GaugeTrigger {
        match_id: MatchId,
        value: i64,
        /// Crossed upward (false = dropped back under)
        over: bool,
    },

    /// Numeric match phase advanced
    PhaseChanged { match_id: MatchId, phase: u8 },

    /// A named phase-timer event fired
    PhaseEvent { match_id: MatchId, event: String },

    /// Cooperative settlement line
    UltimateResult {
        match_id: MatchId,
        earned: i64,
        total: i64,
        best: i64,
    },

    /// Match fully over and detached
    MatchEnded { match_id: MatchId },
}
