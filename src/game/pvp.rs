//! Adversarial match state machine (Fate / Valhalla)
//!
//! One mutex per match covers lifecycle state, scores, per-player stats and
//! base occupation. Mutations return outcome values; the manager does all
//! notice sending and persistence after the lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::game::base::BaseState;
use crate::game::scoring::{self, PointsOutcome};
use crate::game::{CharacterId, MatchError, MatchId, MatchType, TeamSide};
use crate::util::time::ServerTime;
use crate::zone::entity::EntityId;
use crate::zone::InstanceId;

/// Static tuning for one adversarial variant
#[derive(Debug, Clone)]
pub struct PvpVariantDef {
    pub variant_id: u32,
    /// Zone spawned for the private match instance
    pub zone_def_id: u32,
    pub duration_secs: f64,
    /// Reaching this score stops the match timer; None = timed only
    pub max_points: Option<i32>,
    /// Points granted when a capture finalizes
    pub base_capture_points: i32,
    /// Points granted per bonus tick while a base is held
    pub base_bonus_points: i32,
    pub base_bonus_interval_secs: f64,
}

/// Lifecycle of one adversarial match run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvpState {
    /// Participants are being prompted; silence past the deadline declines
    Confirming,
    Active,
    Ended,
}

/// One participant's standing in the match
#[derive(Debug, Clone)]
pub struct PvpPlayer {
    pub character_id: CharacterId,
    pub team: TeamSide,
    /// Confirmed and connected into the instance
    pub present: bool,
    /// Left after confirming, before the end
    pub dropped: bool,
    pub entity_id: Option<EntityId>,
}

/// Per-player running counters for one match
#[derive(Debug, Clone)]
pub struct PvpPlayerStats {
    pub character_id: CharacterId,
    pub team: TeamSide,
    pub kills: u32,
    pub deaths: u32,
    /// Largest single hit dealt
    pub damage_dealt_max: i32,
    pub first_damage_dealt: Option<ServerTime>,
    /// Largest single hit taken
    pub damage_taken_max: i32,
    pub first_damage_taken: Option<ServerTime>,
    pub status_effects: u32,
    pub base_points: i32,
    pub first_base_capture: Option<ServerTime>,
    pub last_base_capture: Option<ServerTime>,
    pub dropped: bool,
}

impl PvpPlayerStats {
    pub fn new(character_id: CharacterId, team: TeamSide) -> Self {
        Self {
            character_id,
            team,
            kills: 0,
            deaths: 0,
            damage_dealt_max: 0,
            first_damage_dealt: None,
            damage_taken_max: 0,
            first_damage_taken: None,
            status_effects: 0,
            base_points: 0,
            first_base_capture: None,
            last_base_capture: None,
            dropped: false,
        }
    }
}

pub(crate) struct PvpInner {
    pub(crate) state: PvpState,
    pub(crate) phase: u8,
    pub(crate) ready_deadline: ServerTime,
    pub(crate) started_at: Option<ServerTime>,
    pub(crate) stopped_at: Option<ServerTime>,
    pub(crate) expires_at: Option<ServerTime>,
    pub(crate) timer_stopped: bool,
    pub(crate) players: Vec<PvpPlayer>,
    pub(crate) score: [i32; 2],
    pub(crate) max_reached: [bool; 2],
    pub(crate) bases: HashMap<EntityId, BaseState>,
    pub(crate) stats: HashMap<CharacterId, PvpPlayerStats>,
}

/// Everything settlement needs, copied out under the match lock
#[derive(Debug, Clone)]
pub struct PvpEndSnapshot {
    pub kind: MatchType,
    pub players: Vec<PvpPlayer>,
    pub score: [i32; 2],
    pub stats: Vec<PvpPlayerStats>,
    pub time_remaining_secs: f64,
    /// Set when one side had no present members
    pub forfeit_winner: Option<TeamSide>,
}

/// One adversarial match
pub struct PvpMatch {
    pub id: MatchId,
    pub kind: MatchType,
    pub variant: Arc<PvpVariantDef>,
    pub instance_id: InstanceId,
    inner: Mutex<PvpInner>,
}

impl PvpMatch {
    pub fn new(
        id: MatchId,
        kind: MatchType,
        variant: Arc<PvpVariantDef>,
        instance_id: InstanceId,
        ready_deadline: ServerTime,
        teams: [Vec<CharacterId>; 2],
        base_entities: Vec<(EntityId, u8)>,
    ) -> Self {
        debug_assert!(kind.is_adversarial());

        let mut players = Vec::new();
        let mut stats = HashMap::new();
        for side in TeamSide::BOTH {
            for character_id in &teams[side.index()] {
                players.push(PvpPlayer {
                    character_id: *character_id,
                    team: side,
                    present: false,
                    dropped: false,
                    entity_id: None,
                });
                stats.insert(*character_id, PvpPlayerStats::new(*character_id, side));
            }
        }

        let bases = base_entities
            .into_iter()
            .map(|(entity_id, slot)| (entity_id, BaseState::new(slot)))
            .collect();

        Self {
            id,
            kind,
            variant,
            instance_id,
            inner: Mutex::new(PvpInner {
                state: PvpState::Confirming,
                phase: 0,
                ready_deadline,
                started_at: None,
                stopped_at: None,
                expires_at: None,
                timer_stopped: false,
                players,
                score: [0, 0],
                max_reached: [false, false],
                bases,
                stats,
            }),
        }
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, PvpInner> {
        self.inner.lock()
    }

    pub fn state(&self) -> PvpState {
        self.inner.lock().state
    }

    pub fn phase(&self) -> u8 {
        self.inner.lock().phase
    }

    pub fn ready_deadline(&self) -> ServerTime {
        self.inner.lock().ready_deadline
    }

    pub fn scores(&self) -> [i32; 2] {
        self.inner.lock().score
    }

    pub fn participants(&self) -> Vec<CharacterId> {
        self.inner
            .lock()
            .players
            .iter()
            .map(|player| player.character_id)
            .collect()
    }

    pub fn player_team(&self, character_id: CharacterId) -> Option<TeamSide> {
        self.inner
            .lock()
            .players
            .iter()
            .find(|player| player.character_id == character_id)
            .map(|player| player.team)
    }

    /// Resolve the entity controlling team (entities enter on confirmation)
    pub fn entity_team(&self, entity_id: EntityId) -> Option<TeamSide> {
        self.inner
            .lock()
            .players
            .iter()
            .find(|player| player.entity_id == Some(entity_id))
            .map(|player| player.team)
    }

    /// A confirmed participant entered the instance
    pub fn mark_present(
        &self,
        character_id: CharacterId,
        entity_id: EntityId,
    ) -> Result<TeamSide, MatchError> {
        let mut inner = self.inner.lock();
        let player = inner
            .players
            .iter_mut()
            .find(|player| player.character_id == character_id)
            .ok_or(MatchError::NotParticipant(character_id))?;
        player.present = true;
        player.entity_id = Some(entity_id);
        Ok(player.team)
    }

    /// A participant declined (or timed out). Returns true if they were
    /// still an undecided participant.
    pub fn mark_declined(&self, character_id: CharacterId) -> bool {
        let mut inner = self.inner.lock();
        match inner
            .players
            .iter_mut()
            .find(|player| player.character_id == character_id)
        {
            Some(player) => {
                player.present = false;
                true
            }
            None => false,
        }
    }

    /// A participant left mid-match: BP forfeited, GP still settles
    pub fn drop_player(&self, character_id: CharacterId) {
        let mut inner = self.inner.lock();
        if let Some(player) = inner
            .players
            .iter_mut()
            .find(|player| player.character_id == character_id)
        {
            player.present = false;
            player.dropped = true;
        }
        if let Some(stats) = inner.stats.get_mut(&character_id) {
            stats.dropped = true;
        }
    }

    /// Both sides have at least one present member
    pub fn teams_active(&self) -> bool {
        let inner = self.inner.lock();
        TeamSide::BOTH.iter().all(|side| {
            inner
                .players
                .iter()
                .any(|player| player.team == *side && player.present)
        })
    }

    /// CONFIRMING -> ACTIVE. Returns the expiry deadline for the stop timer.
    pub fn activate(&self, now: ServerTime) -> Result<ServerTime, MatchError> {
        let mut inner = self.inner.lock();
        if inner.state != PvpState::Confirming {
            return Err(MatchError::InvariantViolated("activate outside CONFIRMING"));
        }
        let expires = now.add_secs(self.variant.duration_secs);
        inner.state = PvpState::Active;
        inner.started_at = Some(now);
        inner.expires_at = Some(expires);
        Ok(expires)
    }

    /// Stop the match timer. Idempotent; returns true the first time.
    /// Allowed from CONFIRMING for the never-started forfeit path.
    pub fn stop_timer(&self, now: ServerTime) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == PvpState::Ended || inner.timer_stopped {
            return false;
        }
        inner.timer_stopped = true;
        inner.stopped_at = Some(now);
        true
    }

    pub fn timer_stopped(&self) -> bool {
        self.inner.lock().timer_stopped
    }

    pub fn expires_at(&self) -> Option<ServerTime> {
        self.inner.lock().expires_at
    }

    /// Seconds from activation to timer stop (zero when never active)
    pub fn match_duration_secs(&self) -> f64 {
        let inner = self.inner.lock();
        match (inner.started_at, inner.stopped_at) {
            (Some(started), Some(stopped)) => started.secs_until(stopped),
            _ => 0.0,
        }
    }

    /// Advance the numeric phase. Phases only move forward, up to the cap.
    pub fn advance_phase(&self, target: u8) -> Result<u8, MatchError> {
        let mut inner = self.inner.lock();
        if target < inner.phase {
            return Err(MatchError::PhaseRegression {
                current: inner.phase,
                requested: target,
            });
        }
        let cap = self.kind.max_phase();
        if target > cap {
            return Err(MatchError::PhaseCapExceeded {
                cap,
                requested: target,
            });
        }
        inner.phase = target;
        Ok(target)
    }

    /// Apply a score delta for one team under the cap rules
    pub fn apply_points(
        &self,
        team: TeamSide,
        delta: i32,
    ) -> Result<PointsOutcome, MatchError> {
        let mut inner = self.inner.lock();
        if inner.state != PvpState::Active {
            return Err(MatchError::NotActive);
        }

        let index = team.index();
        let outcome = scoring::apply_team_points(
            inner.score[index],
            delta,
            self.variant.max_points,
            inner.max_reached[index],
        );
        inner.score[index] = outcome.total;
        if outcome.crossed_threshold {
            inner.max_reached[index] = true;
        }
        Ok(outcome)
    }

    pub fn record_kill(&self, killer: CharacterId, victim: CharacterId) {
        let mut inner = self.inner.lock();
        if let Some(stats) = inner.stats.get_mut(&killer) {
            stats.kills += 1;
        }
        if let Some(stats) = inner.stats.get_mut(&victim) {
            stats.deaths += 1;
        }
    }

    pub fn record_damage_dealt(&self, character_id: CharacterId, amount: i32, now: ServerTime) {
        let mut inner = self.inner.lock();
        if let Some(stats) = inner.stats.get_mut(&character_id) {
            stats.damage_dealt_max = stats.damage_dealt_max.max(amount);
            stats.first_damage_dealt.get_or_insert(now);
        }
    }

    pub fn record_damage_taken(&self, character_id: CharacterId, amount: i32, now: ServerTime) {
        let mut inner = self.inner.lock();
        if let Some(stats) = inner.stats.get_mut(&character_id) {
            stats.damage_taken_max = stats.damage_taken_max.max(amount);
            stats.first_damage_taken.get_or_insert(now);
        }
    }

    pub fn record_status_effect(&self, character_id: CharacterId) {
        let mut inner = self.inner.lock();
        if let Some(stats) = inner.stats.get_mut(&character_id) {
            stats.status_effects += 1;
        }
    }

    pub(crate) fn add_base_points(
        &self,
        character_id: CharacterId,
        points: i32,
        now: ServerTime,
    ) {
        let mut inner = self.inner.lock();
        if let Some(stats) = inner.stats.get_mut(&character_id) {
            stats.base_points += points;
            stats.first_base_capture.get_or_insert(now);
            stats.last_base_capture = Some(now);
        }
    }

    /// Close the match and copy out everything settlement needs. Requires the
    /// timer to be stopped already.
    pub fn end_snapshot(&self) -> Result<PvpEndSnapshot, MatchError> {
        let mut inner = self.inner.lock();
        if inner.state == PvpState::Ended {
            return Err(MatchError::InvariantViolated("match already ended"));
        }
        if !inner.timer_stopped {
            return Err(MatchError::TimerRunning);
        }
        inner.state = PvpState::Ended;

        let present = TeamSide::BOTH.map(|side| {
            inner
                .players
                .iter()
                .filter(|player| player.team == side && player.present)
                .count()
        });
        let forfeit_winner = match (present[0] > 0, present[1] > 0) {
            (true, false) => Some(TeamSide::Alpha),
            (false, true) => Some(TeamSide::Beta),
            _ => None,
        };

        let time_remaining_secs = match (inner.stopped_at, inner.expires_at) {
            (Some(stopped), Some(expires)) => stopped.secs_until(expires),
            _ => 0.0,
        };

        Ok(PvpEndSnapshot {
            kind: self.kind,
            players: inner.players.clone(),
            score: inner.score,
            stats: inner.stats.values().cloned().collect(),
            time_remaining_secs,
            forfeit_winner,
        })
    }
}
