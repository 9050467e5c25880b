//! Cooperative boss-gauge match (Ultimate Battle)
//!
//! Recruitment runs as a lobby-wide lottery (handled by the manager); the
//! match itself moves READY -> ROUND -> COMPLETE. During ROUND a periodic
//! tick drives the shared gauge from the remaining enemies' kill values and
//! checks the phase timer. The tick reschedules itself and carries an epoch
//! token - a stale epoch means a newer tick chain owns the match.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::game::{CharacterId, MatchError, MatchId, MatchType};
use crate::util::time::ServerTime;
use crate::zone::entity::EntityId;
use crate::zone::ZoneKey;

/// Hard clamp on the shared gauge
pub const GAUGE_CAP: i64 = 1_000_000;

/// An enemy's kill value never decays below this fraction of its start value
pub const KILL_VALUE_FLOOR_RATIO: f64 = 0.10;

/// Gauge tuning, taken from server config
#[derive(Debug, Clone)]
pub struct GaugeConfig {
    pub tick_secs: f64,
    /// Kill-value sum to gauge-delta scale
    pub scale: f64,
    /// Constant subtracted on any tick where an enemy died
    pub kill_decay: i64,
    /// Per-tick fractional decay of each enemy's kill value
    pub enemy_decay_rate: f64,
    pub dark_threshold: i64,
}

/// Lifecycle of one cooperative run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UbState {
    /// Lottery accepted, waiting for selected players to enter
    Ready,
    /// Round ticking
    Round,
    Complete,
}

/// One enemy feeding the gauge
#[derive(Debug, Clone)]
struct EnemyGauge {
    kill_value: f64,
    initial_value: f64,
}

/// A configured gauge threshold; each direction fires at most once
#[derive(Debug, Clone)]
pub struct GaugeTrigger {
    pub value: i64,
    fired_over: bool,
    fired_under: bool,
}

/// A pending named event
#[derive(Debug, Clone)]
pub struct PhaseTimer {
    pub expires_at: ServerTime,
    pub event: String,
}

/// What one tick produced
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub gauge: i64,
    /// Gauge is at or past the dark threshold
    pub dark: bool,
    /// Trigger values crossed this tick, with direction (true = upward)
    pub crossings: Vec<(i64, bool)>,
    /// Phase timer expired this tick
    pub timer_event: Option<String>,
    /// Epoch the next scheduled tick must present
    pub next_epoch: u64,
}

/// Result of a phase advance request
#[derive(Debug, Clone, Copy)]
pub struct PhaseOutcome {
    pub phase: u8,
    /// The cap was exceeded and the match ended instead of advancing
    pub ended: bool,
}

/// Per-player settlement line
#[derive(Debug, Clone)]
pub struct UbReward {
    pub character_id: CharacterId,
    /// Points earned during the round, before the cap
    pub raw: i64,
    /// Currency actually awarded (capped)
    pub earned: i64,
}

struct UbInner {
    state: UbState,
    phase: u8,
    gauge: i64,
    killed_since_tick: bool,
    enemies: HashMap<EntityId, EnemyGauge>,
    triggers: Vec<GaugeTrigger>,
    phase_timer: Option<PhaseTimer>,
    /// Lottery winners allowed to enter
    selected: Vec<CharacterId>,
    /// Winners who actually entered before the round began
    joined: Vec<CharacterId>,
    points: HashMap<CharacterId, i64>,
    tick_epoch: u64,
    started_at: Option<ServerTime>,
    ended_at: Option<ServerTime>,
}

/// One cooperative match
pub struct UltimateMatch {
    pub id: MatchId,
    /// The boss zone the round runs in
    pub zone_key: ZoneKey,
    inner: Mutex<UbInner>,
}

impl UltimateMatch {
    pub fn new(
        id: MatchId,
        zone_key: ZoneKey,
        selected: Vec<CharacterId>,
        trigger_values: Vec<i64>,
    ) -> Self {
        Self {
            id,
            zone_key,
            inner: Mutex::new(UbInner {
                state: UbState::Ready,
                phase: 0,
                gauge: 0,
                killed_since_tick: false,
                enemies: HashMap::new(),
                triggers: trigger_values
                    .into_iter()
                    .map(|value| GaugeTrigger {
                        value,
                        fired_over: false,
                        fired_under: false,
                    })
                    .collect(),
                phase_timer: None,
                selected,
                joined: Vec::new(),
                points: HashMap::new(),
                tick_epoch: 0,
                started_at: None,
                ended_at: None,
            }),
        }
    }

    pub fn state(&self) -> UbState {
        self.inner.lock().state
    }

    pub fn phase(&self) -> u8 {
        self.inner.lock().phase
    }

    pub fn gauge(&self) -> i64 {
        self.inner.lock().gauge
    }

    pub fn selected(&self) -> Vec<CharacterId> {
        self.inner.lock().selected.clone()
    }

    pub fn joined(&self) -> Vec<CharacterId> {
        self.inner.lock().joined.clone()
    }

    /// A selected player entered the boss zone during READY
    pub fn join(&self, character_id: CharacterId) -> Result<(), MatchError> {
        let mut inner = self.inner.lock();
        if !inner.selected.contains(&character_id) {
            return Err(MatchError::NotParticipant(character_id));
        }
        if !inner.joined.contains(&character_id) {
            inner.joined.push(character_id);
            inner.points.insert(character_id, 0);
        }
        Ok(())
    }

    /// READY -> ROUND at the scheduled time. Returns false (and completes the
    /// match) when nobody joined.
    pub fn begin_round(&self, now: ServerTime) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != UbState::Ready {
            return false;
        }
        if inner.joined.is_empty() {
            inner.state = UbState::Complete;
            inner.ended_at = Some(now);
            return false;
        }
        inner.state = UbState::Round;
        inner.started_at = Some(now);
        true
    }

    pub fn spawn_enemy(&self, entity_id: EntityId, kill_value: i32) {
        let mut inner = self.inner.lock();
        inner.enemies.insert(
            entity_id,
            EnemyGauge {
                kill_value: kill_value as f64,
                initial_value: kill_value as f64,
            },
        );
    }

    /// Remove a killed enemy; the next tick applies the kill decay. Returns
    /// the enemy's starting kill value for the credit.
    pub fn note_enemy_killed(&self, entity_id: EntityId) -> Option<i64> {
        let mut inner = self.inner.lock();
        let enemy = inner.enemies.remove(&entity_id)?;
        inner.killed_since_tick = true;
        Some(enemy.initial_value as i64)
    }

    /// Run one gauge tick. `epoch` must match the value handed out with the
    /// previous tick; anything else is a stale callback and a no-op.
    pub fn run_tick(&self, cfg: &GaugeConfig, now: ServerTime, epoch: u64) -> Option<TickOutcome> {
        let mut inner = self.inner.lock();
        if inner.state != UbState::Round || inner.tick_epoch != epoch {
            return None;
        }
        inner.tick_epoch += 1;
        let next_epoch = inner.tick_epoch;

        // gauge speed: remaining kill values, minus decay on a killing tick
        let speed: f64 = inner.enemies.values().map(|enemy| enemy.kill_value).sum();
        let mut delta = (speed * cfg.scale).round() as i64;
        if inner.killed_since_tick {
            delta -= cfg.kill_decay;
        }
        inner.killed_since_tick = false;

        // kill values decay toward their floor for the next tick
        if cfg.enemy_decay_rate > 0.0 {
            for enemy in inner.enemies.values_mut() {
                let floor = enemy.initial_value * KILL_VALUE_FLOOR_RATIO;
                enemy.kill_value = (enemy.kill_value * (1.0 - cfg.enemy_decay_rate)).max(floor);
            }
        }

        let previous = inner.gauge;
        let gauge = (previous + delta).clamp(0, GAUGE_CAP);
        inner.gauge = gauge;

        let mut crossings = Vec::new();
        for trigger in &mut inner.triggers {
            if !trigger.fired_over && previous < trigger.value && gauge >= trigger.value {
                trigger.fired_over = true;
                crossings.push((trigger.value, true));
            }
            if !trigger.fired_under && previous >= trigger.value && gauge < trigger.value {
                trigger.fired_under = true;
                crossings.push((trigger.value, false));
            }
        }

        let timer_due = inner
            .phase_timer
            .as_ref()
            .map(|timer| timer.expires_at <= now)
            .unwrap_or(false);
        let timer_event = if timer_due {
            inner.phase_timer.take().map(|timer| timer.event)
        } else {
            None
        };

        Some(TickOutcome {
            gauge,
            dark: gauge >= cfg.dark_threshold,
            crossings,
            timer_event,
            next_epoch,
        })
    }

    /// Delay until the next tick: the periodic interval, shortened so it
    /// never overshoots a pending phase-timer expiry
    pub fn next_tick_delay(&self, cfg: &GaugeConfig, now: ServerTime) -> f64 {
        let inner = self.inner.lock();
        match &inner.phase_timer {
            Some(timer) => cfg.tick_secs.min(now.secs_until(timer.expires_at)),
            None => cfg.tick_secs,
        }
    }

    /// Arm the named phase timer
    pub fn set_phase_timer(&self, expires_at: ServerTime, event: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.phase_timer = Some(PhaseTimer {
            expires_at,
            event: event.into(),
        });
    }

    /// Advance the numeric phase. Exceeding the cooperative cap ends the
    /// match instead of advancing past it; regression is refused.
    pub fn advance_phase(&self, target: u8, now: ServerTime) -> Result<PhaseOutcome, MatchError> {
        let mut inner = self.inner.lock();
        if target < inner.phase {
            return Err(MatchError::PhaseRegression {
                current: inner.phase,
                requested: target,
            });
        }
        let cap = MatchType::UltimateBattle.max_phase();
        if target > cap {
            inner.state = UbState::Complete;
            inner.ended_at = Some(now);
            return Ok(PhaseOutcome {
                phase: inner.phase,
                ended: true,
            });
        }
        inner.phase = target;
        Ok(PhaseOutcome {
            phase: target,
            ended: false,
        })
    }

    pub fn add_points(&self, character_id: CharacterId, amount: i64) {
        let mut inner = self.inner.lock();
        if let Some(points) = inner.points.get_mut(&character_id) {
            *points += amount;
        }
    }

    /// Close the round (idempotent)
    pub fn complete(&self, now: ServerTime) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == UbState::Complete {
            return false;
        }
        inner.state = UbState::Complete;
        inner.ended_at = Some(now);
        true
    }

    /// Seconds the round ran, once complete
    pub fn round_duration_secs(&self) -> f64 {
        let inner = self.inner.lock();
        match (inner.started_at, inner.ended_at) {
            (Some(started), Some(ended)) => started.secs_until(ended),
            _ => 0.0,
        }
    }

    /// Settlement lines: earned currency never exceeds the per-match cap
    pub fn settle(&self, reward_cap: i64) -> Vec<UbReward> {
        let inner = self.inner.lock();
        inner
            .joined
            .iter()
            .map(|character_id| {
                let raw = inner.points.get(character_id).copied().unwrap_or(0);
                UbReward {
                    character_id: *character_id,
                    raw,
                    earned: raw.min(reward_cap).max(0),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> GaugeConfig {
        GaugeConfig {
            tick_secs: 5.0,
            scale: 0.01,
            kill_decay: 0,
            enemy_decay_rate: 0.0,
            dark_threshold: 800_000,
        }
    }

    fn round_match() -> UltimateMatch {
        let game = UltimateMatch::new(
            MatchId(1),
            ZoneKey::new(20, 0),
            vec![CharacterId(1), CharacterId(2)],
            vec![],
        );
        game.join(CharacterId(1)).unwrap();
        assert!(game.begin_round(ServerTime::ZERO));
        game
    }

    #[test]
    fn gauge_rises_by_kill_value_times_scale_each_tick() {
        let game = round_match();
        game.spawn_enemy(EntityId(50), 1_000);

        let mut epoch = 0;
        for expected in [10, 20, 30] {
            let outcome = game
                .run_tick(&cfg(), ServerTime::from_micros(1), epoch)
                .expect("live tick");
            assert_eq!(outcome.gauge, expected);
            assert!(!outcome.dark);
            assert!(outcome.crossings.is_empty());
            epoch = outcome.next_epoch;
        }
    }

    #[test]
    fn stale_epoch_tick_is_a_no_op() {
        let game = round_match();
        game.spawn_enemy(EntityId(50), 1_000);

        let outcome = game.run_tick(&cfg(), ServerTime::from_micros(1), 0).unwrap();
        assert_eq!(outcome.gauge, 10);

        // a duplicate callback with the spent epoch changes nothing
        assert!(game.run_tick(&cfg(), ServerTime::from_micros(2), 0).is_none());
        assert_eq!(game.gauge(), 10);
    }

    #[test]
    fn kill_decay_applies_only_on_killing_ticks() {
        let game = round_match();
        let mut cfg = cfg();
        cfg.kill_decay = 3;
        game.spawn_enemy(EntityId(50), 1_000);
        game.spawn_enemy(EntityId(51), 500);

        let outcome = game.run_tick(&cfg, ServerTime::from_micros(1), 0).unwrap();
        assert_eq!(outcome.gauge, 15);

        assert_eq!(game.note_enemy_killed(EntityId(51)), Some(500));
        let outcome = game.run_tick(&cfg, ServerTime::from_micros(2), 1).unwrap();
        // only the surviving enemy feeds the gauge, minus the decay constant
        assert_eq!(outcome.gauge, 15 + 10 - 3);

        let outcome = game.run_tick(&cfg, ServerTime::from_micros(3), 2).unwrap();
        assert_eq!(outcome.gauge, 22 + 10);
    }

    #[test]
    fn enemy_kill_value_decays_to_ten_percent_floor() {
        let game = round_match();
        let mut cfg = cfg();
        cfg.enemy_decay_rate = 0.5;
        game.spawn_enemy(EntityId(50), 1_000);

        let first = game.run_tick(&cfg, ServerTime::from_micros(1), 0).unwrap();
        assert_eq!(first.gauge, 10);

        let second = game.run_tick(&cfg, ServerTime::from_micros(2), 1).unwrap();
        assert_eq!(second.gauge - first.gauge, 5);

        // decay for a while; the per-tick delta bottoms out at 10% of start
        let mut epoch = second.next_epoch;
        let mut previous = second.gauge;
        let mut last_delta = 0;
        for _ in 0..10 {
            let outcome = game.run_tick(&cfg, ServerTime::from_micros(3), epoch).unwrap();
            last_delta = outcome.gauge - previous;
            previous = outcome.gauge;
            epoch = outcome.next_epoch;
        }
        assert_eq!(last_delta, 1);
    }

    #[test]
    fn triggers_fire_once_per_direction() {
        let game = UltimateMatch::new(
            MatchId(2),
            ZoneKey::new(20, 0),
            vec![CharacterId(1)],
            vec![25],
        );
        game.join(CharacterId(1)).unwrap();
        game.begin_round(ServerTime::ZERO);

        let mut cfg = cfg();
        cfg.kill_decay = 40;
        game.spawn_enemy(EntityId(50), 3_000);

        // tick 1: 0 -> 30, crosses 25 upward
        let outcome = game.run_tick(&cfg, ServerTime::from_micros(1), 0).unwrap();
        assert_eq!(outcome.gauge, 30);
        assert_eq!(outcome.crossings, vec![(25, true)]);

        // killing the boss drags the gauge back under: 30 -> 20
        assert!(game.note_enemy_killed(EntityId(50)).is_some());
        game.spawn_enemy(EntityId(51), 3_000);
        let outcome = game.run_tick(&cfg, ServerTime::from_micros(2), 1).unwrap();
        assert_eq!(outcome.gauge, 20);
        assert_eq!(outcome.crossings, vec![(25, false)]);

        // re-crossing in either direction stays silent
        let outcome = game.run_tick(&cfg, ServerTime::from_micros(3), 2).unwrap();
        assert_eq!(outcome.gauge, 50);
        assert!(outcome.crossings.is_empty());
    }

    #[test]
    fn phase_timer_fires_once_and_bounds_tick_delay() {
        let game = round_match();
        let cfg = cfg();

        game.set_phase_timer(ServerTime::from_micros(8_000_000), "boss_enrage");

        // timer 8s out, periodic tick 5s: periodic wins
        assert_eq!(game.next_tick_delay(&cfg, ServerTime::ZERO), 5.0);
        // 5s in, the timer is 3s out and bounds the reschedule
        let now = ServerTime::from_micros(5_000_000);
        assert_eq!(game.next_tick_delay(&cfg, now), 3.0);

        // not expired yet
        let outcome = game.run_tick(&cfg, now, 0).unwrap();
        assert!(outcome.timer_event.is_none());

        // expired: the event fires and the timer fields clear
        let now = ServerTime::from_micros(8_000_000);
        let outcome = game.run_tick(&cfg, now, 1).unwrap();
        assert_eq!(outcome.timer_event.as_deref(), Some("boss_enrage"));

        let outcome = game.run_tick(&cfg, ServerTime::from_micros(9_000_000), 2).unwrap();
        assert!(outcome.timer_event.is_none());
        assert_eq!(game.next_tick_delay(&cfg, ServerTime::from_micros(9_000_000)), 5.0);
    }

    #[test]
    fn phase_cap_overflow_ends_the_match() {
        let game = round_match();
        let now = ServerTime::from_micros(1);

        assert_eq!(game.advance_phase(5, now).unwrap().phase, 5);
        assert_eq!(game.phase(), 5);
        assert!(matches!(
            game.advance_phase(4, now),
            Err(MatchError::PhaseRegression { current: 5, requested: 4 })
        ));

        let outcome = game.advance_phase(6, now).unwrap();
        assert!(outcome.ended);
        assert_eq!(game.state(), UbState::Complete);
    }

    #[test]
    fn round_without_joiners_is_torn_down() {
        let game = UltimateMatch::new(
            MatchId(3),
            ZoneKey::new(20, 0),
            vec![CharacterId(1)],
            vec![],
        );
        assert!(!game.begin_round(ServerTime::from_micros(1)));
        assert_eq!(game.state(), UbState::Complete);
    }

    #[test]
    fn settlement_caps_earned_currency() {
        let game = round_match();
        game.add_points(CharacterId(1), 14_000);
        game.complete(ServerTime::from_micros(1));

        let rewards = game.settle(10_000);
        assert_eq!(rewards.len(), 1);
        assert_eq!(rewards[0].raw, 14_000);
        assert_eq!(rewards[0].earned, 10_000);
    }
}
