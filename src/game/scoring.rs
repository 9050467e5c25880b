//! Point, GP and BP computation
//!
//! Pure functions over match statistics. The match state machines call these
//! under their own locks; nothing here does I/O.

use crate::game::{Placement, TeamSide};

/// Hard upper cap on a team's score
pub const TEAM_SCORE_CAP: i32 = 5_000 * 10;

/// Outcome of applying a point delta to a team score
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointsOutcome {
    /// The delta actually applied after clamping
    pub applied: i32,
    pub total: i32,
    /// The variant's max-points threshold was newly reached
    pub crossed_threshold: bool,
}

/// Apply a score delta with the cap rules: the total stays in
/// [0, TEAM_SCORE_CAP], and once a configured max-points threshold has been
/// reached the score can never be pushed back under it.
pub fn apply_team_points(
    current: i32,
    delta: i32,
    max_threshold: Option<i32>,
    threshold_reached: bool,
) -> PointsOutcome {
    let mut total = current.saturating_add(delta).clamp(0, TEAM_SCORE_CAP);

    if threshold_reached {
        if let Some(threshold) = max_threshold {
            total = total.max(threshold);
        }
    }

    let crossed_threshold = match max_threshold {
        Some(threshold) => !threshold_reached && total >= threshold,
        None => false,
    };

    PointsOutcome {
        applied: total - current,
        total,
        crossed_threshold,
    }
}

/// Final placements from scores, or from forfeit when a side is absent
pub fn placements(score: [i32; 2], forfeit_winner: Option<TeamSide>) -> [Placement; 2] {
    if let Some(winner) = forfeit_winner {
        let mut result = [Placement::Lose, Placement::Lose];
        result[winner.index()] = Placement::Win;
        return result;
    }

    use std::cmp::Ordering;
    match score[0].cmp(&score[1]) {
        Ordering::Greater => [Placement::Win, Placement::Lose],
        Ordering::Less => [Placement::Lose, Placement::Win],
        Ordering::Equal => [Placement::Draw, Placement::Draw],
    }
}

/// Inputs to one player's reward computation
#[derive(Debug, Clone)]
pub struct RewardInput {
    pub placement: Placement,
    pub kills: u32,
    pub deaths: u32,
    /// Match time left when the timer stopped
    pub time_remaining_secs: f64,
    /// Multiplicative trophy boost (1.0 = no trophies)
    pub trophy_boost: f64,
    /// Left before the end: forfeits BP, GP still applies
    pub dropped: bool,
    /// Current ranking score
    pub gp: i32,
    /// GP floor of the rank already held
    pub rank_threshold: i32,
}

/// GP (ranking point) change. Deterministic in the inputs; the result never
/// takes the holder's GP below their rank-up threshold.
pub fn gp_delta(input: &RewardInput) -> i32 {
    let base = match input.placement {
        Placement::Win => 40,
        Placement::Draw => 12,
        Placement::Lose => -24,
    };

    let performance = input.kills as i32 * 3 - input.deaths as i32 * 2;

    // finishing early is only worth anything to the winner
    let time_bonus = if matches!(input.placement, Placement::Win) {
        (input.time_remaining_secs / 60.0) as i32
    } else {
        0
    };

    let delta = base + performance + time_bonus;
    let floored = (input.gp + delta).max(input.rank_threshold);
    floored - input.gp
}

/// BP (reward currency) earned. Dropping forfeits it entirely.
pub fn bp_earned(input: &RewardInput) -> i64 {
    if input.dropped {
        return 0;
    }

    let base: i64 = match input.placement {
        Placement::Win => 300,
        Placement::Draw => 150,
        Placement::Lose => 80,
    };

    let raw = base + input.kills as i64 * 20;
    (raw as f64 * input.trophy_boost) as i64
}

/// Experience granted after settlement
pub fn experience_granted(input: &RewardInput) -> u64 {
    let base: u64 = match input.placement {
        Placement::Win => 1200,
        Placement::Draw => 600,
        Placement::Lose => 300,
    };
    base + input.kills as u64 * 50
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reward(placement: Placement) -> RewardInput {
        RewardInput {
            placement,
            kills: 0,
            deaths: 0,
            time_remaining_secs: 0.0,
            trophy_boost: 1.0,
            dropped: false,
            gp: 0,
            rank_threshold: 0,
        }
    }

    #[test]
    fn score_stays_within_caps_for_any_delta_sequence() {
        let deltas = [30_000, 30_000, -200_000, 45, 60_000, -1];
        let mut total = 0;
        for delta in deltas {
            let outcome = apply_team_points(total, delta, None, false);
            total = outcome.total;
            assert!((0..=TEAM_SCORE_CAP).contains(&total));
        }
    }

    #[test]
    fn threshold_once_reached_is_a_floor() {
        let threshold = Some(3_000);

        let outcome = apply_team_points(2_990, 20, threshold, false);
        assert_eq!(outcome.total, 3_010);
        assert!(outcome.crossed_threshold);

        // after the crossing, negative deltas cannot pull the score back under
        let outcome = apply_team_points(3_010, -500, threshold, true);
        assert_eq!(outcome.total, 3_000);
        assert_eq!(outcome.applied, -10);
        assert!(!outcome.crossed_threshold);
    }

    #[test]
    fn zero_net_delta_reports_zero_applied() {
        let outcome = apply_team_points(0, -50, None, false);
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.total, 0);
    }

    #[test]
    fn placements_follow_scores_and_forfeit() {
        assert_eq!(
            placements([10, 5], None),
            [Placement::Win, Placement::Lose]
        );
        assert_eq!(placements([5, 5], None), [Placement::Draw, Placement::Draw]);
        assert_eq!(
            placements([0, 100], Some(TeamSide::Alpha)),
            [Placement::Win, Placement::Lose]
        );
    }

    #[test]
    fn gp_never_regresses_below_rank_threshold() {
        let mut input = reward(Placement::Lose);
        input.deaths = 8;
        input.gp = 310;
        input.rank_threshold = 300;

        let delta = gp_delta(&input);
        assert_eq!(input.gp + delta, 300);
    }

    #[test]
    fn dropping_forfeits_bp_but_not_gp() {
        let mut input = reward(Placement::Win);
        input.kills = 4;
        input.dropped = true;

        assert_eq!(bp_earned(&input), 0);
        assert!(gp_delta(&input) > 0);
    }

    #[test]
    fn trophy_boost_scales_bp() {
        let mut input = reward(Placement::Win);
        input.kills = 5;
        let plain = bp_earned(&input);

        input.trophy_boost = 1.5;
        assert_eq!(bp_earned(&input), (plain as f64 * 1.5) as i64);
    }
}
