//! Trophy computation
//!
//! Pure computation over a completed match's instance stats: for each
//! category, find the winning players (ties share the trophy) and accumulate
//! a multiplicative reward boost. The Valhalla sub-kind swaps the
//! survival-oriented categories for a loss-oriented one and remaps every
//! trophy id by a fixed shift - an id transformation, the catalogue itself is
//! shared.

use std::collections::HashMap;

use crate::game::pvp::PvpPlayerStats;
use crate::game::{CharacterId, MatchType};

pub const DAMAGE_DEALT_FIRST: u16 = 1;
pub const DAMAGE_DEALT_MAX: u16 = 2;
pub const DAMAGE_TAKEN_FIRST: u16 = 3;
pub const DAMAGE_TAKEN_MAX: u16 = 4;
pub const BASE_OWNER_FIRST: u16 = 5;
pub const BASE_OWNER_LAST: u16 = 6;
pub const KILL_MAX: u16 = 7;
pub const DEATH_MIN: u16 = 8;
pub const STATUS_MAX: u16 = 9;
pub const DAMAGE_PER_DEATH_MAX: u16 = 10;
pub const KILL_PER_DEATH_MAX: u16 = 11;
pub const MVP: u16 = 12;
/// Loss-oriented category awarded only in Valhalla
pub const DEATH_MAX: u16 = 13;

/// Valhalla trophies carry the same catalogue ids shifted by this amount
pub const VALHALLA_ID_SHIFT: u16 = 100;

/// Trophies and reward boosts for every player in one match
#[derive(Debug, Default)]
pub struct TrophySet {
    awards: HashMap<CharacterId, Vec<u16>>,
    boosts: HashMap<CharacterId, f64>,
}

impl TrophySet {
    pub fn trophies(&self, character_id: CharacterId) -> &[u16] {
        self.awards
            .get(&character_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Multiplicative reward boost; 1.0 for players with no trophies
    pub fn boost(&self, character_id: CharacterId) -> f64 {
        self.boosts.get(&character_id).copied().unwrap_or(1.0)
    }

    fn award(&mut self, winners: &[CharacterId], id: u16, magnitude: f64) {
        for winner in winners {
            self.awards.entry(*winner).or_default().push(id);
            let boost = self.boosts.entry(*winner).or_insert(1.0);
            *boost *= 1.0 + magnitude;
        }
    }
}

/// Per-category boost magnitude, differing by match sub-kind
fn magnitude(category: u16, kind: MatchType) -> f64 {
    let valhalla = kind == MatchType::Valhalla;
    match category {
        MVP => {
            if valhalla {
                0.20
            } else {
                0.30
            }
        }
        KILL_MAX | DEATH_MAX => {
            if valhalla {
                0.15
            } else {
                0.20
            }
        }
        DAMAGE_PER_DEATH_MAX | KILL_PER_DEATH_MAX => {
            if valhalla {
                0.10
            } else {
                0.15
            }
        }
        _ => {
            if valhalla {
                0.05
            } else {
                0.10
            }
        }
    }
}

/// Every player sharing the maximum of `key`, skipping non-qualifiers
fn max_winners<K, F>(stats: &[PvpPlayerStats], key: F) -> Vec<CharacterId>
where
    K: PartialOrd + Copy,
    F: Fn(&PvpPlayerStats) -> Option<K>,
{
    let best = stats.iter().filter_map(&key).fold(None::<K>, |acc, value| {
        match acc {
            Some(current) if current >= value => Some(current),
            _ => Some(value),
        }
    });

    let Some(best) = best else {
        return Vec::new();
    };

    stats
        .iter()
        .filter(|player| key(player) == Some(best))
        .map(|player| player.character_id)
        .collect()
}

/// Every player sharing the minimum of `key`
fn min_winners<K, F>(stats: &[PvpPlayerStats], key: F) -> Vec<CharacterId>
where
    K: PartialOrd + Copy,
    F: Fn(&PvpPlayerStats) -> Option<K>,
{
    let best = stats.iter().filter_map(&key).fold(None::<K>, |acc, value| {
        match acc {
            Some(current) if current <= value => Some(current),
            _ => Some(value),
        }
    });

    let Some(best) = best else {
        return Vec::new();
    };

    stats
        .iter()
        .filter(|player| key(player) == Some(best))
        .map(|player| player.character_id)
        .collect()
}

/// Ratio with the zero-denominator case pinned to a denominator of one
fn per_death(value: f64, deaths: u32) -> f64 {
    value / deaths.max(1) as f64
}

/// MVP score: kills and base work forward, deaths against
fn mvp_score(player: &PvpPlayerStats) -> i64 {
    player.kills as i64 * 300
        + player.base_points as i64
        + player.damage_dealt_max as i64
        - player.deaths as i64 * 200
}

/// Compute the full trophy catalogue for one finished match
pub fn compute_trophies(kind: MatchType, stats: &[PvpPlayerStats]) -> TrophySet {
    let mut set = TrophySet::default();
    if stats.is_empty() {
        return set;
    }

    let valhalla = kind == MatchType::Valhalla;
    let shift = if valhalla { VALHALLA_ID_SHIFT } else { 0 };

    let grant = |set: &mut TrophySet, winners: Vec<CharacterId>, category: u16| {
        if winners.is_empty() {
            return;
        }
        set.award(&winners, category + shift, magnitude(category, kind));
    };

    grant(
        &mut set,
        min_winners(stats, |p| p.first_damage_dealt.map(|t| t.as_micros())),
        DAMAGE_DEALT_FIRST,
    );
    grant(
        &mut set,
        max_winners(stats, |p| (p.damage_dealt_max > 0).then_some(p.damage_dealt_max)),
        DAMAGE_DEALT_MAX,
    );
    grant(
        &mut set,
        min_winners(stats, |p| p.first_damage_taken.map(|t| t.as_micros())),
        DAMAGE_TAKEN_FIRST,
    );
    grant(
        &mut set,
        max_winners(stats, |p| (p.damage_taken_max > 0).then_some(p.damage_taken_max)),
        DAMAGE_TAKEN_MAX,
    );
    grant(
        &mut set,
        min_winners(stats, |p| p.first_base_capture.map(|t| t.as_micros())),
        BASE_OWNER_FIRST,
    );
    grant(
        &mut set,
        max_winners(stats, |p| p.last_base_capture.map(|t| t.as_micros())),
        BASE_OWNER_LAST,
    );
    grant(
        &mut set,
        max_winners(stats, |p| (p.kills > 0).then_some(p.kills)),
        KILL_MAX,
    );
    grant(
        &mut set,
        max_winners(stats, |p| (p.status_effects > 0).then_some(p.status_effects)),
        STATUS_MAX,
    );
    grant(
        &mut set,
        max_winners(stats, |p| {
            (p.damage_dealt_max > 0).then_some(per_death(p.damage_dealt_max as f64, p.deaths))
        }),
        DAMAGE_PER_DEATH_MAX,
    );
    grant(&mut set, max_winners(stats, |p| Some(mvp_score(p))), MVP);

    if valhalla {
        // the loss-oriented substitute replaces the survival categories
        grant(
            &mut set,
            max_winners(stats, |p| (p.deaths > 0).then_some(p.deaths)),
            DEATH_MAX,
        );
    } else {
        grant(&mut set, min_winners(stats, |p| Some(p.deaths)), DEATH_MIN);
        grant(
            &mut set,
            max_winners(stats, |p| {
                (p.kills > 0).then_some(per_death(p.kills as f64, p.deaths))
            }),
            KILL_PER_DEATH_MAX,
        );
    }

    set
}
