//! Base occupation - the two-phase capture protocol
//!
//! Starting a capture claims the base for an entity and stamps an
//! occupy-start-time token. The deferred finalization callback must present
//! the same token: the scheduler cannot cancel callbacks, so the token is the
//! only thing standing between a late callback and someone else's occupation.

use crate::game::pvp::{PvpMatch, PvpState};
use crate::game::{CharacterId, MatchError, TeamSide};
use crate::util::time::ServerTime;
use crate::zone::entity::EntityId;

/// Mutable state of one capturable base, keyed by its entity id
#[derive(Debug, Clone)]
pub struct BaseState {
    pub slot: u8,
    pub owner: Option<TeamSide>,
    pub occupier: Option<EntityId>,
    /// Identity token for the pending finalization, not an elapsed-time value
    pub occupy_started: Option<ServerTime>,
    /// Identity token for ownership bonus ticks
    pub owner_since: Option<ServerTime>,
}

impl BaseState {
    pub fn new(slot: u8) -> Self {
        Self {
            slot,
            owner: None,
            occupier: None,
            occupy_started: None,
            owner_since: None,
        }
    }
}

/// Receipt for a started capture; carries the finalization token
#[derive(Debug, Clone, Copy)]
pub struct CaptureTicket {
    pub token: ServerTime,
    pub team: TeamSide,
    pub capturer: CharacterId,
}

/// What a finalization callback found when it fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The occupation held; the base now belongs to `team`
    Finalized {
        team: TeamSide,
        capturer: CharacterId,
    },
    /// The occupier left; the base reverted to unclaimed
    OccupierLeft,
    /// A different occupation is in effect; nothing to do
    Stale,
}

impl PvpMatch {
    /// Atomically claim a base for an entity. Rejected while any occupation
    /// is in effect, and for a base the entity's own team already holds.
    pub fn begin_capture(
        &self,
        base_id: EntityId,
        entity_id: EntityId,
        now: ServerTime,
    ) -> Result<CaptureTicket, MatchError> {
        let mut inner = self.lock_inner();
        if inner.state != PvpState::Active {
            return Err(MatchError::NotActive);
        }

        let (team, capturer) = inner
            .players
            .iter()
            .find(|player| player.entity_id == Some(entity_id))
            .map(|player| (player.team, player.character_id))
            .ok_or(MatchError::UnknownEntity(entity_id))?;

        let base = inner
            .bases
            .get_mut(&base_id)
            .ok_or(MatchError::UnknownBase(base_id))?;

        if base.occupier.is_some() || base.owner == Some(team) {
            return Err(MatchError::BaseBusy(base_id));
        }

        base.occupier = Some(entity_id);
        base.occupy_started = Some(now);
        Ok(CaptureTicket {
            token: now,
            team,
            capturer,
        })
    }

    /// Finalize a capture started earlier. Only the occupation matching the
    /// start-time token is finalized; a cleared occupation reverts the base
    /// to unclaimed, and any other occupation makes this a no-op.
    pub fn complete_capture(
        &self,
        base_id: EntityId,
        entity_id: EntityId,
        token: ServerTime,
        now: ServerTime,
    ) -> CaptureOutcome {
        let mut inner = self.lock_inner();
        if inner.state != PvpState::Active {
            return CaptureOutcome::Stale;
        }

        let team = inner
            .players
            .iter()
            .find(|player| player.entity_id == Some(entity_id))
            .map(|player| (player.team, player.character_id));

        let Some(base) = inner.bases.get_mut(&base_id) else {
            return CaptureOutcome::Stale;
        };

        if base.occupier == Some(entity_id) && base.occupy_started == Some(token) {
            let Some((team, capturer)) = team else {
                // the capturing entity despawned with the occupation intact
                base.occupier = None;
                base.occupy_started = None;
                base.owner = None;
                return CaptureOutcome::OccupierLeft;
            };
            base.occupier = None;
            base.occupy_started = None;
            base.owner = Some(team);
            base.owner_since = Some(now);
            return CaptureOutcome::Finalized { team, capturer };
        }

        if base.occupier.is_none() && base.occupy_started == Some(token) {
            // this same occupation was abandoned; revert to unclaimed
            base.occupy_started = None;
            base.owner = None;
            base.owner_since = None;
            return CaptureOutcome::OccupierLeft;
        }

        // a different occupation (or none of ours) is in effect
        CaptureOutcome::Stale
    }

    /// The occupier walked off the base before finalization. The start-time
    /// token stays behind so the pending callback can tell this abandoned
    /// occupation apart from whatever happens to the base afterwards.
    pub fn leave_base(&self, base_id: EntityId, entity_id: EntityId) -> bool {
        let mut inner = self.lock_inner();
        let Some(base) = inner.bases.get_mut(&base_id) else {
            return false;
        };
        if base.occupier != Some(entity_id) {
            return false;
        }
        base.occupier = None;
        true
    }

    /// Whether a scheduled bonus tick still refers to the live ownership
    pub fn bonus_tick_valid(
        &self,
        base_id: EntityId,
        team: TeamSide,
        owner_token: ServerTime,
    ) -> bool {
        let inner = self.lock_inner();
        if inner.state != PvpState::Active {
            return false;
        }
        inner
            .bases
            .get(&base_id)
            .map(|base| base.owner == Some(team) && base.owner_since == Some(owner_token))
            .unwrap_or(false)
    }

    pub fn base_owner(&self, base_id: EntityId) -> Option<TeamSide> {
        self.lock_inner()
            .bases
            .get(&base_id)
            .and_then(|base| base.owner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::game::pvp::PvpVariantDef;
    use crate::game::{MatchId, MatchType};
    use crate::zone::InstanceId;

    const BASE: EntityId = EntityId(100);

    fn active_match() -> PvpMatch {
        let game = PvpMatch::new(
            MatchId(1),
            MatchType::Fate,
            Arc::new(PvpVariantDef {
                variant_id: 1,
                zone_def_id: 10,
                duration_secs: 600.0,
                max_points: None,
                base_capture_points: 100,
                base_bonus_points: 10,
                base_bonus_interval_secs: 30.0,
            }),
            InstanceId(1),
            ServerTime::ZERO,
            [vec![CharacterId(1)], vec![CharacterId(2)]],
            vec![(BASE, 0)],
        );
        game.mark_present(CharacterId(1), EntityId(11)).unwrap();
        game.mark_present(CharacterId(2), EntityId(22)).unwrap();
        game.activate(ServerTime::ZERO).unwrap();
        game
    }

    #[test]
    fn capture_finalizes_with_matching_token() {
        let game = active_match();
        let t1 = ServerTime::from_micros(100);

        let ticket = game.begin_capture(BASE, EntityId(11), t1).unwrap();
        assert_eq!(ticket.team, TeamSide::Alpha);

        let outcome =
            game.complete_capture(BASE, EntityId(11), ticket.token, ServerTime::from_micros(600));
        assert!(matches!(
            outcome,
            CaptureOutcome::Finalized {
                team: TeamSide::Alpha,
                ..
            }
        ));
        assert_eq!(game.base_owner(BASE), Some(TeamSide::Alpha));
    }

    #[test]
    fn stale_token_never_changes_base_state() {
        let game = active_match();

        let first = game
            .begin_capture(BASE, EntityId(11), ServerTime::from_micros(100))
            .unwrap();
        assert!(game.leave_base(BASE, EntityId(11)));

        // the enemy starts a fresh occupation before the old callback fires
        let second = game
            .begin_capture(BASE, EntityId(22), ServerTime::from_micros(300))
            .unwrap();

        // the late callback for the first occupation must not touch anything
        let outcome =
            game.complete_capture(BASE, EntityId(11), first.token, ServerTime::from_micros(700));
        assert_eq!(outcome, CaptureOutcome::Stale);
        assert_eq!(game.base_owner(BASE), None);

        // the live occupation still finalizes normally
        let outcome =
            game.complete_capture(BASE, EntityId(22), second.token, ServerTime::from_micros(900));
        assert!(matches!(outcome, CaptureOutcome::Finalized { team: TeamSide::Beta, .. }));
    }

    #[test]
    fn abandoned_occupation_reverts_to_unclaimed() {
        let game = active_match();

        let ticket = game
            .begin_capture(BASE, EntityId(11), ServerTime::from_micros(100))
            .unwrap();
        assert!(game.leave_base(BASE, EntityId(11)));

        let outcome =
            game.complete_capture(BASE, EntityId(11), ticket.token, ServerTime::from_micros(600));
        assert_eq!(outcome, CaptureOutcome::OccupierLeft);
        assert_eq!(game.base_owner(BASE), None);
    }

    #[test]
    fn stale_token_cannot_unclaim_a_finalized_base() {
        let game = active_match();

        // an early occupation is abandoned; its callback is still pending
        let old = game
            .begin_capture(BASE, EntityId(11), ServerTime::from_micros(100))
            .unwrap();
        assert!(game.leave_base(BASE, EntityId(11)));

        // the enemy occupies and finalizes in the meantime
        let flip = game
            .begin_capture(BASE, EntityId(22), ServerTime::from_micros(200))
            .unwrap();
        game.complete_capture(BASE, EntityId(22), flip.token, ServerTime::from_micros(700));
        assert_eq!(game.base_owner(BASE), Some(TeamSide::Beta));

        // the abandoned occupation's late callback must not touch ownership
        let outcome =
            game.complete_capture(BASE, EntityId(11), old.token, ServerTime::from_micros(900));
        assert_eq!(outcome, CaptureOutcome::Stale);
        assert_eq!(game.base_owner(BASE), Some(TeamSide::Beta));
    }

    #[test]
    fn occupied_base_rejects_second_claim() {
        let game = active_match();
        game.begin_capture(BASE, EntityId(11), ServerTime::from_micros(100))
            .unwrap();

        let err = game
            .begin_capture(BASE, EntityId(22), ServerTime::from_micros(150))
            .unwrap_err();
        assert!(matches!(err, MatchError::BaseBusy(_)));
    }

    #[test]
    fn own_team_cannot_recapture_held_base() {
        let game = active_match();
        let ticket = game
            .begin_capture(BASE, EntityId(11), ServerTime::from_micros(100))
            .unwrap();
        game.complete_capture(BASE, EntityId(11), ticket.token, ServerTime::from_micros(600));

        assert!(matches!(
            game.begin_capture(BASE, EntityId(11), ServerTime::from_micros(700)),
            Err(MatchError::BaseBusy(_))
        ));
        // the enemy may still flip it
        assert!(game
            .begin_capture(BASE, EntityId(22), ServerTime::from_micros(800))
            .is_ok());
    }

    #[test]
    fn bonus_tick_token_tracks_ownership_epoch() {
        let game = active_match();
        let ticket = game
            .begin_capture(BASE, EntityId(11), ServerTime::from_micros(100))
            .unwrap();
        let owner_at = ServerTime::from_micros(600);
        game.complete_capture(BASE, EntityId(11), ticket.token, owner_at);

        assert!(game.bonus_tick_valid(BASE, TeamSide::Alpha, owner_at));
        assert!(!game.bonus_tick_valid(BASE, TeamSide::Beta, owner_at));
        assert!(!game.bonus_tick_valid(BASE, TeamSide::Alpha, ServerTime::from_micros(601)));

        // a flip invalidates the old epoch
        let flip = game
            .begin_capture(BASE, EntityId(22), ServerTime::from_micros(700))
            .unwrap();
        let flipped_at = ServerTime::from_micros(1_200);
        game.complete_capture(BASE, EntityId(22), flip.token, flipped_at);
        assert!(!game.bonus_tick_valid(BASE, TeamSide::Alpha, owner_at));
        assert!(game.bonus_tick_valid(BASE, TeamSide::Beta, flipped_at));
    }
}
