//! Match manager - the public surface invoked by the packet-dispatch layer
//!
//! Owns the process-wide queue map, pending-invite sets, penalty cache and
//! the registries of live matches. Every operation takes its own short lock
//! scope, releases, and only then sends notices or touches the store. Timer
//! callbacks re-enter through here and must survive the referenced match or
//! zone having been torn down in the interim.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::game::base::CaptureOutcome;
use crate::game::pvp::{PvpMatch, PvpState, PvpVariantDef};
use crate::game::queue::{MatchEntry, QueueError, QueueMap, Team, TeamRoster};
use crate::game::ultimate::{GaugeConfig, UbState, UltimateMatch};
use crate::game::{scoring, trophy, CharacterId, MatchError, MatchId, MatchType, TeamId, TeamSide};
use crate::net::{ConnectionRegistry, FailCode, Notice, PlacementEntry, RewardEntry};
use crate::store::{
    ChangeSet, ExperienceGrant, PvpRecord, RecordData, RecordKind, RecordStore, UltimateRecord,
};
use crate::sync::{PvpMatchAssignment, WorldSync};
use crate::util::rate_limit::QueueRateLimiter;
use crate::util::sched::Scheduler;
use crate::util::time::{unix_millis, ServerTime};
use crate::zone::entity::{EntityData, EntityId, EntityRecord};
use crate::zone::{InstanceAccess, ZoneKey, ZoneManager};

const ENTRY_KIND: &str = "match_entry";

/// Boxed, `Send` future used to break the auto-trait inference cycle on the
/// self-rescheduling timer callbacks below.
type BoxFut<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Lobby state for the cooperative lottery
struct UltimateLobby {
    pending: Vec<CharacterId>,
    /// A recruitment window is scheduled
    recruiting: bool,
    /// Staleness token for the scheduled window callback
    window_epoch: u64,
    /// When the scheduled window draws
    window_closes_at: ServerTime,
    active: Option<Arc<UltimateMatch>>,
}

/// The match/zone concurrency core's front door
pub struct MatchManager {
    cfg: Arc<Config>,
    sched: Scheduler,
    zones: Arc<ZoneManager>,
    connections: Arc<ConnectionRegistry>,
    store: Arc<dyn RecordStore>,
    sync: Arc<WorldSync>,

    queue: QueueMap,
    teams: TeamRoster,
    variants: DashMap<u32, Arc<PvpVariantDef>>,
    pvp_matches: DashMap<MatchId, Arc<PvpMatch>>,
    /// Characters still owing a yes/no per match id
    pending_invites: DashMap<MatchId, HashSet<CharacterId>>,
    /// Local cache of decline-penalty counters
    penalties: DashMap<CharacterId, u32>,

    ultimate: Mutex<UltimateLobby>,
    next_local_match_id: AtomicU64,

    join_limiter: QueueRateLimiter,
    rng: Mutex<ChaCha8Rng>,
}

impl MatchManager {
    pub fn new(
        cfg: Arc<Config>,
        sched: Scheduler,
        zones: Arc<ZoneManager>,
        connections: Arc<ConnectionRegistry>,
        store: Arc<dyn RecordStore>,
        sync: Arc<WorldSync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            sched,
            zones,
            connections,
            store,
            sync,
            queue: QueueMap::new(),
            teams: TeamRoster::new(),
            variants: DashMap::new(),
            pvp_matches: DashMap::new(),
            pending_invites: DashMap::new(),
            penalties: DashMap::new(),
            ultimate: Mutex::new(UltimateLobby {
                pending: Vec::new(),
                recruiting: false,
                window_epoch: 0,
                window_closes_at: ServerTime::ZERO,
                active: None,
            }),
            next_local_match_id: AtomicU64::new(1),
            join_limiter: QueueRateLimiter::new(),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(rand::random())),
        })
    }

    /// Install adversarial variant definitions
    pub fn load_variants(&self, variants: Vec<PvpVariantDef>) {
        for variant in variants {
            self.variants.insert(variant.variant_id, Arc::new(variant));
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Flush outgoing world-sync events
    pub fn sync_outgoing(&self) {
        self.sync.sync_outgoing();
    }

    // ---- queue ----------------------------------------------------------

    /// Enter the queue for an adversarial match, solo or as team leader.
    /// All validation happens before any mutation.
    pub async fn join_queue(
        &self,
        requester: CharacterId,
        match_type: MatchType,
    ) -> Result<(), QueueError> {
        if !self.join_limiter.check_join(requester) {
            return Err(QueueError::RateLimited);
        }

        let (owner, participants, team_id) = match self.teams.team_of(requester) {
            Some(team) => {
                if team.leader != requester {
                    return Err(QueueError::NotTeamLeader(requester));
                }
                if !team.category.admits(match_type) {
                    return Err(QueueError::WrongTeamCategory {
                        category: team.category,
                        requested: match_type,
                    });
                }
                (requester, team.members.clone(), Some(team.id))
            }
            None => (requester, vec![requester], None),
        };

        for character_id in &participants {
            if self.queue.contains(*character_id) {
                return Err(QueueError::AlreadyQueued(*character_id));
            }
            if self.has_pending_match(*character_id) {
                return Err(QueueError::AlreadyInMatch(*character_id));
            }
        }
        for character_id in &participants {
            let count = self.penalty_count(*character_id).await;
            if count >= self.cfg.penalty_limit {
                return Err(QueueError::PenaltyLimit {
                    count,
                    limit: self.cfg.penalty_limit,
                });
            }
        }

        let entries: Vec<MatchEntry> = participants
            .iter()
            .map(|character_id| MatchEntry::new(*character_id, owner, match_type, team_id))
            .collect();
        self.queue.insert_all(entries.clone())?;

        for entry in &entries {
            self.sync.queue_changed(ENTRY_KIND, entry);
        }
        self.sync.sync_outgoing();

        for client in self.connections.clients_by_characters(&participants, true) {
            client.send(Notice::QueueEntered { match_type });
        }

        info!(owner = %owner, match_type = %match_type, members = participants.len(), "Queue entries created");
        Ok(())
    }

    /// Remove every entry owned by `requester` (the symmetric cancel path).
    /// Returns the number of entries removed.
    pub fn cancel_queue(&self, requester: CharacterId) -> usize {
        let removed = self.queue.remove_owned_by(requester);
        for entry in &removed {
            self.sync.queue_removed(ENTRY_KIND, entry.character_id.0);
        }
        self.sync.sync_outgoing();

        let ids: Vec<CharacterId> = removed.iter().map(|entry| entry.character_id).collect();
        for client in self.connections.clients_by_characters(&ids, true) {
            client.send(Notice::QueueCanceled {
                reason: "canceled".to_string(),
            });
        }

        if !removed.is_empty() {
            info!(owner = %requester, removed = removed.len(), "Queue entries canceled");
        }
        removed.len()
    }

    /// Whether a character is attached to a live adversarial match
    fn has_pending_match(&self, character_id: CharacterId) -> bool {
        self.pvp_matches.iter().any(|entry| {
            entry.value().state() != PvpState::Ended
                && entry.value().player_team(character_id).is_some()
        })
    }

    async fn penalty_count(&self, character_id: CharacterId) -> u32 {
        if let Some(count) = self.penalties.get(&character_id) {
            return *count.value();
        }
        let count = self
            .store
            .pvp_record(character_id)
            .await
            .map(|record| record.penalty_count)
            .unwrap_or(0);
        self.penalties.insert(character_id, count);
        count
    }

    /// Increment a decline penalty, best-effort persisted: a store failure
    /// is logged, the in-memory count stands either way.
    async fn bump_penalty(&self, character_id: CharacterId) {
        let count = self.penalty_count(character_id).await + 1;
        self.penalties.insert(character_id, count);

        let mut record = self
            .store
            .pvp_record(character_id)
            .await
            .unwrap_or_else(|| PvpRecord::new(character_id));
        record.penalty_count = count;
        record.updated_at = chrono::Utc::now();
        self.sync.queue_changed(RecordKind::Pvp.name(), &record);

        let mut change = ChangeSet::new();
        change.upsert(RecordData::Pvp(record));
        if !self.store.process_change_set(change).await {
            warn!(character_id = %character_id, "Penalty persist failed, in-memory count stands");
        }
    }

    // ---- world-originated batches ---------------------------------------

    /// Inbound queue reconciliation from the world process
    pub fn update_match_entries(&self, updates: Vec<MatchEntry>, removes: Vec<CharacterId>) {
        for entry in updates {
            debug!(character_id = %entry.character_id, "Queue entry updated from world");
            self.queue.apply_update(entry);
        }
        for character_id in removes {
            if self.queue.remove(character_id).is_some() {
                if let Some(client) = self.connections.client_by_character(character_id, true) {
                    client.send(Notice::QueueCanceled {
                        reason: "expired".to_string(),
                    });
                }
            }
        }
    }

    /// Inbound team roster reconciliation from the world process
    pub fn update_teams(&self, updates: Vec<Team>, removes: Vec<TeamId>) {
        for team in updates {
            self.teams.upsert(team);
        }
        for team_id in removes {
            self.teams.remove(team_id);
        }
    }

    /// Inbound match assignments from the world process. A record that does
    /// not resolve locally is logged and skipped; the batch continues.
    pub async fn update_pvp_matches(self: &Arc<Self>, assignments: Vec<PvpMatchAssignment>) {
        for assignment in assignments {
            if let Err(error) = self.install_pvp_match(&assignment) {
                error!(
                    match_id = %assignment.match_id,
                    variant = assignment.variant_id,
                    error = %error,
                    "Skipping world match that does not resolve locally"
                );
                let stranded: Vec<CharacterId> = assignment
                    .teams
                    .iter()
                    .flat_map(|side| side.iter().copied())
                    .collect();
                for client in self.connections.clients_by_characters(&stranded, true) {
                    client.send(Notice::Refused {
                        code: FailCode::InstanceUnavailable,
                    });
                }
            }
        }
        self.sync.sync_outgoing();
    }

    fn install_pvp_match(
        self: &Arc<Self>,
        assignment: &PvpMatchAssignment,
    ) -> Result<(), MatchError> {
        if !assignment.match_type.is_adversarial() {
            return Err(MatchError::InvariantViolated(
                "world assignment for non-adversarial type",
            ));
        }
        let variant = self
            .variants
            .get(&assignment.variant_id)
            .map(|entry| entry.value().clone())
            .ok_or(MatchError::InstanceUnavailable(assignment.variant_id))?;

        let participants: Vec<CharacterId> = assignment
            .teams
            .iter()
            .flat_map(|side| side.iter().copied())
            .collect();

        let instance = self
            .zones
            .create_instance(InstanceAccess {
                match_id: Some(assignment.match_id),
                allowed: participants.clone(),
                zone_defs: vec![variant.zone_def_id],
            })
            .map_err(|_| MatchError::InstanceUnavailable(assignment.variant_id))?;
        let zone = instance
            .primary_zone()
            .ok_or(MatchError::InvariantViolated("instance without zones"))?;

        let mut base_entities = Vec::new();
        for slot in 0..zone.def().base_slots {
            let entity_id = zone.allocate_entity_id();
            if zone
                .register_entity(EntityRecord::new(entity_id, EntityData::PvpBase { slot }))
                .is_ok()
            {
                base_entities.push((entity_id, slot));
            }
        }

        let ready_deadline = ServerTime::from_micros(assignment.ready_time)
            .add_secs(self.cfg.confirm_lead_secs);
        let game = Arc::new(PvpMatch::new(
            assignment.match_id,
            assignment.match_type,
            variant,
            instance.id,
            ready_deadline,
            assignment.teams.clone(),
            base_entities,
        ));

        if let Err(error) = zone.attach_match(assignment.match_id) {
            self.zones.destroy_instance(instance.id);
            error!(match_id = %assignment.match_id, error = %error, "Fresh instance zone already busy");
            return Err(MatchError::InvariantViolated("instance zone busy"));
        }

        self.pvp_matches.insert(assignment.match_id, game);
        self.pending_invites
            .insert(assignment.match_id, participants.iter().copied().collect());

        for character_id in &participants {
            self.queue
                .assign_match(*character_id, assignment.match_id, assignment.ready_time);
        }
        for client in self.connections.clients_by_characters(&participants, true) {
            client.send(Notice::ConfirmPrompt {
                match_id: assignment.match_id,
                match_type: assignment.match_type,
                deadline: ready_deadline.as_micros(),
            });
        }

        let manager = Arc::clone(self);
        let match_id = assignment.match_id;
        self.sched.schedule_at(ready_deadline, move || async move {
            manager.activate_pvp(match_id, ready_deadline).await;
        });

        info!(
            match_id = %assignment.match_id,
            match_type = %assignment.match_type,
            deadline = %ready_deadline,
            participants = participants.len(),
            "PvP match installed, confirmations pending"
        );
        Ok(())
    }

    // ---- confirmation ----------------------------------------------------

    fn pvp_match(&self, match_id: MatchId) -> Result<Arc<PvpMatch>, MatchError> {
        self.pvp_matches
            .get(&match_id)
            .map(|entry| entry.value().clone())
            .ok_or(MatchError::UnknownMatch(match_id))
    }

    /// Accept a confirm prompt: enters the caller into the match instance
    pub async fn confirm_match(
        &self,
        character_id: CharacterId,
        match_id: MatchId,
    ) -> Result<(), MatchError> {
        let game = self.pvp_match(match_id)?;
        if game.player_team(character_id).is_none() {
            return Err(MatchError::NotParticipant(character_id));
        }

        let was_invited = self
            .pending_invites
            .get_mut(&match_id)
            .map(|mut set| set.remove(&character_id))
            .unwrap_or(false);
        if !was_invited {
            return Err(MatchError::NotParticipant(character_id));
        }

        let instance = self
            .zones
            .instance(game.instance_id)
            .ok_or(MatchError::UnknownMatch(match_id))?;
        let zone = instance
            .primary_zone()
            .ok_or(MatchError::InvariantViolated("instance without zones"))?;

        let entity_id = zone.allocate_entity_id();
        let record = EntityRecord::new(
            entity_id,
            EntityData::PlayerCharacter {
                character_id,
                level: 0,
            },
        );
        let client = self.connections.client_by_character(character_id, true);
        let registered = match &client {
            Some(client) => zone.add_connection(client.clone(), record, None),
            None => zone.register_entity(record).map(|_| ()),
        };
        if let Err(error) = registered {
            error!(match_id = %match_id, character_id = %character_id, error = %error, "Instance entry failed");
            return Err(MatchError::InvariantViolated("instance entry failed"));
        }

        game.mark_present(character_id, entity_id)?;

        if let Some(client) = client {
            client.send(Notice::MatchConfirmed { match_id });
        }
        debug!(match_id = %match_id, character_id = %character_id, "Participant confirmed");
        Ok(())
    }

    /// Decline a confirm prompt. Declining costs a penalty; the persist is
    /// best-effort and never kills the client.
    pub async fn reject_match(
        &self,
        character_id: CharacterId,
        match_id: MatchId,
    ) -> Result<(), MatchError> {
        let game = self.pvp_match(match_id)?;
        if game.player_team(character_id).is_none() {
            return Err(MatchError::NotParticipant(character_id));
        }

        // emptying the invite set is fine; a missing entry just means the
        // deadline callback got here first
        if let Some(mut set) = self.pending_invites.get_mut(&match_id) {
            set.remove(&character_id);
        }

        game.mark_declined(character_id);
        if self.queue.remove(character_id).is_some() {
            self.sync.queue_removed(ENTRY_KIND, character_id.0);
        }
        self.bump_penalty(character_id).await;

        self.broadcast_instance(
            game.instance_id,
            Notice::MatchDeclined {
                match_id,
                character_id,
            },
        );
        if let Some(client) = self.connections.client_by_character(character_id, true) {
            client.send(Notice::QueueCanceled {
                reason: "declined".to_string(),
            });
        }
        self.sync.sync_outgoing();

        info!(match_id = %match_id, character_id = %character_id, "Participant declined");
        Ok(())
    }

    /// Deadline callback: auto-decline the silent, then start or forfeit.
    async fn activate_pvp(self: &Arc<Self>, match_id: MatchId, deadline_token: ServerTime) {
        let Ok(game) = self.pvp_match(match_id) else {
            debug!(match_id = %match_id, "Activation fired for a dismantled match");
            return;
        };
        if game.ready_deadline() != deadline_token || game.state() != PvpState::Confirming {
            debug!(match_id = %match_id, "Activation token stale");
            return;
        }

        // everyone still owing an answer is treated as a decline
        let silent: Vec<CharacterId> = self
            .pending_invites
            .remove(&match_id)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default();
        for character_id in silent {
            game.mark_declined(character_id);
            if self.queue.remove(character_id).is_some() {
                self.sync.queue_removed(ENTRY_KIND, character_id.0);
            }
            self.bump_penalty(character_id).await;
            if let Some(client) = self.connections.client_by_character(character_id, true) {
                client.send(Notice::QueueCanceled {
                    reason: "confirm_timeout".to_string(),
                });
            }
            self.broadcast_instance(
                game.instance_id,
                Notice::MatchDeclined {
                    match_id,
                    character_id,
                },
            );
        }

        let now = self.sched.now();
        if game.teams_active() {
            match game.activate(now) {
                Ok(expires) => {
                    self.notify_participants(&game, Notice::MatchStarted { match_id });
                    let manager = Arc::clone(self);
                    self.sched.schedule_at(expires, move || async move {
                        manager.expire_pvp(match_id, expires).await;
                    });
                    info!(match_id = %match_id, expires = %expires, "Match active");
                }
                Err(error) => {
                    error!(match_id = %match_id, error = %error, "Activation refused");
                }
            }
        } else {
            // one or zero sides present: never goes active, ends by forfeit
            game.stop_timer(now);
            self.notify_participants(&game, Notice::MatchCanceled { match_id });
            if let Err(error) = self.end_pvp_match(match_id).await {
                error!(match_id = %match_id, error = %error, "Forfeit settlement failed");
            }
        }
        self.sync.sync_outgoing();
    }

    /// Expiry callback: stop the timer when the scheduled run is the live one
    async fn expire_pvp(self: &Arc<Self>, match_id: MatchId, expires_token: ServerTime) {
        let Ok(game) = self.pvp_match(match_id) else {
            return;
        };
        if game.state() != PvpState::Active || game.expires_at() != Some(expires_token) {
            debug!(match_id = %match_id, "Expiry token stale");
            return;
        }
        if game.stop_timer(self.sched.now()) {
            if let Err(error) = self.end_pvp_match(match_id).await {
                error!(match_id = %match_id, error = %error, "Timed-out settlement failed");
            }
        }
    }

    // ---- live scoring ----------------------------------------------------

    /// Resolve which side an entity scores for. Companions resolve through
    /// their owning player's character id.
    fn entity_side(&self, game: &PvpMatch, entity_id: EntityId) -> Result<TeamSide, MatchError> {
        if let Some(team) = game.entity_team(entity_id) {
            return Ok(team);
        }
        let instance = self
            .zones
            .instance(game.instance_id)
            .ok_or(MatchError::UnknownMatch(game.id))?;
        for zone in instance.zones() {
            if let Some(record) = zone.entity(entity_id) {
                if let Some(character_id) = record.character_id() {
                    return game
                        .player_team(character_id)
                        .ok_or(MatchError::NotParticipant(character_id));
                }
            }
        }
        Err(MatchError::UnknownEntity(entity_id))
    }

    fn resolve_character(
        &self,
        game: &PvpMatch,
        entity_id: EntityId,
    ) -> Result<CharacterId, MatchError> {
        let instance = self
            .zones
            .instance(game.instance_id)
            .ok_or(MatchError::UnknownMatch(game.id))?;
        for zone in instance.zones() {
            if let Some(record) = zone.entity(entity_id) {
                if let Some(character_id) = record.character_id() {
                    return Ok(character_id);
                }
            }
        }
        Err(MatchError::UnknownEntity(entity_id))
    }

    /// Apply a point delta credited to `source_entity`'s side
    pub async fn update_pvp_points(
        self: &Arc<Self>,
        match_id: MatchId,
        source_entity: EntityId,
        delta: i32,
    ) -> Result<(), MatchError> {
        let game = self.pvp_match(match_id)?;
        let team = self.entity_side(&game, source_entity)?;
        self.apply_pvp_points(&game, team, delta).await
    }

    async fn apply_pvp_points(
        self: &Arc<Self>,
        game: &Arc<PvpMatch>,
        team: TeamSide,
        delta: i32,
    ) -> Result<(), MatchError> {
        let outcome = game.apply_points(team, delta)?;

        // a zero net change stays silent
        if outcome.applied != 0 {
            self.broadcast_instance(
                game.instance_id,
                Notice::PointsDelta {
                    match_id: game.id,
                    team,
                    delta: outcome.applied,
                    totals: game.scores(),
                },
            );
        }

        if outcome.crossed_threshold {
            info!(match_id = %game.id, team = ?team, total = outcome.total, "Max points reached, stopping timer");
            if game.stop_timer(self.sched.now()) {
                self.end_pvp_match(game.id).await?;
            }
        }
        Ok(())
    }

    /// Record a kill and credit the killer's side
    pub async fn record_pvp_kill(
        self: &Arc<Self>,
        match_id: MatchId,
        killer_entity: EntityId,
        victim_entity: EntityId,
        point_value: i32,
    ) -> Result<(), MatchError> {
        let game = self.pvp_match(match_id)?;
        let killer = self.resolve_character(&game, killer_entity)?;
        let victim = self.resolve_character(&game, victim_entity)?;
        let team = self.entity_side(&game, killer_entity)?;

        game.record_kill(killer, victim);
        self.apply_pvp_points(&game, team, point_value).await
    }

    /// Record a damage exchange for the stats maxima
    pub fn record_pvp_damage(
        &self,
        match_id: MatchId,
        dealer_entity: EntityId,
        target_entity: EntityId,
        amount: i32,
    ) -> Result<(), MatchError> {
        let game = self.pvp_match(match_id)?;
        let dealer = self.resolve_character(&game, dealer_entity)?;
        let target = self.resolve_character(&game, target_entity)?;
        let now = self.sched.now();
        game.record_damage_dealt(dealer, amount, now);
        game.record_damage_taken(target, amount, now);
        Ok(())
    }

    /// Record an inflicted status effect (trophy input)
    pub fn record_pvp_status_effect(
        &self,
        match_id: MatchId,
        dealer_entity: EntityId,
    ) -> Result<(), MatchError> {
        let game = self.pvp_match(match_id)?;
        let dealer = self.resolve_character(&game, dealer_entity)?;
        game.record_status_effect(dealer);
        Ok(())
    }

    /// A participant disconnected or walked out mid-match
    pub fn drop_pvp_player(&self, match_id: MatchId, character_id: CharacterId) {
        if let Ok(game) = self.pvp_match(match_id) {
            game.drop_player(character_id);
        }
    }

    // ---- base capture ----------------------------------------------------

    /// Start capturing a base; finalization is scheduled after a fixed delay
    pub fn capture_base(
        self: &Arc<Self>,
        match_id: MatchId,
        base_id: EntityId,
        entity_id: EntityId,
    ) -> Result<(), MatchError> {
        let game = self.pvp_match(match_id)?;
        let ticket = game.begin_capture(base_id, entity_id, self.sched.now())?;

        self.broadcast_instance(
            game.instance_id,
            Notice::BaseCaptureStarted {
                base: base_id,
                by: entity_id,
            },
        );

        let manager = Arc::clone(self);
        let token = ticket.token;
        self.sched
            .schedule_in(self.cfg.base_capture_delay_secs, move || async move {
                manager
                    .complete_base_capture(match_id, base_id, entity_id, token)
                    .await;
            });
        Ok(())
    }

    /// Finalization callback for a started capture
    async fn complete_base_capture(
        self: &Arc<Self>,
        match_id: MatchId,
        base_id: EntityId,
        entity_id: EntityId,
        token: ServerTime,
    ) {
        let Ok(game) = self.pvp_match(match_id) else {
            debug!(match_id = %match_id, "Capture completion for a dismantled match");
            return;
        };

        let now = self.sched.now();
        match game.complete_capture(base_id, entity_id, token, now) {
            CaptureOutcome::Finalized { team, capturer } => {
                let capture_points = game.variant.base_capture_points;
                game.add_base_points(capturer, capture_points, now);
                self.broadcast_instance(
                    game.instance_id,
                    Notice::BaseCaptured {
                        base: base_id,
                        team,
                    },
                );
                if let Err(error) = self.apply_pvp_points(&game, team, capture_points).await {
                    debug!(match_id = %match_id, error = %error, "Capture points not applied");
                }
                self.schedule_base_bonus(&game, base_id, team, now);
                info!(match_id = %match_id, base = %base_id, team = ?team, "Base captured");
            }
            CaptureOutcome::OccupierLeft => {
                self.broadcast_instance(game.instance_id, Notice::BaseLeft { base: base_id });
            }
            CaptureOutcome::Stale => {
                debug!(match_id = %match_id, base = %base_id, "Capture token stale");
            }
        }
    }

    /// The occupier stepped off the base; the pending finalization callback
    /// notices and broadcasts the "left" state change.
    pub fn leave_base(
        &self,
        match_id: MatchId,
        base_id: EntityId,
        entity_id: EntityId,
    ) -> Result<(), MatchError> {
        let game = self.pvp_match(match_id)?;
        if !game.leave_base(base_id, entity_id) {
            debug!(match_id = %match_id, base = %base_id, "Leave without a live occupation");
        }
        Ok(())
    }

    fn schedule_base_bonus(
        self: &Arc<Self>,
        game: &Arc<PvpMatch>,
        base_id: EntityId,
        team: TeamSide,
        owner_token: ServerTime,
    ) {
        let manager = Arc::clone(self);
        let match_id = game.id;
        let interval = game.variant.base_bonus_interval_secs;
        self.sched.schedule_in(interval, move || async move {
            manager
                .base_bonus_tick(match_id, base_id, team, owner_token)
                .await;
        });
    }

    /// Recurring bonus while a base stays held by the same ownership epoch
    async fn base_bonus_tick(
        self: &Arc<Self>,
        match_id: MatchId,
        base_id: EntityId,
        team: TeamSide,
        owner_token: ServerTime,
    ) {
        let Ok(game) = self.pvp_match(match_id) else {
            return;
        };
        if !game.bonus_tick_valid(base_id, team, owner_token) {
            debug!(match_id = %match_id, base = %base_id, "Base bonus token stale");
            return;
        }

        let bonus = game.variant.base_bonus_points;
        if let Err(error) = self.apply_pvp_points(&game, team, bonus).await {
            debug!(match_id = %match_id, error = %error, "Base bonus not applied");
            return;
        }
        // keep ticking for as long as the same ownership holds
        self.schedule_base_bonus(&game, base_id, team, owner_token);
    }

    // ---- phases ----------------------------------------------------------

    /// Advance a match's numeric phase (either family)
    pub async fn advance_phase(
        self: &Arc<Self>,
        match_id: MatchId,
        target: u8,
    ) -> Result<u8, MatchError> {
        if let Ok(game) = self.pvp_match(match_id) {
            let phase = game.advance_phase(target)?;
            self.broadcast_instance(game.instance_id, Notice::PhaseChanged { match_id, phase });
            return Ok(phase);
        }

        let game = self.ultimate_match(match_id)?;
        let outcome = game.advance_phase(target, self.sched.now())?;
        if outcome.ended {
            // past the cooperative cap the match ends instead of advancing
            self.end_ultimate_phase(match_id, true).await?;
            return Ok(outcome.phase);
        }
        self.broadcast_zone(
            game.zone_key,
            Notice::PhaseChanged {
                match_id,
                phase: outcome.phase,
            },
        );
        Ok(outcome.phase)
    }

    // ---- cooperative (Ultimate Battle) -----------------------------------

    fn ultimate_match(&self, match_id: MatchId) -> Result<Arc<UltimateMatch>, MatchError> {
        let lobby = self.ultimate.lock();
        lobby
            .active
            .as_ref()
            .filter(|game| game.id == match_id)
            .cloned()
            .ok_or(MatchError::UnknownMatch(match_id))
    }

    fn gauge_config(&self) -> GaugeConfig {
        GaugeConfig {
            tick_secs: self.cfg.gauge_tick_secs,
            scale: self.cfg.gauge_scale,
            kill_decay: self.cfg.gauge_kill_decay,
            enemy_decay_rate: self.cfg.gauge_enemy_decay_rate,
            dark_threshold: self.cfg.gauge_dark_threshold,
        }
    }

    /// Enter the lobby-wide cooperative queue; opens a recruitment window if
    /// none is pending
    pub fn join_ultimate_queue(self: &Arc<Self>, character_id: CharacterId) -> Result<(), QueueError> {
        if !self.join_limiter.check_join(character_id) {
            return Err(QueueError::RateLimited);
        }

        let (window, closes_at) = {
            let mut lobby = self.ultimate.lock();
            if lobby.pending.contains(&character_id) {
                return Err(QueueError::AlreadyQueued(character_id));
            }
            if let Some(active) = &lobby.active {
                if active.selected().contains(&character_id) {
                    return Err(QueueError::AlreadyInMatch(character_id));
                }
            }
            lobby.pending.push(character_id);

            if lobby.recruiting {
                (None, lobby.window_closes_at)
            } else {
                lobby.recruiting = true;
                lobby.window_epoch += 1;
                lobby.window_closes_at =
                    self.sched.now().add_secs(self.cfg.recruit_window_secs);
                (Some(lobby.window_epoch), lobby.window_closes_at)
            }
        };

        if let Some(epoch) = window {
            let manager = Arc::clone(self);
            self.sched.schedule_at(closes_at, move || async move {
                manager.run_recruitment(epoch).await;
            });
            info!(closes_at = %closes_at, "Recruitment window opened");
        }

        if let Some(client) = self.connections.client_by_character(character_id, true) {
            client.send(Notice::QueueEntered {
                match_type: MatchType::UltimateBattle,
            });
            client.send(Notice::RecruitOpen {
                closes_at: closes_at.as_micros(),
                server_time: unix_millis(),
            });
        }
        Ok(())
    }

    /// Leave the cooperative lobby queue before a draw
    pub fn cancel_ultimate_queue(&self, character_id: CharacterId) -> bool {
        let removed = {
            let mut lobby = self.ultimate.lock();
            let before = lobby.pending.len();
            lobby.pending.retain(|pending| *pending != character_id);
            before != lobby.pending.len()
        };
        if removed {
            if let Some(client) = self.connections.client_by_character(character_id, true) {
                client.send(Notice::QueueCanceled {
                    reason: "canceled".to_string(),
                });
            }
        }
        removed
    }

    /// Recruitment-window callback: draw the lottery, re-queue the rest
    fn run_recruitment<'a>(self: &'a Arc<Self>, epoch: u64) -> BoxFut<'a> {
        Box::pin(async move {
        let now = self.sched.now();
        let shuffle_seed: u64 = self.rng.lock().gen();

        enum Draw {
            Stale,
            Held { next_epoch: u64 },
            Drawn {
                game: Arc<UltimateMatch>,
                selected: Vec<CharacterId>,
                passed: Vec<CharacterId>,
                next_epoch: Option<u64>,
            },
        }

        let draw = {
            let mut lobby = self.ultimate.lock();
            if lobby.window_epoch != epoch {
                Draw::Stale
            } else if lobby.active.is_some() {
                // a round is still running; hold the lottery one more window
                lobby.window_epoch += 1;
                lobby.window_closes_at = now.add_secs(self.cfg.recruit_window_secs);
                Draw::Held {
                    next_epoch: lobby.window_epoch,
                }
            } else if lobby.pending.is_empty() {
                lobby.recruiting = false;
                Draw::Stale
            } else {
                let mut pool = std::mem::take(&mut lobby.pending);
                let mut rng = ChaCha8Rng::seed_from_u64(shuffle_seed);
                pool.shuffle(&mut rng);

                let take = self.cfg.recruit_party_size.min(pool.len());
                let selected: Vec<CharacterId> = pool.drain(..take).collect();
                let passed = pool;
                lobby.pending = passed.clone();

                let match_id =
                    MatchId(self.next_local_match_id.fetch_add(1, Ordering::Relaxed));
                let game = Arc::new(UltimateMatch::new(
                    match_id,
                    ZoneKey::new(self.cfg.ultimate_zone_def_id, 0),
                    selected.clone(),
                    self.cfg.gauge_trigger_values.clone(),
                ));
                lobby.active = Some(game.clone());

                let next_epoch = if lobby.pending.is_empty() {
                    lobby.recruiting = false;
                    None
                } else {
                    lobby.window_epoch += 1;
                    lobby.window_closes_at = now.add_secs(self.cfg.recruit_window_secs);
                    Some(lobby.window_epoch)
                };
                Draw::Drawn {
                    game,
                    selected,
                    passed,
                    next_epoch,
                }
            }
        };

        match draw {
            Draw::Stale => {}
            Draw::Held { next_epoch } => {
                let manager = Arc::clone(self);
                self.sched
                    .schedule_in(self.cfg.recruit_window_secs, move || async move {
                        manager.run_recruitment(next_epoch).await;
                    });
            }
            Draw::Drawn {
                game,
                selected,
                passed,
                next_epoch,
            } => {
                info!(match_id = %game.id, selected = selected.len(), passed = passed.len(), "Recruitment drawn");

                for client in self.connections.clients_by_characters(&selected, true) {
                    client.send(Notice::RecruitSelected { match_id: game.id });
                }
                let next_window = now.add_secs(self.cfg.recruit_window_secs);
                for client in self.connections.clients_by_characters(&passed, true) {
                    client.send(Notice::RecruitPassed {
                        next_window: next_window.as_micros(),
                    });
                }

                if let Some(next_epoch) = next_epoch {
                    let manager = Arc::clone(self);
                    self.sched
                        .schedule_in(self.cfg.recruit_window_secs, move || async move {
                            manager.run_recruitment(next_epoch).await;
                        });
                }

                let manager = Arc::clone(self);
                let match_id = game.id;
                self.sched
                    .schedule_in(self.cfg.ub_ready_secs, move || async move {
                        manager.begin_ultimate_round(match_id).await;
                    });
            }
        }
        })
    }

    /// A selected player enters the boss zone during READY
    pub fn enter_ultimate(
        &self,
        character_id: CharacterId,
        match_id: MatchId,
    ) -> Result<(), MatchError> {
        let game = self.ultimate_match(match_id)?;
        game.join(character_id)?;

        // spawn the player into the boss zone so broadcasts reach them
        if let Ok(zone) = self.zones.get_or_create_zone(game.zone_key) {
            let entity_id = zone.allocate_entity_id();
            let record = EntityRecord::new(
                entity_id,
                EntityData::PlayerCharacter {
                    character_id,
                    level: 0,
                },
            );
            let result = match self.connections.client_by_character(character_id, true) {
                Some(client) => zone.add_connection(client, record, None),
                None => zone.register_entity(record).map(|_| ()),
            };
            if let Err(error) = result {
                warn!(match_id = %match_id, character_id = %character_id, error = %error, "Boss zone entry failed");
            }
        }

        if let Some(client) = self.connections.client_by_character(character_id, true) {
            client.send(Notice::MatchConfirmed { match_id });
        }
        Ok(())
    }

    /// READY -> ROUND callback
    async fn begin_ultimate_round(self: &Arc<Self>, match_id: MatchId) {
        let Ok(game) = self.ultimate_match(match_id) else {
            debug!(match_id = %match_id, "Round start for a dismantled match");
            return;
        };

        let now = self.sched.now();
        if game.begin_round(now) {
            self.broadcast_zone(game.zone_key, Notice::RoundStarted { match_id });
            let manager = Arc::clone(self);
            let delay = self.cfg.gauge_tick_secs;
            self.sched.schedule_in(delay, move || async move {
                manager.ultimate_tick(match_id, 0).await;
            });
            info!(match_id = %match_id, participants = game.joined().len(), "Cooperative round started");
        } else {
            // nobody joined during READY: tear the match down
            let selected = game.selected();
            {
                let mut lobby = self.ultimate.lock();
                if lobby
                    .active
                    .as_ref()
                    .map(|active| active.id == match_id)
                    .unwrap_or(false)
                {
                    lobby.active = None;
                }
            }
            for client in self.connections.clients_by_characters(&selected, true) {
                client.send(Notice::MatchCanceled { match_id });
            }
            info!(match_id = %match_id, "Cooperative round torn down, nobody joined");
        }
    }

    /// Spawn a gauge-feeding enemy into the boss zone
    pub fn spawn_ultimate_enemy(
        &self,
        match_id: MatchId,
        kill_value: i32,
    ) -> Result<EntityId, MatchError> {
        let game = self.ultimate_match(match_id)?;
        let zone = self
            .zones
            .get_or_create_zone(game.zone_key)
            .map_err(|_| MatchError::UnknownMatch(match_id))?;

        let entity_id = zone.allocate_entity_id();
        zone.register_entity(EntityRecord::new(
            entity_id,
            EntityData::BossSpawn {
                def_id: 0,
                kill_value,
            },
        ))
        .map_err(|_| MatchError::InvariantViolated("boss entity collision"))?;

        game.spawn_enemy(entity_id, kill_value);
        Ok(entity_id)
    }

    /// An enemy died; the killer (if known) is credited its kill value
    pub fn kill_ultimate_enemy(
        &self,
        match_id: MatchId,
        entity_id: EntityId,
        killer: Option<CharacterId>,
    ) -> Result<(), MatchError> {
        let game = self.ultimate_match(match_id)?;
        let kill_value = game
            .note_enemy_killed(entity_id)
            .ok_or(MatchError::UnknownEntity(entity_id))?;
        if let Some(zone) = self.zones.existing_zone(game.zone_key) {
            zone.unregister_entity(entity_id);
        }
        if let Some(killer) = killer {
            game.add_points(killer, kill_value);
        }
        Ok(())
    }

    /// Arm a named phase timer on the cooperative match
    pub fn set_ultimate_timer(
        &self,
        match_id: MatchId,
        delay_secs: f64,
        event: impl Into<String>,
    ) -> Result<(), MatchError> {
        let game = self.ultimate_match(match_id)?;
        game.set_phase_timer(self.sched.now().add_secs(delay_secs), event);
        Ok(())
    }

    /// Gauge-tick callback; reschedules itself while the round lives
    fn ultimate_tick<'a>(self: &'a Arc<Self>, match_id: MatchId, epoch: u64) -> BoxFut<'a> {
        Box::pin(async move {
        let Ok(game) = self.ultimate_match(match_id) else {
            debug!(match_id = %match_id, "Tick fired for a dismantled match");
            return;
        };

        let gauge_cfg = self.gauge_config();
        let now = self.sched.now();
        let Some(outcome) = game.run_tick(&gauge_cfg, now, epoch) else {
            debug!(match_id = %match_id, epoch, "Tick epoch stale");
            return;
        };

        self.broadcast_zone(
            game.zone_key,
            Notice::GaugeUpdate {
                match_id,
                value: outcome.gauge,
                dark: outcome.dark,
            },
        );
        for (value, over) in outcome.crossings {
            self.broadcast_zone(game.zone_key, Notice::GaugeTrigger { match_id, value, over });
        }

        if let Some(event) = outcome.timer_event {
            self.apply_phase_event(&game, event).await;
        }

        if game.state() == UbState::Round {
            let delay = game.next_tick_delay(&gauge_cfg, self.sched.now());
            let manager = Arc::clone(self);
            let next_epoch = outcome.next_epoch;
            self.sched.schedule_in(delay, move || async move {
                manager.ultimate_tick(match_id, next_epoch).await;
            });
        }
        })
    }

    /// Fire a named phase-timer event. "round_end" closes the match; other
    /// names are relayed for the rule layer.
    async fn apply_phase_event(self: &Arc<Self>, game: &Arc<UltimateMatch>, event: String) {
        self.broadcast_zone(
            game.zone_key,
            Notice::PhaseEvent {
                match_id: game.id,
                event: event.clone(),
            },
        );
        if event == "round_end" {
            if let Err(error) = self.end_ultimate_phase(game.id, true).await {
                error!(match_id = %game.id, error = %error, "Round-end settlement failed");
            }
        }
    }

    /// Credit cooperative points to a participant
    pub fn add_ultimate_points(
        &self,
        match_id: MatchId,
        character_id: CharacterId,
        amount: i64,
    ) -> Result<(), MatchError> {
        let game = self.ultimate_match(match_id)?;
        game.add_points(character_id, amount);
        Ok(())
    }

    /// Settle the cooperative phase. With `match_over` the match completes,
    /// cumulative and best-match records are updated as one batch, and the
    /// match detaches from the lobby.
    pub async fn end_ultimate_phase(
        self: &Arc<Self>,
        match_id: MatchId,
        match_over: bool,
    ) -> Result<(), MatchError> {
        let game = self.ultimate_match(match_id)?;
        let now = self.sched.now();

        if match_over {
            game.complete(now);
        }
        let rewards = game.settle(self.cfg.ub_reward_cap);

        let mut change = ChangeSet::new();
        let mut lines = Vec::with_capacity(rewards.len());
        for reward in &rewards {
            let mut record = self
                .store
                .ultimate_record(reward.character_id)
                .await
                .unwrap_or_else(|| UltimateRecord::new(reward.character_id));
            if match_over {
                record.total_points += reward.earned;
                record.best_points = record.best_points.max(reward.earned);
                record.matches_played += 1;
                record.updated_at = chrono::Utc::now();
                self.sync.queue_changed(RecordKind::Ultimate.name(), &record);
                change.upsert(RecordData::Ultimate(record.clone()));
            }
            lines.push((reward.character_id, reward.earned, record));
        }

        if match_over && !change.is_empty() && !self.store.process_change_set(change).await {
            // in-memory rewards already granted; durable state re-syncs later
            error!(match_id = %match_id, "Cooperative ranking persist failed");
        }

        for (character_id, earned, record) in lines {
            if let Some(client) = self.connections.client_by_character(character_id, true) {
                client.send(Notice::UltimateResult {
                    match_id,
                    earned,
                    total: record.total_points,
                    best: record.best_points,
                });
            }
        }

        if match_over {
            {
                let mut lobby = self.ultimate.lock();
                if lobby
                    .active
                    .as_ref()
                    .map(|active| active.id == match_id)
                    .unwrap_or(false)
                {
                    lobby.active = None;
                }
            }
            self.broadcast_zone(game.zone_key, Notice::MatchEnded { match_id });
            self.sync.sync_outgoing();
            info!(
                match_id = %match_id,
                duration_secs = game.round_duration_secs(),
                "Cooperative match settled"
            );
        }
        Ok(())
    }

    // ---- settlement ------------------------------------------------------

    /// Close out an adversarial match: placements, trophies, GP/BP, one
    /// batch persist, result broadcast, async experience grants, teardown.
    /// Requires the timer to be stopped already.
    pub async fn end_pvp_match(self: &Arc<Self>, match_id: MatchId) -> Result<(), MatchError> {
        let game = self.pvp_match(match_id)?;
        let snapshot = game.end_snapshot()?;

        let trophies = trophy::compute_trophies(snapshot.kind, &snapshot.stats);
        let placements = scoring::placements(snapshot.score, snapshot.forfeit_winner);

        let mut change = ChangeSet::new();
        let mut rewards = Vec::new();
        let mut grants = Vec::new();

        // players who never confirmed were auto-declined and settle nothing
        for player in snapshot
            .players
            .iter()
            .filter(|player| player.present || player.dropped)
        {
            let character_id = player.character_id;
            let stats = snapshot
                .stats
                .iter()
                .find(|stats| stats.character_id == character_id)
                .ok_or(MatchError::InvariantViolated("participant without stats"))?;

            let mut record = self
                .store
                .pvp_record(character_id)
                .await
                .unwrap_or_else(|| PvpRecord::new(character_id));

            let placement = placements[player.team.index()];
            let input = scoring::RewardInput {
                placement,
                kills: stats.kills,
                deaths: stats.deaths,
                time_remaining_secs: snapshot.time_remaining_secs,
                trophy_boost: trophies.boost(character_id),
                dropped: stats.dropped,
                gp: record.gp,
                rank_threshold: record.rank_threshold(),
            };
            let gp_delta = scoring::gp_delta(&input);
            let bp = scoring::bp_earned(&input);

            record.gp += gp_delta;
            record.bp += bp;
            record.kills += stats.kills;
            record.deaths += stats.deaths;
            match placement {
                crate::game::Placement::Win => record.wins += 1,
                crate::game::Placement::Lose => record.losses += 1,
                crate::game::Placement::Draw => record.draws += 1,
            }
            record.refresh_rank();
            record.updated_at = chrono::Utc::now();
            self.sync.queue_changed(RecordKind::Pvp.name(), &record);
            change.upsert(RecordData::Pvp(record));

            rewards.push(RewardEntry {
                character_id,
                gp_delta,
                bp_earned: bp,
                trophies: trophies.trophies(character_id).to_vec(),
            });
            grants.push(ExperienceGrant {
                character_id,
                amount: scoring::experience_granted(&input),
            });
        }

        // one transactional batch; a failure is logged, results still go out
        if !change.is_empty() && !self.store.process_change_set(change).await {
            error!(match_id = %match_id, "Post-match persist failed, broadcasting results anyway");
        }

        let placement_entries: Vec<PlacementEntry> = TeamSide::BOTH
            .iter()
            .map(|side| PlacementEntry {
                team: *side,
                placement: placements[side.index()],
                score: snapshot.score[side.index()],
            })
            .collect();
        let result = Notice::MatchResult {
            match_id,
            placements: placement_entries,
            rewards,
        };
        let participants: Vec<CharacterId> = snapshot
            .players
            .iter()
            .map(|player| player.character_id)
            .collect();
        for client in self.connections.clients_by_characters(&participants, true) {
            client.send(result.clone());
        }
        self.broadcast_instance(game.instance_id, Notice::MatchEnded { match_id });

        // experience lands asynchronously, per player
        for grant in grants {
            let store = self.store.clone();
            tokio::spawn(async move {
                let character_id = grant.character_id;
                let mut set = ChangeSet::new();
                set.upsert(RecordData::Experience(grant));
                if !store.process_change_set(set).await {
                    warn!(character_id = %character_id, "Experience grant failed");
                }
            });
        }

        self.dismantle_pvp(&game, &participants);
        self.sync.sync_outgoing();
        info!(
            match_id = %match_id,
            duration_secs = game.match_duration_secs(),
            "Match settled"
        );
        Ok(())
    }

    fn dismantle_pvp(&self, game: &Arc<PvpMatch>, participants: &[CharacterId]) {
        self.pending_invites.remove(&game.id);
        for character_id in participants {
            if self.queue.remove(*character_id).is_some() {
                self.sync.queue_removed(ENTRY_KIND, character_id.0);
            }
        }

        if let Some(instance) = self.zones.instance(game.instance_id) {
            if let Some(zone) = instance.primary_zone() {
                let _ = zone.detach_match(game.id);
            }
            self.zones.destroy_instance(game.instance_id);
        }
        self.pvp_matches.remove(&game.id);
    }

    // ---- notices ---------------------------------------------------------

    fn notify_participants(&self, game: &Arc<PvpMatch>, notice: Notice) {
        let participants = game.participants();
        for client in self.connections.clients_by_characters(&participants, true) {
            client.send(notice.clone());
        }
    }

    fn broadcast_instance(&self, instance_id: crate::zone::InstanceId, notice: Notice) {
        if let Some(instance) = self.zones.instance(instance_id) {
            for zone in instance.zones() {
                zone.broadcast(notice.clone());
            }
        }
    }

    fn broadcast_zone(&self, key: ZoneKey, notice: Notice) {
        if let Some(zone) = self.zones.existing_zone(key) {
            zone.broadcast(notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::game::queue::TeamCategory;
    use crate::game::Placement;
    use crate::net::ClientHandle;
    use crate::store::MemoryStore;
    use crate::sync::SyncBatch;
    use crate::util::time::server_now;
    use crate::zone::entity::EntityKind;
    use crate::zone::ZoneDef;

    struct Harness {
        manager: Arc<MatchManager>,
        store: Arc<MemoryStore>,
        zones: Arc<ZoneManager>,
        connections: Arc<ConnectionRegistry>,
        _sync_rx: UnboundedReceiver<SyncBatch>,
    }

    fn harness(cfg: Config) -> Harness {
        let config = Arc::new(cfg);
        let (sync, sync_rx) = WorldSync::new();
        let sync = Arc::new(sync);

        let zones = Arc::new(ZoneManager::new());
        zones.load_defs(vec![
            ZoneDef::new(1, "home_city", true, 0),
            ZoneDef::new(10, "fate_arena", false, 2),
            ZoneDef::new(config.ultimate_zone_def_id, "ultimate_battle_hall", true, 0),
        ]);

        let connections = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn RecordStore> = store.clone();

        let manager = MatchManager::new(
            config,
            Scheduler::new(),
            zones.clone(),
            connections.clone(),
            store_dyn,
            sync,
        );
        manager.load_variants(vec![PvpVariantDef {
            variant_id: 1,
            zone_def_id: 10,
            duration_secs: 600.0,
            max_points: Some(3_000),
            base_capture_points: 100,
            base_bonus_points: 10,
            base_bonus_interval_secs: 30.0,
        }]);

        Harness {
            manager,
            store,
            zones,
            connections,
            _sync_rx: sync_rx,
        }
    }

    fn connect(harness: &Harness, character_id: CharacterId) -> UnboundedReceiver<Notice> {
        let (client, rx) = ClientHandle::new(character_id, true);
        harness.connections.register(client);
        rx
    }

    fn fate_team(harness: &Harness, id: u64, leader: CharacterId, members: Vec<CharacterId>) {
        harness.manager.update_teams(
            vec![Team {
                id: TeamId(id),
                leader,
                members,
                category: TeamCategory::Fate,
            }],
            vec![],
        );
    }

    fn assignment(
        match_id: u64,
        ready_in_secs: f64,
        alpha: Vec<CharacterId>,
        beta: Vec<CharacterId>,
    ) -> PvpMatchAssignment {
        PvpMatchAssignment {
            match_id: MatchId(match_id),
            match_type: MatchType::Fate,
            variant_id: 1,
            ready_time: server_now().add_secs(ready_in_secs).as_micros(),
            teams: [alpha, beta],
        }
    }

    async fn expect_notice<F>(
        rx: &mut UnboundedReceiver<Notice>,
        what: &str,
        pred: F,
    ) -> Notice
    where
        F: Fn(&Notice) -> bool,
    {
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(600), rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
                .unwrap_or_else(|| panic!("channel closed waiting for {what}"));
            if pred(&notice) {
                return notice;
            }
        }
    }

    #[tokio::test]
    async fn queue_then_cancel_restores_the_entry_map() {
        let h = harness(Config::default());
        let leader = CharacterId(1);
        let member = CharacterId(2);
        fate_team(&h, 1, leader, vec![leader, member]);

        assert!(h.manager.queue_is_empty());
        h.manager.join_queue(leader, MatchType::Fate).await.unwrap();
        assert_eq!(h.manager.queue_len(), 2);

        let removed = h.manager.cancel_queue(leader);
        assert_eq!(removed, 2);
        assert!(h.manager.queue_is_empty());

        // world-originated reconciliation lands in the same cache
        h.manager.update_match_entries(
            vec![MatchEntry::new(
                CharacterId(7),
                CharacterId(7),
                MatchType::Fate,
                None,
            )],
            vec![],
        );
        assert_eq!(h.manager.queue_len(), 1);
        h.manager.update_match_entries(vec![], vec![CharacterId(7)]);
        assert!(h.manager.queue_is_empty());
    }

    #[tokio::test]
    async fn join_validations_reject_before_any_mutation() {
        let h = harness(Config::default());
        let leader = CharacterId(1);
        let member = CharacterId(2);
        fate_team(&h, 1, leader, vec![leader, member]);

        // only the leader queues a team
        assert!(matches!(
            h.manager.join_queue(member, MatchType::Fate).await,
            Err(QueueError::NotTeamLeader(_))
        ));

        // the team category must admit the requested type
        assert!(matches!(
            h.manager.join_queue(leader, MatchType::Valhalla).await,
            Err(QueueError::WrongTeamCategory { .. })
        ));

        h.manager.join_queue(leader, MatchType::Fate).await.unwrap();
        assert!(matches!(
            h.manager.join_queue(leader, MatchType::Fate).await,
            Err(QueueError::AlreadyQueued(_))
        ));
        assert_eq!(h.manager.queue_len(), 2);
    }

    #[tokio::test]
    async fn penalty_threshold_blocks_queueing() {
        let h = harness(Config::default());
        let character = CharacterId(5);

        let mut record = PvpRecord::new(character);
        record.penalty_count = 3;
        let mut seed = ChangeSet::new();
        seed.upsert(RecordData::Pvp(record));
        assert!(h.store.process_change_set(seed).await);

        assert!(matches!(
            h.manager.join_queue(character, MatchType::Fate).await,
            Err(QueueError::PenaltyLimit { count: 3, limit: 3 })
        ));
        assert!(h.manager.queue_is_empty());
    }

    #[tokio::test]
    async fn world_batch_skips_unresolvable_matches() {
        let h = harness(Config::default());
        let a = CharacterId(1);
        let b = CharacterId(2);

        let mut broken = assignment(400, 5.0, vec![a], vec![b]);
        broken.variant_id = 99;
        let valid = assignment(401, 5.0, vec![a], vec![b]);

        h.manager.update_pvp_matches(vec![broken, valid]).await;

        // the bad record is skipped, the rest of the batch lands
        assert!(h.manager.pvp_match(MatchId(400)).is_err());
        assert!(h.manager.pvp_match(MatchId(401)).is_ok());
    }

    #[tokio::test]
    async fn reject_increments_penalty_and_leaves_queue() {
        let h = harness(Config::default());
        let a = CharacterId(1);
        let b = CharacterId(2);
        h.manager.join_queue(a, MatchType::Fate).await.unwrap();
        h.manager.join_queue(b, MatchType::Fate).await.unwrap();

        h.manager
            .update_pvp_matches(vec![assignment(300, 5.0, vec![a], vec![b])])
            .await;

        h.manager.reject_match(b, MatchId(300)).await.unwrap();

        let record = h.store.pvp_record(b).await.expect("penalty record");
        assert_eq!(record.penalty_count, 1);
        assert_eq!(h.manager.queue_len(), 1);

        // a stranger cannot reject
        assert!(matches!(
            h.manager.reject_match(CharacterId(99), MatchId(300)).await,
            Err(MatchError::NotParticipant(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn absent_team_forfeits_without_activating() {
        let h = harness(Config::default());
        let a1 = CharacterId(1);
        let a2 = CharacterId(2);
        let b1 = CharacterId(3);
        fate_team(&h, 1, a1, vec![a1, a2]);
        let mut rx1 = connect(&h, a1);
        let _rx2 = connect(&h, a2);
        // b1 never connects a client

        h.manager.join_queue(a1, MatchType::Fate).await.unwrap();
        h.manager.join_queue(b1, MatchType::Fate).await.unwrap();
        assert_eq!(h.manager.queue_len(), 3);

        h.manager
            .update_pvp_matches(vec![assignment(100, 5.0, vec![a1, a2], vec![b1])])
            .await;
        expect_notice(&mut rx1, "confirm prompt", |n| {
            matches!(n, Notice::ConfirmPrompt { .. })
        })
        .await;

        h.manager.confirm_match(a1, MatchId(100)).await.unwrap();
        h.manager.confirm_match(a2, MatchId(100)).await.unwrap();

        // ready(5s) + confirm lead(30s), with slack
        tokio::time::sleep(Duration::from_secs(40)).await;

        // never went active; fully dismantled, queue symmetric again
        assert!(h.manager.pvp_match(MatchId(100)).is_err());
        assert!(h.manager.queue_is_empty());

        // the absent player pays the decline penalty and nothing else
        let b_record = h.store.pvp_record(b1).await.expect("penalty record");
        assert_eq!(b_record.penalty_count, 1);
        assert_eq!(b_record.gp, 0);
        assert_eq!(b_record.losses, 0);

        // the present team records a forfeit win
        let a_record = h.store.pvp_record(a1).await.expect("winner record");
        assert_eq!(a_record.wins, 1);
        assert!(a_record.gp > 0);

        expect_notice(&mut rx1, "match canceled", |n| {
            matches!(n, Notice::MatchCanceled { .. })
        })
        .await;
        let result = expect_notice(&mut rx1, "match result", |n| {
            matches!(n, Notice::MatchResult { .. })
        })
        .await;
        let Notice::MatchResult {
            placements,
            rewards,
            ..
        } = result
        else {
            unreachable!()
        };
        let alpha = placements
            .iter()
            .find(|entry| entry.team == TeamSide::Alpha)
            .unwrap();
        assert_eq!(alpha.placement, Placement::Win);
        assert!(rewards.iter().any(|line| line.character_id == a1));
        assert!(rewards.iter().any(|line| line.character_id == a2));
        // the absent player settles nothing
        assert!(!rewards.iter().any(|line| line.character_id == b1));
    }

    #[tokio::test(start_paused = true)]
    async fn capture_and_threshold_end_the_match() {
        let h = harness(Config::default());
        let a = CharacterId(1);
        let b = CharacterId(2);
        let mut rx_a = connect(&h, a);
        let _rx_b = connect(&h, b);

        h.manager.join_queue(a, MatchType::Fate).await.unwrap();
        h.manager.join_queue(b, MatchType::Fate).await.unwrap();
        h.manager
            .update_pvp_matches(vec![assignment(200, 1.0, vec![a], vec![b])])
            .await;
        h.manager.confirm_match(a, MatchId(200)).await.unwrap();
        h.manager.confirm_match(b, MatchId(200)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(32)).await;
        expect_notice(&mut rx_a, "match started", |n| {
            matches!(n, Notice::MatchStarted { .. })
        })
        .await;

        // phase numbers only move forward
        assert_eq!(h.manager.advance_phase(MatchId(200), 1).await.unwrap(), 1);
        assert!(h.manager.advance_phase(MatchId(200), 0).await.is_err());

        let game = h.manager.pvp_match(MatchId(200)).unwrap();
        let instance = h.zones.instance(game.instance_id).unwrap();
        let zone = instance.primary_zone().unwrap().clone();
        let base_id = zone.entities_of_kind(EntityKind::PvpBase)[0].id;
        let a_entity = zone
            .entities_of_kind(EntityKind::PlayerCharacter)
            .iter()
            .find(|record| record.character_id() == Some(a))
            .unwrap()
            .id;

        h.manager.capture_base(MatchId(200), base_id, a_entity).unwrap();
        // finalization runs after the fixed capture delay
        tokio::time::sleep(Duration::from_secs(6)).await;
        expect_notice(&mut rx_a, "base captured", |n| {
            matches!(
                n,
                Notice::BaseCaptured {
                    team: TeamSide::Alpha,
                    ..
                }
            )
        })
        .await;
        assert_eq!(game.scores(), [100, 0]);

        // pushing past the variant threshold stops the timer and settles
        h.manager
            .update_pvp_points(MatchId(200), a_entity, 2_900)
            .await
            .unwrap();
        assert!(h.manager.pvp_match(MatchId(200)).is_err());

        let record = h.store.pvp_record(a).await.expect("winner record");
        assert_eq!(record.wins, 1);

        let result = expect_notice(&mut rx_a, "match result", |n| {
            matches!(n, Notice::MatchResult { .. })
        })
        .await;
        let Notice::MatchResult { placements, .. } = result else {
            unreachable!()
        };
        let alpha = placements
            .iter()
            .find(|entry| entry.team == TeamSide::Alpha)
            .unwrap();
        assert_eq!(alpha.placement, Placement::Win);
        assert_eq!(alpha.score, 3_000);
    }

    #[tokio::test(start_paused = true)]
    async fn gauge_round_ticks_and_broadcasts() {
        let mut cfg = Config::default();
        cfg.gauge_enemy_decay_rate = 0.0;
        cfg.gauge_kill_decay = 0;
        let h = harness(cfg);

        let c = CharacterId(9);
        let mut rx = connect(&h, c);
        h.manager.join_ultimate_queue(c).unwrap();

        // the lottery draws at the end of the recruitment window
        let selected = expect_notice(&mut rx, "lottery selection", |n| {
            matches!(n, Notice::RecruitSelected { .. })
        })
        .await;
        let Notice::RecruitSelected { match_id } = selected else {
            unreachable!()
        };

        h.manager.enter_ultimate(c, match_id).unwrap();
        expect_notice(&mut rx, "round start", |n| {
            matches!(n, Notice::RoundStarted { .. })
        })
        .await;

        h.manager.spawn_ultimate_enemy(match_id, 1_000).unwrap();

        // kill value 1000 at scale 0.01: +10 per tick, no trigger in range
        for expected in [10i64, 20, 30] {
            let update = expect_notice(&mut rx, "gauge update", |n| {
                matches!(n, Notice::GaugeUpdate { .. })
            })
            .await;
            let Notice::GaugeUpdate { value, dark, .. } = update else {
                unreachable!()
            };
            assert_eq!(value, expected);
            assert!(!dark);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn combat_records_flow_into_settlement() {
        let h = harness(Config::default());
        let a = CharacterId(1);
        let b = CharacterId(2);
        let mut rx_a = connect(&h, a);
        let _rx_b = connect(&h, b);

        h.manager.join_queue(a, MatchType::Fate).await.unwrap();
        h.manager.join_queue(b, MatchType::Fate).await.unwrap();
        h.manager
            .update_pvp_matches(vec![assignment(500, 1.0, vec![a], vec![b])])
            .await;
        h.manager.confirm_match(a, MatchId(500)).await.unwrap();
        h.manager.confirm_match(b, MatchId(500)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(32)).await;
        expect_notice(&mut rx_a, "match started", |n| {
            matches!(n, Notice::MatchStarted { .. })
        })
        .await;

        let game = h.manager.pvp_match(MatchId(500)).unwrap();
        let zone = h
            .zones
            .instance(game.instance_id)
            .unwrap()
            .primary_zone()
            .unwrap()
            .clone();
        let find_entity = |character: CharacterId| {
            zone.entities_of_kind(EntityKind::PlayerCharacter)
                .iter()
                .find(|record| record.character_id() == Some(character))
                .unwrap()
                .id
        };
        let a_entity = find_entity(a);
        let b_entity = find_entity(b);

        h.manager
            .record_pvp_damage(MatchId(500), a_entity, b_entity, 250)
            .unwrap();
        h.manager
            .record_pvp_status_effect(MatchId(500), a_entity)
            .unwrap();
        h.manager
            .record_pvp_kill(MatchId(500), a_entity, b_entity, 50)
            .await
            .unwrap();
        assert_eq!(game.scores(), [50, 0]);

        // leaving a base nobody occupies is a harmless no-op
        let base_id = zone.entities_of_kind(EntityKind::PvpBase)[0].id;
        h.manager.leave_base(MatchId(500), base_id, a_entity).unwrap();

        // the loser walks out; the match runs down its clock
        h.manager.drop_pvp_player(MatchId(500), b);
        tokio::time::sleep(Duration::from_secs(601)).await;
        assert!(h.manager.pvp_match(MatchId(500)).is_err());

        let result = expect_notice(&mut rx_a, "match result", |n| {
            matches!(n, Notice::MatchResult { .. })
        })
        .await;
        let Notice::MatchResult { rewards, .. } = result else {
            unreachable!()
        };
        let winner_line = rewards
            .iter()
            .find(|line| line.character_id == a)
            .expect("winner reward line");
        assert!(winner_line.bp_earned > 0);
        assert!(!winner_line.trophies.is_empty());
        let loser_line = rewards
            .iter()
            .find(|line| line.character_id == b)
            .expect("loser reward line");
        // dropping forfeits BP
        assert_eq!(loser_line.bp_earned, 0);

        let record_a = h.store.pvp_record(a).await.unwrap();
        assert_eq!(record_a.kills, 1);
        assert_eq!(record_a.wins, 1);
        let record_b = h.store.pvp_record(b).await.unwrap();
        assert_eq!(record_b.deaths, 1);
        assert_eq!(record_b.losses, 1);
        assert_eq!(record_b.bp, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ultimate_round_settles_on_round_end_event() {
        let mut cfg = Config::default();
        cfg.gauge_enemy_decay_rate = 0.0;
        cfg.gauge_kill_decay = 0;
        let h = harness(cfg);

        let c = CharacterId(9);
        let mut rx = connect(&h, c);
        h.manager.join_ultimate_queue(c).unwrap();

        let selected = expect_notice(&mut rx, "lottery selection", |n| {
            matches!(n, Notice::RecruitSelected { .. })
        })
        .await;
        let Notice::RecruitSelected { match_id } = selected else {
            unreachable!()
        };
        h.manager.enter_ultimate(c, match_id).unwrap();
        expect_notice(&mut rx, "round start", |n| {
            matches!(n, Notice::RoundStarted { .. })
        })
        .await;

        let enemy = h.manager.spawn_ultimate_enemy(match_id, 1_000).unwrap();
        expect_notice(&mut rx, "gauge update", |n| {
            matches!(n, Notice::GaugeUpdate { .. })
        })
        .await;

        // killing the boss credits its kill value to the killer
        h.manager
            .kill_ultimate_enemy(match_id, enemy, Some(c))
            .unwrap();
        h.manager.add_ultimate_points(match_id, c, 500).unwrap();

        // the armed timer fires on the next tick and closes the round
        h.manager
            .set_ultimate_timer(match_id, 1.0, "round_end")
            .unwrap();
        let result = expect_notice(&mut rx, "settlement", |n| {
            matches!(n, Notice::UltimateResult { .. })
        })
        .await;
        let Notice::UltimateResult { earned, total, best, .. } = result else {
            unreachable!()
        };
        assert_eq!(earned, 1_500);
        assert_eq!(total, 1_500);
        assert_eq!(best, 1_500);

        expect_notice(&mut rx, "match ended", |n| {
            matches!(n, Notice::MatchEnded { .. })
        })
        .await;
        assert!(h.manager.ultimate_match(match_id).is_err());

        let record = h.store.ultimate_record(c).await.expect("ranking record");
        assert_eq!(record.total_points, 1_500);
        assert_eq!(record.best_points, 1_500);
        assert_eq!(record.matches_played, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lottery_draws_at_most_the_party_size() {
        let h = harness(Config::default());

        let mut receivers = Vec::new();
        for id in 1..=7u64 {
            let character = CharacterId(id);
            receivers.push(connect(&h, character));
            h.manager.join_ultimate_queue(character).unwrap();
        }

        // a player who cancels before the draw is out of the lottery
        let quitter = CharacterId(8);
        let mut rx_quitter = connect(&h, quitter);
        h.manager.join_ultimate_queue(quitter).unwrap();
        assert!(h.manager.cancel_ultimate_queue(quitter));
        expect_notice(&mut rx_quitter, "cancel ack", |n| {
            matches!(n, Notice::QueueCanceled { .. })
        })
        .await;

        tokio::time::sleep(Duration::from_secs(41)).await;

        let mut selected = 0;
        let mut passed = 0;
        for rx in &mut receivers {
            let notice = expect_notice(rx, "lottery outcome", |n| {
                matches!(
                    n,
                    Notice::RecruitSelected { .. } | Notice::RecruitPassed { .. }
                )
            })
            .await;
            match notice {
                Notice::RecruitSelected { .. } => selected += 1,
                Notice::RecruitPassed { .. } => passed += 1,
                _ => unreachable!(),
            }
        }
        assert_eq!(selected, 5);
        assert_eq!(passed, 2);
    }
}
