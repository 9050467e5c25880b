//! Application state shared across services

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::game::pvp::PvpVariantDef;
use crate::game::MatchManager;
use crate::net::ConnectionRegistry;
use crate::store::{MemoryStore, RecordStore};
use crate::sync::{SyncBatch, WorldSync};
use crate::util::sched::Scheduler;
use crate::zone::{ZoneDef, ZoneManager};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub zones: Arc<ZoneManager>,
    pub connections: Arc<ConnectionRegistry>,
    pub store: Arc<dyn RecordStore>,
    pub sync: Arc<WorldSync>,
    pub matches: Arc<MatchManager>,
}

impl AppState {
    /// Build the service graph. The returned receiver is the outgoing half
    /// of the world link; the channel process (or a logging drain) owns it.
    pub fn new(config: Config) -> (Self, mpsc::UnboundedReceiver<SyncBatch>) {
        let config = Arc::new(config);

        let (sync, sync_rx) = WorldSync::new();
        let sync = Arc::new(sync);

        let zones = Arc::new(ZoneManager::new());
        zones.load_defs(default_zone_defs(&config));

        let connections = Arc::new(ConnectionRegistry::new());

        // standalone runs persist in memory; production swaps the store
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());

        let matches = MatchManager::new(
            config.clone(),
            Scheduler::new(),
            zones.clone(),
            connections.clone(),
            store.clone(),
            sync.clone(),
        );
        matches.load_variants(default_variants());

        (
            Self {
                config,
                zones,
                connections,
                store,
                sync,
                matches,
            },
            sync_rx,
        )
    }
}

/// Zone definitions installed at startup (the definition-loading layer owns
/// the real tables; these are the entries the match core requires)
fn default_zone_defs(config: &Config) -> Vec<ZoneDef> {
    vec![
        ZoneDef::new(1, "home_city", true, 0),
        ZoneDef::new(10, "fate_arena", false, 2),
        ZoneDef::new(11, "valhalla_arena", false, 3),
        ZoneDef::new(config.ultimate_zone_def_id, "ultimate_battle_hall", true, 0),
    ]
}

/// Adversarial variant table
fn default_variants() -> Vec<PvpVariantDef> {
    vec![
        PvpVariantDef {
            variant_id: 1,
            zone_def_id: 10,
            duration_secs: 600.0,
            max_points: Some(3_000),
            base_capture_points: 100,
            base_bonus_points: 10,
            base_bonus_interval_secs: 30.0,
        },
        PvpVariantDef {
            variant_id: 2,
            zone_def_id: 11,
            duration_secs: 900.0,
            max_points: None,
            base_capture_points: 150,
            base_bonus_points: 15,
            base_bonus_interval_secs: 30.0,
        },
    ]
}
