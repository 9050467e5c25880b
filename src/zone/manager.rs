//! Zone pool and instance resolution
//!
//! Maps logical (definition, channel) addresses to running zones and manages
//! private instances created for matches. A dedicated mutex guards the
//! create-or-fetch path so two threads cannot double-create the same zone;
//! the maps themselves are sharded and fine for plain lookup/removal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::game::{CharacterId, MatchId};
use crate::util::time::{server_now, ServerTime};
use crate::zone::zone::Zone;
use crate::zone::{InstanceId, ZoneDef, ZoneKey, INSTANCE_CHANNEL};

/// Zone resolution errors
#[derive(Debug, thiserror::Error)]
pub enum ZoneError {
    #[error("unknown zone definition {0}")]
    UnknownDefinition(u32),
}

/// Access descriptor for a new private instance
#[derive(Debug, Clone)]
pub struct InstanceAccess {
    /// Match the instance was created for, if any
    pub match_id: Option<MatchId>,
    /// Characters allowed to enter
    pub allowed: Vec<CharacterId>,
    /// Zone definitions to spawn inside the instance, in entry order
    pub zone_defs: Vec<u32>,
}

/// A private, possibly multi-zone group created for one match or dungeon run
pub struct Instance {
    pub id: InstanceId,
    pub match_id: Option<MatchId>,
    allowed: Vec<CharacterId>,
    zones: Vec<Arc<Zone>>,
    pub created_at: ServerTime,
}

impl Instance {
    pub fn zones(&self) -> &[Arc<Zone>] {
        &self.zones
    }

    /// The entry zone of the instance
    pub fn primary_zone(&self) -> Option<&Arc<Zone>> {
        self.zones.first()
    }

    pub fn allows(&self, character_id: CharacterId) -> bool {
        self.allowed.contains(&character_id)
    }

    pub fn is_empty(&self) -> bool {
        self.zones.iter().all(|zone| zone.is_empty())
    }
}

/// Owner of the running zone pool
pub struct ZoneManager {
    defs: DashMap<u32, Arc<ZoneDef>>,
    zones: DashMap<ZoneKey, Arc<Zone>>,
    instances: DashMap<InstanceId, Arc<Instance>>,
    /// Guards the create-or-fetch critical section
    create_lock: Mutex<()>,
    next_instance_id: AtomicU64,
}

impl ZoneManager {
    pub fn new() -> Self {
        Self {
            defs: DashMap::new(),
            zones: DashMap::new(),
            instances: DashMap::new(),
            create_lock: Mutex::new(()),
            next_instance_id: AtomicU64::new(1),
        }
    }

    /// Install zone definitions (from the definition-loading layer)
    pub fn load_defs(&self, defs: Vec<ZoneDef>) {
        for def in defs {
            self.defs.insert(def.def_id, Arc::new(def));
        }
    }

    pub fn def(&self, def_id: u32) -> Option<Arc<ZoneDef>> {
        self.defs.get(&def_id).map(|entry| entry.value().clone())
    }

    /// Eagerly create channel-0 zones for every persistent definition
    pub fn create_global_zones(&self) {
        let persistent: Vec<Arc<ZoneDef>> = self
            .defs
            .iter()
            .filter(|entry| entry.value().persistent)
            .map(|entry| entry.value().clone())
            .collect();

        for def in persistent {
            let key = ZoneKey::new(def.def_id, 0);
            let _ = self.get_or_create_zone(key);
            info!(zone = %key, name = %def.name, "Global zone created");
        }
    }

    /// Resolve a running zone without creating one
    pub fn existing_zone(&self, key: ZoneKey) -> Option<Arc<Zone>> {
        self.zones.get(&key).map(|entry| entry.value().clone())
    }

    /// Resolve a running zone, creating it on first use
    pub fn get_or_create_zone(&self, key: ZoneKey) -> Result<Arc<Zone>, ZoneError> {
        if let Some(zone) = self.existing_zone(key) {
            return Ok(zone);
        }

        // Serialize creation so two callers cannot race the same key
        let _guard = self.create_lock.lock();
        if let Some(zone) = self.existing_zone(key) {
            return Ok(zone);
        }

        let def = self
            .def(key.def_id)
            .ok_or(ZoneError::UnknownDefinition(key.def_id))?;
        let zone = Arc::new(Zone::new(key, def));
        self.zones.insert(key, zone.clone());
        debug!(zone = %key, "Zone created");
        Ok(zone)
    }

    pub fn instance(&self, id: InstanceId) -> Option<Arc<Instance>> {
        self.instances.get(&id).map(|entry| entry.value().clone())
    }

    /// Create a private instance with its own zones
    pub fn create_instance(&self, access: InstanceAccess) -> Result<Arc<Instance>, ZoneError> {
        let _guard = self.create_lock.lock();

        let id = InstanceId(self.next_instance_id.fetch_add(1, Ordering::Relaxed));
        let mut zones = Vec::with_capacity(access.zone_defs.len());
        for def_id in &access.zone_defs {
            let def = self.def(*def_id).ok_or(ZoneError::UnknownDefinition(*def_id))?;
            zones.push(Arc::new(Zone::new(
                ZoneKey::new(*def_id, INSTANCE_CHANNEL),
                def,
            )));
        }

        let instance = Arc::new(Instance {
            id,
            match_id: access.match_id,
            allowed: access.allowed,
            zones,
            created_at: server_now(),
        });
        self.instances.insert(id, instance.clone());
        info!(instance_id = %id, match_id = ?instance.match_id, "Instance created");
        Ok(instance)
    }

    /// Tear down an instance. Non-empty instances are logged and removed
    /// anyway: by the time a match cleans up, stragglers have been ejected.
    pub fn destroy_instance(&self, id: InstanceId) {
        if let Some((_, instance)) = self.instances.remove(&id) {
            if !instance.is_empty() {
                warn!(instance_id = %id, "Destroying instance with residents");
            }
            let lifetime = server_now().since(instance.created_at);
            info!(instance_id = %id, lifetime_secs = lifetime.as_secs(), "Instance destroyed");
        }
    }

    /// Drop a non-persistent zone once it has emptied
    pub fn remove_zone_if_empty(&self, key: ZoneKey) {
        if let Some(zone) = self.existing_zone(key) {
            if !zone.def().persistent && zone.is_empty() {
                self.zones.remove(&key);
                debug!(zone = %key, "Empty zone removed");
            }
        }
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

impl Default for ZoneManager {
    fn default() -> Self {
        Self::new()
    }
}
