//! Zone state - entity registry, connected clients, attached match
//!
//! One mutex per zone covers every read and mutation. Populations are tens of
//! entities, so the single lock stays cheap; I/O (notices, persistence)
//! happens only after the lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::game::MatchId;
use crate::net::{ClientHandle, Notice};
use crate::zone::entity::{EntityId, EntityKind, EntityRecord};
use crate::zone::{ZoneDef, ZoneKey};

/// Registry/zone errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// An entity with this id is still registered; ids must be unique while
    /// the old entity is live, so collision is a precondition violation.
    #[error("entity id {0} already registered")]
    IdCollision(EntityId),

    #[error("zone already has an attached match {0}")]
    MatchAttached(MatchId),

    #[error("attached match is {actual:?}, not {expected}")]
    MatchMismatch {
        expected: MatchId,
        actual: Option<MatchId>,
    },
}

/// A running instance of a simulated area
pub struct Zone {
    key: ZoneKey,
    def: Arc<ZoneDef>,
    inner: Mutex<ZoneInner>,
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

struct ZoneInner {
    next_entity_id: u32,
    entities: HashMap<EntityId, Arc<EntityRecord>>,
    /// Primary player-entity id -> connected client
    clients: HashMap<EntityId, ClientHandle>,
    attached_match: Option<MatchId>,
}

impl Zone {
    pub fn new(key: ZoneKey, def: Arc<ZoneDef>) -> Self {
        Self {
            key,
            def,
            inner: Mutex::new(ZoneInner {
                next_entity_id: 1,
                entities: HashMap::new(),
                clients: HashMap::new(),
                attached_match: None,
            }),
        }
    }

    pub fn key(&self) -> ZoneKey {
        self.key
    }

    pub fn def(&self) -> &Arc<ZoneDef> {
        &self.def
    }

    /// Allocate the next entity id (unique within this zone's lifetime)
    pub fn allocate_entity_id(&self) -> EntityId {
        let mut inner = self.inner.lock();
        let id = EntityId(inner.next_entity_id);
        inner.next_entity_id += 1;
        id
    }

    /// Insert an entity record. Id collision while the old entity is live
    /// would desync clients, so it fails instead of overwriting.
    pub fn register_entity(
        &self,
        record: EntityRecord,
    ) -> Result<Arc<EntityRecord>, RegistryError> {
        let id = record.id;
        let record = Arc::new(record);
        let mut inner = self.inner.lock();
        if inner.entities.contains_key(&id) {
            drop(inner);
            error!(zone = %self.key, entity_id = %id, "Entity id collision on register");
            return Err(RegistryError::IdCollision(id));
        }
        inner.entities.insert(id, record.clone());
        Ok(record)
    }

    /// Remove an entity record. Idempotent: absent id is a no-op.
    pub fn unregister_entity(&self, id: EntityId) {
        let mut inner = self.inner.lock();
        inner.entities.remove(&id);
    }

    /// Shared reference to an entity, stable after the lock is released
    pub fn entity(&self, id: EntityId) -> Option<Arc<EntityRecord>> {
        let inner = self.inner.lock();
        inner.entities.get(&id).cloned()
    }

    /// Snapshot of every entity of one kind
    pub fn entities_of_kind(&self, kind: EntityKind) -> Vec<Arc<EntityRecord>> {
        let inner = self.inner.lock();
        inner
            .entities
            .values()
            .filter(|record| record.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn entity_count(&self) -> usize {
        self.inner.lock().entities.len()
    }

    /// Register a connecting client's primary (and optional companion) entity
    /// records and map the primary entity id to the client handle. All three
    /// writes happen under the one lock; nothing is inserted on collision.
    pub fn add_connection(
        &self,
        client: ClientHandle,
        primary: EntityRecord,
        companion: Option<EntityRecord>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if inner.entities.contains_key(&primary.id) {
            return Err(RegistryError::IdCollision(primary.id));
        }
        if let Some(companion) = &companion {
            if inner.entities.contains_key(&companion.id) {
                return Err(RegistryError::IdCollision(companion.id));
            }
        }

        let primary_id = primary.id;
        inner.entities.insert(primary_id, Arc::new(primary));
        if let Some(companion) = companion {
            inner.entities.insert(companion.id, Arc::new(companion));
        }
        inner.clients.insert(primary_id, client);
        Ok(())
    }

    /// Drop a client and its entity records (companion included)
    pub fn remove_connection(&self, primary_id: EntityId) {
        let mut inner = self.inner.lock();
        inner.clients.remove(&primary_id);
        inner.entities.remove(&primary_id);

        let companion_ids: Vec<EntityId> = inner
            .entities
            .values()
            .filter(|record| record.owner_entity() == Some(primary_id))
            .map(|record| record.id)
            .collect();
        for id in companion_ids {
            inner.entities.remove(&id);
        }
    }

    /// The connected client controlling `primary_id`, if any
    pub fn client(&self, primary_id: EntityId) -> Option<ClientHandle> {
        let inner = self.inner.lock();
        inner.clients.get(&primary_id).cloned()
    }

    /// Snapshot of every connected client
    pub fn clients(&self) -> Vec<ClientHandle> {
        let inner = self.inner.lock();
        inner.clients.values().cloned().collect()
    }

    pub fn population(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().clients.is_empty()
    }

    /// Send a notice to every connected client. The client list is copied out
    /// under the lock; sends happen after release.
    pub fn broadcast(&self, notice: Notice) {
        let clients = self.clients();
        for client in clients {
            client.send(notice.clone());
        }
    }

    /// Attach a match to this zone. A zone holds at most one match; the
    /// previous one must have been detached first.
    pub fn attach_match(&self, id: MatchId) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if let Some(current) = inner.attached_match {
            drop(inner);
            debug!(zone = %self.key, match_id = %id, current = %current, "Refusing second match attach");
            return Err(RegistryError::MatchAttached(current));
        }
        inner.attached_match = Some(id);
        Ok(())
    }

    /// Detach the given match. Fails if a different match is attached.
    pub fn detach_match(&self, id: MatchId) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if inner.attached_match != Some(id) {
            let actual = inner.attached_match;
            return Err(RegistryError::MatchMismatch {
                expected: id,
                actual,
            });
        }
        inner.attached_match = None;
        Ok(())
    }

    pub fn attached_match(&self) -> Option<MatchId> {
        self.inner.lock().attached_match
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::CharacterId;
    use crate::zone::entity::EntityData;

    fn test_zone() -> Zone {
        let def = Arc::new(ZoneDef::new(10, "arena", false, 2));
        Zone::new(ZoneKey::new(10, 0), def)
    }

    fn npc(id: u32) -> EntityRecord {
        EntityRecord::new(EntityId(id), EntityData::Npc { def_id: 500 })
    }

    #[test]
    fn register_then_get_returns_shared_record() {
        let zone = test_zone();
        zone.register_entity(npc(1)).unwrap();

        let record = zone.entity(EntityId(1)).expect("registered entity");
        assert_eq!(record.kind(), EntityKind::Npc);
        assert_eq!(zone.entity_count(), 1);
    }

    #[test]
    fn register_rejects_id_collision() {
        let zone = test_zone();
        zone.register_entity(npc(1)).unwrap();

        let err = zone.register_entity(npc(1)).unwrap_err();
        assert!(matches!(err, RegistryError::IdCollision(EntityId(1))));
        assert_eq!(zone.entity_count(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let zone = test_zone();
        zone.register_entity(npc(7)).unwrap();

        zone.unregister_entity(EntityId(7));
        assert!(zone.entity(EntityId(7)).is_none());
        // second remove is a no-op, not an error
        zone.unregister_entity(EntityId(7));
        assert_eq!(zone.entity_count(), 0);
    }

    #[test]
    fn at_most_one_attached_match() {
        let zone = test_zone();
        zone.attach_match(MatchId(1)).unwrap();

        assert!(zone.attach_match(MatchId(2)).is_err());
        assert_eq!(zone.attached_match(), Some(MatchId(1)));

        // detaching the wrong match leaves the slot untouched
        assert!(zone.detach_match(MatchId(2)).is_err());
        zone.detach_match(MatchId(1)).unwrap();
        assert_eq!(zone.attached_match(), None);

        zone.attach_match(MatchId(2)).unwrap();
        assert_eq!(zone.attached_match(), Some(MatchId(2)));
    }

    #[test]
    fn connection_registers_primary_and_companion() {
        let zone = test_zone();
        let (client, _rx) = ClientHandle::new(CharacterId(42), true);

        let primary_id = zone.allocate_entity_id();
        let companion_id = zone.allocate_entity_id();
        zone.add_connection(
            client,
            EntityRecord::new(
                primary_id,
                EntityData::PlayerCharacter {
                    character_id: CharacterId(42),
                    level: 30,
                },
            ),
            Some(EntityRecord::new(
                companion_id,
                EntityData::PlayerCompanion {
                    character_id: CharacterId(42),
                    owner: primary_id,
                },
            )),
        )
        .unwrap();

        assert_eq!(zone.population(), 1);
        assert_eq!(zone.entity_count(), 2);
        assert!(zone.client(primary_id).is_some());

        zone.remove_connection(primary_id);
        assert!(zone.is_empty());
        assert_eq!(zone.entity_count(), 0);
    }
}
