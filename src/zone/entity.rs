//! Zone entities - the polymorphic records tracked by a zone's registry

use serde::{Deserialize, Serialize};

use crate::game::CharacterId;

/// Entity id, unique within one zone's lifetime (not globally)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntityId(pub u32);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of entity kinds the registry can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    PlayerCharacter,
    PlayerCompanion,
    Npc,
    StaticObject,
    LootContainer,
    BossSpawn,
    PvpBase,
    DiasporaBase,
    CultureMachine,
}

/// Kind-specific payload. Identity and definition references only - mutable
/// match state (base occupation, boss gauges) lives with the match that owns
/// it, keyed by entity id.
#[derive(Debug, Clone)]
pub enum EntityData {
    PlayerCharacter {
        character_id: CharacterId,
        level: u16,
    },
    /// A player's companion; resolves to the owning player for team checks
    PlayerCompanion {
        character_id: CharacterId,
        owner: EntityId,
    },
    Npc {
        def_id: u32,
    },
    StaticObject {
        def_id: u32,
    },
    LootContainer {
        def_id: u32,
        owner: Option<EntityId>,
    },
    BossSpawn {
        def_id: u32,
        kill_value: i32,
    },
    PvpBase {
        slot: u8,
    },
    DiasporaBase {
        def_id: u32,
        tier: u8,
    },
    CultureMachine {
        def_id: u32,
        owner_character: Option<CharacterId>,
    },
}

/// One registered entity
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub id: EntityId,
    pub data: EntityData,
}

impl EntityRecord {
    pub fn new(id: EntityId, data: EntityData) -> Self {
        Self { id, data }
    }

    pub fn kind(&self) -> EntityKind {
        match self.data {
            EntityData::PlayerCharacter { .. } => EntityKind::PlayerCharacter,
            EntityData::PlayerCompanion { .. } => EntityKind::PlayerCompanion,
            EntityData::Npc { .. } => EntityKind::Npc,
            EntityData::StaticObject { .. } => EntityKind::StaticObject,
            EntityData::LootContainer { .. } => EntityKind::LootContainer,
            EntityData::BossSpawn { .. } => EntityKind::BossSpawn,
            EntityData::PvpBase { .. } => EntityKind::PvpBase,
            EntityData::DiasporaBase { .. } => EntityKind::DiasporaBase,
            EntityData::CultureMachine { .. } => EntityKind::CultureMachine,
        }
    }

    /// The controlling character, for players and companions
    pub fn character_id(&self) -> Option<CharacterId> {
        match self.data {
            EntityData::PlayerCharacter { character_id, .. }
            | EntityData::PlayerCompanion { character_id, .. } => Some(character_id),
            _ => None,
        }
    }

    /// The owning entity, where one exists (companions, owned loot)
    pub fn owner_entity(&self) -> Option<EntityId> {
        match self.data {
            EntityData::PlayerCompanion { owner, .. } => Some(owner),
            EntityData::LootContainer { owner, .. } => owner,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_maps_from_its_data() {
        let cases = vec![
            (
                EntityData::PlayerCharacter {
                    character_id: CharacterId(1),
                    level: 40,
                },
                EntityKind::PlayerCharacter,
            ),
            (
                EntityData::PlayerCompanion {
                    character_id: CharacterId(1),
                    owner: EntityId(1),
                },
                EntityKind::PlayerCompanion,
            ),
            (EntityData::Npc { def_id: 10 }, EntityKind::Npc),
            (EntityData::StaticObject { def_id: 11 }, EntityKind::StaticObject),
            (
                EntityData::LootContainer {
                    def_id: 12,
                    owner: Some(EntityId(1)),
                },
                EntityKind::LootContainer,
            ),
            (
                EntityData::BossSpawn {
                    def_id: 13,
                    kill_value: 1_000,
                },
                EntityKind::BossSpawn,
            ),
            (EntityData::PvpBase { slot: 0 }, EntityKind::PvpBase),
            (
                EntityData::DiasporaBase { def_id: 14, tier: 2 },
                EntityKind::DiasporaBase,
            ),
            (
                EntityData::CultureMachine {
                    def_id: 15,
                    owner_character: Some(CharacterId(1)),
                },
                EntityKind::CultureMachine,
            ),
        ];

        for (index, (data, kind)) in cases.into_iter().enumerate() {
            let record = EntityRecord::new(EntityId(index as u32 + 1), data);
            assert_eq!(record.kind(), kind);
        }
    }

    #[test]
    fn ownership_resolves_for_companions_and_owned_loot() {
        let companion = EntityRecord::new(
            EntityId(2),
            EntityData::PlayerCompanion {
                character_id: CharacterId(7),
                owner: EntityId(1),
            },
        );
        assert_eq!(companion.owner_entity(), Some(EntityId(1)));
        assert_eq!(companion.character_id(), Some(CharacterId(7)));

        let npc = EntityRecord::new(EntityId(3), EntityData::Npc { def_id: 5 });
        assert_eq!(npc.owner_entity(), None);
        assert_eq!(npc.character_id(), None);
    }
}
