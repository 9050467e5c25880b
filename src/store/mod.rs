//! Persistence seam
//!
//! The database layer lives behind a narrow change-set interface: the match
//! core builds a batch of record operations, hands it over, and gets back a
//! single success flag. Whether a failure is fatal is the caller's call -
//! post-match cosmetic updates are logged and dropped, live-record updates
//! are treated more seriously.

pub mod records;

pub use records::{ExperienceGrant, PvpRecord, UltimateRecord};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::game::CharacterId;

/// Record families, keyed by type name on the sync channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Pvp,
    Ultimate,
    Experience,
}

impl RecordKind {
    pub fn name(self) -> &'static str {
        match self {
            RecordKind::Pvp => "pvp_record",
            RecordKind::Ultimate => "ultimate_record",
            RecordKind::Experience => "experience_grant",
        }
    }
}

/// One record payload
#[derive(Debug, Clone)]
pub enum RecordData {
    Pvp(PvpRecord),
    Ultimate(UltimateRecord),
    Experience(ExperienceGrant),
}

/// One insert/update/delete
#[derive(Debug, Clone)]
pub enum RecordOp {
    Upsert(RecordData),
    Delete { kind: RecordKind, key: CharacterId },
}

/// A batch of record operations applied as one unit
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    ops: Vec<RecordOp>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, data: RecordData) -> &mut Self {
        self.ops.push(RecordOp::Upsert(data));
        self
    }

    pub fn delete(&mut self, kind: RecordKind, key: CharacterId) -> &mut Self {
        self.ops.push(RecordOp::Delete { kind, key });
        self
    }

    pub fn ops(&self) -> &[RecordOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The persistence collaborator
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Apply the whole change set; false means nothing was written
    async fn process_change_set(&self, set: ChangeSet) -> bool;

    async fn pvp_record(&self, character_id: CharacterId) -> Option<PvpRecord>;

    async fn ultimate_record(&self, character_id: CharacterId) -> Option<UltimateRecord>;
}

/// In-memory store used by tests and standalone runs
#[derive(Default)]
pub struct MemoryStore {
    pvp: DashMap<CharacterId, PvpRecord>,
    ultimate: DashMap<CharacterId, UltimateRecord>,
    experience: DashMap<CharacterId, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total experience granted to a character (test observability)
    pub fn experience_total(&self, character_id: CharacterId) -> u64 {
        self.experience
            .get(&character_id)
            .map(|entry| *entry.value())
            .unwrap_or(0)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn process_change_set(&self, set: ChangeSet) -> bool {
        for op in set.ops() {
            match op {
                RecordOp::Upsert(RecordData::Pvp(record)) => {
                    self.pvp.insert(record.character_id, record.clone());
                }
                RecordOp::Upsert(RecordData::Ultimate(record)) => {
                    self.ultimate.insert(record.character_id, record.clone());
                }
                RecordOp::Upsert(RecordData::Experience(grant)) => {
                    *self.experience.entry(grant.character_id).or_insert(0) += grant.amount;
                }
                RecordOp::Delete { kind, key } => match kind {
                    RecordKind::Pvp => {
                        self.pvp.remove(key);
                    }
                    RecordKind::Ultimate => {
                        self.ultimate.remove(key);
                    }
                    RecordKind::Experience => {
                        self.experience.remove(key);
                    }
                },
            }
        }
        true
    }

    async fn pvp_record(&self, character_id: CharacterId) -> Option<PvpRecord> {
        self.pvp.get(&character_id).map(|entry| entry.value().clone())
    }

    async fn ultimate_record(&self, character_id: CharacterId) -> Option<UltimateRecord> {
        self.ultimate
            .get(&character_id)
            .map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn change_set_round_trip() {
        let store = MemoryStore::new();

        let mut record = PvpRecord::new(CharacterId(1));
        record.gp = 120;

        let mut set = ChangeSet::new();
        set.upsert(RecordData::Pvp(record))
            .upsert(RecordData::Experience(ExperienceGrant {
                character_id: CharacterId(1),
                amount: 500,
            }));
        assert_eq!(set.len(), 2);

        assert!(store.process_change_set(set).await);
        assert_eq!(store.pvp_record(CharacterId(1)).await.unwrap().gp, 120);
        assert_eq!(store.experience_total(CharacterId(1)), 500);

        let mut removal = ChangeSet::new();
        removal.delete(RecordKind::Pvp, CharacterId(1));
        assert!(store.process_change_set(removal).await);
        assert!(store.pvp_record(CharacterId(1)).await.is_none());
    }
}
