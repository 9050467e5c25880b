//! Zone registry modules

pub mod entity;
pub mod manager;
pub mod zone;

pub use manager::{Instance, InstanceAccess, ZoneManager};
pub use zone::{RegistryError, Zone};

use serde::{Deserialize, Serialize};

/// Logical zone address: static definition id plus channel (variant) number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZoneKey {
    pub def_id: u32,
    pub channel: u16,
}

impl ZoneKey {
    pub fn new(def_id: u32, channel: u16) -> Self {
        Self { def_id, channel }
    }
}

impl std::fmt::Display for ZoneKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.def_id, self.channel)
    }
}

/// Channel number reserved for zones living inside a private instance
pub const INSTANCE_CHANNEL: u16 = u16::MAX;

/// Private instance id
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InstanceId(pub u64);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static zone definition (layout/rules), owned by the definition layer
#[derive(Debug, Clone)]
pub struct ZoneDef {
    pub def_id: u32,
    pub name: String,
    /// Global zones survive when empty; others are torn down
    pub persistent: bool,
    /// Number of capturable base slots spawned for adversarial matches
    pub base_slots: u8,
}

impl ZoneDef {
    pub fn new(def_id: u32, name: impl Into<String>, persistent: bool, base_slots: u8) -> Self {
        Self {
            def_id,
            name: name.into(),
            persistent,
            base_slots,
        }
    }
}
