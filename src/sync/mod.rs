//! Channel-to-world synchronization
//!
//! Teams, queue entries and PvP match assignments are authoritatively owned
//! by the world process; this process keeps a local cache. Outgoing changes
//! accumulate in a queue flushed explicitly; incoming batches arrive through
//! `MatchManager::update_match_entries` / `update_pvp_matches`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::game::{CharacterId, MatchId, MatchType};

/// One record-change event on the world channel, keyed by record type name
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncEvent {
    Changed {
        kind: &'static str,
        payload: serde_json::Value,
    },
    Removed {
        kind: &'static str,
        key: u64,
    },
}

/// A flushed batch of outgoing events
pub type SyncBatch = Vec<SyncEvent>;

/// Inbound PvP match assignment pushed by the world process once enough
/// compatible queue entries exist
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvpMatchAssignment {
    pub match_id: MatchId,
    pub match_type: MatchType,
    /// Resolves to a local variant definition; unresolvable ids are skipped
    pub variant_id: u32,
    /// Server time (microseconds) the match is nominally ready
    pub ready_time: u64,
    /// Participants per side
    pub teams: [Vec<CharacterId>; 2],
}

/// Outgoing half of the world channel
pub struct WorldSync {
    outgoing: Mutex<Vec<SyncEvent>>,
    sink: mpsc::UnboundedSender<SyncBatch>,
}

impl WorldSync {
    /// Create the sync queue plus the receiver the world link drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncBatch>) {
        let (sink, rx) = mpsc::unbounded_channel();
        (
            Self {
                outgoing: Mutex::new(Vec::new()),
                sink,
            },
            rx,
        )
    }

    /// Queue a "this record changed" event
    pub fn queue_changed<T: Serialize>(&self, kind: &'static str, record: &T) {
        match serde_json::to_value(record) {
            Ok(payload) => {
                self.outgoing.lock().push(SyncEvent::Changed { kind, payload });
            }
            Err(error) => {
                warn!(kind, error = %error, "Failed to encode sync payload");
            }
        }
    }

    /// Queue a "this record was removed" event
    pub fn queue_removed(&self, kind: &'static str, key: u64) {
        self.outgoing.lock().push(SyncEvent::Removed { kind, key });
    }

    /// Flush everything queued since the last flush
    pub fn sync_outgoing(&self) {
        let batch: SyncBatch = {
            let mut outgoing = self.outgoing.lock();
            if outgoing.is_empty() {
                return;
            }
            outgoing.drain(..).collect()
        };

        debug!(events = batch.len(), "Flushing outgoing sync batch");
        if self.sink.send(batch).is_err() {
            warn!("World link closed, sync batch dropped");
        }
    }

    /// Number of unflushed events (test observability)
    pub fn pending(&self) -> usize {
        self.outgoing.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flush_drains_queued_events_in_order() {
        let (sync, mut rx) = WorldSync::new();

        sync.queue_changed("match_entry", &serde_json::json!({ "character_id": 7 }));
        sync.queue_removed("match_entry", 7);
        assert_eq!(sync.pending(), 2);

        sync.sync_outgoing();
        assert_eq!(sync.pending(), 0);

        let batch = rx.recv().await.expect("one batch");
        assert_eq!(batch.len(), 2);
        assert!(matches!(batch[0], SyncEvent::Changed { kind: "match_entry", .. }));
        assert!(matches!(batch[1], SyncEvent::Removed { kind: "match_entry", key: 7 }));

        // empty flush sends nothing
        sync.sync_outgoing();
        assert!(rx.try_recv().is_err());
    }
}
