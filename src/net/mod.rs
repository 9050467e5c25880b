//! Connection handles and lookup
//!
//! The packet layer owns sockets, authentication and byte encoding. This
//! core sees a connected client only as a character id plus an opaque notice
//! sink, and looks clients up by world-character-id.

pub mod protocol;

pub use protocol::{FailCode, Notice, PlacementEntry, RewardEntry};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::game::CharacterId;

/// Handle to one connected client
#[derive(Clone)]
pub struct ClientHandle {
    pub character_id: CharacterId,
    /// Connected to this process (false = mirrored from another channel)
    pub local: bool,
    tx: mpsc::UnboundedSender<Notice>,
}

impl ClientHandle {
    /// Create a handle plus the receiving end the packet layer drains
    pub fn new(
        character_id: CharacterId,
        local: bool,
    ) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                character_id,
                local,
                tx,
            },
            rx,
        )
    }

    /// Best-effort send; a closed sink means the client is mid-disconnect
    pub fn send(&self, notice: Notice) {
        if self.tx.send(notice).is_err() {
            debug!(character_id = %self.character_id, "Notice dropped, client sink closed");
        }
    }
}

/// Process-wide registry of connected clients, keyed by character id
pub struct ConnectionRegistry {
    clients: DashMap<CharacterId, ClientHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    pub fn register(&self, client: ClientHandle) {
        self.clients.insert(client.character_id, client);
    }

    pub fn unregister(&self, character_id: CharacterId) {
        self.clients.remove(&character_id);
    }

    /// Look up one client; `local_only` filters out mirrored handles
    pub fn client_by_character(
        &self,
        character_id: CharacterId,
        local_only: bool,
    ) -> Option<ClientHandle> {
        self.clients
            .get(&character_id)
            .map(|entry| entry.value().clone())
            .filter(|client| !local_only || client.local)
    }

    /// Look up a set of clients, skipping ids with no connection
    pub fn clients_by_characters(
        &self,
        character_ids: &[CharacterId],
        local_only: bool,
    ) -> Vec<ClientHandle> {
        character_ids
            .iter()
            .filter_map(|id| self.client_by_character(*id, local_only))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_only_filters_mirrored_handles() {
        let registry = ConnectionRegistry::new();
        let (local, _rx1) = ClientHandle::new(CharacterId(1), true);
        let (remote, _rx2) = ClientHandle::new(CharacterId(2), false);
        registry.register(local);
        registry.register(remote);

        assert!(registry.client_by_character(CharacterId(1), true).is_some());
        assert!(registry.client_by_character(CharacterId(2), true).is_none());
        assert!(registry.client_by_character(CharacterId(2), false).is_some());

        let both = registry.clients_by_characters(&[CharacterId(1), CharacterId(2)], false);
        assert_eq!(both.len(), 2);
        let local_only = registry.clients_by_characters(&[CharacterId(1), CharacterId(2)], true);
        assert_eq!(local_only.len(), 1);
    }

    #[tokio::test]
    async fn notices_arrive_in_send_order() {
        let (client, mut rx) = ClientHandle::new(CharacterId(9), true);
        client.send(Notice::MatchStarted {
            match_id: crate::game::MatchId(1),
        });
        client.send(Notice::MatchEnded {
            match_id: crate::game::MatchId(1),
        });

        assert!(matches!(rx.recv().await, Some(Notice::MatchStarted { .. })));
        assert!(matches!(rx.recv().await, Some(Notice::MatchEnded { .. })));
    }
}
