//! Vault event fan-out
//!
//! All registry, swarm, and folder-sync notifications flow through one
//! broadcast channel. Delivery is at-least-once per subscriber with no
//! ordering guarantee across subscribers; a lagging subscriber loses the
//! oldest events, not the newest.

use tokio::sync::broadcast;

use crate::types::{PeerHistorySample, SyncDirection};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the vault registry and its subsystems
#[derive(Debug, Clone)]
pub enum VaultEvent {
    /// A vault was saved (pinned) by a settings change
    Added { url: String },
    /// A vault was unsaved by a settings change
    Removed { url: String },
    /// A vault's manifest-derived metadata was refreshed
    Updated { url: String },
    /// Peer set changed for a vault
    NetworkChanged {
        url: String,
        /// Connected peer identifiers for this vault
        peers: Vec<String>,
        peer_count: usize,
        /// Sum of peer counts across all loaded vaults
        total_peer_count: usize,
        /// Most recent coalesced history sample
        sample: PeerHistorySample,
    },
    /// A folder sync pass completed
    FolderSynced { url: String, direction: SyncDirection },
    /// A folder sync failed in a way the host should surface
    FolderSyncError {
        url: String,
        /// Stable error kind (see `VaultError::kind`)
        kind: &'static str,
        message: String,
    },
}

/// Publish/subscribe hub for vault events. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VaultEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn publish(&self, event: VaultEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(VaultEvent::Added {
            url: "vault://00/".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, VaultEvent::Added { .. }));
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(VaultEvent::Removed {
            url: "vault://00/".to_string(),
        });
    }
}
