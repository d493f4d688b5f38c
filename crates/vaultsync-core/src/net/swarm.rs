//! Swarm membership and replication-stream lifecycle
//!
//! One controller per registry. A vault is either unjoined or flocking;
//! `configure_network` reconciles the persisted `networked` setting with
//! that state. While flocking, a listener task owns the vault's topic
//! receiver: it resolves incoming feed traffic to the loaded vault via
//! the shared discovery-key map, serves log entries and blobs to peers,
//! applies verified remote entries, and keeps the peer bookkeeping (and
//! its coalesced history) current.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::debug_log::DebugLog;
use crate::error::{VaultError, VaultResult};
use crate::events::{EventBus, VaultEvent};
use crate::net::gossip::{topic_for, GossipNet, TopicEvent, TopicSender};
use crate::net::protocol::{
    WireMessage, MAX_BLOB_BYTES_PER_MESSAGE, MAX_ENTRIES_PER_MESSAGE,
};
use crate::storage::VaultDb;
use crate::types::{DiscoveryKey, UserSettings};
use crate::vault::Vault;

/// Map shared between the registry and the swarm: a vault is registered
/// here before it is exposed for general lookup, so the peer-matching
/// path can find it mid-load.
pub type DkeyMap = Arc<RwLock<HashMap<DiscoveryKey, Arc<Vault>>>>;

struct FlockHandle {
    sender: TopicSender,
    listener: JoinHandle<()>,
}

/// Joins/leaves the discovery swarm per vault and manages replication
/// stream lifecycle.
pub struct SwarmController {
    db: VaultDb,
    events: EventBus,
    debug_log: Arc<DebugLog>,
    vaults_by_dkey: DkeyMap,
    gossip: OnceCell<Arc<GossipNet>>,
    flocks: Mutex<HashMap<DiscoveryKey, FlockHandle>>,
}

impl SwarmController {
    pub fn new(
        db: VaultDb,
        events: EventBus,
        debug_log: Arc<DebugLog>,
        vaults_by_dkey: DkeyMap,
    ) -> Self {
        Self {
            db,
            events,
            debug_log,
            vaults_by_dkey,
            gossip: OnceCell::new(),
            flocks: Mutex::new(HashMap::new()),
        }
    }

    /// Lazily spawn the endpoint under the persistent network identity.
    async fn ensure_gossip(&self) -> VaultResult<Arc<GossipNet>> {
        self.gossip
            .get_or_try_init(|| async {
                let secret_key = match self.db.load_endpoint_secret_key()? {
                    Some(bytes) => iroh::SecretKey::from(bytes),
                    None => {
                        let secret_key = iroh::SecretKey::generate(&mut rand::rng());
                        self.db.save_endpoint_secret_key(&secret_key.to_bytes())?;
                        secret_key
                    }
                };
                Ok::<_, VaultError>(Arc::new(GossipNet::with_secret_key(Some(secret_key)).await?))
            })
            .await
            .map(|gossip| gossip.clone())
    }

    /// Reconcile desired state (`settings.networked`) with actual state.
    pub async fn configure_network(
        &self,
        vault: &Arc<Vault>,
        settings: &UserSettings,
    ) -> VaultResult<()> {
        if settings.networked {
            self.join_flock(vault).await
        } else {
            self.leave_flock(vault);
            Ok(())
        }
    }

    /// Join the vault's discovery swarm. No-op if already flocking.
    pub async fn join_flock(&self, vault: &Arc<Vault>) -> VaultResult<()> {
        if vault.is_flocking() {
            return Ok(());
        }
        let gossip = self.ensure_gossip().await?;
        let dkey = *vault.discovery_key();
        let (sender, mut receiver) = gossip.subscribe_split(topic_for(&dkey), vec![]).await?;

        self.debug_log
            .record(*vault.key(), "flocking", dkey.to_hex());
        vault.set_flocking(true);

        let listener = {
            let vault = vault.clone();
            let sender = sender.clone();
            let events = self.events.clone();
            let by_dkey = self.vaults_by_dkey.clone();
            let debug_log = self.debug_log.clone();
            tokio::spawn(async move {
                while let Some(event) = receiver.recv_event().await {
                    match event {
                        TopicEvent::Message(msg) => {
                            if let Err(e) = handle_message(&vault, &sender, &msg.content).await {
                                warn!(key = %vault.key(), error = ?e, "Replication message failed");
                                debug_log.record(
                                    *vault.key(),
                                    "connection-error",
                                    e.to_string(),
                                );
                            }
                        }
                        TopicEvent::NeighborUp(peer) => {
                            vault.add_peer(peer.to_string());
                            publish_network_changed(&vault, &by_dkey, &events);
                            // let the newcomer see where we are
                            let announce = WireMessage::Announce {
                                version: vault.version(),
                            };
                            if let Ok(bytes) = announce.encode() {
                                let _ = sender.broadcast(bytes).await;
                            }
                        }
                        TopicEvent::NeighborDown(peer) => {
                            vault.remove_peer(&peer.to_string());
                            publish_network_changed(&vault, &by_dkey, &events);
                        }
                    }
                }
                debug!(key = %vault.key(), "Replication listener ended");
            })
        };

        self.flocks
            .lock()
            .insert(dkey, FlockHandle { sender: sender.clone(), listener });

        // initial announce so existing peers learn our version
        let announce = WireMessage::Announce {
            version: vault.version(),
        };
        if let Ok(bytes) = announce.encode() {
            let _ = sender.broadcast(bytes).await;
        }
        Ok(())
    }

    /// Leave the vault's swarm, destroying every active replication
    /// stream. No-op if not flocking.
    pub fn leave_flock(&self, vault: &Arc<Vault>) {
        if !vault.is_flocking() {
            return;
        }
        if let Some(handle) = self.flocks.lock().remove(vault.discovery_key()) {
            handle.listener.abort();
            drop(handle.sender);
        }
        self.debug_log.record(
            *vault.key(),
            "unflocking",
            format!("Disconnected {} peers", vault.peer_count()),
        );
        vault.clear_peers();
        vault.set_flocking(false);
    }

    /// Announce the current version on the vault's topic (called after
    /// local writes so replicas know to catch up).
    pub async fn announce(&self, vault: &Arc<Vault>) {
        let sender = match self.flocks.lock().get(vault.discovery_key()) {
            Some(handle) => handle.sender.clone(),
            None => return,
        };
        let announce = WireMessage::Announce {
            version: vault.version(),
        };
        if let Ok(bytes) = announce.encode() {
            let _ = sender.broadcast(bytes).await;
        }
    }

    /// Ask peers for every blob in the vault's wanted set.
    pub async fn request_wanted(&self, vault: &Arc<Vault>) {
        let sender = match self.flocks.lock().get(vault.discovery_key()) {
            Some(handle) => handle.sender.clone(),
            None => return,
        };
        request_wanted_blobs(vault, &sender).await;
    }

    /// Leave every flock and close the endpoint.
    pub async fn shutdown(&self) {
        let handles: Vec<FlockHandle> = self.flocks.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.listener.abort();
        }
        if let Some(gossip) = self.gossip.get() {
            let _ = gossip.shutdown().await;
        }
    }
}

/// Handle one replication message for a flocking vault.
async fn handle_message(
    vault: &Arc<Vault>,
    sender: &TopicSender,
    content: &[u8],
) -> VaultResult<()> {
    let store = vault.store();
    let msg = WireMessage::decode(content)
        .map_err(|e| VaultError::Serialization(e.to_string()))?;
    match msg {
        WireMessage::Announce { version } => {
            if !store.writable() && version > store.version() {
                let request = WireMessage::Request {
                    from: store.version(),
                };
                sender
                    .broadcast(request.encode().map_err(|e| {
                        VaultError::Serialization(e.to_string())
                    })?)
                    .await?;
            }
        }
        WireMessage::Request { from } => {
            if store.version() > from {
                let entries = store.entries_from(from)?;
                for chunk in entries.chunks(MAX_ENTRIES_PER_MESSAGE) {
                    let msg = WireMessage::Entries {
                        entries: chunk.to_vec(),
                    };
                    sender
                        .broadcast(msg.encode().map_err(|e| {
                            VaultError::Serialization(e.to_string())
                        })?)
                        .await?;
                }
            }
        }
        WireMessage::Entries { entries } => {
            if !store.writable() {
                let applied = store.apply_remote(&entries)?;
                debug!(key = %vault.key(), applied, "Applied replicated entries");
                if !store.wanted_blobs().is_empty() {
                    request_wanted_blobs(vault, sender).await;
                }
            }
        }
        WireMessage::BlobRequest { hashes } => {
            let mut batch: Vec<([u8; 32], Vec<u8>)> = Vec::new();
            let mut batch_bytes = 0usize;
            for hash in hashes {
                if let Some(bytes) = store.blob_bytes(&hash)? {
                    batch_bytes += bytes.len();
                    batch.push((hash, bytes));
                    if batch_bytes >= MAX_BLOB_BYTES_PER_MESSAGE {
                        send_blob_batch(sender, std::mem::take(&mut batch)).await?;
                        batch_bytes = 0;
                    }
                }
            }
            if !batch.is_empty() {
                send_blob_batch(sender, batch).await?;
            }
        }
        WireMessage::BlobData { blobs } => {
            for (hash, bytes) in blobs {
                if !store.has_blob(&hash)? {
                    if let Err(e) = store.insert_blob(&hash, &bytes) {
                        warn!(key = %vault.key(), error = ?e, "Rejected blob from peer");
                    }
                }
            }
        }
    }
    Ok(())
}

async fn send_blob_batch(
    sender: &TopicSender,
    blobs: Vec<([u8; 32], Vec<u8>)>,
) -> VaultResult<()> {
    let msg = WireMessage::BlobData { blobs };
    sender
        .broadcast(
            msg.encode()
                .map_err(|e| VaultError::Serialization(e.to_string()))?,
        )
        .await
}

async fn request_wanted_blobs(vault: &Arc<Vault>, sender: &TopicSender) {
    let wanted = vault.store().wanted_blobs();
    if wanted.is_empty() {
        return;
    }
    for chunk in wanted.chunks(128) {
        let msg = WireMessage::BlobRequest {
            hashes: chunk.to_vec(),
        };
        if let Ok(bytes) = msg.encode() {
            let _ = sender.broadcast(bytes).await;
        }
    }
}

/// Coalesce a history sample and emit the aggregate network-changed event.
fn publish_network_changed(vault: &Arc<Vault>, by_dkey: &DkeyMap, events: &EventBus) {
    let sample = vault.record_peer_sample();
    let total_peer_count: usize = by_dkey.read().values().map(|v| v.peer_count()).sum();
    events.publish(VaultEvent::NetworkChanged {
        url: vault.url().to_string(),
        peers: vault.peers(),
        peer_count: vault.peer_count(),
        total_peer_count,
        sample,
    });
}
