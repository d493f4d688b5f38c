//! In-memory state for a loaded vault
//!
//! A `Vault` is exclusively owned by the registry's maps while loaded and
//! shared out as `Arc<Vault>`. Everything mutable sits behind its own
//! lock; swarm code owns the peer set, sync code owns the watcher slot,
//! and neither assumes a snapshot stays valid across an await.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::autodownload::AutoDownloader;
use crate::folder_sync::{FolderWatcher, SyncGuard};
use crate::store::VersionedStore;
use crate::types::{
    from_key_to_url, now_ms, DiscoveryKey, Manifest, PeerHistorySample, VaultKey,
};

/// Coalescing window for peer-history samples (10 s)
const PEER_HISTORY_COALESCE_MS: i64 = 10_000;
/// Cap before the history is trimmed
const PEER_HISTORY_CAP: usize = 500;
/// Entries kept after trimming (one hour at 10 s resolution)
const PEER_HISTORY_KEEP: usize = 360;

/// A loaded vault
pub struct Vault {
    key: VaultKey,
    discovery_key: DiscoveryKey,
    url: String,
    store: VersionedStore,
    flocking: AtomicBool,
    /// Connected peer identifiers, owned by the swarm controller
    peers: Mutex<BTreeSet<String>>,
    peer_history: Mutex<Vec<PeerHistorySample>>,
    local_sync_path: Mutex<Option<PathBuf>>,
    manifest: RwLock<Manifest>,
    pub(crate) autodownloader: Mutex<Option<AutoDownloader>>,
    pub(crate) watcher: Mutex<Option<FolderWatcher>>,
    /// Task wired to the store change-watch stream
    pub(crate) change_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) sync_guard: Arc<SyncGuard>,
}

impl Vault {
    pub(crate) fn new(key: VaultKey, store: VersionedStore) -> Self {
        Self {
            key,
            discovery_key: DiscoveryKey::derive(&key),
            url: from_key_to_url(&key),
            store,
            flocking: AtomicBool::new(false),
            peers: Mutex::new(BTreeSet::new()),
            peer_history: Mutex::new(Vec::new()),
            local_sync_path: Mutex::new(None),
            manifest: RwLock::new(Manifest::default()),
            autodownloader: Mutex::new(None),
            watcher: Mutex::new(None),
            change_task: Mutex::new(None),
            sync_guard: Arc::new(SyncGuard::new()),
        }
    }

    pub fn key(&self) -> &VaultKey {
        &self.key
    }

    pub fn discovery_key(&self) -> &DiscoveryKey {
        &self.discovery_key
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn store(&self) -> &VersionedStore {
        &self.store
    }

    pub fn writable(&self) -> bool {
        self.store.writable()
    }

    pub fn version(&self) -> u64 {
        self.store.version()
    }

    /// Content byte estimate
    pub fn size(&self) -> u64 {
        self.store.content_bytes()
    }

    /// Cached manifest, refreshed on every meta pull
    pub fn manifest(&self) -> Manifest {
        self.manifest.read().clone()
    }

    pub(crate) fn set_manifest(&self, manifest: Manifest) {
        *self.manifest.write() = manifest;
    }

    pub fn is_flocking(&self) -> bool {
        self.flocking.load(Ordering::SeqCst)
    }

    pub(crate) fn set_flocking(&self, value: bool) {
        self.flocking.store(value, Ordering::SeqCst);
    }

    pub fn local_sync_path(&self) -> Option<PathBuf> {
        self.local_sync_path.lock().clone()
    }

    pub(crate) fn set_local_sync_path(&self, path: Option<PathBuf>) {
        *self.local_sync_path.lock() = path;
    }

    // ═══════════════════════════════════════════════════════════════════
    // Peer bookkeeping (swarm controller only)
    // ═══════════════════════════════════════════════════════════════════

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.lock().iter().cloned().collect()
    }

    pub(crate) fn add_peer(&self, id: String) -> usize {
        let mut peers = self.peers.lock();
        peers.insert(id);
        peers.len()
    }

    pub(crate) fn remove_peer(&self, id: &str) -> usize {
        let mut peers = self.peers.lock();
        peers.remove(id);
        peers.len()
    }

    pub(crate) fn clear_peers(&self) {
        self.peers.lock().clear();
    }

    pub fn peer_history(&self) -> Vec<PeerHistorySample> {
        self.peer_history.lock().clone()
    }

    /// Record the current peer count in the history, coalescing samples
    /// within the 10 s window and trimming past the cap. Returns the
    /// sample that now ends the sequence.
    pub(crate) fn record_peer_sample(&self) -> PeerHistorySample {
        let peers = self.peer_count();
        let now = now_ms();
        let mut history = self.peer_history.lock();

        match history.last_mut() {
            Some(last) if now - last.ts < PEER_HISTORY_COALESCE_MS => {
                last.peers = peers;
            }
            _ => history.push(PeerHistorySample { ts: now, peers }),
        }

        if history.len() >= PEER_HISTORY_CAP {
            let start = history.len() - PEER_HISTORY_KEEP;
            history.drain(..start);
        }

        *history.last().expect("history is never empty here")
    }

    /// Test-only access for pre-seeding history timestamps
    #[cfg(test)]
    pub(crate) fn push_history_sample(&self, sample: PeerHistorySample) {
        self.peer_history.lock().push(sample);
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("key", &self.key)
            .field("writable", &self.writable())
            .field("version", &self.version())
            .field("flocking", &self.is_flocking())
            .finish()
    }
}
