//! Vault registry
//!
//! Owns the in-memory set of loaded vaults, keyed by public key and by
//! discovery key, deduplicates concurrent load requests, and drives
//! creation, forking, loading, and unloading. Construct one per service;
//! `shutdown` closes every open store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::autodownload::{configure_auto_download, stop_auto_download};
use crate::debug_log::{DebugLog, DebugRecord};
use crate::error::{VaultError, VaultResult};
use crate::events::{EventBus, VaultEvent};
use crate::folder_sync::{DiffOpts, FolderSyncEngine, DEFAULT_IGNORE_CONFIG_KEY};
use crate::ignore::DEFAULT_IGNORE_RULES;
use crate::net::{DkeyMap, SwarmController};
use crate::scoped_fs::ScopedFs;
use crate::storage::{TouchField, VaultDb};
use crate::store::{
    VersionedStore, IGNORE_FILE_PATH, MANIFEST_PATH, STORE_DIR_PATH, VCS_DIR_PATH,
};
use crate::tree::{join_path, FileTree};
use crate::types::{
    from_url_to_key, generate_keypair, now_ms, Manifest, SettingsUpdate, UserSettings,
    VaultKey, VaultMeta, VaultQuery, VaultSummary,
};
use crate::vault::Vault;

/// Debounce for store-change-driven meta refresh and vault→folder sync
const CHANGE_DEBOUNCE: Duration = Duration::from_secs(1);

/// Detailed single-vault view
#[derive(Debug, Clone)]
pub struct VaultInfo {
    pub url: String,
    pub meta: VaultMeta,
    pub user_settings: UserSettings,
    pub manifest: Manifest,
    pub version: u64,
    pub size: u64,
    pub peers: usize,
    pub peer_history: Vec<crate::types::PeerHistorySample>,
}

/// The vault lifecycle and replication manager
pub struct VaultRegistry {
    data_dir: PathBuf,
    db: VaultDb,
    events: EventBus,
    debug_log: Arc<DebugLog>,
    swarm: Arc<SwarmController>,
    folder_sync: Arc<FolderSyncEngine>,
    profile_id: u32,
    vaults: RwLock<HashMap<VaultKey, Arc<Vault>>>,
    vaults_by_dkey: DkeyMap,
    /// In-flight load deduplication, keyed by public key
    pending_loads: Mutex<HashMap<VaultKey, broadcast::Sender<Result<Arc<Vault>, String>>>>,
    /// Named advisory lock: settings read-modify-write
    settings_lock: tokio::sync::Mutex<()>,
    /// Named advisory lock: meta read-modify-write
    meta_lock: tokio::sync::Mutex<()>,
}

impl VaultRegistry {
    /// Create a registry rooted at `data_dir`. No vaults are loaded yet;
    /// call `load_saved_vaults` to bring up everything marked saved.
    pub fn new(data_dir: impl AsRef<Path>) -> VaultResult<Arc<Self>> {
        let data_dir = data_dir.as_ref().to_path_buf();
        info!(?data_dir, "Initializing vault registry");
        std::fs::create_dir_all(data_dir.join("vaults"))?;

        let db = VaultDb::new(data_dir.join("vaults.redb"))?;
        let events = EventBus::new();
        let debug_log = Arc::new(DebugLog::new());
        let vaults_by_dkey: DkeyMap = Arc::new(RwLock::new(HashMap::new()));
        let swarm = Arc::new(SwarmController::new(
            db.clone(),
            events.clone(),
            debug_log.clone(),
            vaults_by_dkey.clone(),
        ));
        let folder_sync = Arc::new(FolderSyncEngine::new(db.clone(), events.clone()));

        Ok(Arc::new(Self {
            data_dir,
            db,
            events,
            debug_log,
            swarm,
            folder_sync,
            profile_id: 0,
            vaults: RwLock::new(HashMap::new()),
            vaults_by_dkey,
            pending_loads: Mutex::new(HashMap::new()),
            settings_lock: tokio::sync::Mutex::new(()),
            meta_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// Subscribe to registry events
    pub fn events(&self) -> broadcast::Receiver<VaultEvent> {
        self.events.subscribe()
    }

    /// The folder sync engine (diff/sync/watch surface)
    pub fn folder_sync(&self) -> &Arc<FolderSyncEngine> {
        &self.folder_sync
    }

    /// The settings/meta database
    pub fn db(&self) -> &VaultDb {
        &self.db
    }

    /// The profile this registry operates as
    pub fn profile(&self) -> u32 {
        self.profile_id
    }

    /// The swarm controller (join/leave surface for hosts)
    pub fn swarm(&self) -> &Arc<SwarmController> {
        &self.swarm
    }

    /// Debug records for one vault
    pub fn debug_log(&self, key: &str) -> VaultResult<Vec<DebugRecord>> {
        let key = from_url_to_key(key)?;
        Ok(self.debug_log.records_for(&key))
    }

    /// Live tap on all debug records
    pub fn debug_tap(&self) -> broadcast::Receiver<DebugRecord> {
        self.debug_log.tap()
    }

    /// On-disk directory for a vault's store, derived from the key
    pub fn store_path(&self, key: &VaultKey) -> PathBuf {
        let hex = key.to_hex();
        self.data_dir.join("vaults").join(&hex[..2]).join(&hex[2..])
    }

    // ═══════════════════════════════════════════════════════════════════
    // Loading
    // ═══════════════════════════════════════════════════════════════════

    /// Load a vault. `key = None` generates a fresh keypair (the vault is
    /// owned and writable). A second concurrent load for the same key
    /// observes the first load's outcome; the store is opened once.
    ///
    /// A read-only vault with an empty log blocks until the first
    /// metadata update arrives from a peer; wrap this call in a timeout
    /// if that is not acceptable.
    pub async fn load(
        self: &Arc<Self>,
        key: Option<&str>,
        settings: Option<UserSettings>,
    ) -> VaultResult<Arc<Vault>> {
        let (key, secret) = match key {
            Some(s) => (from_url_to_key(s)?, None),
            None => {
                let (key, secret) = generate_keypair();
                (key, Some(secret))
            }
        };

        // fall back to the in-flight load, if one exists
        let mut waiter = None;
        {
            let mut pending = self.pending_loads.lock();
            match pending.get(&key) {
                Some(tx) => waiter = Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    pending.insert(key, tx);
                }
            }
        }
        if let Some(mut rx) = waiter {
            return match rx.recv().await {
                Ok(Ok(vault)) => Ok(vault),
                Ok(Err(detail)) => Err(VaultError::Load(detail)),
                Err(_) => Err(VaultError::Load("load was abandoned".to_string())),
            };
        }

        let result = self.load_inner(key, secret, settings).await;
        if let Err(ref e) = result {
            error!(%key, error = ?e, "Failed to load vault");
        }
        // clear the in-flight marker on success and failure alike
        if let Some(tx) = self.pending_loads.lock().remove(&key) {
            let shared = match &result {
                Ok(vault) => Ok(vault.clone()),
                Err(e) => Err(e.to_string()),
            };
            let _ = tx.send(shared);
        }
        result
    }

    async fn load_inner(
        self: &Arc<Self>,
        key: VaultKey,
        secret: Option<ed25519_dalek::SigningKey>,
        settings: Option<UserSettings>,
    ) -> VaultResult<Arc<Vault>> {
        let settings = match settings {
            Some(s) => s,
            None => self
                .db
                .get_user_settings(self.profile_id, &key)?
                .unwrap_or_default(),
        };

        let store = VersionedStore::open(self.store_path(&key), key, secret, None)?;
        store.ready()?;
        let vault = Arc::new(Vault::new(key, store));

        if let Err(e) = self.touch(&key.to_hex(), TouchField::LastAccessTime).await {
            error!(%key, error = ?e, "Failed to update lastAccessTime");
        }

        // register for swarm lookup first, so the peer-matching path can
        // find the vault to replicate during this same load
        self.vaults_by_dkey
            .write()
            .insert(*vault.discovery_key(), vault.clone());

        self.swarm.configure_network(&vault, &settings).await?;
        configure_auto_download(&vault, &settings, &self.swarm);
        self.configure_local_sync(&vault, &settings);

        // a read-only empty vault has nothing to serve; wait for the
        // first update from a peer (bounded only by the network)
        if !vault.writable() && vault.version() == 0 {
            debug!(%key, "Awaiting first metadata update from peers");
            let mut watch = vault.store().watch();
            while vault.version() == 0 {
                match watch.recv().await {
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(VaultError::Network(
                            "store closed while awaiting first update".to_string(),
                        ));
                    }
                }
            }
        }
        if !vault.writable() {
            // always replicate the full metadata log
            self.swarm.announce(&vault).await;
        }

        self.pull_latest_vault_meta(&vault, false).await?;
        self.wire_change_events(&vault);

        // now expose for general lookup, fully loaded
        self.vaults.write().insert(key, vault.clone());
        Ok(vault)
    }

    /// Debounced reactive wiring: store changes refresh the cached meta
    /// (bumping mtime) and mirror the vault to its local folder.
    fn wire_change_events(self: &Arc<Self>, vault: &Arc<Vault>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let vault_for_task = vault.clone();
        let mut watch = vault.store().watch();
        let task = tokio::spawn(async move {
            loop {
                match watch.recv().await {
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                // absorb the burst before reacting
                loop {
                    match tokio::time::timeout(CHANGE_DEBOUNCE, watch.recv()).await {
                        Ok(Ok(_)) => continue,
                        Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                        Ok(Err(broadcast::error::RecvError::Closed)) => return,
                        Err(_) => break,
                    }
                }
                let Some(registry) = weak.upgrade() else { break };
                if let Err(e) = registry.pull_latest_vault_meta(&vault_for_task, true).await {
                    warn!(key = %vault_for_task.key(), error = ?e, "Meta refresh failed");
                }
                if let Err(e) = registry
                    .folder_sync
                    .sync_vault_to_folder(
                        &vault_for_task,
                        &DiffOpts {
                            shallow: false,
                            ..Default::default()
                        },
                    )
                {
                    warn!(key = %vault_for_task.key(), error = ?e, "Vault->folder sync failed");
                }
                registry.swarm.announce(&vault_for_task).await;
            }
        });
        *vault.change_task.lock() = Some(task);
    }

    /// Synchronous lookup of a loaded vault; no I/O.
    pub fn get_loaded(&self, key: &str) -> Option<Arc<Vault>> {
        let key = from_url_to_key(key).ok()?;
        self.vaults.read().get(&key).cloned()
    }

    fn get_by_key(&self, key: &VaultKey) -> Option<Arc<Vault>> {
        self.vaults.read().get(key).cloned()
    }

    /// Loaded instance or a fresh load
    pub async fn get_or_load(self: &Arc<Self>, key: &str) -> VaultResult<Arc<Vault>> {
        if let Some(vault) = self.get_loaded(key) {
            return Ok(vault);
        }
        self.load(Some(key), None).await
    }

    /// True if the vault is in memory
    pub fn is_loaded(&self, key: &str) -> bool {
        self.get_loaded(key).is_some()
    }

    /// Load and configure everything marked saved (service start).
    pub async fn load_saved_vaults(self: &Arc<Self>) {
        let saved = match self.db.query(
            self.profile_id,
            &VaultQuery {
                is_saved: Some(true),
                ..Default::default()
            },
        ) {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = ?e, "Failed to list saved vaults");
                return;
            }
        };
        for (meta, settings) in saved {
            let registry = self.clone();
            let key = meta.key.to_hex();
            tokio::spawn(async move {
                if let Err(e) = registry.load(Some(&key), Some(settings)).await {
                    error!(%key, error = ?e, "Failed to load saved vault");
                }
            });
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Creation and forking
    // ═══════════════════════════════════════════════════════════════════

    /// Allocate a new vault: fresh keypair, manifest, default ignore file,
    /// saved + networked settings, refreshed meta. Returns its URL.
    pub async fn create(
        self: &Arc<Self>,
        manifest: Manifest,
        settings: Option<SettingsUpdate>,
    ) -> VaultResult<String> {
        let networked = settings
            .as_ref()
            .and_then(|s| s.networked)
            .unwrap_or(true);
        let hint = UserSettings {
            is_saved: true,
            networked,
            ..Default::default()
        };
        let vault = self.load(None, Some(hint)).await?;
        let key = *vault.key();

        vault.store().write_manifest(&manifest)?;
        vault
            .store()
            .write_file(IGNORE_FILE_PATH, self.default_ignore_rules()?.as_bytes())?;

        let mut update = settings.unwrap_or_default();
        update.is_saved = Some(true);
        update.networked = Some(networked);
        self.set_user_settings(&key.to_hex(), update).await?;

        self.pull_latest_vault_meta(&vault, true).await?;
        Ok(vault.url().to_string())
    }

    /// Fork a vault: merge manifest overrides (a fixed set of fields is
    /// always preserved from the source), copy all content except
    /// reserved paths, and ensure an ignore file exists in the copy.
    pub async fn fork(
        self: &Arc<Self>,
        source: &str,
        overrides: Manifest,
        settings: Option<SettingsUpdate>,
    ) -> VaultResult<String> {
        let src_vault = self.get_or_load(source).await?;
        let src_manifest = src_vault.store().read_manifest();

        let mut dst_manifest = Manifest {
            title: overrides.title.or_else(|| src_manifest.title.clone()),
            description: overrides
                .description
                .or_else(|| src_manifest.description.clone()),
            type_tags: if overrides.type_tags.is_empty() {
                src_manifest.type_tags.clone()
            } else {
                overrides.type_tags
            },
            author: overrides.author,
            ..Default::default()
        };
        dst_manifest.preserve_on_fork(&src_manifest);

        let dst_url = self.create(dst_manifest, settings).await?;
        let dst_vault = self
            .get_loaded(&dst_url)
            .ok_or_else(|| VaultError::Load("fork target vanished".to_string()))?;

        copy_vault_content(src_vault.store(), dst_vault.store(), "/")?;

        if dst_vault.store().stat(IGNORE_FILE_PATH)?.is_none() {
            dst_vault
                .store()
                .write_file(IGNORE_FILE_PATH, self.default_ignore_rules()?.as_bytes())?;
        }
        self.pull_latest_vault_meta(&dst_vault, true).await?;
        Ok(dst_url)
    }

    fn default_ignore_rules(&self) -> VaultResult<String> {
        Ok(self
            .db
            .get_config(DEFAULT_IGNORE_CONFIG_KEY)?
            .unwrap_or_else(|| DEFAULT_IGNORE_RULES.to_string()))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Unloading
    // ═══════════════════════════════════════════════════════════════════

    /// Unload a vault: leave the swarm, halt autodownload and the
    /// change-watch stream, close the store, remove from both maps.
    /// Idempotent.
    pub async fn unload(&self, key: &str) -> VaultResult<()> {
        let key = from_url_to_key(key)?;
        let vault = match self.vaults.write().remove(&key) {
            Some(vault) => vault,
            None => return Ok(()),
        };

        self.swarm.leave_flock(&vault);
        stop_auto_download(&vault);
        vault.watcher.lock().take();
        if let Some(task) = vault.change_task.lock().take() {
            task.abort();
        }
        vault.store().close();
        self.vaults_by_dkey.write().remove(vault.discovery_key());
        info!(%key, "Vault unloaded");
        Ok(())
    }

    /// Unload everything and close the endpoint.
    pub async fn shutdown(&self) {
        let keys: Vec<VaultKey> = self.vaults.read().keys().copied().collect();
        for key in keys {
            if let Err(e) = self.unload(&key.to_hex()).await {
                warn!(%key, error = ?e, "Failed to unload vault during shutdown");
            }
        }
        self.swarm.shutdown().await;
    }

    // ═══════════════════════════════════════════════════════════════════
    // Settings and meta
    // ═══════════════════════════════════════════════════════════════════

    /// The single settings-mutation entry point: read-modify-write under
    /// the settings lock, persist atomically, emit events, and reconcile
    /// network, autodownload, and local-sync wiring for a loaded vault.
    pub async fn set_user_settings(
        self: &Arc<Self>,
        key: &str,
        update: SettingsUpdate,
    ) -> VaultResult<UserSettings> {
        let key = from_url_to_key(key)?;

        let settings = {
            let _guard = self.settings_lock.lock().await;
            let settings = match self.db.get_user_settings(self.profile_id, &key)? {
                Some(mut current) => {
                    update.apply_to(&mut current);
                    current
                }
                None => update.clone().into_initial(),
            };
            self.db
                .put_user_settings(self.profile_id, &key, &settings)?;
            settings
        };

        let url = crate::types::from_key_to_url(&key);
        match update.is_saved {
            Some(true) => self.events.publish(VaultEvent::Added { url }),
            Some(false) => self.events.publish(VaultEvent::Removed { url }),
            None => {}
        }

        if let Some(vault) = self.get_by_key(&key) {
            if let Err(e) = self.swarm.configure_network(&vault, &settings).await {
                warn!(%key, error = ?e, "Failed to reconfigure network");
            }
            configure_auto_download(&vault, &settings, &self.swarm);
            self.configure_local_sync(&vault, &settings);
        }
        Ok(settings)
    }

    /// User settings for a vault, defaulted when absent.
    pub fn get_user_settings(&self, key: &str) -> VaultResult<UserSettings> {
        let key = from_url_to_key(key)?;
        Ok(self
            .db
            .get_user_settings(self.profile_id, &key)?
            .unwrap_or_default())
    }

    fn configure_local_sync(self: &Arc<Self>, vault: &Arc<Vault>, settings: &UserSettings) {
        let old = vault.local_sync_path();
        let new = if settings.is_saved {
            settings.local_sync_path.clone()
        } else {
            None
        };
        if new != old {
            vault.set_local_sync_path(new);
            if let Err(e) = self.folder_sync.configure_folder_to_vault_watcher(vault) {
                error!(key = %vault.key(), error = ?e, "Failed to configure folder watcher");
            }
        }
    }

    /// Read the manifest, refresh size tracking, and persist the derived
    /// meta record under the meta lock.
    pub async fn pull_latest_vault_meta(
        &self,
        vault: &Arc<Vault>,
        update_mtime: bool,
    ) -> VaultResult<VaultMeta> {
        let manifest = vault.store().read_manifest();
        vault.set_manifest(manifest.clone());

        let _guard = self.meta_lock.lock().await;
        let old = self.db.get_meta(vault.key())?;
        let meta = VaultMeta {
            key: *vault.key(),
            title: manifest.title,
            description: manifest.description,
            type_tags: manifest.type_tags,
            mtime: if update_mtime { now_ms() } else { old.mtime },
            is_owner: vault.writable(),
            last_access_time: old.last_access_time,
            last_repository_access_time: old.last_repository_access_time,
        };
        self.db.put_meta(&meta)?;
        drop(_guard);

        self.events.publish(VaultEvent::Updated {
            url: vault.url().to_string(),
        });
        Ok(meta)
    }

    /// Upsert an access timestamp under the meta lock.
    pub async fn touch(&self, key: &str, field: TouchField) -> VaultResult<()> {
        let key = from_url_to_key(key)?;
        let _guard = self.meta_lock.lock().await;
        self.db.touch(&key, field, now_ms())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════

    /// Query persisted settings joined with persisted meta; loaded vaults
    /// additionally report live size, peer count, and peer history.
    pub fn query(&self, query: &VaultQuery) -> VaultResult<Vec<VaultSummary>> {
        let rows = self.db.query(self.profile_id, query)?;
        let mut out = Vec::with_capacity(rows.len());
        for (meta, user_settings) in rows {
            let loaded = self.get_by_key(&meta.key);
            if let Some(want) = query.in_memory {
                if loaded.is_some() != want {
                    continue;
                }
            }
            let url = crate::types::from_key_to_url(&meta.key);
            let summary = match loaded {
                Some(vault) => VaultSummary {
                    url,
                    meta,
                    user_settings,
                    size: vault.size(),
                    peers: vault.peer_count(),
                    peer_history: vault.peer_history(),
                },
                None => VaultSummary {
                    url,
                    meta,
                    user_settings,
                    size: 0,
                    peers: 0,
                    peer_history: Vec::new(),
                },
            };
            out.push(summary);
        }
        Ok(out)
    }

    /// Detailed view of one vault, loading it if needed.
    pub async fn vault_info(self: &Arc<Self>, key: &str) -> VaultResult<VaultInfo> {
        let vault = self.get_or_load(key).await?;
        let meta = self.db.get_meta(vault.key())?;
        let user_settings = self
            .db
            .get_user_settings(self.profile_id, vault.key())?
            .unwrap_or_default();
        Ok(VaultInfo {
            url: vault.url().to_string(),
            meta,
            user_settings,
            manifest: vault.manifest(),
            version: vault.version(),
            size: vault.size(),
            peers: vault.peer_count(),
            peer_history: vault.peer_history(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // Maintenance
    // ═══════════════════════════════════════════════════════════════════

    /// Drop all downloaded content for a read-only vault and force the
    /// auto-downloader to start over.
    pub async fn clear_file_cache(self: &Arc<Self>, key: &str) -> VaultResult<()> {
        let vault = self.get_or_load(key).await?;
        if vault.writable() {
            return Ok(()); // only meaningful for downloaded vaults
        }
        vault.store().clear_content()?;
        let settings = self
            .db
            .get_user_settings(self.profile_id, vault.key())?
            .unwrap_or_default();
        stop_auto_download(&vault);
        configure_auto_download(&vault, &settings, &self.swarm);
        Ok(())
    }

    /// Delete a vault's on-disk data and database rows, returning the
    /// bytes freed. The vault must not be loaded.
    pub fn delete_vault_data(&self, key: &VaultKey) -> VaultResult<u64> {
        let dir = self.store_path(key);
        let mut freed = 0u64;
        if dir.exists() {
            for entry in walkdir::WalkDir::new(&dir).into_iter().flatten() {
                if entry.file_type().is_file() {
                    freed += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
            }
            std::fs::remove_dir_all(&dir)?;
        }
        self.db.delete_vault(key)?;
        Ok(freed)
    }
}

/// Copy everything except reserved paths from one store into another,
/// skipping files whose content has not been downloaded.
fn copy_vault_content(
    src: &VersionedStore,
    dst: &VersionedStore,
    dir: &str,
) -> VaultResult<()> {
    for name in src.readdir(dir)? {
        let path = join_path(dir, &name);
        if path == STORE_DIR_PATH || path == VCS_DIR_PATH || path == MANIFEST_PATH {
            continue;
        }
        match src.stat(&path)? {
            Some(st) if st.is_dir => {
                dst.mkdir(&path)?;
                copy_vault_content(src, dst, &path)?;
            }
            Some(_) => match src.read_file(&path) {
                Ok(data) => dst.write_file(&path, &data)?,
                Err(VaultError::NotFound(_)) => {} // undownloaded, skip
                Err(e) => return Err(e),
            },
            None => {}
        }
    }
    Ok(())
}

/// Scoped filesystem helper for hosts that want a capability handle over
/// a vault's local folder.
pub fn local_folder_tree(vault: &Vault) -> Option<ScopedFs> {
    vault.local_sync_path().map(ScopedFs::new)
}
