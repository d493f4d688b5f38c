//! Versioned content-addressed store
//!
//! Each vault is backed by a single-writer append-only log of signed tree
//! operations plus a content-addressed blob table, both persisted in one
//! redb database under the vault's directory. The current version is the
//! log length. Replicas verify every entry against the vault's public key
//! before applying it, so a read-only peer cannot be poisoned.
//!
//! Blob content may lag the log on replicas (sparse replication): the log
//! entry carries `(hash, size)` and the bytes arrive separately. Reading a
//! file whose blob has not arrived is a `NotFound` with a
//! "content not downloaded" detail. The per-blob download selections plus
//! the progress broadcast are the byte-range-selection analog the
//! auto-downloader drives.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{VaultError, VaultResult};
use crate::tree::{normalize_path, parent_path, FileTree, TreeStat};
use crate::types::{now_ms, Manifest, VaultKey};

/// Reserved path of the manifest document
pub const MANIFEST_PATH: &str = "/vault.json";
/// Reserved path of the ignore-rule file
pub const IGNORE_FILE_PATH: &str = "/.vaultignore";
/// Store metadata directory, never synced or writable through the tree API
pub const STORE_DIR_PATH: &str = "/.vault";
/// VCS directory, never synced
pub const VCS_DIR_PATH: &str = "/.git";
/// Paths every ignore rule set excludes implicitly
pub const RESERVED_PATHS: [&str; 2] = [STORE_DIR_PATH, VCS_DIR_PATH];

/// Default per-vault content byte budget (500 MiB)
pub const DEFAULT_QUOTA_BYTES: u64 = 500 * 1024 * 1024;

const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("log");
const BLOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");
const KEYS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("keys");

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A tree mutation recorded in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeOp {
    Put { path: String, hash: [u8; 32], size: u64 },
    Unlink { path: String },
    Mkdir { path: String },
    Rmdir { path: String },
    Rename { from: String, to: String },
    Copy { from: String, to: String },
}

impl TreeOp {
    /// Primary path the operation touches (destination for rename/copy)
    pub fn path(&self) -> &str {
        match self {
            TreeOp::Put { path, .. }
            | TreeOp::Unlink { path }
            | TreeOp::Mkdir { path }
            | TreeOp::Rmdir { path } => path,
            TreeOp::Rename { to, .. } | TreeOp::Copy { to, .. } => to,
        }
    }
}

/// One log record, before signing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Sequence number; always equal to the log length at append time
    pub seq: u64,
    /// Epoch ms
    pub timestamp: i64,
    pub op: TreeOp,
}

/// A log record as persisted and replicated: postcard payload + ed25519
/// signature by the vault secret key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEntry {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedEntry {
    fn seal(entry: &LogEntry, secret: &SigningKey) -> VaultResult<Self> {
        let payload = postcard::to_allocvec(entry)
            .map_err(|e| VaultError::Serialization(e.to_string()))?;
        let signature = secret.sign(&payload).to_vec();
        Ok(Self { payload, signature })
    }

    fn decode(&self) -> VaultResult<LogEntry> {
        postcard::from_bytes(&self.payload)
            .map_err(|e| VaultError::Serialization(e.to_string()))
    }

    /// Decode after verifying the signature against the vault public key
    pub fn decode_verified(&self, key: &VaultKey) -> VaultResult<LogEntry> {
        let verifying = VerifyingKey::from_bytes(key.as_bytes())
            .map_err(|e| VaultError::SignatureInvalid(e.to_string()))?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|e| VaultError::SignatureInvalid(e.to_string()))?;
        verifying
            .verify(&self.payload, &signature)
            .map_err(|e| VaultError::SignatureInvalid(e.to_string()))?;
        self.decode()
    }
}

/// One item of `history()`
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryItem {
    pub version: u64,
    pub timestamp: i64,
    pub op: TreeOp,
}

/// Change notification from `watch()`
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub path: String,
    /// Version after the change was applied
    pub version: u64,
}

/// Download-progress notification
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// Remote log entries were applied (metadata advanced)
    Metadata { version: u64 },
    /// A content blob arrived
    Blob { hash: [u8; 32] },
    /// The selection set was rewritten
    Selection,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    File { hash: [u8; 32], size: u64, mtime: i64 },
    Dir,
}

type TreeState = BTreeMap<String, Node>;

struct StoreInner {
    db: Database,
    key: VaultKey,
    secret_key: Option<SigningKey>,
    quota_bytes: u64,
    state: RwLock<TreeState>,
    version: AtomicU64,
    content_bytes: AtomicU64,
    ready: Mutex<bool>,
    closed: AtomicBool,
    changes: broadcast::Sender<StoreChange>,
    downloads: broadcast::Sender<DownloadEvent>,
    /// Blob hashes currently selected for download
    wanted: Mutex<HashSet<[u8; 32]>>,
}

/// Handle to one vault's versioned store. Cheap to clone.
#[derive(Clone)]
pub struct VersionedStore {
    inner: Arc<StoreInner>,
}

impl VersionedStore {
    /// Open (or create) the store rooted at `dir`.
    ///
    /// The handle is not usable until `ready()` has completed the log
    /// replay.
    pub fn open(
        dir: impl AsRef<Path>,
        key: VaultKey,
        secret_key: Option<SigningKey>,
        quota_bytes: Option<u64>,
    ) -> VaultResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("store.redb"))?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(LOG_TABLE)?;
            let _ = write_txn.open_table(BLOBS_TABLE)?;
            let mut keys = write_txn.open_table(KEYS_TABLE)?;
            // the secret key lives with the store so an owned vault stays
            // writable across reloads
            if let Some(ref secret) = secret_key {
                keys.insert("secret", secret.to_bytes().as_slice())?;
            }
        }
        write_txn.commit()?;

        let secret_key = match secret_key {
            Some(secret) => Some(secret),
            None => {
                let read_txn = db.begin_read()?;
                let keys = read_txn.open_table(KEYS_TABLE)?;
                keys.get("secret")?.map(|v| {
                    let mut seed = [0u8; 32];
                    seed.copy_from_slice(v.value());
                    SigningKey::from_bytes(&seed)
                })
            }
        };

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (downloads, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                key,
                secret_key,
                quota_bytes: quota_bytes.unwrap_or(DEFAULT_QUOTA_BYTES),
                state: RwLock::new(TreeState::new()),
                version: AtomicU64::new(0),
                content_bytes: AtomicU64::new(0),
                ready: Mutex::new(false),
                closed: AtomicBool::new(false),
                changes,
                downloads,
                wanted: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// Replay the persisted log into the in-memory tree. Idempotent; every
    /// other operation requires this to have completed.
    pub fn ready(&self) -> VaultResult<()> {
        let mut done = self.inner.ready.lock();
        if *done {
            return Ok(());
        }
        let read_txn = self.inner.db.begin_read()?;
        let table = read_txn.open_table(LOG_TABLE)?;
        let mut state = TreeState::new();
        let mut bytes: i64 = 0;
        let mut count = 0u64;
        for row in table.iter()? {
            let (_, value) = row?;
            let signed: SignedEntry = postcard::from_bytes(value.value())
                .map_err(|e| VaultError::Serialization(e.to_string()))?;
            let entry = signed.decode()?;
            bytes += apply_op(&mut state, &entry.op, entry.timestamp);
            count += 1;
        }
        *self.inner.state.write() = state;
        self.inner.version.store(count, Ordering::SeqCst);
        self.inner
            .content_bytes
            .store(bytes.max(0) as u64, Ordering::SeqCst);
        *done = true;
        debug!(key = %self.inner.key, version = count, "Store ready");
        Ok(())
    }

    /// The vault public key
    pub fn key(&self) -> &VaultKey {
        &self.inner.key
    }

    /// True if the secret key is present
    pub fn writable(&self) -> bool {
        self.inner.secret_key.is_some()
    }

    /// Current version (log length)
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    /// Content byte estimate (sum of file sizes in the current tree)
    pub fn content_bytes(&self) -> u64 {
        self.inner.content_bytes.load(Ordering::SeqCst)
    }

    /// Subscribe to tree-change notifications
    pub fn watch(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.changes.subscribe()
    }

    /// Subscribe to download-progress notifications
    pub fn download_progress(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.downloads.subscribe()
    }

    /// Mark the handle closed. Further mutations fail with a storage error.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    // ═══════════════════════════════════════════════════════════════════
    // Manifest
    // ═══════════════════════════════════════════════════════════════════

    /// Read and parse the manifest; absent or malformed yields the default.
    pub fn read_manifest(&self) -> Manifest {
        match self.read_file(MANIFEST_PATH) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Manifest::default(),
        }
    }

    /// Serialize and write the manifest
    pub fn write_manifest(&self, manifest: &Manifest) -> VaultResult<()> {
        let bytes = serde_json::to_vec_pretty(manifest)
            .map_err(|e| VaultError::Serialization(e.to_string()))?;
        self.write_file(MANIFEST_PATH, &bytes)
    }

    /// Merge `updates` over the current manifest and write it back
    pub fn update_manifest(&self, updates: &Manifest) -> VaultResult<Manifest> {
        let mut manifest = self.read_manifest();
        manifest.merge_from(updates);
        self.write_manifest(&manifest)?;
        Ok(manifest)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Local (owner) mutation
    // ═══════════════════════════════════════════════════════════════════

    fn append_local(&self, op: TreeOp, blob: Option<(&[u8; 32], &[u8])>) -> VaultResult<u64> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(VaultError::Storage("store is closed".to_string()));
        }
        let secret = self
            .inner
            .secret_key
            .as_ref()
            .ok_or(VaultError::VaultNotWritable)?;

        // serialize appends through the state write lock
        let mut state = self.inner.state.write();
        let seq = self.inner.version.load(Ordering::SeqCst);
        let entry = LogEntry {
            seq,
            timestamp: now_ms(),
            op,
        };
        let signed = SignedEntry::seal(&entry, secret)?;
        let raw = postcard::to_allocvec(&signed)
            .map_err(|e| VaultError::Serialization(e.to_string()))?;

        let write_txn = self.inner.db.begin_write()?;
        {
            let mut log = write_txn.open_table(LOG_TABLE)?;
            log.insert(seq, raw.as_slice())?;
            if let Some((hash, bytes)) = blob {
                let mut blobs = write_txn.open_table(BLOBS_TABLE)?;
                let hash_hex = hex::encode(hash);
                if blobs.get(hash_hex.as_str())?.is_none() {
                    blobs.insert(hash_hex.as_str(), bytes)?;
                }
            }
        }
        write_txn.commit()?;

        let delta = apply_op(&mut state, &entry.op, entry.timestamp);
        drop(state);
        self.bump(delta, entry.op.path(), seq + 1);
        Ok(seq + 1)
    }

    fn bump(&self, delta: i64, path: &str, version: u64) {
        self.inner.version.store(version, Ordering::SeqCst);
        let bytes = self.inner.content_bytes.load(Ordering::SeqCst) as i64 + delta;
        self.inner
            .content_bytes
            .store(bytes.max(0) as u64, Ordering::SeqCst);
        let _ = self.inner.changes.send(StoreChange {
            path: path.to_string(),
            version,
        });
    }

    /// Rename a file or directory subtree
    pub fn rename(&self, from: &str, to: &str) -> VaultResult<()> {
        let from = self.check_mutable_path(from)?;
        let to = self.check_mutable_path(to)?;
        self.append_local(TreeOp::Rename { from, to }, None)?;
        Ok(())
    }

    /// Copy a file or directory subtree
    pub fn copy(&self, from: &str, to: &str) -> VaultResult<()> {
        let from = normalize_path(from)?;
        let to = self.check_mutable_path(to)?;
        self.append_local(TreeOp::Copy { from, to }, None)?;
        Ok(())
    }

    fn check_mutable_path(&self, path: &str) -> VaultResult<String> {
        let path = normalize_path(path)?;
        if path == STORE_DIR_PATH || path.starts_with(&format!("{}/", STORE_DIR_PATH)) {
            return Err(VaultError::ProtectedPathNotWritable(path));
        }
        Ok(path)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Replication
    // ═══════════════════════════════════════════════════════════════════

    /// Raw signed entries from `from` (inclusive) to the current version
    pub fn entries_from(&self, from: u64) -> VaultResult<Vec<SignedEntry>> {
        let read_txn = self.inner.db.begin_read()?;
        let table = read_txn.open_table(LOG_TABLE)?;
        let mut out = Vec::new();
        for row in table.range(from..)? {
            let (_, value) = row?;
            out.push(
                postcard::from_bytes(value.value())
                    .map_err(|e| VaultError::Serialization(e.to_string()))?,
            );
        }
        Ok(out)
    }

    /// Verify and apply entries received from a peer, in order.
    ///
    /// Entries below the current version are skipped; a gap stops the
    /// batch. Returns the number applied. Only meaningful on replicas;
    /// the writer's log is authoritative and rejects remote entries.
    pub fn apply_remote(&self, entries: &[SignedEntry]) -> VaultResult<usize> {
        if self.writable() {
            return Err(VaultError::Storage(
                "refusing remote entries on a writable store".to_string(),
            ));
        }
        let mut applied = 0;
        for signed in entries {
            let entry = signed.decode_verified(&self.inner.key)?;
            let current = self.version();
            if entry.seq < current {
                continue;
            }
            if entry.seq > current {
                warn!(
                    key = %self.inner.key,
                    expected = current,
                    got = entry.seq,
                    "Gap in replicated log, stopping batch"
                );
                break;
            }
            let raw = postcard::to_allocvec(signed)
                .map_err(|e| VaultError::Serialization(e.to_string()))?;
            let mut state = self.inner.state.write();
            let write_txn = self.inner.db.begin_write()?;
            {
                let mut log = write_txn.open_table(LOG_TABLE)?;
                log.insert(entry.seq, raw.as_slice())?;
            }
            write_txn.commit()?;
            let delta = apply_op(&mut state, &entry.op, entry.timestamp);
            drop(state);
            self.bump(delta, entry.op.path(), entry.seq + 1);
            applied += 1;
        }
        if applied > 0 {
            let _ = self.inner.downloads.send(DownloadEvent::Metadata {
                version: self.version(),
            });
        }
        Ok(applied)
    }

    /// Drop every log entry at or above `version` and rebuild the tree.
    pub fn truncate_from(&self, version: u64) -> VaultResult<()> {
        if !self.writable() {
            return Err(VaultError::VaultNotWritable);
        }
        let mut state = self.inner.state.write();
        let write_txn = self.inner.db.begin_write()?;
        {
            let mut log = write_txn.open_table(LOG_TABLE)?;
            log.retain(|seq, _| seq < version)?;
        }
        write_txn.commit()?;

        // rebuild from what remains
        let read_txn = self.inner.db.begin_read()?;
        let table = read_txn.open_table(LOG_TABLE)?;
        let mut rebuilt = TreeState::new();
        let mut bytes: i64 = 0;
        let mut count = 0u64;
        for row in table.iter()? {
            let (_, value) = row?;
            let signed: SignedEntry = postcard::from_bytes(value.value())
                .map_err(|e| VaultError::Serialization(e.to_string()))?;
            let entry = signed.decode()?;
            bytes += apply_op(&mut rebuilt, &entry.op, entry.timestamp);
            count += 1;
        }
        *state = rebuilt;
        drop(state);
        self.inner.version.store(count, Ordering::SeqCst);
        self.inner
            .content_bytes
            .store(bytes.max(0) as u64, Ordering::SeqCst);
        let _ = self.inner.changes.send(StoreChange {
            path: "/".to_string(),
            version: count,
        });
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Blobs and download selections
    // ═══════════════════════════════════════════════════════════════════

    /// True if the blob bytes are present locally
    pub fn has_blob(&self, hash: &[u8; 32]) -> VaultResult<bool> {
        let read_txn = self.inner.db.begin_read()?;
        let table = read_txn.open_table(BLOBS_TABLE)?;
        Ok(table.get(hex::encode(hash).as_str())?.is_some())
    }

    /// Blob bytes, if present
    pub fn blob_bytes(&self, hash: &[u8; 32]) -> VaultResult<Option<Vec<u8>>> {
        let read_txn = self.inner.db.begin_read()?;
        let table = read_txn.open_table(BLOBS_TABLE)?;
        Ok(table.get(hex::encode(hash).as_str())?.map(|v| v.value().to_vec()))
    }

    /// Store a blob that arrived from a peer. Verifies the content hash.
    pub fn insert_blob(&self, hash: &[u8; 32], bytes: &[u8]) -> VaultResult<()> {
        if blake3::hash(bytes).as_bytes() != hash {
            return Err(VaultError::SignatureInvalid(
                "blob content does not match its hash".to_string(),
            ));
        }
        let write_txn = self.inner.db.begin_write()?;
        {
            let mut table = write_txn.open_table(BLOBS_TABLE)?;
            table.insert(hex::encode(hash).as_str(), bytes)?;
        }
        write_txn.commit()?;
        self.inner.wanted.lock().remove(hash);
        let _ = self
            .inner
            .downloads
            .send(DownloadEvent::Blob { hash: *hash });
        Ok(())
    }

    /// Hashes referenced by the current tree with no local bytes
    pub fn missing_blobs(&self) -> VaultResult<Vec<[u8; 32]>> {
        let state = self.inner.state.read();
        let mut hashes: HashSet<[u8; 32]> = HashSet::new();
        for node in state.values() {
            if let Node::File { hash, .. } = node {
                hashes.insert(*hash);
            }
        }
        drop(state);
        let read_txn = self.inner.db.begin_read()?;
        let table = read_txn.open_table(BLOBS_TABLE)?;
        let mut missing = Vec::new();
        for hash in hashes {
            if table.get(hex::encode(hash).as_str())?.is_none() {
                missing.push(hash);
            }
        }
        Ok(missing)
    }

    /// Select the whole tree for download (wanted = currently missing)
    pub fn select_all(&self) -> VaultResult<()> {
        let missing = self.missing_blobs()?;
        *self.inner.wanted.lock() = missing.into_iter().collect();
        let _ = self.inner.downloads.send(DownloadEvent::Selection);
        Ok(())
    }

    /// Cancel every in-flight download selection
    pub fn clear_selections(&self) {
        self.inner.wanted.lock().clear();
        let _ = self.inner.downloads.send(DownloadEvent::Selection);
    }

    /// Snapshot of the selected-but-missing blob hashes
    pub fn wanted_blobs(&self) -> Vec<[u8; 32]> {
        self.inner.wanted.lock().iter().copied().collect()
    }

    /// Drop all downloaded blob content (read-only cache clear). The log
    /// and tree are untouched; reads fail until content is re-fetched.
    pub fn clear_content(&self) -> VaultResult<()> {
        if self.writable() {
            return Err(VaultError::Storage(
                "refusing to clear content on a writable store".to_string(),
            ));
        }
        let write_txn = self.inner.db.begin_write()?;
        {
            let mut table = write_txn.open_table(BLOBS_TABLE)?;
            table.retain(|_, _| false)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // History and checkouts
    // ═══════════════════════════════════════════════════════════════════

    /// Decoded log entries in `[from, to)` version order
    pub fn history(&self, from: u64, to: Option<u64>) -> VaultResult<Vec<HistoryItem>> {
        let to = to.unwrap_or_else(|| self.version());
        let mut out = Vec::new();
        for signed in self.entries_from(from)? {
            let entry = signed.decode()?;
            if entry.seq >= to {
                break;
            }
            out.push(HistoryItem {
                version: entry.seq + 1,
                timestamp: entry.timestamp,
                op: entry.op,
            });
        }
        Ok(out)
    }

    /// Read-only view of the tree pinned at `version`
    pub fn checkout(&self, version: u64) -> VaultResult<Checkout> {
        let mut state = TreeState::new();
        for signed in self.entries_from(0)? {
            let entry = signed.decode()?;
            if entry.seq >= version {
                break;
            }
            apply_op(&mut state, &entry.op, entry.timestamp);
        }
        Ok(Checkout {
            store: self.clone(),
            version,
            state,
        })
    }
}

impl FileTree for VersionedStore {
    fn stat(&self, path: &str) -> VaultResult<Option<TreeStat>> {
        let path = normalize_path(path)?;
        let state = self.inner.state.read();
        Ok(stat_in(&state, &path))
    }

    fn read_file(&self, path: &str) -> VaultResult<Vec<u8>> {
        let path = normalize_path(path)?;
        let hash = {
            let state = self.inner.state.read();
            match state.get(&path) {
                Some(Node::File { hash, .. }) => *hash,
                Some(Node::Dir) => return Err(VaultError::NotADirectory(path)),
                None => return Err(VaultError::NotFound(path)),
            }
        };
        match self.blob_bytes(&hash)? {
            Some(bytes) => Ok(bytes),
            None => Err(VaultError::NotFound(format!(
                "content not downloaded: {}",
                path
            ))),
        }
    }

    fn write_file(&self, path: &str, data: &[u8]) -> VaultResult<()> {
        let path = self.check_mutable_path(path)?;
        {
            let state = self.inner.state.read();
            if matches!(state.get(&path), Some(Node::Dir)) {
                return Err(VaultError::NotADirectory(path));
            }
            // quota: projected size after replacing any existing version
            let old = match state.get(&path) {
                Some(Node::File { size, .. }) => *size,
                _ => 0,
            };
            let needed = self.content_bytes() - old + data.len() as u64;
            if needed > self.inner.quota_bytes {
                return Err(VaultError::QuotaExceeded {
                    needed,
                    quota: self.inner.quota_bytes,
                });
            }
        }
        let hash = *blake3::hash(data).as_bytes();
        self.append_local(
            TreeOp::Put {
                path,
                hash,
                size: data.len() as u64,
            },
            Some((&hash, data)),
        )?;
        Ok(())
    }

    fn mkdir(&self, path: &str) -> VaultResult<()> {
        let path = self.check_mutable_path(path)?;
        self.append_local(TreeOp::Mkdir { path }, None)?;
        Ok(())
    }

    fn unlink(&self, path: &str) -> VaultResult<()> {
        let path = self.check_mutable_path(path)?;
        {
            let state = self.inner.state.read();
            match state.get(&path) {
                Some(Node::File { .. }) => {}
                Some(Node::Dir) => return Err(VaultError::NotADirectory(path)),
                None => return Err(VaultError::NotFound(path)),
            }
        }
        self.append_local(TreeOp::Unlink { path }, None)?;
        Ok(())
    }

    fn rmdir(&self, path: &str) -> VaultResult<()> {
        let path = self.check_mutable_path(path)?;
        {
            let state = self.inner.state.read();
            match state.get(&path) {
                Some(Node::Dir) => {}
                Some(Node::File { .. }) => return Err(VaultError::NotADirectory(path)),
                None => return Err(VaultError::NotFound(path)),
            }
        }
        self.append_local(TreeOp::Rmdir { path }, None)?;
        Ok(())
    }

    fn readdir(&self, path: &str) -> VaultResult<Vec<String>> {
        let path = normalize_path(path)?;
        let state = self.inner.state.read();
        readdir_in(&state, &path)
    }
}

/// Read-only tree view pinned to a historic version
pub struct Checkout {
    store: VersionedStore,
    version: u64,
    state: TreeState,
}

impl Checkout {
    /// The version this view is pinned to
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl FileTree for Checkout {
    fn stat(&self, path: &str) -> VaultResult<Option<TreeStat>> {
        let path = normalize_path(path)?;
        Ok(stat_in(&self.state, &path))
    }

    fn read_file(&self, path: &str) -> VaultResult<Vec<u8>> {
        let path = normalize_path(path)?;
        match self.state.get(&path) {
            Some(Node::File { hash, .. }) => match self.store.blob_bytes(hash)? {
                Some(bytes) => Ok(bytes),
                None => Err(VaultError::NotFound(format!(
                    "content not downloaded: {}",
                    path
                ))),
            },
            Some(Node::Dir) => Err(VaultError::NotADirectory(path)),
            None => Err(VaultError::NotFound(path)),
        }
    }

    fn write_file(&self, _path: &str, _data: &[u8]) -> VaultResult<()> {
        Err(VaultError::VaultNotWritable)
    }

    fn mkdir(&self, _path: &str) -> VaultResult<()> {
        Err(VaultError::VaultNotWritable)
    }

    fn unlink(&self, _path: &str) -> VaultResult<()> {
        Err(VaultError::VaultNotWritable)
    }

    fn rmdir(&self, _path: &str) -> VaultResult<()> {
        Err(VaultError::VaultNotWritable)
    }

    fn readdir(&self, path: &str) -> VaultResult<Vec<String>> {
        let path = normalize_path(path)?;
        readdir_in(&self.state, &path)
    }
}

fn stat_in(state: &TreeState, path: &str) -> Option<TreeStat> {
    if path == "/" {
        return Some(TreeStat {
            is_dir: true,
            size: 0,
            mtime: 0,
        });
    }
    match state.get(path) {
        Some(Node::File { size, mtime, .. }) => Some(TreeStat {
            is_dir: false,
            size: *size,
            mtime: *mtime,
        }),
        Some(Node::Dir) => Some(TreeStat {
            is_dir: true,
            size: 0,
            mtime: 0,
        }),
        None => None,
    }
}

fn readdir_in(state: &TreeState, path: &str) -> VaultResult<Vec<String>> {
    if path != "/" {
        match state.get(path) {
            Some(Node::Dir) => {}
            Some(Node::File { .. }) => return Err(VaultError::NotADirectory(path.to_string())),
            None => return Err(VaultError::NotFound(path.to_string())),
        }
    }
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    };
    let mut names = Vec::new();
    for key in state.keys() {
        if let Some(rest) = key.strip_prefix(&prefix) {
            if !rest.is_empty() && !rest.contains('/') {
                names.push(rest.to_string());
            }
        }
    }
    names.sort();
    names.dedup();
    Ok(names)
}

/// Apply one op to a tree, returning the content-byte delta.
fn apply_op(state: &mut TreeState, op: &TreeOp, timestamp: i64) -> i64 {
    match op {
        TreeOp::Put { path, hash, size } => {
            let old = match state.get(path) {
                Some(Node::File { size, .. }) => *size as i64,
                _ => 0,
            };
            ensure_parents(state, path);
            state.insert(
                path.clone(),
                Node::File {
                    hash: *hash,
                    size: *size,
                    mtime: timestamp,
                },
            );
            *size as i64 - old
        }
        TreeOp::Unlink { path } => match state.remove(path) {
            Some(Node::File { size, .. }) => -(size as i64),
            _ => 0,
        },
        TreeOp::Mkdir { path } => {
            ensure_parents(state, path);
            state.entry(path.clone()).or_insert(Node::Dir);
            0
        }
        TreeOp::Rmdir { path } => {
            // only removes an empty directory; violations are ignored on
            // replay so a malformed log cannot wedge the store
            let prefix = format!("{}/", path);
            let has_children = state.keys().any(|k| k.starts_with(&prefix));
            if !has_children {
                if let Some(Node::Dir) = state.get(path) {
                    state.remove(path);
                }
            }
            0
        }
        TreeOp::Rename { from, to } => {
            let moved = take_subtree(state, from);
            for (suffix, node) in moved {
                let dst = rebase(from, to, &suffix);
                ensure_parents(state, &dst);
                state.insert(dst, node);
            }
            0
        }
        TreeOp::Copy { from, to } => {
            let copied: Vec<(String, Node)> = subtree(state, from);
            let mut delta = 0;
            for (suffix, node) in copied {
                if let Node::File { size, .. } = node {
                    delta += size as i64;
                }
                let dst = rebase(from, to, &suffix);
                ensure_parents(state, &dst);
                state.insert(
                    dst,
                    match node {
                        Node::File { hash, size, .. } => Node::File {
                            hash,
                            size,
                            mtime: timestamp,
                        },
                        Node::Dir => Node::Dir,
                    },
                );
            }
            delta
        }
    }
}

fn ensure_parents(state: &mut TreeState, path: &str) {
    let mut current = path.to_string();
    while let Some(parent) = parent_path(&current) {
        if parent == "/" {
            break;
        }
        state.entry(parent.to_string()).or_insert(Node::Dir);
        current = parent.to_string();
    }
}

/// Entries at or under `root`, keyed by suffix relative to `root`
fn subtree(state: &TreeState, root: &str) -> Vec<(String, Node)> {
    let prefix = format!("{}/", root);
    state
        .iter()
        .filter(|(k, _)| k.as_str() == root || k.starts_with(&prefix))
        .map(|(k, v)| (k[root.len()..].to_string(), v.clone()))
        .collect()
}

fn take_subtree(state: &mut TreeState, root: &str) -> Vec<(String, Node)> {
    let entries = subtree(state, root);
    let prefix = format!("{}/", root);
    state.retain(|k, _| k != root && !k.starts_with(&prefix));
    entries
}

fn rebase(_from: &str, to: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        to.to_string()
    } else {
        format!("{}{}", to, suffix)
    }
}
