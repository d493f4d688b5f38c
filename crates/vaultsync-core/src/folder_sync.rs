//! Bidirectional folder synchronization
//!
//! Computes and applies directional diffs between a vault's tree and a
//! local folder, under ignore rules, and owns the debounced filesystem
//! watcher that drives the folder→vault direction. The diff walker is
//! generic over `FileTree`, so either side can be the store, a checkout,
//! or the scoped filesystem.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{VaultError, VaultResult};
use crate::events::{EventBus, VaultEvent};
use crate::ignore::{IgnoreRules, DEFAULT_IGNORE_RULES};
use crate::scoped_fs::{ScopedFs, ScopedFsCache};
use crate::storage::VaultDb;
use crate::store::{IGNORE_FILE_PATH, MANIFEST_PATH};
use crate::tree::{join_path, normalize_path, remove_recursive, FileTree};
use crate::types::{ChangeKind, DiffEntry, EntryKind, Manifest, SyncDirection};
use crate::vault::Vault;

/// Size ceiling for `diff_file` (1 MiB)
pub const MAX_DIFF_SIZE: u64 = 1024 * 1024;
/// Debounce window for watcher-triggered syncs
const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);
/// Config key for the process-wide default ignore rules
pub const DEFAULT_IGNORE_CONFIG_KEY: &str = "default_ignore_rules";

/// Protected OS paths that may never be a sync root
const DISALLOWED_SYNC_ROOTS: &[&str] = &[
    "/", "/bin", "/boot", "/dev", "/etc", "/home", "/lib", "/opt", "/proc",
    "/root", "/sbin", "/sys", "/tmp", "/usr", "/var",
];

/// Options for diff and sync operations
#[derive(Debug, Clone)]
pub struct DiffOpts {
    /// Don't descend into one-sided directories beyond the top-level entry
    pub shallow: bool,
    /// Byte comparison instead of size-only
    pub compare_content: bool,
    /// Explicit whitelist overriding ignore rules
    pub paths: Option<Vec<String>>,
    /// Override the vault's configured local sync path
    pub local_sync_path: Option<PathBuf>,
    /// Post-filter to additions only (suppresses deletes/modifies)
    pub add_only: bool,
}

impl Default for DiffOpts {
    fn default() -> Self {
        Self {
            shallow: true,
            compare_content: true,
            paths: None,
            local_sync_path: None,
            add_only: false,
        }
    }
}

/// One line of a `diff_file` result
#[derive(Debug, Clone, PartialEq)]
pub struct LineDiff {
    pub op: LineOp,
    pub text: String,
}

/// Line-diff operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOp {
    Equal,
    /// Present on the folder side only
    Insert,
    /// Present on the vault side only
    Delete,
}

/// Single-slot deferred-sync state: the pending debounce handle and the
/// in-flight flag live under one lock, which is what makes the
/// at-most-one-in-flight invariant enforceable.
#[derive(Debug, Default)]
pub struct SyncGuard {
    state: Mutex<GuardState>,
}

#[derive(Debug, Default)]
struct GuardState {
    pending: Option<JoinHandle<()>>,
    in_flight: bool,
}

impl SyncGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// True from the moment a folder→vault sync enters its debounce
    /// window until that sync finishes running
    pub fn is_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }
}

/// Active watcher on a vault's local sync folder
pub struct FolderWatcher {
    _watcher: notify::RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for FolderWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for FolderWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderWatcher").finish_non_exhaustive()
    }
}

/// The folder synchronization engine
pub struct FolderSyncEngine {
    scoped: ScopedFsCache,
    db: VaultDb,
    events: EventBus,
}

impl FolderSyncEngine {
    pub fn new(db: VaultDb, events: EventBus) -> Self {
        Self {
            scoped: ScopedFsCache::new(),
            db,
            events,
        }
    }

    /// The memoized scoped-fs cache (shared with the registry)
    pub fn scoped_fs(&self, root: impl AsRef<Path>) -> Arc<ScopedFs> {
        self.scoped.get(root)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Diff and sync
    // ═══════════════════════════════════════════════════════════════════

    /// Path-level differences between the folder side and the store side
    /// (folder→vault direction).
    pub fn diff_listing(&self, vault: &Vault, opts: &DiffOpts) -> VaultResult<Vec<DiffEntry>> {
        let root = match resolve_sync_root(vault, opts) {
            Some(root) => root,
            None => return Ok(Vec::new()),
        };
        let scoped = self.scoped.get(&root);
        let filter = self.build_filter(&scoped, opts)?;
        let mut diff = diff_trees(scoped.as_ref(), vault.store(), opts, &filter)?;
        if opts.add_only {
            diff.retain(|d| d.change == ChangeKind::Add);
        }
        Ok(diff)
    }

    /// Apply the folder's state onto the vault. Requires a writable vault.
    pub fn sync_folder_to_vault(&self, vault: &Vault, opts: &DiffOpts) -> VaultResult<()> {
        if !vault.writable() {
            return Err(VaultError::VaultNotWritable);
        }
        self.sync(vault, true, opts)
    }

    /// Apply the vault's state onto the folder. No writability required;
    /// refuses to run while a folder→vault sync is in its debounce window
    /// to avoid fighting the watcher.
    pub fn sync_vault_to_folder(&self, vault: &Vault, opts: &DiffOpts) -> VaultResult<()> {
        if vault.sync_guard.is_pending() {
            debug!(key = %vault.key(), "Folder sync pending, skipping vault->folder pass");
            return Ok(());
        }
        self.sync(vault, false, opts)
    }

    fn sync(&self, vault: &Vault, to_vault: bool, opts: &DiffOpts) -> VaultResult<()> {
        let root = match resolve_sync_root(vault, opts) {
            Some(root) => root,
            None => return Ok(()),
        };
        let scoped = self.scoped.get(&root);
        let filter = self.build_filter(&scoped, opts)?;

        let (left, right): (&dyn FileTree, &dyn FileTree) = if to_vault {
            (scoped.as_ref(), vault.store())
        } else {
            (vault.store(), scoped.as_ref())
        };

        let mut diff = diff_trees(left, right, opts, &filter)?;
        if opts.add_only {
            diff.retain(|d| d.change == ChangeKind::Add);
        }
        apply_right(left, right, &diff)?;

        let direction = if to_vault {
            SyncDirection::ToVault
        } else {
            SyncDirection::ToFolder
        };
        debug!(key = %vault.key(), %direction, changes = diff.len(), "Folder sync complete");
        self.events.publish(VaultEvent::FolderSynced {
            url: vault.url().to_string(),
            direction,
        });
        Ok(())
    }

    /// Merge the folder's manifest over the vault's (folder fields win),
    /// then an add-only vault→folder pass so nothing local is destroyed,
    /// then a full folder→vault pass.
    pub fn merge_vault_and_folder(&self, vault: &Vault, root: &Path) -> VaultResult<()> {
        let scoped = self.scoped.get(root);
        let folder_manifest: Manifest = scoped
            .read_file(MANIFEST_PATH)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        let mut merged = vault.store().read_manifest();
        merged.merge_from(&folder_manifest);
        let bytes = serde_json::to_vec_pretty(&merged)
            .map_err(|e| VaultError::Serialization(e.to_string()))?;
        scoped.write_file(MANIFEST_PATH, &bytes)?;

        let base = DiffOpts {
            shallow: false,
            local_sync_path: Some(root.to_path_buf()),
            ..Default::default()
        };
        self.sync(
            vault,
            false,
            &DiffOpts {
                add_only: true,
                ..base.clone()
            },
        )?;
        self.sync(vault, true, &base)
    }

    // ═══════════════════════════════════════════════════════════════════
    // File-level diff
    // ═══════════════════════════════════════════════════════════════════

    /// Line-level text diff of one file between the folder (new side) and
    /// the vault (old side).
    pub fn diff_file(&self, vault: &Vault, path: &str) -> VaultResult<Vec<LineDiff>> {
        let root = match vault.local_sync_path() {
            Some(root) => root,
            None => return Ok(Vec::new()),
        };
        let scoped = self.scoped.get(&root);
        let path = normalize_path(path)?;

        // filename heuristic first, content sniff only if inconclusive
        let by_name = binary_by_name(&path);
        if by_name == Some(true) {
            return Err(VaultError::InvalidEncoding(
                "cannot diff a binary file".to_string(),
            ));
        }
        check_diff_side(scoped.as_ref(), &path, by_name)?;
        check_diff_side(vault.store(), &path, by_name)?;

        let new_text = read_lossy(scoped.as_ref(), &path);
        let old_text = read_lossy(vault.store(), &path);
        Ok(diff_lines(&old_text, &new_text))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Watcher lifecycle
    // ═══════════════════════════════════════════════════════════════════

    /// Attach (or re-attach) the folder→vault watcher according to the
    /// vault's current local sync path. Detaches any previous watcher
    /// first. On first attach the one-time merge runs before watching.
    pub fn configure_folder_to_vault_watcher(
        self: &Arc<Self>,
        vault: &Arc<Vault>,
    ) -> VaultResult<()> {
        let was_watching = vault.watcher.lock().take().is_some();

        let root = match vault.local_sync_path() {
            Some(root) => root,
            None => return Ok(()),
        };
        if !root.is_dir() {
            error!(key = %vault.key(), ?root, "Local sync folder not found, aborting watch");
            return Ok(());
        }

        if !was_watching {
            if let Err(e) = self.merge_vault_and_folder(vault, &root) {
                error!(key = %vault.key(), error = ?e, "Failed to merge local sync folder");
            }
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| {
                if res.is_ok() {
                    let _ = tx.send(());
                }
            },
        )
        .map_err(|e| VaultError::Io(std::io::Error::other(e)))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| VaultError::Io(std::io::Error::other(e)))?;

        let task = {
            let engine = self.clone();
            let vault = vault.clone();
            tokio::spawn(async move {
                while rx.recv().await.is_some() {
                    engine.on_folder_change(&vault);
                }
            })
        };

        *vault.watcher.lock() = Some(FolderWatcher {
            _watcher: watcher,
            task,
        });
        Ok(())
    }

    /// Debounce a filesystem change; events during an in-flight sync are
    /// dropped rather than queued.
    fn on_folder_change(self: &Arc<Self>, vault: &Arc<Vault>) {
        let mut state = vault.sync_guard.state.lock();
        if state.in_flight {
            return;
        }
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        let engine = self.clone();
        let vault = vault.clone();
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(WATCH_DEBOUNCE).await;
            engine.run_debounced_sync(&vault).await;
        }));
    }

    async fn run_debounced_sync(self: &Arc<Self>, vault: &Arc<Vault>) {
        {
            // the pending handle (ourselves) stays set while the sync
            // runs, so vault->folder passes keep refusing until it ends
            let mut state = vault.sync_guard.state.lock();
            if state.in_flight {
                state.pending = None;
                return;
            }
            state.in_flight = true;
        }

        // watched root gone: self-detach
        let root = vault.local_sync_path();
        if !root.as_deref().map(Path::is_dir).unwrap_or(false) {
            error!(key = %vault.key(), ?root, "Local sync folder disappeared, detaching watcher");
            vault.watcher.lock().take();
            let mut state = vault.sync_guard.state.lock();
            state.pending = None;
            state.in_flight = false;
            return;
        }

        let result = self.sync_folder_to_vault(
            vault,
            &DiffOpts {
                shallow: false,
                ..Default::default()
            },
        );
        match result {
            Ok(()) => {}
            Err(e @ VaultError::FilesystemCycle(_)) => {
                self.events.publish(VaultEvent::FolderSyncError {
                    url: vault.url().to_string(),
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
            Err(e) => {
                warn!(key = %vault.key(), error = ?e, "Error syncing folder");
            }
        }
        let mut state = vault.sync_guard.state.lock();
        state.pending = None;
        state.in_flight = false;
    }

    // ═══════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════

    /// Reject protected OS paths and anything that is not an existing
    /// directory.
    pub fn assert_safe_path(&self, path: &Path) -> VaultResult<()> {
        let candidate = path
            .to_string_lossy()
            .trim_end_matches('/')
            .to_string();
        let candidate = if candidate.is_empty() { "/".to_string() } else { candidate };
        for disallowed in DISALLOWED_SYNC_ROOTS {
            if candidate == *disallowed {
                return Err(VaultError::ProtectedPathNotWritable(candidate));
            }
        }
        let md = std::fs::metadata(path)
            .map_err(|_| VaultError::NotFound(path.to_string_lossy().into_owned()))?;
        if !md.is_dir() {
            return Err(VaultError::NotADirectory(
                path.to_string_lossy().into_owned(),
            ));
        }
        Ok(())
    }

    /// Build the per-operation filter: an explicit whitelist when `paths`
    /// is given, otherwise rules read fresh from the folder's ignore file
    /// (falling back to the configured, then built-in, defaults).
    fn build_filter(&self, scoped: &ScopedFs, opts: &DiffOpts) -> VaultResult<PathFilter> {
        if let Some(ref paths) = opts.paths {
            let mut normalized = Vec::with_capacity(paths.len());
            for p in paths {
                // the trailing-separator convention marks directories
                let is_dir = p.ends_with('/');
                let mut n = normalize_path(p)?;
                if is_dir && n != "/" {
                    n.push('/');
                }
                normalized.push(n);
            }
            return Ok(PathFilter::Whitelist(normalized));
        }
        let text = match scoped.read_file(IGNORE_FILE_PATH) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => self
                .db
                .get_config(DEFAULT_IGNORE_CONFIG_KEY)?
                .unwrap_or_else(|| DEFAULT_IGNORE_RULES.to_string()),
        };
        Ok(PathFilter::Rules(IgnoreRules::parse(&text)))
    }
}

fn resolve_sync_root(vault: &Vault, opts: &DiffOpts) -> Option<PathBuf> {
    opts.local_sync_path
        .clone()
        .or_else(|| vault.local_sync_path())
}

/// Which paths a diff/sync pass skips
enum PathFilter {
    Rules(IgnoreRules),
    /// Normalized whitelist; directory entries carry a trailing slash
    Whitelist(Vec<String>),
}

impl PathFilter {
    fn skips(&self, path: &str) -> bool {
        match self {
            PathFilter::Rules(rules) => rules.is_ignored(path),
            PathFilter::Whitelist(targets) => {
                for target in targets {
                    if let Some(dir) = target.strip_suffix('/') {
                        // the directory itself and everything inside it
                        if path == dir {
                            return false;
                        }
                        if path.starts_with(target) {
                            return false;
                        }
                        if dir.starts_with(path)
                            && dir.as_bytes().get(path.len()) == Some(&b'/')
                        {
                            return false; // ancestor of the whitelisted dir
                        }
                    } else {
                        if path == target {
                            return false;
                        }
                        if target.starts_with(path)
                            && target.as_bytes().get(path.len()) == Some(&b'/')
                        {
                            return false; // ancestor of the whitelisted file
                        }
                    }
                }
                true
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Tree diff
// ═══════════════════════════════════════════════════════════════════════

fn diff_trees(
    left: &dyn FileTree,
    right: &dyn FileTree,
    opts: &DiffOpts,
    filter: &PathFilter,
) -> VaultResult<Vec<DiffEntry>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    walk_diff(left, right, "/", opts, filter, &mut out, &mut visited)?;
    Ok(out)
}

fn walk_diff(
    left: &dyn FileTree,
    right: &dyn FileTree,
    dir: &str,
    opts: &DiffOpts,
    filter: &PathFilter,
    out: &mut Vec<DiffEntry>,
    visited: &mut HashSet<PathBuf>,
) -> VaultResult<()> {
    // structural cycles (symlink loops) on the filesystem side
    for side in [left, right] {
        if let Some(real) = side.real_path(dir) {
            if !visited.insert(real) {
                return Err(VaultError::FilesystemCycle(dir.to_string()));
            }
        }
    }

    let mut names: Vec<String> = Vec::new();
    for side in [left, right] {
        if let Ok(children) = side.readdir(dir) {
            names.extend(children);
        }
    }
    names.sort();
    names.dedup();

    for name in names {
        let path = join_path(dir, &name);
        if filter.skips(&path) {
            continue;
        }
        let l = left.stat(&path)?;
        let r = right.stat(&path)?;
        match (l, r) {
            (None, None) => {}
            (Some(l), None) => {
                let kind = entry_kind(l.is_dir);
                out.push(DiffEntry {
                    change: ChangeKind::Add,
                    kind,
                    path: path.clone(),
                });
                if l.is_dir && !opts.shallow {
                    collect_side(left, &path, ChangeKind::Add, filter, out, visited)?;
                }
            }
            (None, Some(r)) => {
                out.push(DiffEntry {
                    change: ChangeKind::Delete,
                    kind: entry_kind(r.is_dir),
                    path,
                });
            }
            (Some(l), Some(r)) if l.is_dir && r.is_dir => {
                walk_diff(left, right, &path, opts, filter, out, visited)?;
            }
            (Some(l), Some(r)) if !l.is_dir && !r.is_dir => {
                if files_differ(left, right, &path, l.size, r.size, opts)? {
                    out.push(DiffEntry {
                        change: ChangeKind::Modify,
                        kind: EntryKind::File,
                        path,
                    });
                }
            }
            (Some(l), Some(_)) => {
                // type changed: one modify entry, applied as replace
                out.push(DiffEntry {
                    change: ChangeKind::Modify,
                    kind: entry_kind(l.is_dir),
                    path: path.clone(),
                });
                if l.is_dir && !opts.shallow {
                    collect_side(left, &path, ChangeKind::Add, filter, out, visited)?;
                }
            }
        }
    }
    Ok(())
}

/// Enumerate everything under a one-sided directory as its own entries
fn collect_side(
    tree: &dyn FileTree,
    dir: &str,
    change: ChangeKind,
    filter: &PathFilter,
    out: &mut Vec<DiffEntry>,
    visited: &mut HashSet<PathBuf>,
) -> VaultResult<()> {
    if let Some(real) = tree.real_path(dir) {
        if !visited.insert(real) {
            return Err(VaultError::FilesystemCycle(dir.to_string()));
        }
    }
    for name in tree.readdir(dir)? {
        let path = join_path(dir, &name);
        if filter.skips(&path) {
            continue;
        }
        match tree.stat(&path)? {
            Some(st) if st.is_dir => {
                out.push(DiffEntry {
                    change,
                    kind: EntryKind::Dir,
                    path: path.clone(),
                });
                collect_side(tree, &path, change, filter, out, visited)?;
            }
            Some(_) => out.push(DiffEntry {
                change,
                kind: EntryKind::File,
                path,
            }),
            None => {}
        }
    }
    Ok(())
}

fn entry_kind(is_dir: bool) -> EntryKind {
    if is_dir {
        EntryKind::Dir
    } else {
        EntryKind::File
    }
}

fn files_differ(
    left: &dyn FileTree,
    right: &dyn FileTree,
    path: &str,
    l_size: u64,
    r_size: u64,
    opts: &DiffOpts,
) -> VaultResult<bool> {
    if l_size != r_size {
        return Ok(true);
    }
    if !opts.compare_content {
        return Ok(false);
    }
    // a side whose content has not been downloaded cannot be compared
    let l_bytes = match left.read_file(path) {
        Ok(bytes) => bytes,
        Err(VaultError::NotFound(_)) => return Ok(false),
        Err(e) => return Err(e),
    };
    let r_bytes = match right.read_file(path) {
        Ok(bytes) => bytes,
        Err(VaultError::NotFound(_)) => return Ok(false),
        Err(e) => return Err(e),
    };
    Ok(l_bytes != r_bytes)
}

/// Apply the diff so the right side matches the left.
fn apply_right(
    left: &dyn FileTree,
    right: &dyn FileTree,
    diff: &[DiffEntry],
) -> VaultResult<()> {
    for entry in diff {
        match entry.change {
            ChangeKind::Add | ChangeKind::Modify => {
                // replace on type mismatch
                if let Some(existing) = right.stat(&entry.path)? {
                    let kind_differs = existing.is_dir != (entry.kind == EntryKind::Dir);
                    if kind_differs {
                        remove_recursive(right, &entry.path)?;
                    }
                }
                match entry.kind {
                    EntryKind::Dir => right.mkdir(&entry.path)?,
                    EntryKind::File => {
                        let data = left.read_file(&entry.path)?;
                        right.write_file(&entry.path, &data)?;
                    }
                }
            }
            ChangeKind::Delete => remove_recursive(right, &entry.path)?,
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// diff_file helpers
// ═══════════════════════════════════════════════════════════════════════

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "bmp", "webp", "zip", "gz", "tar", "7z",
    "exe", "dll", "so", "dylib", "bin", "pdf", "mp3", "mp4", "avi", "mov", "ogg",
    "woff", "woff2", "ttf", "eot", "class", "jar", "wasm",
];

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "html", "htm", "css", "js", "mjs", "json", "xml",
    "yml", "yaml", "toml", "rs", "py", "c", "h", "cpp", "hpp", "java", "go",
    "rb", "sh", "csv", "svg",
];

/// Filename heuristic: Some(true) = binary, Some(false) = text,
/// None = inconclusive (sniff the content).
fn binary_by_name(path: &str) -> Option<bool> {
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    if BINARY_EXTENSIONS.contains(&ext.as_str()) {
        return Some(true);
    }
    if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        return Some(false);
    }
    None
}

/// NUL byte in the first 512 bytes reads as binary
fn is_binary_content(bytes: &[u8]) -> bool {
    bytes.iter().take(512).any(|b| *b == 0)
}

fn check_diff_side(
    tree: &dyn FileTree,
    path: &str,
    by_name: Option<bool>,
) -> VaultResult<()> {
    let st = match tree.stat(path)? {
        Some(st) if st.is_file() => st,
        _ => return Ok(()),
    };
    if st.size > MAX_DIFF_SIZE {
        return Err(VaultError::SourceTooLarge {
            size: st.size,
            limit: MAX_DIFF_SIZE,
        });
    }
    if by_name.is_none() {
        if let Ok(bytes) = tree.read_file(path) {
            if is_binary_content(&bytes) {
                return Err(VaultError::InvalidEncoding(
                    "cannot diff a binary file".to_string(),
                ));
            }
        }
    }
    Ok(())
}

fn read_lossy(tree: &dyn FileTree, path: &str) -> String {
    tree.read_file(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Line-level LCS diff. Falls back to whole-file replacement when the
/// quadratic table would be unreasonably large (inputs are already capped
/// at 1 MiB by the callers).
fn diff_lines(old: &str, new: &str) -> Vec<LineDiff> {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    // trim the common prefix and suffix before the DP
    let mut start = 0;
    while start < old_lines.len()
        && start < new_lines.len()
        && old_lines[start] == new_lines[start]
    {
        start += 1;
    }
    let mut old_end = old_lines.len();
    let mut new_end = new_lines.len();
    while old_end > start && new_end > start && old_lines[old_end - 1] == new_lines[new_end - 1]
    {
        old_end -= 1;
        new_end -= 1;
    }

    let old_mid = &old_lines[start..old_end];
    let new_mid = &new_lines[start..new_end];

    let mut out: Vec<LineDiff> = old_lines[..start]
        .iter()
        .map(|l| LineDiff {
            op: LineOp::Equal,
            text: (*l).to_string(),
        })
        .collect();

    const MAX_DP_CELLS: usize = 4_000_000;
    if old_mid.len().saturating_mul(new_mid.len()) > MAX_DP_CELLS {
        out.extend(old_mid.iter().map(|l| LineDiff {
            op: LineOp::Delete,
            text: (*l).to_string(),
        }));
        out.extend(new_mid.iter().map(|l| LineDiff {
            op: LineOp::Insert,
            text: (*l).to_string(),
        }));
    } else {
        out.extend(lcs_diff(old_mid, new_mid));
    }

    out.extend(old_lines[old_end..].iter().map(|l| LineDiff {
        op: LineOp::Equal,
        text: (*l).to_string(),
    }));
    out
}

fn lcs_diff(old: &[&str], new: &[&str]) -> Vec<LineDiff> {
    let n = old.len();
    let m = new.len();
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[idx(i, j)] = if old[i] == new[j] {
                table[idx(i + 1, j + 1)] + 1
            } else {
                table[idx(i + 1, j)].max(table[idx(i, j + 1)])
            };
        }
    }

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            out.push(LineDiff {
                op: LineOp::Equal,
                text: old[i].to_string(),
            });
            i += 1;
            j += 1;
        } else if table[idx(i + 1, j)] >= table[idx(i, j + 1)] {
            out.push(LineDiff {
                op: LineOp::Delete,
                text: old[i].to_string(),
            });
            i += 1;
        } else {
            out.push(LineDiff {
                op: LineOp::Insert,
                text: new[j].to_string(),
            });
            j += 1;
        }
    }
    out.extend(old[i..].iter().map(|l| LineDiff {
        op: LineOp::Delete,
        text: (*l).to_string(),
    }));
    out.extend(new[j..].iter().map(|l| LineDiff {
        op: LineOp::Insert,
        text: (*l).to_string(),
    }));
    out
}
