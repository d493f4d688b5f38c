//! Scoped filesystem handles
//!
//! A `ScopedFs` exposes the `FileTree` surface over an ordinary directory,
//! with every path resolved inside the root (escapes are rejected before
//! touching the disk). Handles are memoized per root path to reduce
//! allocations, mirroring how the sync engine re-enters the same local
//! folder on every watcher tick.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;

use crate::error::{VaultError, VaultResult};
use crate::tree::{normalize_path, FileTree, TreeStat};

/// A filesystem view rooted at one local directory
#[derive(Debug)]
pub struct ScopedFs {
    root: PathBuf,
}

impl ScopedFs {
    /// Create a handle scoped to `root`. The directory need not exist yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root this handle is scoped to
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a tree path onto the scoped on-disk location.
    fn resolve(&self, path: &str) -> VaultResult<PathBuf> {
        let normalized = normalize_path(path)?;
        Ok(self.root.join(normalized.trim_start_matches('/')))
    }
}

impl FileTree for ScopedFs {
    fn stat(&self, path: &str) -> VaultResult<Option<TreeStat>> {
        let full = self.resolve(path)?;
        match fs::symlink_metadata(&full) {
            Ok(md) => {
                // follow symlinks for the stat itself; a dangling link
                // reads as absent
                let md = if md.file_type().is_symlink() {
                    match fs::metadata(&full) {
                        Ok(md) => md,
                        Err(_) => return Ok(None),
                    }
                } else {
                    md
                };
                let mtime = md
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                Ok(Some(TreeStat {
                    is_dir: md.is_dir(),
                    size: if md.is_dir() { 0 } else { md.len() },
                    mtime,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_file(&self, path: &str) -> VaultResult<Vec<u8>> {
        let full = self.resolve(path)?;
        fs::read(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultError::NotFound(path.to_string())
            } else {
                e.into()
            }
        })
    }

    fn write_file(&self, path: &str, data: &[u8]) -> VaultResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full, data)?;
        Ok(())
    }

    fn mkdir(&self, path: &str) -> VaultResult<()> {
        let full = self.resolve(path)?;
        fs::create_dir_all(&full)?;
        Ok(())
    }

    fn unlink(&self, path: &str) -> VaultResult<()> {
        let full = self.resolve(path)?;
        fs::remove_file(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultError::NotFound(path.to_string())
            } else {
                e.into()
            }
        })
    }

    fn rmdir(&self, path: &str) -> VaultResult<()> {
        let full = self.resolve(path)?;
        fs::remove_dir(&full)?;
        Ok(())
    }

    fn readdir(&self, path: &str) -> VaultResult<Vec<String>> {
        let full = self.resolve(path)?;
        let md = fs::metadata(&full)
            .map_err(|_| VaultError::NotFound(path.to_string()))?;
        if !md.is_dir() {
            return Err(VaultError::NotADirectory(path.to_string()));
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&full)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn real_path(&self, path: &str) -> Option<PathBuf> {
        let full = self.resolve(path).ok()?;
        fs::canonicalize(full).ok()
    }
}

/// Memoized `ScopedFs` handles keyed by root path
#[derive(Debug, Default)]
pub struct ScopedFsCache {
    handles: Mutex<HashMap<PathBuf, Arc<ScopedFs>>>,
}

impl ScopedFsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the handle for a root path
    pub fn get(&self, root: impl AsRef<Path>) -> Arc<ScopedFs> {
        let root = root.as_ref().to_path_buf();
        self.handles
            .lock()
            .entry(root.clone())
            .or_insert_with(|| Arc::new(ScopedFs::new(root)))
            .clone()
    }
}
