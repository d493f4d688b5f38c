//! File-tree capability interface
//!
//! The diff/sync algorithm is generic over "either side": the live store,
//! a historic checkout, and the scoped filesystem all expose the same
//! small surface. Paths are normalized slash-separated strings rooted at
//! `/`; implementations map them onto their own storage.

use std::path::PathBuf;

use crate::error::{VaultError, VaultResult};

/// Stat result for a tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStat {
    pub is_dir: bool,
    /// File size in bytes; 0 for directories
    pub size: u64,
    /// Epoch ms of the last modification
    pub mtime: i64,
}

impl TreeStat {
    pub fn is_file(&self) -> bool {
        !self.is_dir
    }
}

/// Capability surface shared by the versioned store and the scoped
/// filesystem. Implementations use interior mutability; `&self` methods
/// keep the trait object-safe for the generic diff walker.
pub trait FileTree: Send + Sync {
    /// Stat a path; `None` if it does not exist
    fn stat(&self, path: &str) -> VaultResult<Option<TreeStat>>;

    /// Read a file's full contents
    fn read_file(&self, path: &str) -> VaultResult<Vec<u8>>;

    /// Write a file, creating parent directories as needed
    fn write_file(&self, path: &str, data: &[u8]) -> VaultResult<()>;

    /// Create a directory (parents created as needed)
    fn mkdir(&self, path: &str) -> VaultResult<()>;

    /// Remove a file
    fn unlink(&self, path: &str) -> VaultResult<()>;

    /// Remove an empty directory
    fn rmdir(&self, path: &str) -> VaultResult<()>;

    /// List the names (not paths) of a directory's children
    fn readdir(&self, path: &str) -> VaultResult<Vec<String>>;

    /// Resolved on-disk location of a path, for cycle detection.
    ///
    /// Trees without a physical filesystem return `None`.
    fn real_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

/// Normalize a tree path: forward slashes, leading `/`, no `.` or empty
/// segments, `..` resolved lexically.
///
/// # Errors
///
/// Returns `ProtectedPathNotWritable` if `..` would escape the root.
pub fn normalize_path(path: &str) -> VaultResult<String> {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.replace('\\', "/").split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(VaultError::ProtectedPathNotWritable(path.to_string()));
                }
            }
            s => parts.push(s),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Join a normalized parent path and a child name
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Parent of a normalized path (`/` has no parent)
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Remove a path and everything under it, files first.
pub fn remove_recursive(tree: &dyn FileTree, path: &str) -> VaultResult<()> {
    match tree.stat(path)? {
        None => Ok(()),
        Some(st) if st.is_file() => tree.unlink(path),
        Some(_) => {
            for name in tree.readdir(path)? {
                remove_recursive(tree, &join_path(path, &name))?;
            }
            tree.rmdir(path)
        }
    }
}

/// Copy a file or directory subtree from `src` to `dst` at the same path.
pub fn copy_recursive(src: &dyn FileTree, dst: &dyn FileTree, path: &str) -> VaultResult<()> {
    match src.stat(path)? {
        None => Err(VaultError::NotFound(path.to_string())),
        Some(st) if st.is_file() => {
            let data = src.read_file(path)?;
            dst.write_file(path, &data)
        }
        Some(_) => {
            dst.mkdir(path)?;
            for name in src.readdir(path)? {
                copy_recursive(src, dst, &join_path(path, &name))?;
            }
            Ok(())
        }
    }
}
