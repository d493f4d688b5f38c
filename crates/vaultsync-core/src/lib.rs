//! Vaultsync Core Library
//!
//! Vault lifecycle and replication management for versioned,
//! content-addressed, cryptographically-identified data containers that
//! replicate peer-to-peer and mirror to and from ordinary folders.
//!
//! ## Overview
//!
//! A vault is identified by an ed25519 public key; holding the secret key
//! makes it writable. The registry owns the loaded set, the swarm
//! controller joins one gossip topic per vault (keyed by a derived
//! discovery key), the folder sync engine keeps a vault and a local
//! folder consistent under ignore rules, and the garbage collector
//! reclaims disk space from unsaved, idle vaults.
//!
//! ## Quick Start
//!
//! ```ignore
//! use vaultsync_core::{GarbageCollector, Manifest, VaultRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = VaultRegistry::new("~/.vaultsync/data")?;
//!     registry.load_saved_vaults().await;
//!
//!     let gc = GarbageCollector::new(registry.clone());
//!     gc.setup();
//!
//!     // Create a vault and write into it
//!     let url = registry
//!         .create(
//!             Manifest {
//!                 title: Some("My Site".into()),
//!                 ..Default::default()
//!             },
//!             None,
//!         )
//!         .await?;
//!     let vault = registry.get_loaded(&url).unwrap();
//!     vault.store().write_file("/index.html", b"<h1>hi</h1>")?;
//!
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod autodownload;
pub mod debug_log;
pub mod dns;
pub mod error;
pub mod events;
pub mod folder_sync;
pub mod gc;
pub mod ignore;
pub mod net;
pub mod registry;
pub mod scoped_fs;
pub mod storage;
pub mod store;
pub mod tree;
pub mod types;
pub mod vault;

// Re-exports
pub use autodownload::{configure_auto_download, stop_auto_download};
pub use debug_log::{DebugLog, DebugRecord};
pub use dns::{LookupFn, NameResolver};
pub use error::{VaultError, VaultResult};
pub use events::{EventBus, VaultEvent};
pub use folder_sync::{DiffOpts, FolderSyncEngine, LineDiff, LineOp, MAX_DIFF_SIZE};
pub use gc::{GarbageCollector, GcOptions, GcStats, GC_EXPIRATION_AGE};
pub use ignore::{IgnoreRules, DEFAULT_IGNORE_RULES};
pub use net::{GossipNet, SwarmController, WireMessage};
pub use registry::{VaultInfo, VaultRegistry};
pub use scoped_fs::{ScopedFs, ScopedFsCache};
pub use storage::{TouchField, VaultDb};
pub use store::{
    Checkout, HistoryItem, SignedEntry, VersionedStore, IGNORE_FILE_PATH, MANIFEST_PATH,
};
pub use tree::{FileTree, TreeStat};
pub use types::*;
pub use vault::Vault;
