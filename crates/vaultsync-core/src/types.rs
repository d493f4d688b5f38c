//! Core types for vaultsync
//!
//! A vault is identified by an ed25519 public key (32 bytes, displayed as
//! 64 hex characters). The discovery key is derived from the public key
//! and is used only for peer rendezvous, never for data addressing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{VaultError, VaultResult};

/// URL scheme for vaults
pub const VAULT_URL_SCHEME: &str = "vault://";

/// Domain separation context for discovery-key derivation
const DISCOVERY_KEY_CONTEXT: &str = "vaultsync discovery-key v1";

/// Public key identifying a vault (64 hex chars on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VaultKey(pub [u8; 32]);

impl VaultKey {
    /// Create a VaultKey from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from a 64-character hex string (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns `VaultError::InvalidVaultKey` for any other input. This is
    /// the single validation point for the fixed-length-hex invariant and
    /// runs before any I/O.
    pub fn parse(s: &str) -> VaultResult<Self> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(VaultError::InvalidVaultKey(s.to_string()));
        }
        let bytes = hex::decode(s).map_err(|_| VaultError::InvalidVaultKey(s.to_string()))?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding (the canonical string form)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Rendezvous key derived from the public key.
///
/// Peers meet on this value; it never addresses stored data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryKey(pub [u8; 32]);

impl DiscoveryKey {
    /// Derive the discovery key for a vault key
    pub fn derive(key: &VaultKey) -> Self {
        Self(blake3::derive_key(DISCOVERY_KEY_CONTEXT, key.as_bytes()))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Parse a `vault://` URL or bare 64-hex key into a VaultKey.
///
/// # Errors
///
/// Returns `VaultError::InvalidVaultKey` if the scheme is wrong or the
/// host is not a valid key.
pub fn from_url_to_key(url: &str) -> VaultResult<VaultKey> {
    if let Ok(key) = VaultKey::parse(url) {
        return Ok(key);
    }
    let rest = url
        .strip_prefix(VAULT_URL_SCHEME)
        .ok_or_else(|| VaultError::InvalidVaultKey(url.to_string()))?;
    let host = rest.split('/').next().unwrap_or_default();
    VaultKey::parse(host)
}

/// Format a vault key as its canonical URL
pub fn from_key_to_url(key: &VaultKey) -> String {
    format!("{}{}/", VAULT_URL_SCHEME, key.to_hex())
}

/// Vault manifest, stored as JSON at the reserved path inside the store.
///
/// All fields are optional; unknown fields are dropped on rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Type tags (multi-valued)
    #[serde(rename = "type", default, skip_serializing_if = "Vec::is_empty")]
    pub type_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_security_policy: Option<String>,
}

impl Manifest {
    /// Merge `other` over `self`: every field set in `other` wins.
    pub fn merge_from(&mut self, other: &Manifest) {
        if other.title.is_some() {
            self.title = other.title.clone();
        }
        if other.description.is_some() {
            self.description = other.description.clone();
        }
        if !other.type_tags.is_empty() {
            self.type_tags = other.type_tags.clone();
        }
        if other.author.is_some() {
            self.author = other.author.clone();
        }
        if other.links.is_some() {
            self.links = other.links.clone();
        }
        if other.web_root.is_some() {
            self.web_root = other.web_root.clone();
        }
        if other.fallback_page.is_some() {
            self.fallback_page = other.fallback_page.clone();
        }
        if other.content_security_policy.is_some() {
            self.content_security_policy = other.content_security_policy.clone();
        }
    }

    /// Copy the fixed set of fields that survive a fork regardless of
    /// overrides: web_root, fallback_page, links.
    pub fn preserve_on_fork(&mut self, source: &Manifest) {
        if source.web_root.is_some() {
            self.web_root = source.web_root.clone();
        }
        if source.fallback_page.is_some() {
            self.fallback_page = source.fallback_page.clone();
        }
        if source.links.is_some() {
            self.links = source.links.clone();
        }
    }
}

/// Per (profile, vault) user settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Pinned in the local cache (protected from GC)
    pub is_saved: bool,
    /// Participate in the swarm
    pub networked: bool,
    pub auto_download: bool,
    pub auto_upload: bool,
    /// Epoch ms; 0 = never expires
    pub expires_at: i64,
    pub local_sync_path: Option<PathBuf>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            is_saved: false,
            networked: true,
            auto_download: false,
            auto_upload: false,
            expires_at: 0,
            local_sync_path: None,
        }
    }
}

/// Partial settings update; unset fields keep their current value.
///
/// On first write for a vault, `networked` defaults to true and
/// `auto_download`/`auto_upload` default to `is_saved`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub is_saved: Option<bool>,
    pub networked: Option<bool>,
    pub auto_download: Option<bool>,
    pub auto_upload: Option<bool>,
    pub expires_at: Option<i64>,
    pub local_sync_path: Option<Option<PathBuf>>,
}

impl SettingsUpdate {
    /// Initial record from a partial update, applying the contextual
    /// defaults described above.
    pub fn into_initial(self) -> UserSettings {
        let is_saved = self.is_saved.unwrap_or(false);
        UserSettings {
            is_saved,
            networked: self.networked.unwrap_or(true),
            auto_download: self.auto_download.unwrap_or(is_saved),
            auto_upload: self.auto_upload.unwrap_or(is_saved),
            expires_at: self.expires_at.unwrap_or(0),
            local_sync_path: self.local_sync_path.unwrap_or(None),
        }
    }

    /// Apply onto an existing record
    pub fn apply_to(&self, settings: &mut UserSettings) {
        if let Some(v) = self.is_saved {
            settings.is_saved = v;
        }
        if let Some(v) = self.networked {
            settings.networked = v;
        }
        if let Some(v) = self.auto_download {
            settings.auto_download = v;
        }
        if let Some(v) = self.auto_upload {
            settings.auto_upload = v;
        }
        if let Some(v) = self.expires_at {
            settings.expires_at = v;
        }
        if let Some(ref v) = self.local_sync_path {
            settings.local_sync_path = v.clone();
        }
    }
}

/// Persisted cache of manifest-derived fields plus access bookkeeping.
///
/// Always re-derivable from the store manifest; never the source of truth
/// for writability (that is secret-key presence).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultMeta {
    pub key: VaultKey,
    pub title: Option<String>,
    pub description: Option<String>,
    pub type_tags: Vec<String>,
    /// Epoch ms of the last content change
    pub mtime: i64,
    pub is_owner: bool,
    /// Epoch ms
    pub last_access_time: i64,
    /// Epoch ms
    pub last_repository_access_time: i64,
}

impl VaultMeta {
    /// Empty record for a key with no stored meta yet
    pub fn empty(key: VaultKey) -> Self {
        Self {
            key,
            title: None,
            description: None,
            type_tags: Vec::new(),
            mtime: 0,
            is_owner: false,
            last_access_time: 0,
            last_repository_access_time: 0,
        }
    }
}

/// One time-bucketed sample of the peer count.
///
/// Samples within a 10 second window are coalesced in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHistorySample {
    /// Epoch ms
    pub ts: i64,
    pub peers: usize,
}

/// Query criteria for `VaultRegistry::query`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VaultQuery {
    pub is_saved: Option<bool>,
    pub is_networked: Option<bool>,
    pub is_owner: Option<bool>,
    /// Match vaults carrying this type tag
    pub type_tag: Option<String>,
    /// In-memory-only post-filter: true = only loaded, false = only unloaded
    pub in_memory: Option<bool>,
}

/// Row returned by `VaultRegistry::query`: persisted settings joined with
/// persisted meta, augmented with live data for loaded vaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSummary {
    pub url: String,
    pub meta: VaultMeta,
    pub user_settings: UserSettings,
    /// Content byte estimate; 0 when not loaded
    pub size: u64,
    /// Current peer count; 0 when not loaded
    pub peers: usize,
    pub peer_history: Vec<PeerHistorySample>,
}

/// Kind of change a diff entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

/// Whether the differing path is a file or a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Dir,
}

/// One path-level difference between two trees. Produced transiently by a
/// diff pass; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub change: ChangeKind,
    pub kind: EntryKind,
    /// Normalized path, always starting with `/`
    pub path: String,
}

/// Direction of a completed folder sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDirection {
    /// Folder contents were applied to the vault
    ToVault,
    /// Vault contents were applied to the folder
    ToFolder,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDirection::ToVault => write!(f, "vault"),
            SyncDirection::ToFolder => write!(f, "folder"),
        }
    }
}

/// Current epoch time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a fresh vault keypair.
///
/// Uses getrandom directly for the seed to avoid rand version conflicts
/// with ed25519-dalek's rand_core.
pub fn generate_keypair() -> (VaultKey, ed25519_dalek::SigningKey) {
    let mut seed = [0u8; 32];
    getrandom::getrandom(&mut seed).expect("Failed to get random bytes");
    let secret = ed25519_dalek::SigningKey::from_bytes(&seed);
    let key = VaultKey::from_bytes(secret.verifying_key().to_bytes());
    (key, secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parse_roundtrip() {
        let hex = "ab".repeat(32);
        let key = VaultKey::parse(&hex).unwrap();
        assert_eq!(key.to_hex(), hex);
    }

    #[test]
    fn test_key_parse_accepts_uppercase() {
        let key = VaultKey::parse(&"AB".repeat(32)).unwrap();
        assert_eq!(key.to_hex(), "ab".repeat(32));
    }

    #[test]
    fn test_key_parse_rejects_bad_input() {
        assert!(matches!(
            VaultKey::parse("short"),
            Err(VaultError::InvalidVaultKey(_))
        ));
        assert!(matches!(
            VaultKey::parse(&"zz".repeat(32)),
            Err(VaultError::InvalidVaultKey(_))
        ));
        assert!(matches!(
            VaultKey::parse(&"ab".repeat(33)),
            Err(VaultError::InvalidVaultKey(_))
        ));
    }

    #[test]
    fn test_discovery_key_differs_from_key() {
        let key = VaultKey::from_bytes([7u8; 32]);
        let dkey = DiscoveryKey::derive(&key);
        assert_ne!(dkey.as_bytes(), key.as_bytes());
        // deterministic
        assert_eq!(DiscoveryKey::derive(&key), dkey);
    }

    #[test]
    fn test_url_helpers() {
        let key = VaultKey::from_bytes([1u8; 32]);
        let url = from_key_to_url(&key);
        assert!(url.starts_with("vault://"));
        assert_eq!(from_url_to_key(&url).unwrap(), key);
        // bare key also accepted
        assert_eq!(from_url_to_key(&key.to_hex()).unwrap(), key);
        // wrong scheme rejected
        assert!(from_url_to_key("https://example.com").is_err());
    }

    #[test]
    fn test_url_with_path_suffix() {
        let key = VaultKey::from_bytes([2u8; 32]);
        let url = format!("vault://{}/some/file.txt", key.to_hex());
        assert_eq!(from_url_to_key(&url).unwrap(), key);
    }

    #[test]
    fn test_manifest_merge_prefers_other() {
        let mut base = Manifest {
            title: Some("old".into()),
            description: Some("keep me".into()),
            ..Default::default()
        };
        let over = Manifest {
            title: Some("new".into()),
            ..Default::default()
        };
        base.merge_from(&over);
        assert_eq!(base.title.as_deref(), Some("new"));
        assert_eq!(base.description.as_deref(), Some("keep me"));
    }

    #[test]
    fn test_manifest_preserve_on_fork() {
        let src = Manifest {
            title: Some("src".into()),
            web_root: Some("/public".into()),
            fallback_page: Some("/404.html".into()),
            links: Some(serde_json::json!({"license": []})),
            ..Default::default()
        };
        let mut dst = Manifest {
            title: Some("fork".into()),
            web_root: Some("/overridden".into()),
            ..Default::default()
        };
        dst.preserve_on_fork(&src);
        // preserved fields always come from the source
        assert_eq!(dst.web_root.as_deref(), Some("/public"));
        assert_eq!(dst.fallback_page.as_deref(), Some("/404.html"));
        assert!(dst.links.is_some());
        // other fields untouched
        assert_eq!(dst.title.as_deref(), Some("fork"));
    }

    #[test]
    fn test_settings_update_initial_defaults() {
        let update = SettingsUpdate {
            is_saved: Some(true),
            ..Default::default()
        };
        let settings = update.into_initial();
        assert!(settings.is_saved);
        assert!(settings.networked);
        // autoDownload defaults to isSaved when unset
        assert!(settings.auto_download);
        assert!(settings.auto_upload);
        assert_eq!(settings.expires_at, 0);
    }

    #[test]
    fn test_settings_update_partial_apply() {
        let mut settings = UserSettings {
            is_saved: true,
            networked: true,
            ..Default::default()
        };
        let update = SettingsUpdate {
            networked: Some(false),
            ..Default::default()
        };
        update.apply_to(&mut settings);
        assert!(settings.is_saved);
        assert!(!settings.networked);
    }
}
