//! Persistent settings and metadata storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Per (profile, vault) user settings
//! - Per-vault cached metadata (manifest-derived fields + access times)
//! - The persistent name-resolution cache
//! - Process-wide configuration values (e.g. the default ignore rules)
//! - The process network identity key
//!
//! The meta table is purely a read-optimization: every row is re-derivable
//! from the vault's manifest and must never be the source of truth for
//! writability.

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

use crate::error::{VaultError, VaultResult};
use crate::types::{UserSettings, VaultKey, VaultMeta, VaultQuery};

// Table definitions
const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vault_settings");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vault_meta");
const NAME_CACHE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("name_cache");
const CONFIG_TABLE: TableDefinition<&str, &str> = TableDefinition::new("config");
const NET_IDENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("net_identity");

/// Which meta timestamp `touch` updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchField {
    LastAccessTime,
    LastRepositoryAccessTime,
}

/// Storage layer for vault settings and metadata
#[derive(Clone)]
pub struct VaultDb {
    db: Arc<RwLock<Database>>,
}

impl VaultDb {
    /// Create a new storage instance at the given path.
    pub fn new(path: impl AsRef<Path>) -> VaultResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SETTINGS_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
            let _ = write_txn.open_table(NAME_CACHE_TABLE)?;
            let _ = write_txn.open_table(CONFIG_TABLE)?;
            let _ = write_txn.open_table(NET_IDENTITY_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    fn settings_key(profile: u32, key: &VaultKey) -> String {
        format!("{}:{}", profile, key.to_hex())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // User Settings
    // ═══════════════════════════════════════════════════════════════════════

    /// Load the settings record for (profile, vault), if one exists.
    pub fn get_user_settings(
        &self,
        profile: u32,
        key: &VaultKey,
    ) -> VaultResult<Option<UserSettings>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;
        match table.get(Self::settings_key(profile, key).as_str())? {
            Some(v) => {
                let settings = serde_json::from_slice(v.value())
                    .map_err(|e| VaultError::Serialization(e.to_string()))?;
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    /// Upsert the settings record for (profile, vault).
    ///
    /// Callers mutate settings only through the registry's settings lock;
    /// this is the single atomic persistence step of that read-modify-write.
    pub fn put_user_settings(
        &self,
        profile: u32,
        key: &VaultKey,
        settings: &UserSettings,
    ) -> VaultResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            let data = serde_json::to_vec(settings)
                .map_err(|e| VaultError::Serialization(e.to_string()))?;
            table.insert(Self::settings_key(profile, key).as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// All settings rows for one profile
    pub fn list_settings(&self, profile: u32) -> VaultResult<Vec<(VaultKey, UserSettings)>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;
        let prefix = format!("{}:", profile);
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            if let Some(hex) = k.value().strip_prefix(&prefix) {
                let key = VaultKey::parse(hex)?;
                let settings = serde_json::from_slice(v.value())
                    .map_err(|e| VaultError::Serialization(e.to_string()))?;
                out.push((key, settings));
            }
        }
        Ok(out)
    }

    /// Remove every row belonging to a profile (cascade on profile delete)
    pub fn delete_profile(&self, profile: u32) -> VaultResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            let prefix = format!("{}:", profile);
            table.retain(|k, _| !k.starts_with(prefix.as_str()))?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Vault Meta
    // ═══════════════════════════════════════════════════════════════════════

    /// Load the meta record, falling back to an empty record.
    pub fn get_meta(&self, key: &VaultKey) -> VaultResult<VaultMeta> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        match table.get(key.to_hex().as_str())? {
            Some(v) => serde_json::from_slice(v.value())
                .map_err(|e| VaultError::Serialization(e.to_string())),
            None => Ok(VaultMeta::empty(*key)),
        }
    }

    /// Upsert a meta record. Callers hold the registry's meta lock.
    pub fn put_meta(&self, meta: &VaultMeta) -> VaultResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            let data = serde_json::to_vec(meta)
                .map_err(|e| VaultError::Serialization(e.to_string()))?;
            table.insert(meta.key.to_hex().as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Upsert one access timestamp, creating the meta row if absent.
    pub fn touch(&self, key: &VaultKey, field: TouchField, value: i64) -> VaultResult<()> {
        let mut meta = self.get_meta(key)?;
        match field {
            TouchField::LastAccessTime => meta.last_access_time = value,
            TouchField::LastRepositoryAccessTime => meta.last_repository_access_time = value,
        }
        self.put_meta(&meta)
    }

    /// Delete every row for a vault (settings across all profiles + meta)
    pub fn delete_vault(&self, key: &VaultKey) -> VaultResult<()> {
        let hex = key.to_hex();
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut settings = write_txn.open_table(SETTINGS_TABLE)?;
            let suffix = format!(":{}", hex);
            settings.retain(|k, _| !k.ends_with(suffix.as_str()))?;
            let mut meta = write_txn.open_table(META_TABLE)?;
            meta.remove(hex.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    /// Join persisted meta with the profile's settings, applying the
    /// persistent-side filter criteria (the in-memory filter is applied by
    /// the registry).
    pub fn query(
        &self,
        profile: u32,
        query: &VaultQuery,
    ) -> VaultResult<Vec<(VaultMeta, UserSettings)>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let meta_table = read_txn.open_table(META_TABLE)?;
        let settings_table = read_txn.open_table(SETTINGS_TABLE)?;

        let mut out = Vec::new();
        for entry in meta_table.iter()? {
            let (k, v) = entry?;
            let meta: VaultMeta = serde_json::from_slice(v.value())
                .map_err(|e| VaultError::Serialization(e.to_string()))?;
            let key = VaultKey::parse(k.value())?;
            let settings = match settings_table.get(Self::settings_key(profile, &key).as_str())? {
                Some(s) => serde_json::from_slice(s.value())
                    .map_err(|e| VaultError::Serialization(e.to_string()))?,
                None => UserSettings {
                    is_saved: false,
                    networked: false,
                    ..Default::default()
                },
            };

            if let Some(want) = query.is_owner {
                if meta.is_owner != want {
                    continue;
                }
            }
            if let Some(want) = query.is_saved {
                if settings.is_saved != want {
                    continue;
                }
            }
            if let Some(want) = query.is_networked {
                if settings.networked != want {
                    continue;
                }
            }
            if let Some(ref tag) = query.type_tag {
                if !meta.type_tags.iter().any(|t| t == tag) {
                    continue;
                }
            }
            out.push((meta, settings));
        }
        Ok(out)
    }

    /// Saved vaults whose expiry is set and in the past
    pub fn list_expired(&self, profile: u32, now: i64) -> VaultResult<Vec<VaultKey>> {
        Ok(self
            .list_settings(profile)?
            .into_iter()
            .filter(|(_, s)| s.is_saved && s.expires_at != 0 && s.expires_at < now)
            .map(|(k, _)| k)
            .collect())
    }

    /// Unsaved vaults idle past the retention window, optionally filtered
    /// by ownership.
    pub fn list_collectable(
        &self,
        profile: u32,
        older_than_ms: i64,
        is_owner: Option<bool>,
        now: i64,
    ) -> VaultResult<Vec<VaultKey>> {
        let cutoff = now - older_than_ms;
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let meta_table = read_txn.open_table(META_TABLE)?;
        let settings_table = read_txn.open_table(SETTINGS_TABLE)?;

        let mut out = Vec::new();
        for entry in meta_table.iter()? {
            let (k, v) = entry?;
            let meta: VaultMeta = serde_json::from_slice(v.value())
                .map_err(|e| VaultError::Serialization(e.to_string()))?;
            let key = VaultKey::parse(k.value())?;
            let saved = match settings_table.get(Self::settings_key(profile, &key).as_str())? {
                Some(s) => {
                    let settings: UserSettings = serde_json::from_slice(s.value())
                        .map_err(|e| VaultError::Serialization(e.to_string()))?;
                    settings.is_saved
                }
                None => false,
            };
            if saved {
                continue;
            }
            if meta.last_access_time >= cutoff {
                continue;
            }
            if let Some(want) = is_owner {
                if meta.is_owner != want {
                    continue;
                }
            }
            out.push(key);
        }
        Ok(out)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Name cache
    // ═══════════════════════════════════════════════════════════════════════

    /// Cached key for a resolved name
    pub fn name_cache_get(&self, name: &str) -> VaultResult<Option<String>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(NAME_CACHE_TABLE)?;
        Ok(table.get(name)?.map(|v| v.value().to_string()))
    }

    /// Persist a resolved name → key mapping
    pub fn name_cache_put(&self, name: &str, key_hex: &str) -> VaultResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(NAME_CACHE_TABLE)?;
            table.insert(name, key_hex)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Config values
    // ═══════════════════════════════════════════════════════════════════════

    /// Process-wide config value (e.g. "default_ignore_rules")
    pub fn get_config(&self, name: &str) -> VaultResult<Option<String>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CONFIG_TABLE)?;
        Ok(table.get(name)?.map(|v| v.value().to_string()))
    }

    /// Set a process-wide config value
    pub fn set_config(&self, name: &str, value: &str) -> VaultResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CONFIG_TABLE)?;
            table.insert(name, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Network identity
    // ═══════════════════════════════════════════════════════════════════════

    /// Storage key for the process network identity (one per process)
    const NET_SECRET_KEY: &'static str = "endpoint_secret_key";

    /// Save the endpoint's secret key. Stable network identity across
    /// restarts.
    pub fn save_endpoint_secret_key(&self, secret_key: &[u8; 32]) -> VaultResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(NET_IDENTITY_TABLE)?;
            table.insert(Self::NET_SECRET_KEY, secret_key.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the endpoint's secret key, if one has been generated.
    pub fn load_endpoint_secret_key(&self) -> VaultResult<Option<[u8; 32]>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(NET_IDENTITY_TABLE)?;
        match table.get(Self::NET_SECRET_KEY)? {
            Some(v) => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(v.value());
                Ok(Some(arr))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_db() -> (VaultDb, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = VaultDb::new(temp.path().join("test.redb")).unwrap();
        (db, temp)
    }

    fn key(n: u8) -> VaultKey {
        VaultKey::from_bytes([n; 32])
    }

    #[test]
    fn test_settings_roundtrip() {
        let (db, _temp) = create_test_db();
        let k = key(1);
        assert!(db.get_user_settings(0, &k).unwrap().is_none());

        let settings = UserSettings {
            is_saved: true,
            networked: true,
            ..Default::default()
        };
        db.put_user_settings(0, &k, &settings).unwrap();
        assert_eq!(db.get_user_settings(0, &k).unwrap().unwrap(), settings);
        // a different profile does not see the row
        assert!(db.get_user_settings(1, &k).unwrap().is_none());
    }

    #[test]
    fn test_meta_defaults_to_empty() {
        let (db, _temp) = create_test_db();
        let meta = db.get_meta(&key(2)).unwrap();
        assert_eq!(meta.key, key(2));
        assert!(!meta.is_owner);
        assert_eq!(meta.last_access_time, 0);
    }

    #[test]
    fn test_touch_creates_row() {
        let (db, _temp) = create_test_db();
        let k = key(3);
        db.touch(&k, TouchField::LastAccessTime, 1234).unwrap();
        assert_eq!(db.get_meta(&k).unwrap().last_access_time, 1234);

        db.touch(&k, TouchField::LastRepositoryAccessTime, 99).unwrap();
        let meta = db.get_meta(&k).unwrap();
        assert_eq!(meta.last_access_time, 1234);
        assert_eq!(meta.last_repository_access_time, 99);
    }

    #[test]
    fn test_delete_vault_cascades() {
        let (db, _temp) = create_test_db();
        let k = key(4);
        db.put_user_settings(0, &k, &UserSettings::default()).unwrap();
        db.put_user_settings(7, &k, &UserSettings::default()).unwrap();
        db.touch(&k, TouchField::LastAccessTime, 1).unwrap();

        db.delete_vault(&k).unwrap();
        assert!(db.get_user_settings(0, &k).unwrap().is_none());
        assert!(db.get_user_settings(7, &k).unwrap().is_none());
        assert_eq!(db.get_meta(&k).unwrap().last_access_time, 0);
    }

    #[test]
    fn test_delete_profile_cascades() {
        let (db, _temp) = create_test_db();
        db.put_user_settings(0, &key(1), &UserSettings::default()).unwrap();
        db.put_user_settings(0, &key(2), &UserSettings::default()).unwrap();
        db.put_user_settings(1, &key(1), &UserSettings::default()).unwrap();

        db.delete_profile(0).unwrap();
        assert!(db.list_settings(0).unwrap().is_empty());
        assert_eq!(db.list_settings(1).unwrap().len(), 1);
    }

    #[test]
    fn test_query_filters() {
        let (db, _temp) = create_test_db();
        let owned = key(1);
        let fetched = key(2);

        let mut meta = VaultMeta::empty(owned);
        meta.is_owner = true;
        meta.type_tags = vec!["website".to_string()];
        db.put_meta(&meta).unwrap();
        db.put_user_settings(
            0,
            &owned,
            &UserSettings {
                is_saved: true,
                networked: true,
                ..Default::default()
            },
        )
        .unwrap();

        db.put_meta(&VaultMeta::empty(fetched)).unwrap();

        let all = db.query(0, &VaultQuery::default()).unwrap();
        assert_eq!(all.len(), 2);

        let saved = db
            .query(
                0,
                &VaultQuery {
                    is_saved: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0.key, owned);

        let sites = db
            .query(
                0,
                &VaultQuery {
                    type_tag: Some("website".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(sites.len(), 1);

        let owners = db
            .query(
                0,
                &VaultQuery {
                    is_owner: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].0.key, fetched);
    }

    #[test]
    fn test_list_expired() {
        let (db, _temp) = create_test_db();
        let now = 1_000_000;

        let expired = key(1);
        db.put_user_settings(
            0,
            &expired,
            &UserSettings {
                is_saved: true,
                expires_at: now - 1,
                ..Default::default()
            },
        )
        .unwrap();

        // never expires
        db.put_user_settings(
            0,
            &key(2),
            &UserSettings {
                is_saved: true,
                expires_at: 0,
                ..Default::default()
            },
        )
        .unwrap();

        // not saved: expiry is irrelevant
        db.put_user_settings(
            0,
            &key(3),
            &UserSettings {
                is_saved: false,
                expires_at: now - 1,
                ..Default::default()
            },
        )
        .unwrap();

        let expired_keys = db.list_expired(0, now).unwrap();
        assert_eq!(expired_keys, vec![expired]);
    }

    #[test]
    fn test_list_collectable_respects_saved_pin() {
        let (db, _temp) = create_test_db();
        let now = 1_000_000;

        // old and unsaved: collectable
        let stale = key(1);
        let mut meta = VaultMeta::empty(stale);
        meta.last_access_time = 100;
        db.put_meta(&meta).unwrap();

        // old but saved: never collectable
        let pinned = key(2);
        let mut meta = VaultMeta::empty(pinned);
        meta.last_access_time = 100;
        db.put_meta(&meta).unwrap();
        db.put_user_settings(
            0,
            &pinned,
            &UserSettings {
                is_saved: true,
                ..Default::default()
            },
        )
        .unwrap();

        // recent: inside the retention window
        let fresh = key(3);
        let mut meta = VaultMeta::empty(fresh);
        meta.last_access_time = now;
        db.put_meta(&meta).unwrap();

        let collectable = db.list_collectable(0, 1000, None, now).unwrap();
        assert_eq!(collectable, vec![stale]);
    }

    #[test]
    fn test_list_collectable_owner_filter() {
        let (db, _temp) = create_test_db();
        let owned = key(1);
        let mut meta = VaultMeta::empty(owned);
        meta.is_owner = true;
        db.put_meta(&meta).unwrap();
        db.put_meta(&VaultMeta::empty(key(2))).unwrap();

        let non_owned = db.list_collectable(0, 0, Some(false), 1000).unwrap();
        assert_eq!(non_owned, vec![key(2)]);
    }

    #[test]
    fn test_name_cache_and_config() {
        let (db, _temp) = create_test_db();
        assert!(db.name_cache_get("example.com").unwrap().is_none());
        db.name_cache_put("example.com", &"ab".repeat(32)).unwrap();
        assert_eq!(
            db.name_cache_get("example.com").unwrap().unwrap(),
            "ab".repeat(32)
        );

        assert!(db.get_config("default_ignore_rules").unwrap().is_none());
        db.set_config("default_ignore_rules", ".git\n").unwrap();
        assert_eq!(
            db.get_config("default_ignore_rules").unwrap().unwrap(),
            ".git\n"
        );
    }

    #[test]
    fn test_endpoint_secret_key_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test.redb");
        let secret = [42u8; 32];
        {
            let db = VaultDb::new(&path).unwrap();
            assert!(db.load_endpoint_secret_key().unwrap().is_none());
            db.save_endpoint_secret_key(&secret).unwrap();
        }
        {
            let db = VaultDb::new(&path).unwrap();
            assert_eq!(db.load_endpoint_secret_key().unwrap().unwrap(), secret);
        }
    }
}
