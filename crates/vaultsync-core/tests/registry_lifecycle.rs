//! Vault Registry Lifecycle Integration Tests
//!
//! These tests verify the load/create/fork/unload lifecycle:
//!
//! - Concurrent loads for the same key resolve to the same instance
//! - Distinct keys always yield distinct instances
//! - Key validation rejects malformed identifiers before any I/O
//! - Read-only vaults reject every mutation
//! - Forks preserve the fixed manifest field set and copy content

use std::sync::Arc;

use vaultsync_core::{
    from_url_to_key, generate_keypair, FileTree, Manifest, SettingsUpdate, UserSettings,
    VaultError, VaultQuery, VaultRegistry, VersionedStore,
};
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

fn create_test_registry() -> (Arc<VaultRegistry>, TempDir) {
    let temp = TempDir::new().unwrap();
    let registry = VaultRegistry::new(temp.path()).unwrap();
    (registry, temp)
}

/// Settings that keep tests off the network
fn offline() -> Option<SettingsUpdate> {
    Some(SettingsUpdate {
        networked: Some(false),
        ..Default::default()
    })
}

async fn create_offline_vault(registry: &Arc<VaultRegistry>) -> String {
    registry
        .create(Manifest::default(), offline())
        .await
        .unwrap()
}

// ============================================================================
// Loading
// ============================================================================

#[tokio::test]
async fn test_create_write_read() {
    let (registry, _temp) = create_test_registry();
    let url = registry
        .create(
            Manifest {
                title: Some("Test Vault".into()),
                ..Default::default()
            },
            offline(),
        )
        .await
        .unwrap();

    let vault = registry.get_loaded(&url).unwrap();
    assert!(vault.writable());
    assert_eq!(vault.manifest().title.as_deref(), Some("Test Vault"));

    vault.store().write_file("/hello.txt", b"hello").unwrap();
    assert_eq!(vault.store().read_file("/hello.txt").unwrap(), b"hello");

    // the default ignore file was written at creation
    assert!(vault
        .store()
        .stat(vaultsync_core::IGNORE_FILE_PATH)
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_concurrent_loads_share_one_instance() {
    let (registry, _temp) = create_test_registry();
    let url = create_offline_vault(&registry).await;
    let key = from_url_to_key(&url).unwrap().to_hex();
    registry.unload(&key).await.unwrap();
    assert!(registry.get_loaded(&key).is_none());

    // whichever request starts second either finds the in-flight load in
    // the dedup map or the already-resolved instance; never a duplicate
    let (a, b) = tokio::join!(registry.get_or_load(&key), registry.get_or_load(&key));
    let a = a.unwrap();
    let b = b.unwrap();
    assert!(Arc::ptr_eq(&a, &b), "deduplicated loads must share the instance");
    assert!(registry.is_loaded(&key));
}

#[tokio::test]
async fn test_distinct_keys_distinct_instances() {
    let (registry, _temp) = create_test_registry();
    let url1 = create_offline_vault(&registry).await;
    let url2 = create_offline_vault(&registry).await;
    assert_ne!(url1, url2);

    let v1 = registry.get_loaded(&url1).unwrap();
    let v2 = registry.get_loaded(&url2).unwrap();
    assert!(!Arc::ptr_eq(&v1, &v2));
    assert_ne!(v1.key(), v2.key());
}

#[tokio::test]
async fn test_invalid_key_rejected_before_io() {
    let (registry, _temp) = create_test_registry();
    assert!(matches!(
        registry.load(Some("not-a-key"), None).await,
        Err(VaultError::InvalidVaultKey(_))
    ));
    assert!(matches!(
        registry.load(Some("vault://tooshort/"), None).await,
        Err(VaultError::InvalidVaultKey(_))
    ));
    assert!(registry.get_loaded("not-a-key").is_none());
}

#[tokio::test]
async fn test_get_or_load_returns_loaded_instance() {
    let (registry, _temp) = create_test_registry();
    let url = create_offline_vault(&registry).await;
    let loaded = registry.get_loaded(&url).unwrap();
    let again = registry.get_or_load(&url).await.unwrap();
    assert!(Arc::ptr_eq(&loaded, &again));
}

#[tokio::test]
async fn test_unload_is_idempotent() {
    let (registry, _temp) = create_test_registry();
    let url = create_offline_vault(&registry).await;
    let key = from_url_to_key(&url).unwrap().to_hex();

    registry.unload(&key).await.unwrap();
    assert!(!registry.is_loaded(&key));
    // second unload is a no-op
    registry.unload(&key).await.unwrap();
}

// ============================================================================
// Read-only vaults
// ============================================================================

/// Build a read-only replica of `src` directly inside the registry's
/// store directory, then load it through the registry.
async fn load_replica(
    registry: &Arc<VaultRegistry>,
    src: &VersionedStore,
) -> Arc<vaultsync_core::Vault> {
    let key = *src.key();
    let replica =
        VersionedStore::open(registry.store_path(&key), key, None, None).unwrap();
    replica.ready().unwrap();
    replica.apply_remote(&src.entries_from(0).unwrap()).unwrap();
    drop(replica);

    let settings = UserSettings {
        networked: false,
        ..Default::default()
    };
    registry
        .load(Some(&key.to_hex()), Some(settings))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_read_only_vault_rejects_all_mutations() {
    let (registry, _temp) = create_test_registry();
    let src_temp = TempDir::new().unwrap();
    let (key, secret) = generate_keypair();
    let src = VersionedStore::open(src_temp.path(), key, Some(secret), None).unwrap();
    src.ready().unwrap();
    src.write_file("/page.html", b"<html>").unwrap();
    src.mkdir("/dir").unwrap();

    let vault = load_replica(&registry, &src).await;
    assert!(!vault.writable());
    assert_eq!(vault.version(), src.version());

    let store = vault.store();
    assert!(matches!(
        store.write_file("/x", b"x"),
        Err(VaultError::VaultNotWritable)
    ));
    assert!(matches!(
        store.unlink("/page.html"),
        Err(VaultError::VaultNotWritable)
    ));
    assert!(matches!(
        store.rename("/page.html", "/y"),
        Err(VaultError::VaultNotWritable)
    ));
    assert!(matches!(store.mkdir("/z"), Err(VaultError::VaultNotWritable)));
    assert!(matches!(
        store.rmdir("/dir"),
        Err(VaultError::VaultNotWritable)
    ));
}

// ============================================================================
// Forking
// ============================================================================

#[tokio::test]
async fn test_fork_preserves_fixed_fields_and_copies_content() {
    let (registry, _temp) = create_test_registry();
    let src_url = registry
        .create(
            Manifest {
                title: Some("Original".into()),
                web_root: Some("/public".into()),
                fallback_page: Some("/404.html".into()),
                links: Some(serde_json::json!({"license": [{"href": "https://example.com"}]})),
                ..Default::default()
            },
            offline(),
        )
        .await
        .unwrap();
    let src = registry.get_loaded(&src_url).unwrap();
    src.store().write_file("/index.html", b"<h1>src</h1>").unwrap();
    src.store().write_file("/assets/app.js", b"js").unwrap();

    let fork_url = registry
        .fork(
            &src_url,
            Manifest {
                title: Some("The Fork".into()),
                web_root: Some("/overridden".into()),
                ..Default::default()
            },
            offline(),
        )
        .await
        .unwrap();
    assert_ne!(fork_url, src_url);

    let fork = registry.get_loaded(&fork_url).unwrap();
    let manifest = fork.store().read_manifest();
    assert_eq!(manifest.title.as_deref(), Some("The Fork"));
    // preserved-on-fork fields always come from the source
    assert_eq!(manifest.web_root.as_deref(), Some("/public"));
    assert_eq!(manifest.fallback_page.as_deref(), Some("/404.html"));
    assert!(manifest.links.is_some());

    assert_eq!(
        fork.store().read_file("/index.html").unwrap(),
        b"<h1>src</h1>"
    );
    assert_eq!(fork.store().read_file("/assets/app.js").unwrap(), b"js");
    // a fork has its own ignore file
    assert!(fork
        .store()
        .stat(vaultsync_core::IGNORE_FILE_PATH)
        .unwrap()
        .is_some());
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_query_joins_settings_meta_and_live_state() {
    let (registry, _temp) = create_test_registry();
    let url = registry
        .create(
            Manifest {
                title: Some("Queryable".into()),
                type_tags: vec!["website".into()],
                ..Default::default()
            },
            offline(),
        )
        .await
        .unwrap();
    let vault = registry.get_loaded(&url).unwrap();
    vault.store().write_file("/f", b"12345").unwrap();

    let saved = registry
        .query(&VaultQuery {
            is_saved: Some(true),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].meta.title.as_deref(), Some("Queryable"));
    assert!(saved[0].meta.is_owner);
    assert!(saved[0].size > 0, "loaded vaults report live size");

    let sites = registry
        .query(&VaultQuery {
            type_tag: Some("website".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(sites.len(), 1);

    // in-memory post-filter
    let in_mem = registry
        .query(&VaultQuery {
            in_memory: Some(true),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(in_mem.len(), 1);
    registry.unload(&url).await.unwrap();
    let in_mem = registry
        .query(&VaultQuery {
            in_memory: Some(true),
            ..Default::default()
        })
        .unwrap();
    assert!(in_mem.is_empty());
}

#[tokio::test]
async fn test_vault_info_reports_manifest_and_version() {
    let (registry, _temp) = create_test_registry();
    let url = registry
        .create(
            Manifest {
                title: Some("Info".into()),
                ..Default::default()
            },
            offline(),
        )
        .await
        .unwrap();
    let info = registry.vault_info(&url).await.unwrap();
    assert_eq!(info.manifest.title.as_deref(), Some("Info"));
    assert!(info.version > 0);
    assert!(info.user_settings.is_saved);
    assert_eq!(info.peers, 0);
}
