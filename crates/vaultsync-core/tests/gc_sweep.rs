//! Garbage Collection Integration Tests
//!
//! Verifies the two-phase sweep: expiry removes the saved pin, the
//! collect phase deletes unsaved idle vaults, and a saved vault is never
//! deleted regardless of idle time.

use std::sync::Arc;
use std::time::Duration;

use vaultsync_core::{
    from_url_to_key, FileTree, GarbageCollector, GcOptions, Manifest, SettingsUpdate,
    VaultQuery, VaultRegistry,
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
// Sweep behavior
// ============================================================================

#[tokio::test]
async fn test_saved_vault_is_never_collected() {
    let (registry, _temp) = create_test_registry();
    let url = create_offline_vault(&registry).await;
    let key = from_url_to_key(&url).unwrap();

    let gc = GarbageCollector::new(registry.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = gc
        .collect(GcOptions {
            older_than_ms: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(stats.total_vaults, 0);
    assert!(registry.store_path(&key).exists());
}

#[tokio::test]
async fn test_unsaved_idle_vault_is_collected() {
    let (registry, _temp) = create_test_registry();
    let url = create_offline_vault(&registry).await;
    let key = from_url_to_key(&url).unwrap();
    let vault = registry.get_loaded(&url).unwrap();
    vault.store().write_file("/data.bin", &[7u8; 1024]).unwrap();

    registry
        .set_user_settings(
            &url,
            SettingsUpdate {
                is_saved: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let gc = GarbageCollector::new(registry.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = gc
        .collect(GcOptions {
            older_than_ms: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(stats.total_vaults, 1);
    assert!(stats.total_bytes > 0, "freed bytes should be reported");
    assert_eq!(stats.skipped, 0);
    // the vault was unloaded and its data and rows removed
    assert!(!registry.is_loaded(&url));
    assert!(!registry.store_path(&key).exists());
    assert!(registry.query(&VaultQuery::default()).unwrap().is_empty());
}

#[tokio::test]
async fn test_expired_vault_is_unsaved_then_collected_in_one_pass() {
    let (registry, _temp) = create_test_registry();
    let url = create_offline_vault(&registry).await;
    let key = from_url_to_key(&url).unwrap();

    // saved, but already expired
    registry
        .set_user_settings(
            &url,
            SettingsUpdate {
                expires_at: Some(vaultsync_core::now_ms() - 1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let gc = GarbageCollector::new(registry.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = gc
        .collect(GcOptions {
            older_than_ms: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();

    // expire phase unsaved it; collect phase deleted it
    assert_eq!(stats.total_vaults, 1);
    assert!(!registry.store_path(&key).exists());
}

#[tokio::test]
async fn test_retention_window_protects_recent_vaults() {
    let (registry, _temp) = create_test_registry();
    let url = create_offline_vault(&registry).await;
    let key = from_url_to_key(&url).unwrap();
    registry
        .set_user_settings(
            &url,
            SettingsUpdate {
                is_saved: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // default 7-day window: a just-touched vault is safe
    let gc = GarbageCollector::new(registry.clone());
    let stats = gc.collect(GcOptions::default()).await.unwrap();
    assert_eq!(stats.total_vaults, 0);
    assert!(registry.store_path(&key).exists());
}

#[tokio::test]
async fn test_owner_filter_limits_collection() {
    let (registry, _temp) = create_test_registry();
    let url = create_offline_vault(&registry).await;
    registry
        .set_user_settings(
            &url,
            SettingsUpdate {
                is_saved: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let gc = GarbageCollector::new(registry.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    // restrict to non-owned vaults: ours is owned, so nothing goes
    let stats = gc
        .collect(GcOptions {
            older_than_ms: Some(0),
            is_owner: Some(false),
        })
        .await
        .unwrap();
    assert_eq!(stats.total_vaults, 0);

    // owned collection sweeps it
    let stats = gc
        .collect(GcOptions {
            older_than_ms: Some(0),
            is_owner: Some(true),
        })
        .await
        .unwrap();
    assert_eq!(stats.total_vaults, 1);
}
