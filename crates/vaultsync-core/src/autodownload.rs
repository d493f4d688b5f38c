//! Auto-download policy for read-only vaults
//!
//! While enabled (`isSaved && autoDownload` on a non-writable vault), a
//! background task keeps a "download everything" selection current: each
//! throttled tick cancels every in-flight selection and re-selects the
//! whole tree, so bursts of metadata updates collapse into one
//! re-prioritization instead of piling up overlapping requests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::net::SwarmController;
use crate::types::UserSettings;
use crate::vault::Vault;

/// Quantum between re-prioritizations
const THROTTLE: Duration = Duration::from_secs(5);

/// Handle for an active auto-download task, stored on the vault
#[derive(Debug)]
pub struct AutoDownloader {
    task: JoinHandle<()>,
}

/// Reconcile the auto-download task with the given settings.
///
/// Idempotent in both directions: enabling twice is a no-op, disabling an
/// already-disabled controller is a no-op. Writable vaults are skipped
/// entirely.
pub fn configure_auto_download(
    vault: &Arc<Vault>,
    settings: &UserSettings,
    swarm: &Arc<SwarmController>,
) {
    if vault.writable() {
        return;
    }
    let enabled = settings.is_saved && settings.auto_download;
    let mut slot = vault.autodownloader.lock();
    if enabled && slot.is_none() {
        debug!(key = %vault.key(), "Starting auto-download");
        let task = spawn_downloader(vault.clone(), swarm.clone());
        *slot = Some(AutoDownloader { task });
    } else if !enabled && slot.is_some() {
        drop(slot);
        stop_auto_download(vault);
    }
}

/// Cancel the active download selection and stop the task. No-op when
/// not running.
pub fn stop_auto_download(vault: &Arc<Vault>) {
    if let Some(downloader) = vault.autodownloader.lock().take() {
        debug!(key = %vault.key(), "Stopping auto-download");
        downloader.task.abort();
        vault.store().clear_selections();
    }
}

fn spawn_downloader(vault: Arc<Vault>, swarm: Arc<SwarmController>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut progress = vault.store().download_progress();
        loop {
            // cancel ALL previous selections, then re-select ALL current
            vault.store().clear_selections();
            if let Err(e) = vault.store().select_all() {
                debug!(key = %vault.key(), error = ?e, "Selection refresh failed");
            }
            swarm.request_wanted(&vault).await;

            // wait for the next progress signal, then absorb the burst
            match progress.recv().await {
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
            tokio::time::sleep(THROTTLE).await;
            loop {
                match progress.try_recv() {
                    Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Closed) => return,
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_log::DebugLog;
    use crate::events::EventBus;
    use crate::storage::VaultDb;
    use crate::store::VersionedStore;
    use crate::types::generate_keypair;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn test_swarm(temp: &TempDir) -> Arc<SwarmController> {
        let db = VaultDb::new(temp.path().join("db.redb")).unwrap();
        Arc::new(SwarmController::new(
            db,
            EventBus::new(),
            Arc::new(DebugLog::new()),
            Arc::new(RwLock::new(HashMap::new())),
        ))
    }

    fn read_only_vault(temp: &TempDir) -> Arc<Vault> {
        let (key, _) = generate_keypair();
        let store =
            VersionedStore::open(temp.path().join("vault"), key, None, None).unwrap();
        store.ready().unwrap();
        Arc::new(Vault::new(key, store))
    }

    fn saved_settings() -> UserSettings {
        UserSettings {
            is_saved: true,
            auto_download: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_enable_twice_is_single_task() {
        let temp = TempDir::new().unwrap();
        let swarm = test_swarm(&temp);
        let vault = read_only_vault(&temp);

        configure_auto_download(&vault, &saved_settings(), &swarm);
        assert!(vault.autodownloader.lock().is_some());
        configure_auto_download(&vault, &saved_settings(), &swarm);
        assert!(vault.autodownloader.lock().is_some());

        stop_auto_download(&vault);
        assert!(vault.autodownloader.lock().is_none());
        // disabling again is a no-op
        stop_auto_download(&vault);
    }

    #[tokio::test]
    async fn test_disable_via_settings() {
        let temp = TempDir::new().unwrap();
        let swarm = test_swarm(&temp);
        let vault = read_only_vault(&temp);

        configure_auto_download(&vault, &saved_settings(), &swarm);
        assert!(vault.autodownloader.lock().is_some());

        let disabled = UserSettings {
            is_saved: false,
            auto_download: true,
            ..Default::default()
        };
        configure_auto_download(&vault, &disabled, &swarm);
        assert!(vault.autodownloader.lock().is_none());
    }

    #[tokio::test]
    async fn test_writable_vault_is_skipped() {
        let temp = TempDir::new().unwrap();
        let swarm = test_swarm(&temp);
        let (key, secret) = generate_keypair();
        let store =
            VersionedStore::open(temp.path().join("w"), key, Some(secret), None).unwrap();
        store.ready().unwrap();
        let vault = Arc::new(Vault::new(key, store));

        configure_auto_download(&vault, &saved_settings(), &swarm);
        assert!(vault.autodownloader.lock().is_none());
    }
}
