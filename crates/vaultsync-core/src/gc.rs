//! Garbage collection
//!
//! Two-phase sweep: expire (flip the saved pin off for vaults whose
//! expiry passed) then collect (delete unsaved vaults idle past the
//! retention window). One vault's failure never aborts the sweep.
//! Self-rescheduling: a short wait after start, a longer fixed interval
//! thereafter; any explicit invocation cancels the pending run and
//! reschedules after completing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::VaultResult;
use crate::registry::VaultRegistry;
use crate::types::{now_ms, SettingsUpdate};

/// Minimum idle time before an unsaved vault's data may be deleted (7 days)
pub const GC_EXPIRATION_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Wait after process start before the first sweep
pub const GC_FIRST_COLLECT_WAIT: Duration = Duration::from_secs(30);
/// Interval between scheduled sweeps
pub const GC_REGULAR_COLLECT_WAIT: Duration = Duration::from_secs(15 * 60);

/// Overrides for an explicit sweep
#[derive(Debug, Clone, Copy, Default)]
pub struct GcOptions {
    /// Retention window override in ms (default 7 days)
    pub older_than_ms: Option<i64>,
    /// Restrict the collect phase to owned / non-owned vaults
    pub is_owner: Option<bool>,
}

/// Aggregate sweep result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Bytes freed on disk
    pub total_bytes: u64,
    /// Vaults whose data was deleted
    pub total_vaults: usize,
    /// Vaults that errored and were left in place
    pub skipped: usize,
}

/// Periodic sweep over the registry's vaults
pub struct GarbageCollector {
    registry: Arc<VaultRegistry>,
    next: Mutex<Option<JoinHandle<()>>>,
}

impl GarbageCollector {
    pub fn new(registry: Arc<VaultRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            next: Mutex::new(None),
        })
    }

    /// Schedule the first sweep (service start).
    pub fn setup(self: &Arc<Self>) {
        self.schedule(GC_FIRST_COLLECT_WAIT);
    }

    /// Cancel any scheduled sweep.
    pub fn cancel(&self) {
        if let Some(task) = self.next.lock().take() {
            task.abort();
        }
    }

    fn schedule(self: &Arc<Self>, wait: Duration) {
        let mut slot = self.next.lock();
        if let Some(task) = slot.take() {
            task.abort();
        }
        let gc = self.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Err(e) = gc.collect(GcOptions::default()).await {
                warn!(error = ?e, "Scheduled GC sweep failed");
            }
        }));
    }

    /// Run the two-phase sweep now. Cancels a pending scheduled run and
    /// reschedules after completing.
    pub async fn collect(self: &Arc<Self>, opts: GcOptions) -> VaultResult<GcStats> {
        self.cancel();
        let started = now_ms();
        let mut stats = GcStats::default();
        let profile = self.registry.profile();

        // phase 1: unsave expired vaults (removes the pin, deletes nothing)
        let expired = self.registry.db().list_expired(profile, started)?;
        debug!(count = expired.len(), "GC unsaving expired vaults");
        for key in expired {
            let update = SettingsUpdate {
                is_saved: Some(false),
                ..Default::default()
            };
            if let Err(e) = self
                .registry
                .set_user_settings(&key.to_hex(), update)
                .await
            {
                warn!(%key, error = ?e, "GC failed to unsave expired vault");
            }
        }

        // phase 2: delete unsaved vaults past the retention window
        let older_than = opts
            .older_than_ms
            .unwrap_or(GC_EXPIRATION_AGE.as_millis() as i64);
        let collectable =
            self.registry
                .db()
                .list_collectable(profile, older_than, opts.is_owner, started)?;
        debug!(count = collectable.len(), "GC cleaning out unused vaults");
        for key in collectable {
            if let Err(e) = self.registry.unload(&key.to_hex()).await {
                warn!(%key, error = ?e, "GC failed to unload vault, skipping");
                stats.skipped += 1;
                continue;
            }
            match self.registry.delete_vault_data(&key) {
                Ok(bytes) => {
                    stats.total_bytes += bytes;
                    stats.total_vaults += 1;
                }
                Err(e) => {
                    warn!(%key, error = ?e, "GC failed to delete vault data, skipping");
                    stats.skipped += 1;
                }
            }
        }

        debug!(
            elapsed_ms = now_ms() - started,
            vaults = stats.total_vaults,
            bytes = stats.total_bytes,
            skipped = stats.skipped,
            "GC completed"
        );
        self.schedule(GC_REGULAR_COLLECT_WAIT);
        Ok(stats)
    }
}
