//! Per-vault debug log
//!
//! A bounded in-memory ring of structured records, keyed by vault, with a
//! broadcast tap for live consumers. Hosts use it to show per-vault
//! network activity without scraping the process log.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::types::{now_ms, VaultKey};

/// Maximum records kept in the ring
const DEBUG_LOG_CAPACITY: usize = 4096;

/// One debug record
#[derive(Debug, Clone)]
pub struct DebugRecord {
    /// Epoch ms
    pub ts: i64,
    pub key: VaultKey,
    /// Short event name, e.g. "flocking"
    pub event: &'static str,
    pub message: String,
}

/// Bounded debug-record ring with a live tap
#[derive(Debug)]
pub struct DebugLog {
    ring: Mutex<VecDeque<DebugRecord>>,
    tap: broadcast::Sender<DebugRecord>,
}

impl DebugLog {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(256);
        Self {
            ring: Mutex::new(VecDeque::with_capacity(DEBUG_LOG_CAPACITY)),
            tap,
        }
    }

    /// Append a record, evicting the oldest past capacity.
    pub fn record(&self, key: VaultKey, event: &'static str, message: impl Into<String>) {
        let record = DebugRecord {
            ts: now_ms(),
            key,
            event,
            message: message.into(),
        };
        let mut ring = self.ring.lock();
        if ring.len() >= DEBUG_LOG_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(record.clone());
        drop(ring);
        let _ = self.tap.send(record);
    }

    /// All retained records for one vault, oldest first
    pub fn records_for(&self, key: &VaultKey) -> Vec<DebugRecord> {
        self.ring
            .lock()
            .iter()
            .filter(|r| &r.key == key)
            .cloned()
            .collect()
    }

    /// Subscribe to records as they are appended
    pub fn tap(&self) -> broadcast::Receiver<DebugRecord> {
        self.tap.subscribe()
    }
}

impl Default for DebugLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_filtered_by_key() {
        let log = DebugLog::new();
        let a = VaultKey::from_bytes([1; 32]);
        let b = VaultKey::from_bytes([2; 32]);
        log.record(a, "flocking", "joined");
        log.record(b, "flocking", "joined");
        log.record(a, "unflocking", "left");

        let records = log.records_for(&a);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, "flocking");
        assert_eq!(records[1].event, "unflocking");
    }

    #[test]
    fn test_ring_is_bounded() {
        let log = DebugLog::new();
        let key = VaultKey::from_bytes([3; 32]);
        for i in 0..(DEBUG_LOG_CAPACITY + 100) {
            log.record(key, "tick", format!("{}", i));
        }
        let records = log.records_for(&key);
        assert_eq!(records.len(), DEBUG_LOG_CAPACITY);
        // oldest evicted first
        assert_eq!(records[0].message, "100");
    }
}
