use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::storage::{JsonStore, KeyValueStore};

const STATUS_KEY: &str = "sync/status";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusInfo {
    pub connected: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_changes: usize,
    pub last_error: Option<String>,
    /// Completed sync passes recorded in this store
    #[serde(default)]
    pub passes: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SyncStatusInfo {
    /// Status older than two minutes is no longer trusted.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.updated_at {
            Some(at) => now - at > Duration::minutes(2),
            None => true,
        }
    }
}

/// Shared sync status, mirrored into storage for out-of-process readers.
pub struct SyncStatusBoard {
    store: Arc<dyn KeyValueStore>,
    status: Mutex<SyncStatusInfo>,
}

impl SyncStatusBoard {
    /// Continues from the last persisted status, if any.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let status = Self::load_persisted(store.as_ref()).unwrap_or_default();
        Self {
            store,
            status: Mutex::new(status),
        }
    }

    /// Last status written by any process using the same store
    pub fn load_persisted(store: &dyn KeyValueStore) -> Option<SyncStatusInfo> {
        match store.get_json::<SyncStatusInfo>(STATUS_KEY) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("failed to read persisted sync status: {e}");
                None
            }
        }
    }

    pub fn snapshot(&self) -> SyncStatusInfo {
        match self.status.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update<F: FnOnce(&mut SyncStatusInfo)>(&self, f: F) {
        let snapshot = {
            let mut status = match self.status.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&mut status);
            status.updated_at = Some(Utc::now());
            status.clone()
        };
        if let Err(e) = self.store.set_json(STATUS_KEY, &snapshot) {
            tracing::warn!("failed to persist sync status: {e}");
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.update(|s| s.connected = connected);
    }

    pub fn set_pending(&self, pending: usize) {
        self.update(|s| s.pending_changes = pending);
    }

    /// Record the end of a sync pass.
    pub fn record_pass(&self, pending: usize, error: Option<String>) {
        self.update(|s| {
            s.passes += 1;
            s.pending_changes = pending;
            s.last_error = error;
            s.last_sync = Some(Utc::now());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn pass_updates_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let board = SyncStatusBoard::new(store.clone());
        board.set_connected(true);
        board.record_pass(3, Some("favorites: HTTP 500".into()));

        let snap = board.snapshot();
        assert!(snap.connected);
        assert_eq!(snap.passes, 1);
        assert_eq!(snap.pending_changes, 3);
        assert!(snap.last_sync.is_some());
        assert!(!snap.is_stale(Utc::now()));

        let persisted = SyncStatusBoard::load_persisted(store.as_ref()).unwrap();
        assert_eq!(persisted.passes, 1);
        assert_eq!(persisted.last_error.as_deref(), Some("favorites: HTTP 500"));
    }

    #[test]
    fn board_resumes_from_persisted_status() {
        let store = Arc::new(MemoryStore::new());
        SyncStatusBoard::new(store.clone()).record_pass(0, None);

        let board = SyncStatusBoard::new(store);
        board.set_pending(2);
        let snap = board.snapshot();
        assert_eq!(snap.passes, 1);
        assert_eq!(snap.pending_changes, 2);
        assert!(snap.last_sync.is_some());
    }

    #[test]
    fn status_without_update_is_stale() {
        assert!(SyncStatusInfo::default().is_stale(Utc::now()));
    }
}
