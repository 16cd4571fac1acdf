//! A persisted lease so that only one process replays the offline queues
//! at a time.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StorageResult;
use crate::storage::{transaction, JsonStore, KeyValueStore};

const LEASE_KEY: &str = "sync/lease";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    holder: Uuid,
    pid: u32,
    expires_at: DateTime<Utc>,
}

/// One contender for the sync lease. Each orchestrator owns one.
pub struct SyncLease {
    store: Arc<dyn KeyValueStore>,
    holder: Uuid,
    ttl: Duration,
}

impl SyncLease {
    /// A lease not renewed within `ttl` may be taken over, so a crashed
    /// holder blocks others for at most that long.
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self {
            store,
            holder: Uuid::new_v4(),
            ttl,
        }
    }

    /// Take the lease, or return `None` while someone else holds it.
    pub fn acquire(&self) -> StorageResult<Option<LeaseGuard<'_>>> {
        if self.claim()? {
            tracing::debug!(holder = %self.holder, "sync lease acquired");
            Ok(Some(LeaseGuard { lease: self }))
        } else {
            Ok(None)
        }
    }

    /// Who currently holds an unexpired lease, if anyone (by process id).
    pub fn held_by(&self) -> StorageResult<Option<u32>> {
        let record: Option<LeaseRecord> = self.store.get_json(LEASE_KEY)?;
        Ok(record
            .filter(|r| r.expires_at > Utc::now())
            .map(|r| r.pid))
    }

    fn claim(&self) -> StorageResult<bool> {
        transaction(self.store.as_ref(), |tx| {
            let now = Utc::now();
            let current: Option<LeaseRecord> = tx.get_json(LEASE_KEY)?;
            if let Some(current) = current {
                if current.holder != self.holder && current.expires_at > now {
                    return Ok(false);
                }
            }
            tx.set_json(
                LEASE_KEY,
                &LeaseRecord {
                    holder: self.holder,
                    pid: std::process::id(),
                    expires_at: now + self.ttl,
                },
            )?;
            Ok(true)
        })
    }

    fn release(&self) -> StorageResult<()> {
        transaction(self.store.as_ref(), |tx| {
            let current: Option<LeaseRecord> = tx.get_json(LEASE_KEY)?;
            match current {
                Some(current) if current.holder == self.holder => tx.remove(LEASE_KEY),
                _ => Ok(()),
            }
        })
    }
}

/// Held lease; released on drop.
pub struct LeaseGuard<'a> {
    lease: &'a SyncLease,
}

impl LeaseGuard<'_> {
    /// Push the expiry out by another ttl. False if the lease expired and
    /// was taken over by someone else in the meantime.
    pub fn renew(&self) -> StorageResult<bool> {
        self.lease.claim()
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        match self.lease.release() {
            Ok(()) => tracing::debug!(holder = %self.lease.holder, "sync lease released"),
            Err(e) => tracing::warn!("failed to release sync lease: {e}"),
        }
    }
}
