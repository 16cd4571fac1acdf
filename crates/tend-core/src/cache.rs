//! Local copies of server collections and the query cache seam.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::error::StorageResult;
use crate::storage::{transaction, JsonStore, KeyValueStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    /// Written optimistically, not yet accepted by the server
    LocalOnly,
    Synced,
}

/// A cached entity together with whether the server has seen it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tracked<T> {
    /// Server id once synced, a locally generated id before that
    pub id: String,
    pub status: SyncStatus,
    pub data: T,
    pub updated_at: DateTime<Utc>,
}

impl<T> Tracked<T> {
    pub fn local(id: impl Into<String>, data: T) -> Self {
        Self {
            id: id.into(),
            status: SyncStatus::LocalOnly,
            data,
            updated_at: Utc::now(),
        }
    }

    pub fn synced(id: impl Into<String>, data: T) -> Self {
        Self {
            id: id.into(),
            status: SyncStatus::Synced,
            data,
            updated_at: Utc::now(),
        }
    }

    pub fn is_local_only(&self) -> bool {
        self.status == SyncStatus::LocalOnly
    }
}

/// One cached collection, stored as a JSON array under `cache/<tag>`.
pub struct EntityCache<T> {
    store: Arc<dyn KeyValueStore>,
    key: String,
    _entity: PhantomData<fn() -> T>,
}

impl<T> EntityCache<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub fn new(store: Arc<dyn KeyValueStore>, tag: &str) -> Self {
        Self {
            store,
            key: format!("cache/{tag}"),
            _entity: PhantomData,
        }
    }

    pub fn load(&self) -> StorageResult<Vec<Tracked<T>>> {
        self.load_from(self.store.as_ref())
    }

    pub fn save(&self, items: &[Tracked<T>]) -> StorageResult<()> {
        self.store.set_json(&self.key, items)
    }

    fn load_from(&self, store: &dyn KeyValueStore) -> StorageResult<Vec<Tracked<T>>> {
        Ok(store.get_json(&self.key)?.unwrap_or_default())
    }

    /// Read, change and write back the collection in one store transaction.
    fn modify<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&mut Vec<Tracked<T>>) -> (R, bool),
    {
        transaction(self.store.as_ref(), |tx| {
            let mut items = self.load_from(tx)?;
            let (result, changed) = f(&mut items);
            if changed {
                tx.set_json(&self.key, &items)?;
            }
            Ok(result)
        })
    }

    pub fn get(&self, id: &str) -> StorageResult<Option<Tracked<T>>> {
        Ok(self.load()?.into_iter().find(|t| t.id == id))
    }

    /// Insert or replace the entry with the same id.
    pub fn upsert(&self, item: Tracked<T>) -> StorageResult<()> {
        self.modify(|items| {
            match items.iter_mut().find(|t| t.id == item.id) {
                Some(existing) => *existing = item,
                None => items.push(item),
            }
            ((), true)
        })
    }

    pub fn remove(&self, id: &str) -> StorageResult<bool> {
        self.modify(|items| {
            let before = items.len();
            items.retain(|t| t.id != id);
            let removed = items.len() != before;
            (removed, removed)
        })
    }

    /// Re-key a local-only entry under its server id once the create went through.
    pub fn promote(&self, local_id: &str, remote_id: &str, data: T) -> StorageResult<()> {
        self.modify(|items| {
            items.retain(|t| t.id != local_id && t.id != remote_id);
            items.push(Tracked::synced(remote_id, data));
            ((), true)
        })
    }

    /// Overwrite the collection with server truth.
    ///
    /// Local-only entries for which `still_pending` returns true survive:
    /// they replace the server entry with the same id (an unsent edit) or
    /// are appended (an unsent create). Every other local-only entry is
    /// dropped. `still_pending` runs inside the cache's transaction and
    /// may read the store, but must not start a transaction of its own.
    pub fn merge_server<F>(
        &self,
        server: Vec<(String, T)>,
        still_pending: F,
    ) -> StorageResult<Vec<Tracked<T>>>
    where
        F: Fn(&Tracked<T>) -> bool,
    {
        self.modify(|items| {
            let mut merged: Vec<Tracked<T>> = server
                .into_iter()
                .map(|(id, data)| Tracked::synced(id, data))
                .collect();
            for pending in items
                .drain(..)
                .filter(|t| t.is_local_only() && still_pending(t))
            {
                match merged.iter_mut().find(|t| t.id == pending.id) {
                    Some(existing) => *existing = pending,
                    None => merged.push(pending),
                }
            }
            *items = merged.clone();
            (merged, true)
        })
    }
}

/// Cached reads that can be marked stale so consumers refetch.
pub trait QueryCache: Send + Sync {
    fn invalidate(&self, tag: &str);
}

/// Records invalidations per tag; a tag stays stale until marked fresh.
#[derive(Debug, Default)]
pub struct InvalidationTracker {
    counts: Mutex<HashMap<String, u64>>,
    stale: Mutex<HashMap<String, bool>>,
}

impl InvalidationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidations(&self, tag: &str) -> u64 {
        self.counts
            .lock()
            .map(|c| c.get(tag).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_stale(&self, tag: &str) -> bool {
        self.stale
            .lock()
            .map(|s| s.get(tag).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn mark_fresh(&self, tag: &str) {
        if let Ok(mut stale) = self.stale.lock() {
            stale.insert(tag.to_string(), false);
        }
    }
}

impl QueryCache for InvalidationTracker {
    fn invalidate(&self, tag: &str) {
        tracing::debug!(tag, "query cache invalidated");
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry(tag.to_string()).or_insert(0) += 1;
        }
        if let Ok(mut stale) = self.stale.lock() {
            stale.insert(tag.to_string(), true);
        }
    }
}
