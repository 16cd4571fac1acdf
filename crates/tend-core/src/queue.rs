//! Persisted log of mutations made while the server was unreachable.
//!
//! Each `(Domain, MutationKind)` pair is its own sub-queue stored under a
//! separate key. Draining never removes anything; the caller settles the
//! queue once it knows which items made it to the server.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::storage::{transaction, JsonStore, KeyValueStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Mood,
    Favorites,
    Tasks,
    Projects,
}

impl Domain {
    pub const ALL: [Domain; 4] = [
        Domain::Mood,
        Domain::Favorites,
        Domain::Tasks,
        Domain::Projects,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Mood => "mood",
            Domain::Favorites => "favorites",
            Domain::Tasks => "tasks",
            Domain::Projects => "projects",
        }
    }

    /// Tag under which cached reads of this domain are invalidated
    pub fn query_tag(&self) -> &'static str {
        match self {
            Domain::Mood => "mood-stats",
            Domain::Favorites => "favorites",
            Domain::Tasks => "tasks",
            Domain::Projects => "projects",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub const ALL: [MutationKind; 3] = [
        MutationKind::Create,
        MutationKind::Update,
        MutationKind::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one sub-queue of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub domain: Domain,
    pub kind: MutationKind,
}

impl QueueKey {
    pub const fn new(domain: Domain, kind: MutationKind) -> Self {
        Self { domain, kind }
    }

    pub fn all() -> impl Iterator<Item = QueueKey> {
        Domain::ALL.into_iter().flat_map(|domain| {
            MutationKind::ALL
                .into_iter()
                .map(move |kind| QueueKey::new(domain, kind))
        })
    }

    pub fn storage_key(&self) -> String {
        format!("offline/{}/{}", self.domain, self.kind)
    }

    pub fn dead_letter_key(&self) -> String {
        format!("offline/dead/{}/{}", self.domain, self.kind)
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: Uuid,
    pub kind: MutationKind,
    pub domain: Domain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingMutation {
    fn build(
        domain: Domain,
        kind: MutationKind,
        entity_id: Option<String>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            domain,
            entity_id,
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
        }
    }

    /// `entity_id` is the local id the optimistic write was stored under.
    pub fn create<T: Serialize>(
        domain: Domain,
        entity_id: impl Into<String>,
        payload: &T,
    ) -> StorageResult<Self> {
        let payload = to_value(domain, payload)?;
        Ok(Self::build(
            domain,
            MutationKind::Create,
            Some(entity_id.into()),
            Some(payload),
        ))
    }

    pub fn update<T: Serialize>(
        domain: Domain,
        entity_id: impl Into<String>,
        payload: &T,
    ) -> StorageResult<Self> {
        let payload = to_value(domain, payload)?;
        Ok(Self::build(
            domain,
            MutationKind::Update,
            Some(entity_id.into()),
            Some(payload),
        ))
    }

    pub fn delete(domain: Domain, entity_id: impl Into<String>) -> Self {
        Self::build(domain, MutationKind::Delete, Some(entity_id.into()), None)
    }

    pub fn key(&self) -> QueueKey {
        QueueKey::new(self.domain, self.kind)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> StorageResult<T> {
        let value = self.payload.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value).map_err(|source| StorageError::Serde {
            key: self.key().storage_key(),
            source,
        })
    }

    pub fn record_failure(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.attempts += 1;
        self.last_attempt_at = Some(at);
        self.last_error = Some(error.into());
    }
}

fn to_value<T: Serialize>(domain: Domain, payload: &T) -> StorageResult<serde_json::Value> {
    serde_json::to_value(payload).map_err(|source| StorageError::Serde {
        key: format!("offline/{domain}"),
        source,
    })
}

/// Exponential backoff with a cap on attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::seconds(30),
            max_delay: Duration::seconds(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempts` failures.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::zero();
        }
        let factor = 1i32 << attempts.saturating_sub(1).min(30);
        self.base_delay
            .checked_mul(factor)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    pub fn is_due(&self, mutation: &PendingMutation, now: DateTime<Utc>) -> bool {
        match mutation.last_attempt_at {
            Some(last) if mutation.attempts > 0 => now - last >= self.backoff(mutation.attempts),
            _ => true,
        }
    }

    pub fn is_exhausted(&self, mutation: &PendingMutation) -> bool {
        mutation.attempts >= self.max_attempts
    }
}

/// What became of a queued create while it was being sent.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateFate {
    /// Still queued as sent; settling removes it
    Unchanged,
    /// Edited meanwhile. The edit now sits in the update sub-queue,
    /// addressed to the server id.
    Amended(PendingMutation),
    /// Cancelled meanwhile. A delete for the server id was queued.
    Cancelled(PendingMutation),
}

/// The persisted mutation log.
///
/// Every read-modify-write runs in a store transaction, so several logs
/// (in this process or another one) may share one store.
pub struct MutationLog {
    store: Arc<dyn KeyValueStore>,
}

fn load(store: &dyn KeyValueStore, key: &str) -> StorageResult<Vec<PendingMutation>> {
    Ok(store.get_json(key)?.unwrap_or_default())
}

fn save(store: &dyn KeyValueStore, key: &str, items: &[PendingMutation]) -> StorageResult<()> {
    if items.is_empty() {
        store.remove(key)
    } else {
        store.set_json(key, items)
    }
}

fn append(store: &dyn KeyValueStore, mutation: PendingMutation) -> StorageResult<()> {
    let key = mutation.key().storage_key();
    let mut items = load(store, &key)?;
    tracing::debug!(
        queue = %mutation.key(),
        entity = mutation.entity_id.as_deref().unwrap_or("-"),
        "queued offline mutation"
    );
    items.push(mutation);
    save(store, &key, &items)
}

impl MutationLog {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Append to the end of the mutation's sub-queue.
    pub fn enqueue(&self, mutation: PendingMutation) -> StorageResult<()> {
        transaction(self.store.as_ref(), |tx| append(tx, mutation))
    }

    /// Current contents of a sub-queue, oldest first. Nothing is removed.
    pub fn drain(&self, key: QueueKey) -> StorageResult<Vec<PendingMutation>> {
        load(self.store.as_ref(), &key.storage_key())
    }

    pub fn clear(&self, key: QueueKey) -> StorageResult<()> {
        self.store.remove(&key.storage_key())
    }

    /// Record the outcome of replaying `drained`.
    ///
    /// Drained entries are removed unless they appear in `retained`, which
    /// replaces them in place. Entries appended after the drain began are
    /// kept. So are drained entries whose payload was amended meanwhile,
    /// since the server only saw the old payload. Entries discarded during
    /// the replay stay discarded.
    pub fn settle(
        &self,
        key: QueueKey,
        drained: &[PendingMutation],
        retained: Vec<PendingMutation>,
    ) -> StorageResult<()> {
        let mut retained: HashMap<Uuid, PendingMutation> =
            retained.into_iter().map(|m| (m.id, m)).collect();
        let storage_key = key.storage_key();

        transaction(self.store.as_ref(), |tx| {
            let items: Vec<_> = load(tx, &storage_key)?
                .into_iter()
                .filter_map(|now| {
                    let Some(sent) = drained.iter().find(|d| d.id == now.id) else {
                        return Some(now);
                    };
                    match retained.remove(&now.id) {
                        Some(mut kept) => {
                            kept.payload = now.payload;
                            Some(kept)
                        }
                        None if now.payload != sent.payload => Some(now),
                        None => None,
                    }
                })
                .collect();
            save(tx, &storage_key, &items)
        })
    }

    /// Reconcile a create the server just accepted under `server_id` with
    /// whatever happened to its queue entry in the meantime.
    ///
    /// An amended entry leaves the create sub-queue and becomes an update of
    /// `server_id`; a discarded one turns into a delete of `server_id`.
    pub fn resolve_create(
        &self,
        sent: &PendingMutation,
        server_id: &str,
    ) -> StorageResult<CreateFate> {
        let create_key = sent.key().storage_key();

        transaction(self.store.as_ref(), |tx| {
            let mut creates = load(tx, &create_key)?;
            let Some(pos) = creates.iter().position(|m| m.id == sent.id) else {
                let delete = PendingMutation::delete(sent.domain, server_id);
                append(tx, delete.clone())?;
                return Ok(CreateFate::Cancelled(delete));
            };
            if creates[pos].payload == sent.payload {
                return Ok(CreateFate::Unchanged);
            }

            let amended = creates.remove(pos);
            save(tx, &create_key, &creates)?;
            let update = PendingMutation::build(
                sent.domain,
                MutationKind::Update,
                Some(server_id.to_string()),
                amended.payload,
            );
            append(tx, update.clone())?;
            Ok(CreateFate::Amended(update))
        })
    }

    pub fn dead_letter(&self, key: QueueKey, items: Vec<PendingMutation>) -> StorageResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let storage_key = key.dead_letter_key();
        transaction(self.store.as_ref(), |tx| {
            let mut dead = load(tx, &storage_key)?;
            dead.extend(items);
            save(tx, &storage_key, &dead)
        })
    }

    pub fn dead_letters(&self, key: QueueKey) -> StorageResult<Vec<PendingMutation>> {
        load(self.store.as_ref(), &key.dead_letter_key())
    }

    pub fn len(&self, key: QueueKey) -> StorageResult<usize> {
        Ok(self.drain(key)?.len())
    }

    pub fn is_empty(&self, key: QueueKey) -> StorageResult<bool> {
        Ok(self.len(key)? == 0)
    }

    /// Number of queued mutations across every sub-queue
    pub fn pending_total(&self) -> StorageResult<usize> {
        let mut total = 0;
        for key in QueueKey::all() {
            total += self.len(key)?;
        }
        Ok(total)
    }

    /// Rewrite the payload of the newest queued mutation for `entity_id`.
    /// Returns false when nothing for that entity is queued.
    pub fn amend_payload<T: Serialize>(
        &self,
        key: QueueKey,
        entity_id: &str,
        payload: &T,
    ) -> StorageResult<bool> {
        let value = to_value(key.domain, payload)?;
        let storage_key = key.storage_key();

        transaction(self.store.as_ref(), |tx| {
            let mut items = load(tx, &storage_key)?;
            let Some(item) = items
                .iter_mut()
                .rev()
                .find(|m| m.entity_id.as_deref() == Some(entity_id))
            else {
                return Ok(false);
            };
            item.payload = Some(value);
            save(tx, &storage_key, &items)?;
            Ok(true)
        })
    }

    /// Drop every queued mutation for `entity_id`; returns how many went.
    pub fn discard_entity(&self, key: QueueKey, entity_id: &str) -> StorageResult<usize> {
        let storage_key = key.storage_key();
        transaction(self.store.as_ref(), |tx| {
            let mut items = load(tx, &storage_key)?;
            let before = items.len();
            items.retain(|m| m.entity_id.as_deref() != Some(entity_id));
            let removed = before - items.len();
            if removed > 0 {
                save(tx, &storage_key, &items)?;
            }
            Ok(removed)
        })
    }

    pub fn contains_entity(&self, key: QueueKey, entity_id: &str) -> StorageResult<bool> {
        Ok(self
            .drain(key)?
            .iter()
            .any(|m| m.entity_id.as_deref() == Some(entity_id)))
    }
}
