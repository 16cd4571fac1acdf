//! Per-domain replay of offline mutations and refresh from the server.

mod favorites;
mod mood;
mod planner;

pub use favorites::FavoritesSync;
pub use mood::MoodSync;
pub use planner::PlannerSync;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::ops::AddAssign;
use std::sync::Arc;
use tend_core::{
    ConnectivityMonitor, KeyValueStore, MutationLog, PendingMutation, QueryCache, QueueKey,
    RetryPolicy, StorageError,
};
use thiserror::Error;
use uuid::Uuid;

use crate::api::{ApiError, RemoteApi};

/// Everything a domain service needs, handed over at construction.
#[derive(Clone)]
pub struct SyncContext {
    pub api: Arc<dyn RemoteApi>,
    pub log: Arc<MutationLog>,
    pub store: Arc<dyn KeyValueStore>,
    pub monitor: ConnectivityMonitor,
    pub queries: Arc<dyn QueryCache>,
    pub policy: RetryPolicy,
}

/// A domain that can drain its offline queues and refresh from the server.
#[async_trait]
pub trait DomainSync: Send + Sync {
    fn name(&self) -> &'static str;

    async fn sync(&self) -> Result<DomainReport>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainReport {
    pub domain: &'static str,
    pub replay: ReplayOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    /// Failed this time, kept for the next pass
    pub retained: usize,
    /// Skipped because their backoff has not elapsed or the network dropped
    pub deferred: usize,
    pub dead_lettered: usize,
}

impl AddAssign for ReplayOutcome {
    fn add_assign(&mut self, other: Self) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.retained += other.retained;
        self.deferred += other.deferred;
        self.dead_lettered += other.dead_lettered;
    }
}

/// Sends one queued mutation to the server.
#[async_trait]
pub(crate) trait Replayer: Send + Sync {
    async fn apply(&self, mutation: &PendingMutation) -> Result<()>;
}

/// A queued mutation addresses an entity by an id the server never issued.
#[derive(Debug, Error)]
#[error("{0:?} is not a server id")]
pub(crate) struct NotAServerId(pub String);

pub(crate) fn server_id(id: &str) -> Result<i64, NotAServerId> {
    id.parse().map_err(|_| NotAServerId(id.to_string()))
}

/// Failures that will repeat no matter how often the item is retried.
fn is_permanent(error: &anyhow::Error) -> bool {
    if let Some(api) = error.downcast_ref::<ApiError>() {
        return !api.is_retryable();
    }
    // an undecodable payload stays undecodable
    error.downcast_ref::<StorageError>().is_some() || error.downcast_ref::<NotAServerId>().is_some()
}

/// Whether the queue now holds a different payload for the entity `sent`
/// addressed, i.e. a newer local edit the server has not seen yet.
pub(crate) fn superseded(log: &MutationLog, key: QueueKey, sent: &PendingMutation) -> bool {
    log.drain(key)
        .map(|queued| {
            queued
                .iter()
                .any(|m| m.entity_id == sent.entity_id && m.payload != sent.payload)
        })
        .unwrap_or(true)
}

/// Replay one sub-queue in order and settle it.
///
/// Succeeded items are removed, failed ones are kept with their attempt
/// count bumped, and items that exhausted their attempts (or can never
/// succeed) move to the dead-letter queue. A storage failure while reading
/// the queue is logged and treated as an empty queue.
pub(crate) async fn replay_queue(
    ctx: &SyncContext,
    key: QueueKey,
    replayer: &dyn Replayer,
) -> ReplayOutcome {
    let mut outcome = ReplayOutcome::default();
    let drained = match ctx.log.drain(key) {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(queue = %key, "failed to read offline queue, skipping: {e}");
            return outcome;
        }
    };
    if drained.is_empty() {
        return outcome;
    }

    let snapshot = drained.clone();
    let started = Utc::now();
    let mut retained = Vec::new();
    let mut dead = Vec::new();

    for mut mutation in drained {
        if !ctx.monitor.get_status() || !ctx.policy.is_due(&mutation, started) {
            outcome.deferred += 1;
            retained.push(mutation);
            continue;
        }

        outcome.attempted += 1;
        match replayer.apply(&mutation).await {
            Ok(()) => {
                outcome.succeeded += 1;
                tracing::debug!(queue = %key, id = %mutation.id, "replayed mutation");
            }
            Err(e) => {
                mutation.record_failure(format!("{e:#}"), Utc::now());
                if is_permanent(&e) || ctx.policy.is_exhausted(&mutation) {
                    tracing::warn!(
                        queue = %key,
                        id = %mutation.id,
                        attempts = mutation.attempts,
                        "giving up on mutation: {e:#}"
                    );
                    outcome.dead_lettered += 1;
                    dead.push(mutation);
                } else {
                    tracing::warn!(
                        queue = %key,
                        id = %mutation.id,
                        attempts = mutation.attempts,
                        "replay failed, will retry: {e:#}"
                    );
                    outcome.retained += 1;
                    retained.push(mutation);
                }
            }
        }
    }

    if let Err(e) = ctx.log.dead_letter(key, dead) {
        tracing::warn!(queue = %key, "failed to record dead letters: {e}");
    }
    // If this fails the already-sent items are replayed next time.
    if let Err(e) = ctx.log.settle(key, &snapshot, retained) {
        tracing::warn!(queue = %key, "failed to settle offline queue: {e}");
    }

    outcome
}

/// Id for entities that exist only on this device so far.
pub(crate) fn new_local_id() -> String {
    format!("local-{}", Uuid::new_v4())
}

/// Decide whether an online write error should fall back to the queue.
pub(crate) fn queue_on_error(error: ApiError, what: &str) -> Result<()> {
    if error.is_retryable() {
        tracing::warn!("{what} failed, queuing for later: {error}");
        Ok(())
    } else {
        Err(error.into())
    }
}
