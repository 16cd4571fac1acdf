use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tend_core::{Domain, EntityCache, JsonStore, MutationKind, PendingMutation, QueueKey, Tracked};
use tend_proto::{MoodCheckIn, MoodStats};

use super::{
    new_local_id, queue_on_error, replay_queue, DomainReport, DomainSync, Replayer, SyncContext,
};

const MOOD_CREATE: QueueKey = QueueKey::new(Domain::Mood, MutationKind::Create);
const STATS_KEY: &str = "cache/mood-stats";

/// Mood check-ins and the server-computed statistics over them.
pub struct MoodSync {
    ctx: SyncContext,
    entries: EntityCache<MoodCheckIn>,
}

impl MoodSync {
    pub fn new(ctx: SyncContext) -> Self {
        let entries = EntityCache::new(ctx.store.clone(), "mood");
        Self { ctx, entries }
    }

    /// Record a check-in, sending it right away when online.
    pub async fn record(&self, check_in: MoodCheckIn) -> Result<Tracked<MoodCheckIn>> {
        if !check_in.is_valid() {
            bail!("mood must be between 1 and 5, got {}", check_in.mood);
        }

        if self.ctx.monitor.get_status() {
            match self.ctx.api.submit_mood(&check_in).await {
                Ok(entry) => {
                    let tracked = Tracked::synced(entry.id.to_string(), entry.check_in);
                    self.entries
                        .upsert(tracked.clone())
                        .context("Failed to cache mood entry")?;
                    self.ctx.queries.invalidate(Domain::Mood.query_tag());
                    return Ok(tracked);
                }
                Err(e) => queue_on_error(e, "mood check-in")?,
            }
        }

        let local_id = new_local_id();
        self.ctx
            .log
            .enqueue(PendingMutation::create(Domain::Mood, &local_id, &check_in)?)
            .context("Failed to queue mood check-in")?;
        let tracked = Tracked::local(local_id, check_in);
        self.entries
            .upsert(tracked.clone())
            .context("Failed to cache mood entry")?;
        Ok(tracked)
    }

    pub fn entries(&self) -> Result<Vec<Tracked<MoodCheckIn>>> {
        Ok(self.entries.load()?)
    }

    /// Statistics from the last successful refresh
    pub fn stats(&self) -> Result<Option<MoodStats>> {
        Ok(self.ctx.store.get_json(STATS_KEY)?)
    }

    async fn refresh(&self) -> Result<()> {
        let moods = self
            .ctx
            .api
            .list_moods()
            .await
            .context("Failed to fetch mood entries")?;
        let server = moods
            .into_iter()
            .map(|m| (m.id.to_string(), m.check_in))
            .collect();
        let log = &self.ctx.log;
        self.entries.merge_server(server, |t| {
            log.contains_entity(MOOD_CREATE, &t.id).unwrap_or(true)
        })?;

        let stats = self
            .ctx
            .api
            .mood_stats()
            .await
            .context("Failed to fetch mood stats")?;
        self.ctx.store.set_json(STATS_KEY, &stats)?;
        Ok(())
    }
}

#[async_trait]
impl Replayer for MoodSync {
    async fn apply(&self, mutation: &PendingMutation) -> Result<()> {
        let check_in: MoodCheckIn = mutation.payload_as()?;
        let entry = self.ctx.api.submit_mood(&check_in).await?;

        if let Some(local_id) = mutation.entity_id.as_deref() {
            if let Err(e) = self
                .entries
                .promote(local_id, &entry.id.to_string(), entry.check_in)
            {
                tracing::warn!("mood entry {} sent but cache not updated: {e}", entry.id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DomainSync for MoodSync {
    fn name(&self) -> &'static str {
        Domain::Mood.as_str()
    }

    async fn sync(&self) -> Result<DomainReport> {
        let replay = replay_queue(&self.ctx, MOOD_CREATE, self).await;
        let refreshed = self.refresh().await;
        self.ctx.queries.invalidate(Domain::Mood.query_tag());
        refreshed?;

        Ok(DomainReport {
            domain: self.name(),
            replay,
        })
    }
}
