use anyhow::{Context, Result};
use async_trait::async_trait;
use tend_core::{Domain, EntityCache, MutationKind, PendingMutation, QueueKey, Tracked};
use tend_proto::FavoriteToggle;

use super::{
    queue_on_error, replay_queue, superseded, DomainReport, DomainSync, Replayer, SyncContext,
};

const FAVORITE_UPDATE: QueueKey = QueueKey::new(Domain::Favorites, MutationKind::Update);

/// Favorite coaches, keyed by coach id.
///
/// Unfavoriting offline leaves a local-only entry with `favorite: false`
/// until the server confirms, so the pending change stays visible.
pub struct FavoritesSync {
    ctx: SyncContext,
    cache: EntityCache<FavoriteToggle>,
}

impl FavoritesSync {
    pub fn new(ctx: SyncContext) -> Self {
        let cache = EntityCache::new(ctx.store.clone(), Domain::Favorites.query_tag());
        Self { ctx, cache }
    }

    pub async fn toggle(&self, coach_id: &str, favorite: bool) -> Result<()> {
        let toggle = FavoriteToggle {
            coach_id: coach_id.to_string(),
            favorite,
        };

        if self.ctx.monitor.get_status() {
            match self.ctx.api.set_favorite(&toggle).await {
                Ok(()) => {
                    self.apply_confirmed(toggle)
                        .context("Failed to cache favorite")?;
                    self.ctx.queries.invalidate(Domain::Favorites.query_tag());
                    return Ok(());
                }
                Err(e) => queue_on_error(e, "favorite toggle")?,
            }
        }

        // only the latest state per coach matters
        let amended = self
            .ctx
            .log
            .amend_payload(FAVORITE_UPDATE, coach_id, &toggle)
            .context("Failed to queue favorite toggle")?;
        if !amended {
            self.ctx
                .log
                .enqueue(PendingMutation::update(Domain::Favorites, coach_id, &toggle)?)
                .context("Failed to queue favorite toggle")?;
        }
        self.cache
            .upsert(Tracked::local(coach_id, toggle))
            .context("Failed to cache favorite")?;
        Ok(())
    }

    pub fn is_favorite(&self, coach_id: &str) -> Result<bool> {
        Ok(self
            .cache
            .get(coach_id)?
            .map(|t| t.data.favorite)
            .unwrap_or(false))
    }

    pub fn favorites(&self) -> Result<Vec<Tracked<FavoriteToggle>>> {
        Ok(self.cache.load()?)
    }

    fn apply_confirmed(&self, toggle: FavoriteToggle) -> tend_core::StorageResult<()> {
        if toggle.favorite {
            let id = toggle.coach_id.clone();
            self.cache.upsert(Tracked::synced(id, toggle))
        } else {
            self.cache.remove(&toggle.coach_id).map(|_| ())
        }
    }

    async fn refresh(&self) -> Result<()> {
        let favorites = self
            .ctx
            .api
            .list_favorites()
            .await
            .context("Failed to fetch favorites")?;
        let server = favorites
            .into_iter()
            .map(|f| {
                let toggle = FavoriteToggle {
                    coach_id: f.coach_id.clone(),
                    favorite: true,
                };
                (f.coach_id, toggle)
            })
            .collect();
        let log = &self.ctx.log;
        self.cache.merge_server(server, |t| {
            log.contains_entity(FAVORITE_UPDATE, &t.id).unwrap_or(true)
        })?;
        Ok(())
    }
}

#[async_trait]
impl Replayer for FavoritesSync {
    async fn apply(&self, mutation: &PendingMutation) -> Result<()> {
        let toggle: FavoriteToggle = mutation.payload_as()?;
        self.ctx.api.set_favorite(&toggle).await?;

        let coach_id = toggle.coach_id.clone();
        // a newer toggle may have been folded in meanwhile; leave its entry alone
        if !superseded(&self.ctx.log, FAVORITE_UPDATE, mutation) {
            if let Err(e) = self.apply_confirmed(toggle) {
                tracing::warn!("favorite {coach_id} sent but cache not updated: {e}");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DomainSync for FavoritesSync {
    fn name(&self) -> &'static str {
        Domain::Favorites.as_str()
    }

    async fn sync(&self) -> Result<DomainReport> {
        let replay = replay_queue(&self.ctx, FAVORITE_UPDATE, self).await;
        let refreshed = self.refresh().await;
        self.ctx.queries.invalidate(Domain::Favorites.query_tag());
        refreshed?;

        Ok(DomainReport {
            domain: self.name(),
            replay,
        })
    }
}
