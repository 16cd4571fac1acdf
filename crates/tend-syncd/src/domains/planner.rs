use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tend_core::{
    CreateFate, Domain, EntityCache, MutationKind, PendingMutation, QueueKey, Tracked,
};
use tend_proto::{ProjectDraft, TaskDraft};

use super::{
    new_local_id, queue_on_error, replay_queue, server_id, superseded, DomainReport, DomainSync,
    ReplayOutcome, Replayer, SyncContext,
};
use crate::api::{ApiResult, RemoteApi};

/// Projects are created before the tasks that may reference them and
/// deleted only after those tasks are gone.
const REPLAY_ORDER: [QueueKey; 6] = [
    QueueKey::new(Domain::Projects, MutationKind::Create),
    QueueKey::new(Domain::Projects, MutationKind::Update),
    QueueKey::new(Domain::Tasks, MutationKind::Create),
    QueueKey::new(Domain::Tasks, MutationKind::Update),
    QueueKey::new(Domain::Tasks, MutationKind::Delete),
    QueueKey::new(Domain::Projects, MutationKind::Delete),
];

/// What the planner needs to know about tasks and projects to sync them
/// through the same code path.
#[async_trait]
trait PlannerEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const DOMAIN: Domain;

    fn cache(planner: &PlannerSync) -> &EntityCache<Self>;

    async fn create_remote(&self, api: &dyn RemoteApi) -> ApiResult<(i64, Self)>;
    async fn update_remote(&self, api: &dyn RemoteApi, id: i64) -> ApiResult<(i64, Self)>;
    async fn delete_remote(api: &dyn RemoteApi, id: i64) -> ApiResult<()>;
    async fn list_remote(api: &dyn RemoteApi) -> ApiResult<Vec<(i64, Self)>>;

    fn key(kind: MutationKind) -> QueueKey {
        QueueKey::new(Self::DOMAIN, kind)
    }
}

#[async_trait]
impl PlannerEntity for TaskDraft {
    const DOMAIN: Domain = Domain::Tasks;

    fn cache(planner: &PlannerSync) -> &EntityCache<Self> {
        &planner.tasks
    }

    async fn create_remote(&self, api: &dyn RemoteApi) -> ApiResult<(i64, Self)> {
        let task = api.create_task(self).await?;
        Ok((task.id, task.draft))
    }

    async fn update_remote(&self, api: &dyn RemoteApi, id: i64) -> ApiResult<(i64, Self)> {
        let task = api.update_task(id, self).await?;
        Ok((task.id, task.draft))
    }

    async fn delete_remote(api: &dyn RemoteApi, id: i64) -> ApiResult<()> {
        api.delete_task(id).await
    }

    async fn list_remote(api: &dyn RemoteApi) -> ApiResult<Vec<(i64, Self)>> {
        let tasks = api.list_tasks().await?;
        Ok(tasks.into_iter().map(|t| (t.id, t.draft)).collect())
    }
}

#[async_trait]
impl PlannerEntity for ProjectDraft {
    const DOMAIN: Domain = Domain::Projects;

    fn cache(planner: &PlannerSync) -> &EntityCache<Self> {
        &planner.projects
    }

    async fn create_remote(&self, api: &dyn RemoteApi) -> ApiResult<(i64, Self)> {
        let project = api.create_project(self).await?;
        Ok((project.id, project.draft))
    }

    async fn update_remote(&self, api: &dyn RemoteApi, id: i64) -> ApiResult<(i64, Self)> {
        let project = api.update_project(id, self).await?;
        Ok((project.id, project.draft))
    }

    async fn delete_remote(api: &dyn RemoteApi, id: i64) -> ApiResult<()> {
        api.delete_project(id).await
    }

    async fn list_remote(api: &dyn RemoteApi) -> ApiResult<Vec<(i64, Self)>> {
        let projects = api.list_projects().await?;
        Ok(projects.into_iter().map(|p| (p.id, p.draft)).collect())
    }
}

/// Tasks and projects.
///
/// Entities created offline live under a `local-` id until their create
/// reaches the server. Edits to such an entity are folded into the queued
/// create, and deleting it simply cancels the create. If the create is
/// already on its way, the edit or delete follows it to the server id.
pub struct PlannerSync {
    ctx: SyncContext,
    tasks: EntityCache<TaskDraft>,
    projects: EntityCache<ProjectDraft>,
}

impl PlannerSync {
    pub fn new(ctx: SyncContext) -> Self {
        let tasks = EntityCache::new(ctx.store.clone(), Domain::Tasks.query_tag());
        let projects = EntityCache::new(ctx.store.clone(), Domain::Projects.query_tag());
        Self {
            ctx,
            tasks,
            projects,
        }
    }

    pub async fn create_task(&self, draft: TaskDraft) -> Result<Tracked<TaskDraft>> {
        self.create(draft).await
    }

    pub async fn update_task(&self, id: &str, draft: TaskDraft) -> Result<Tracked<TaskDraft>> {
        self.update(id, draft).await
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        self.delete::<TaskDraft>(id).await
    }

    pub fn tasks(&self) -> Result<Vec<Tracked<TaskDraft>>> {
        Ok(self.tasks.load()?)
    }

    pub async fn create_project(&self, draft: ProjectDraft) -> Result<Tracked<ProjectDraft>> {
        self.create(draft).await
    }

    pub async fn update_project(
        &self,
        id: &str,
        draft: ProjectDraft,
    ) -> Result<Tracked<ProjectDraft>> {
        self.update(id, draft).await
    }

    pub async fn delete_project(&self, id: &str) -> Result<()> {
        self.delete::<ProjectDraft>(id).await
    }

    pub fn projects(&self) -> Result<Vec<Tracked<ProjectDraft>>> {
        Ok(self.projects.load()?)
    }

    async fn create<E: PlannerEntity>(&self, draft: E) -> Result<Tracked<E>> {
        let cache = E::cache(self);

        if self.ctx.monitor.get_status() {
            match draft.create_remote(self.ctx.api.as_ref()).await {
                Ok((id, data)) => {
                    let tracked = Tracked::synced(id.to_string(), data);
                    cache.upsert(tracked.clone())?;
                    self.ctx.queries.invalidate(E::DOMAIN.query_tag());
                    return Ok(tracked);
                }
                Err(e) => queue_on_error(e, &format!("creating {}", E::DOMAIN))?,
            }
        }

        let local_id = new_local_id();
        self.ctx
            .log
            .enqueue(PendingMutation::create(E::DOMAIN, &local_id, &draft)?)
            .with_context(|| format!("Failed to queue new {} entry", E::DOMAIN))?;
        let tracked = Tracked::local(local_id, draft);
        cache.upsert(tracked.clone())?;
        Ok(tracked)
    }

    async fn update<E: PlannerEntity>(&self, id: &str, draft: E) -> Result<Tracked<E>> {
        let cache = E::cache(self);
        let log = &self.ctx.log;

        // never reached the server, or an earlier edit is still queued
        if log.amend_payload(E::key(MutationKind::Create), id, &draft)?
            || log.amend_payload(E::key(MutationKind::Update), id, &draft)?
        {
            let tracked = Tracked::local(id, draft);
            cache.upsert(tracked.clone())?;
            return Ok(tracked);
        }

        let remote_id = server_id(id)?;
        if self.ctx.monitor.get_status() {
            match draft.update_remote(self.ctx.api.as_ref(), remote_id).await {
                Ok((id, data)) => {
                    let tracked = Tracked::synced(id.to_string(), data);
                    cache.upsert(tracked.clone())?;
                    self.ctx.queries.invalidate(E::DOMAIN.query_tag());
                    return Ok(tracked);
                }
                Err(e) => queue_on_error(e, &format!("updating {} {id}", E::DOMAIN))?,
            }
        }

        log.enqueue(PendingMutation::update(E::DOMAIN, id, &draft)?)
            .with_context(|| format!("Failed to queue {} update", E::DOMAIN))?;
        let tracked = Tracked::local(id, draft);
        cache.upsert(tracked.clone())?;
        Ok(tracked)
    }

    async fn delete<E: PlannerEntity>(&self, id: &str) -> Result<()> {
        let cache = E::cache(self);
        let log = &self.ctx.log;

        if log.discard_entity(E::key(MutationKind::Create), id)? > 0 {
            log.discard_entity(E::key(MutationKind::Update), id)?;
            cache.remove(id)?;
            tracing::debug!("cancelled unsent {} {id}", E::DOMAIN);
            return Ok(());
        }

        let remote_id = server_id(id)?;
        log.discard_entity(E::key(MutationKind::Update), id)?;

        if self.ctx.monitor.get_status() {
            match E::delete_remote(self.ctx.api.as_ref(), remote_id).await {
                Ok(()) => {
                    cache.remove(id)?;
                    self.ctx.queries.invalidate(E::DOMAIN.query_tag());
                    return Ok(());
                }
                Err(e) => queue_on_error(e, &format!("deleting {} {id}", E::DOMAIN))?,
            }
        }

        log.enqueue(PendingMutation::delete(E::DOMAIN, id))
            .with_context(|| format!("Failed to queue {} delete", E::DOMAIN))?;
        cache.remove(id)?;
        Ok(())
    }

    async fn apply_as<E: PlannerEntity>(&self, mutation: &PendingMutation) -> Result<()> {
        let api = self.ctx.api.as_ref();
        let entity_id = mutation
            .entity_id
            .as_deref()
            .context("queued mutation has no entity id")?;

        match mutation.kind {
            MutationKind::Create => {
                let draft: E = mutation.payload_as()?;
                let (id, data) = draft.create_remote(api).await?;
                self.settle_create(mutation, entity_id, &id.to_string(), data);
            }
            MutationKind::Update => {
                let draft: E = mutation.payload_as()?;
                let (id, data) = draft.update_remote(api, server_id(entity_id)?).await?;
                if !superseded(&self.ctx.log, mutation.key(), mutation) {
                    if let Err(e) = E::cache(self).upsert(Tracked::synced(id.to_string(), data)) {
                        tracing::warn!("{} {id} updated but cache not updated: {e}", E::DOMAIN);
                    }
                }
            }
            MutationKind::Delete => {
                E::delete_remote(api, server_id(entity_id)?).await?;
            }
        }
        Ok(())
    }

    /// Carry edits or a delete made while the create was in flight over to
    /// the server id, and re-key the cache entry.
    fn settle_create<E: PlannerEntity>(
        &self,
        sent: &PendingMutation,
        local_id: &str,
        id: &str,
        created: E,
    ) {
        let cache = E::cache(self);
        let cached = match self.ctx.log.resolve_create(sent, id) {
            Ok(CreateFate::Unchanged) => cache.promote(local_id, id, created),
            Ok(CreateFate::Amended(update)) => {
                tracing::debug!("{} {id} edited while being created, queued update", E::DOMAIN);
                update.payload_as::<E>().and_then(|latest| {
                    cache.remove(local_id)?;
                    cache.upsert(Tracked::local(id, latest))
                })
            }
            Ok(CreateFate::Cancelled(_)) => {
                tracing::debug!("{} {id} deleted while being created, queued delete", E::DOMAIN);
                cache.remove(local_id).map(|_| ())
            }
            Err(e) => {
                tracing::warn!("{} {id} created but queue not reconciled: {e}", E::DOMAIN);
                cache.promote(local_id, id, created)
            }
        };
        if let Err(e) = cached {
            tracing::warn!("{} {id} created but cache not updated: {e}", E::DOMAIN);
        }
    }

    /// Pull server state for one entity type into its cache.
    ///
    /// Entities with a queued delete stay hidden; local-only entries with a
    /// queued create or update shadow the server copy.
    async fn refresh<E: PlannerEntity>(&self) -> Result<()> {
        let remote = E::list_remote(self.ctx.api.as_ref())
            .await
            .with_context(|| format!("Failed to fetch {}", E::DOMAIN))?;
        let log = &self.ctx.log;

        let pending_delete = |id: &str| {
            log.contains_entity(E::key(MutationKind::Delete), id)
                .unwrap_or(false)
        };
        let server = remote
            .into_iter()
            .map(|(id, data)| (id.to_string(), data))
            .filter(|(id, _)| !pending_delete(id.as_str()))
            .collect();

        E::cache(self).merge_server(server, |t| {
            [MutationKind::Create, MutationKind::Update]
                .into_iter()
                .any(|kind| log.contains_entity(E::key(kind), &t.id).unwrap_or(true))
        })?;
        Ok(())
    }
}

#[async_trait]
impl Replayer for PlannerSync {
    async fn apply(&self, mutation: &PendingMutation) -> Result<()> {
        match mutation.domain {
            Domain::Tasks => self.apply_as::<TaskDraft>(mutation).await,
            Domain::Projects => self.apply_as::<ProjectDraft>(mutation).await,
            other => bail!("{other} mutation in a planner queue"),
        }
    }
}

#[async_trait]
impl DomainSync for PlannerSync {
    fn name(&self) -> &'static str {
        "planner"
    }

    async fn sync(&self) -> Result<DomainReport> {
        let mut replay = ReplayOutcome::default();
        for key in REPLAY_ORDER {
            replay += replay_queue(&self.ctx, key, self).await;
        }

        let tasks = self.refresh::<TaskDraft>().await;
        self.ctx.queries.invalidate(Domain::Tasks.query_tag());
        let projects = self.refresh::<ProjectDraft>().await;
        self.ctx.queries.invalidate(Domain::Projects.query_tag());
        tasks?;
        projects?;

        Ok(DomainReport {
            domain: self.name(),
            replay,
        })
    }
}
