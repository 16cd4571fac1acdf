#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tend_core::{
    ConnectivityMonitor, InvalidationTracker, KeyValueStore, MemoryStore, MutationLog,
    RetryPolicy, StorageError, StorageResult, SyncLease, SyncStatusBoard,
};
use tokio::sync::{Notify, Semaphore};
use tend_proto::{
    Favorite, FavoriteToggle, MoodCheckIn, MoodEntry, MoodStats, Project, ProjectDraft, Task,
    TaskDraft,
};
use tend_syncd::api::ApiResult;
use tend_syncd::{ApiError, FavoritesSync, MoodSync, PlannerSync, RemoteApi, SyncContext};

/// Holds a call open until the test lets it through.
pub struct Gate {
    pub entered: Notify,
    pub release: Semaphore,
}

impl Gate {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }
}

/// In-memory server that counts calls and can be told to fail.
pub struct StubApi {
    gates: Mutex<HashMap<&'static str, Arc<Gate>>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    history: Mutex<Vec<&'static str>>,
    failures: Mutex<HashMap<&'static str, u16>>,
    next_id: AtomicI64,
    moods: Mutex<Vec<MoodEntry>>,
    favorites: Mutex<Vec<Favorite>>,
    tasks: Mutex<Vec<Task>>,
    projects: Mutex<Vec<Project>>,
}

impl StubApi {
    /// Ids handed out by creates start at 42.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gates: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(42),
            moods: Mutex::new(Vec::new()),
            favorites: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            projects: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    /// Every call so far, in order
    pub fn history(&self) -> Vec<&'static str> {
        self.history.lock().unwrap().clone()
    }

    /// Calls that change server state, in order
    pub fn writes(&self) -> Vec<&'static str> {
        self.history()
            .into_iter()
            .filter(|m| !m.starts_with("list_") && *m != "mood_stats")
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Make `method` answer with HTTP `status` until [`StubApi::recover`].
    pub fn fail_with(&self, method: &'static str, status: u16) {
        self.failures.lock().unwrap().insert(method, status);
    }

    pub fn recover(&self, method: &str) {
        self.failures.lock().unwrap().remove(method);
    }

    /// Block every `method` call until a permit is added to the gate.
    pub fn hold(&self, method: &'static str) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        self.gates.lock().unwrap().insert(method, gate.clone());
        gate
    }

    async fn pass_gate(&self, method: &str) {
        let gate = self.gates.lock().unwrap().get(method).cloned();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.acquire().await.unwrap().forget();
        }
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }

    pub fn seed_task(&self, id: i64, text: &str) {
        self.tasks.lock().unwrap().push(Task {
            id,
            draft: TaskDraft::new(text),
            updated_at: Utc::now(),
        });
    }

    fn call(&self, method: &'static str) -> ApiResult<()> {
        *self.calls.lock().unwrap().entry(method).or_insert(0) += 1;
        self.history.lock().unwrap().push(method);
        match self.failures.lock().unwrap().get(method) {
            Some(&status) => Err(ApiError::Status {
                status,
                message: format!("{method} failed"),
            }),
            None => Ok(()),
        }
    }

    fn id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteApi for StubApi {
    async fn submit_mood(&self, check_in: &MoodCheckIn) -> ApiResult<MoodEntry> {
        self.call("submit_mood")?;
        let entry = MoodEntry {
            id: self.id(),
            check_in: check_in.clone(),
        };
        self.moods.lock().unwrap().push(entry.clone());
        Ok(entry)
    }

    async fn list_moods(&self) -> ApiResult<Vec<MoodEntry>> {
        self.call("list_moods")?;
        Ok(self.moods.lock().unwrap().clone())
    }

    async fn mood_stats(&self) -> ApiResult<MoodStats> {
        self.call("mood_stats")?;
        let moods = self.moods.lock().unwrap();
        let count = moods.len() as u32;
        let total: u32 = moods.iter().map(|m| m.check_in.mood as u32).sum();
        Ok(MoodStats {
            average: if count == 0 { 0.0 } else { total as f32 / count as f32 },
            count,
            streak_days: 0,
        })
    }

    async fn set_favorite(&self, toggle: &FavoriteToggle) -> ApiResult<()> {
        self.call("set_favorite")?;
        let mut favorites = self.favorites.lock().unwrap();
        favorites.retain(|f| f.coach_id != toggle.coach_id);
        if toggle.favorite {
            favorites.push(Favorite {
                coach_id: toggle.coach_id.clone(),
                created_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn list_favorites(&self) -> ApiResult<Vec<Favorite>> {
        self.call("list_favorites")?;
        Ok(self.favorites.lock().unwrap().clone())
    }

    async fn create_task(&self, draft: &TaskDraft) -> ApiResult<Task> {
        self.pass_gate("create_task").await;
        self.call("create_task")?;
        let task = Task {
            id: self.id(),
            draft: draft.clone(),
            updated_at: Utc::now(),
        };
        self.tasks.lock().unwrap().push(task.clone());
        Ok(task)
    }

    async fn update_task(&self, id: i64, draft: &TaskDraft) -> ApiResult<Task> {
        self.call("update_task")?;
        let mut tasks = self.tasks.lock().unwrap();
        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            return Err(ApiError::Status {
                status: 404,
                message: "no such task".into(),
            });
        };
        task.draft = draft.clone();
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn delete_task(&self, id: i64) -> ApiResult<()> {
        self.call("delete_task")?;
        self.tasks.lock().unwrap().retain(|t| t.id != id);
        Ok(())
    }

    async fn list_tasks(&self) -> ApiResult<Vec<Task>> {
        self.call("list_tasks")?;
        Ok(self.tasks())
    }

    async fn create_project(&self, draft: &ProjectDraft) -> ApiResult<Project> {
        self.call("create_project")?;
        let project = Project {
            id: self.id(),
            draft: draft.clone(),
            updated_at: Utc::now(),
        };
        self.projects.lock().unwrap().push(project.clone());
        Ok(project)
    }

    async fn update_project(&self, id: i64, draft: &ProjectDraft) -> ApiResult<Project> {
        self.call("update_project")?;
        let mut projects = self.projects.lock().unwrap();
        let Some(project) = projects.iter_mut().find(|p| p.id == id) else {
            return Err(ApiError::Status {
                status: 404,
                message: "no such project".into(),
            });
        };
        project.draft = draft.clone();
        Ok(project.clone())
    }

    async fn delete_project(&self, id: i64) -> ApiResult<()> {
        self.call("delete_project")?;
        self.projects.lock().unwrap().retain(|p| p.id != id);
        Ok(())
    }

    async fn list_projects(&self) -> ApiResult<Vec<Project>> {
        self.call("list_projects")?;
        Ok(self.projects.lock().unwrap().clone())
    }
}

/// Memory store whose reads or writes can be switched off.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool) -> StorageResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("disk on fire".into()))
        } else {
            Ok(())
        }
    }
}

impl KeyValueStore for FlakyStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.check(&self.fail_reads)?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.check(&self.fail_writes)?;
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.check(&self.fail_writes)?;
        self.inner.remove(key)
    }

    fn atomically(
        &self,
        f: &mut dyn FnMut(&dyn KeyValueStore) -> StorageResult<()>,
    ) -> StorageResult<()> {
        self.inner.atomically(&mut |_: &dyn KeyValueStore| f(self))
    }
}

/// Services wired against a [`StubApi`] and a [`FlakyStore`].
pub struct Harness {
    pub api: Arc<StubApi>,
    pub store: Arc<FlakyStore>,
    pub log: Arc<MutationLog>,
    pub monitor: ConnectivityMonitor,
    pub queries: Arc<InvalidationTracker>,
    pub status: Arc<SyncStatusBoard>,
    pub ctx: SyncContext,
}

impl Harness {
    /// Retries are due immediately and give up after three failures.
    pub fn new(online: bool) -> Self {
        Self::with_policy(
            online,
            RetryPolicy {
                max_attempts: 3,
                base_delay: chrono::Duration::zero(),
                max_delay: chrono::Duration::zero(),
            },
        )
    }

    pub fn with_policy(online: bool, policy: RetryPolicy) -> Self {
        Self::build(StubApi::new(), Arc::new(FlakyStore::default()), online, policy)
    }

    /// A second process working on the same database and server: it shares
    /// the store but has its own log, monitor and status board.
    pub fn another_process(&self) -> Self {
        Self::build(
            self.api.clone(),
            self.store.clone(),
            self.monitor.get_status(),
            self.ctx.policy,
        )
    }

    fn build(api: Arc<StubApi>, store: Arc<FlakyStore>, online: bool, policy: RetryPolicy) -> Self {
        let log = Arc::new(MutationLog::new(store.clone()));
        let monitor = ConnectivityMonitor::new(store.clone());
        monitor.set_online(online);
        let queries = Arc::new(InvalidationTracker::new());
        let status = Arc::new(SyncStatusBoard::new(store.clone()));
        let ctx = SyncContext {
            api: api.clone(),
            log: log.clone(),
            store: store.clone(),
            monitor: monitor.clone(),
            queries: queries.clone(),
            policy,
        };
        Self {
            api,
            store,
            log,
            monitor,
            queries,
            status,
            ctx,
        }
    }

    pub fn lease(&self) -> SyncLease {
        SyncLease::new(self.store.clone(), chrono::Duration::minutes(5))
    }

    pub fn mood(&self) -> Arc<MoodSync> {
        Arc::new(MoodSync::new(self.ctx.clone()))
    }

    pub fn favorites(&self) -> Arc<FavoritesSync> {
        Arc::new(FavoritesSync::new(self.ctx.clone()))
    }

    pub fn planner(&self) -> Arc<PlannerSync> {
        Arc::new(PlannerSync::new(self.ctx.clone()))
    }
}
