mod support;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support::Harness;
use tend_core::{Domain, MutationKind, QueueKey, SyncStatus};
use tend_proto::TaskDraft;
use tend_syncd::{DomainReport, DomainSync, SyncOrchestrator, SyncPhase, TriggerOutcome};
use tokio::sync::{Notify, Semaphore};

const TASK_CREATE: QueueKey = QueueKey::new(Domain::Tasks, MutationKind::Create);
const FAVORITE_UPDATE: QueueKey = QueueKey::new(Domain::Favorites, MutationKind::Update);

/// Counts how often it was synced.
struct Counting {
    name: &'static str,
    runs: AtomicUsize,
}

impl Counting {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            runs: AtomicUsize::new(0),
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DomainSync for Counting {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn sync(&self) -> Result<DomainReport> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(DomainReport {
            domain: self.name,
            ..Default::default()
        })
    }
}

/// Blocks inside `sync` until the test hands out a permit.
struct Gated {
    runs: AtomicUsize,
    entered: Notify,
    release: Semaphore,
}

impl Gated {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            entered: Notify::new(),
            release: Semaphore::new(0),
        })
    }
}

#[async_trait]
impl DomainSync for Gated {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn sync(&self) -> Result<DomainReport> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.acquire().await?.forget();
        Ok(DomainReport::default())
    }
}

fn orchestrator(h: &Harness, domains: Vec<Arc<dyn DomainSync>>) -> SyncOrchestrator {
    SyncOrchestrator::new(
        domains,
        h.monitor.clone(),
        h.log.clone(),
        h.status.clone(),
        h.lease(),
    )
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn online_edge_runs_each_domain_once() {
    let h = Harness::new(false);
    let mood = Counting::new("mood");
    let favorites = Counting::new("favorites");
    let planner = Counting::new("planner");
    let orch = orchestrator(&h, vec![mood.clone(), favorites.clone(), planner.clone()]);

    let outcome = orch.handle_connectivity(true).await;

    assert_eq!(outcome, Some(TriggerOutcome::Completed { passes: 1 }));
    assert_eq!((mood.runs(), favorites.runs(), planner.runs()), (1, 1, 1));
    assert_eq!(h.status.snapshot().passes, 1);
    assert_eq!(orch.phase(), SyncPhase::Idle);
}

#[tokio::test]
async fn no_edge_no_sync() {
    let h = Harness::new(true);
    let domain = Counting::new("mood");
    let orch = orchestrator(&h, vec![domain.clone()]);

    // already online
    assert_eq!(orch.handle_connectivity(true).await, None);
    // going offline is not a trigger either
    assert_eq!(orch.handle_connectivity(false).await, None);
    assert_eq!(domain.runs(), 0);

    assert!(orch.handle_connectivity(true).await.is_some());
    assert_eq!(domain.runs(), 1);
}

#[tokio::test]
async fn trigger_during_pass_is_coalesced_into_one_rerun() {
    let h = Harness::new(true);
    let gated = Gated::new();
    let orch = orchestrator(&h, vec![gated.clone()]);

    let running = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.trigger().await })
    };
    gated.entered.notified().await;
    assert_eq!(orch.phase(), SyncPhase::Syncing);

    assert_eq!(orch.trigger().await, TriggerOutcome::Coalesced);
    assert_eq!(orch.trigger().await, TriggerOutcome::Coalesced);

    gated.release.add_permits(2);
    let outcome = running.await.unwrap();

    assert_eq!(outcome, TriggerOutcome::Completed { passes: 2 });
    assert_eq!(gated.runs.load(Ordering::SeqCst), 2);
    assert_eq!(orch.phase(), SyncPhase::Idle);
}

#[tokio::test]
async fn rerun_is_dropped_when_connection_is_lost() {
    let h = Harness::new(true);
    let gated = Gated::new();
    let orch = orchestrator(&h, vec![gated.clone()]);

    let running = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.trigger().await })
    };
    gated.entered.notified().await;
    assert_eq!(orch.trigger().await, TriggerOutcome::Coalesced);
    h.monitor.set_online(false);

    gated.release.add_permits(1);
    assert_eq!(
        running.await.unwrap(),
        TriggerOutcome::Completed { passes: 1 }
    );
}

#[tokio::test]
async fn failing_domain_does_not_block_the_others() {
    let h = Harness::new(false);
    let favorites = h.favorites();
    let planner = h.planner();
    favorites.toggle("coach-1", true).await.unwrap();
    planner.create_task(TaskDraft::new("Buy milk")).await.unwrap();

    h.api.fail_with("set_favorite", 500);
    h.api.fail_with("list_favorites", 500);
    let orch = orchestrator(&h, vec![h.mood(), favorites, planner]);

    h.monitor.set_online(true);
    orch.handle_connectivity(true).await;

    assert!(h.log.is_empty(TASK_CREATE).unwrap());
    assert_eq!(h.log.len(FAVORITE_UPDATE).unwrap(), 1);
    let status = h.status.snapshot();
    assert_eq!(status.pending_changes, 1);
    assert!(status.last_error.unwrap().starts_with("favorites:"));
}

#[tokio::test]
async fn buy_milk_reaches_the_server_when_connection_returns() {
    let h = Harness::new(false);
    let planner = h.planner();
    let queued = planner.create_task(TaskDraft::new("Buy milk")).await.unwrap();
    assert!(queued.is_local_only());

    let orch = orchestrator(&h, vec![h.mood(), h.favorites(), planner.clone()]);
    orch.init();
    h.monitor.set_online(true);

    assert!(eventually(|| h.status.snapshot().passes == 1).await);

    assert!(h.log.is_empty(TASK_CREATE).unwrap());
    assert_eq!(h.api.calls("create_task"), 1);
    assert_eq!(h.api.calls("list_tasks"), 1);
    assert_eq!(h.queries.invalidations("tasks"), 1);

    let tasks = planner.tasks().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, "42");
    assert_eq!(tasks[0].data.text, "Buy milk");
    assert_eq!(tasks[0].status, SyncStatus::Synced);

    orch.dispose();
}

#[tokio::test]
async fn dispose_stops_listening() {
    let h = Harness::new(false);
    let domain = Counting::new("mood");
    let orch = orchestrator(&h, vec![domain.clone()]);

    orch.init();
    orch.init();
    assert!(orch.is_running());
    assert_eq!(h.monitor.listener_count(), 1);

    orch.dispose();
    assert!(!orch.is_running());
    assert_eq!(h.monitor.listener_count(), 0);

    h.monitor.set_online(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(domain.runs(), 0);
}

#[tokio::test]
async fn flapping_connection_syncs_once_per_edge() {
    let h = Harness::new(false);
    let domain = Counting::new("mood");
    let orch = orchestrator(&h, vec![domain.clone()]);
    orch.init();

    h.monitor.set_online(true);
    assert!(eventually(|| domain.runs() == 1).await);
    h.monitor.set_online(false);
    h.monitor.set_online(true);
    assert!(eventually(|| domain.runs() == 2).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(domain.runs(), 2);
    orch.dispose();
}

#[tokio::test]
async fn second_process_skips_while_a_pass_holds_the_lease() {
    let daemon = Harness::new(false);
    daemon
        .planner()
        .create_task(TaskDraft::new("Buy milk"))
        .await
        .unwrap();
    daemon.monitor.set_online(true);
    let one_shot = daemon.another_process();

    let gate = daemon.api.hold("create_task");
    let first = orchestrator(&daemon, vec![daemon.planner()]);
    let second = orchestrator(&one_shot, vec![one_shot.planner()]);

    let running = {
        let first = first.clone();
        tokio::spawn(async move { first.trigger().await })
    };
    gate.entered.notified().await;

    assert_eq!(second.trigger().await, TriggerOutcome::Skipped);
    assert_eq!(second.phase(), SyncPhase::Idle);

    gate.release.add_permits(1);
    assert_eq!(
        running.await.unwrap(),
        TriggerOutcome::Completed { passes: 1 }
    );
    assert_eq!(daemon.api.calls("create_task"), 1);
    assert_eq!(daemon.api.tasks().len(), 1);

    // released: the other process may sync now and finds nothing to send
    assert_eq!(
        second.trigger().await,
        TriggerOutcome::Completed { passes: 1 }
    );
    assert_eq!(daemon.api.calls("create_task"), 1);
    assert!(one_shot.log.is_empty(TASK_CREATE).unwrap());
}

#[tokio::test]
async fn lease_is_released_between_triggers() {
    let h = Harness::new(true);
    let domain = Counting::new("mood");
    let orch = orchestrator(&h, vec![domain.clone()]);

    assert_eq!(orch.trigger().await, TriggerOutcome::Completed { passes: 1 });
    assert_eq!(orch.trigger().await, TriggerOutcome::Completed { passes: 1 });
    assert!(h.lease().held_by().unwrap().is_none());
    assert_eq!(domain.runs(), 2);
}
