//! Runs the domain syncs whenever connectivity comes back.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tend_core::{
    ConnectivityMonitor, LeaseGuard, MutationLog, Subscription, SyncLease, SyncStatusBoard,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domains::DomainSync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Syncing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// This call ran `passes` sync passes (1, or 2 with a queued rerun)
    Completed { passes: u32 },
    /// A pass was already running; a rerun was requested instead
    Coalesced,
    /// Another process holds the sync lease (or it could not be read)
    Skipped,
}

struct State {
    phase: SyncPhase,
    rerun_requested: bool,
    last_online: bool,
}

struct Running {
    subscription: Subscription,
    events: JoinHandle<()>,
}

struct Inner {
    domains: Vec<Arc<dyn DomainSync>>,
    monitor: ConnectivityMonitor,
    log: Arc<MutationLog>,
    status: Arc<SyncStatusBoard>,
    lease: SyncLease,
    state: Mutex<State>,
    running: Mutex<Option<Running>>,
}

/// Drives every domain sync in order on each offline to online transition.
///
/// Only one pass runs at a time, across processes sharing the store: a
/// pass needs the [`SyncLease`]. A transition seen while a pass is in
/// flight schedules at most one more pass.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    /// `domains` are synced in the order given.
    pub fn new(
        domains: Vec<Arc<dyn DomainSync>>,
        monitor: ConnectivityMonitor,
        log: Arc<MutationLog>,
        status: Arc<SyncStatusBoard>,
        lease: SyncLease,
    ) -> Self {
        let last_online = monitor.get_status();
        Self {
            inner: Arc::new(Inner {
                domains,
                monitor,
                log,
                status,
                lease,
                state: Mutex::new(State {
                    phase: SyncPhase::Idle,
                    rerun_requested: false,
                    last_online,
                }),
                running: Mutex::new(None),
            }),
        }
    }

    /// Start listening for connectivity changes. Must be called from
    /// within a tokio runtime. Calling it twice is a no-op.
    pub fn init(&self) {
        let mut running = lock(&self.inner.running);
        if running.is_some() {
            return;
        }

        let online = self.inner.monitor.get_status();
        lock(&self.inner.state).last_online = online;
        self.inner.status.set_connected(online);

        // listeners run synchronously inside report(); just hand the value over
        let (tx, mut rx) = mpsc::unbounded_channel::<bool>();
        let subscription = self.inner.monitor.subscribe(move |online| {
            let _ = tx.send(online);
        });

        let this = self.clone();
        let events = tokio::spawn(async move {
            while let Some(online) = rx.recv().await {
                if this.observe(online) {
                    let orchestrator = this.clone();
                    tokio::spawn(async move {
                        orchestrator.trigger().await;
                    });
                }
            }
        });

        *running = Some(Running {
            subscription,
            events,
        });
        tracing::debug!("sync orchestrator started");
    }

    /// Stop listening. A pass already in flight runs to completion.
    pub fn dispose(&self) {
        let Some(running) = lock(&self.inner.running).take() else {
            return;
        };
        running.subscription.unsubscribe();
        running.events.abort();
        tracing::debug!("sync orchestrator stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.running).is_some()
    }

    pub fn phase(&self) -> SyncPhase {
        lock(&self.inner.state).phase
    }

    /// Record a connectivity value; true on an offline to online edge.
    fn observe(&self, online: bool) -> bool {
        self.inner.status.set_connected(online);
        let mut state = lock(&self.inner.state);
        let rising = online && !state.last_online;
        state.last_online = online;
        rising
    }

    /// Feed one connectivity value through edge detection and, on an
    /// offline to online edge, sync before returning.
    pub async fn handle_connectivity(&self, online: bool) -> Option<TriggerOutcome> {
        if self.observe(online) {
            tracing::info!("connection restored, syncing");
            Some(self.trigger().await)
        } else {
            None
        }
    }

    /// Run a sync pass now, or request a rerun if one is in flight.
    pub async fn trigger(&self) -> TriggerOutcome {
        {
            let mut state = lock(&self.inner.state);
            if state.phase == SyncPhase::Syncing {
                state.rerun_requested = true;
                tracing::debug!("sync already running, rerun requested");
                return TriggerOutcome::Coalesced;
            }
            state.phase = SyncPhase::Syncing;
            state.rerun_requested = false;
        }

        let guard = match self.inner.lease.acquire() {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::info!("another process is syncing, skipping this pass");
                self.set_idle();
                return TriggerOutcome::Skipped;
            }
            Err(e) => {
                tracing::warn!("could not take the sync lease, skipping this pass: {e}");
                self.set_idle();
                return TriggerOutcome::Skipped;
            }
        };

        let mut passes = 0;
        loop {
            self.run_pass(&guard).await;
            passes += 1;

            let rerun = {
                let mut state = lock(&self.inner.state);
                let rerun =
                    state.rerun_requested && passes < 2 && self.inner.monitor.get_status();
                state.rerun_requested = false;
                rerun
            };
            if !rerun {
                break;
            }
            tracing::debug!("connectivity changed during sync, running once more");
        }

        // released before going idle so the next pass can take it again
        drop(guard);
        self.set_idle();
        TriggerOutcome::Completed { passes }
    }

    fn set_idle(&self) {
        lock(&self.inner.state).phase = SyncPhase::Idle;
    }

    async fn run_pass(&self, lease: &LeaseGuard<'_>) {
        let started = Instant::now();
        let mut failures = Vec::new();

        for domain in &self.inner.domains {
            match lease.renew() {
                Ok(true) => {}
                Ok(false) => {
                    tracing::error!("sync lease was taken over, abandoning this pass");
                    failures.push("sync lease lost".to_string());
                    break;
                }
                Err(e) => tracing::warn!("could not renew the sync lease: {e}"),
            }

            match domain.sync().await {
                Ok(report) => {
                    let r = report.replay;
                    tracing::info!(
                        domain = report.domain,
                        attempted = r.attempted,
                        succeeded = r.succeeded,
                        retained = r.retained,
                        deferred = r.deferred,
                        dead_lettered = r.dead_lettered,
                        "domain synced"
                    );
                }
                Err(e) => {
                    tracing::error!(domain = domain.name(), "sync failed: {e:#}");
                    failures.push(format!("{}: {e:#}", domain.name()));
                }
            }
        }

        let pending = self.inner.log.pending_total().unwrap_or_else(|e| {
            tracing::warn!("could not count pending mutations: {e}");
            0
        });
        let last_error = (!failures.is_empty()).then(|| failures.join("; "));
        self.inner.status.record_pass(pending, last_error);

        tracing::info!(
            pending,
            failed = failures.len(),
            "sync pass finished in {:?}",
            started.elapsed()
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
