use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tend_core::config::expand_home;
use tend_core::{
    Config, ConnectivityMonitor, InvalidationTracker, KeyValueStore, MutationLog, QueueKey,
    SqliteStore, SyncLease, SyncStatus, SyncStatusBoard,
};
use tend_proto::{MoodCheckIn, TaskDraft};
use tend_syncd::{
    spawn_probe_loop, DomainSync, FavoritesSync, HttpApi, HttpProbe, LocalOnlyApi, MoodSync,
    PlannerSync, Reachability, RemoteApi, SyncContext, SyncOrchestrator, TriggerOutcome,
};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tend-syncd",
    version,
    about = "Offline-first sync daemon for tend"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground (default)
    Run,

    /// Check connectivity once and sync if the server is reachable
    Sync,

    /// Show connection state and queued changes
    Status,

    /// Record a mood check-in
    Mood {
        /// 1 (worst) to 5 (best)
        level: u8,
        #[arg(long)]
        note: Option<String>,
        /// Tag the check-in (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Mark a coach as favorite
    Favorite {
        coach_id: String,
        /// Remove from favorites instead
        #[arg(long)]
        remove: bool,
    },

    /// Add a task
    Task {
        text: String,
        /// Server id of the project the task belongs to
        #[arg(long)]
        project: Option<i64>,
        /// Due date, YYYY-MM-DD
        #[arg(long)]
        due: Option<NaiveDate>,
    },
}

/// Everything the daemon and the one-shot commands share.
struct Services {
    config: Config,
    store: Arc<dyn KeyValueStore>,
    log: Arc<MutationLog>,
    monitor: ConnectivityMonitor,
    status: Arc<SyncStatusBoard>,
    mood: Arc<MoodSync>,
    favorites: Arc<FavoritesSync>,
    planner: Arc<PlannerSync>,
    orchestrator: SyncOrchestrator,
    probe: Option<HttpProbe>,
}

impl Services {
    fn build(config: Config) -> Result<Self> {
        let db_path = config.database_path()?;
        let store: Arc<dyn KeyValueStore> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database: {}", db_path.display()))?,
        );
        let log = Arc::new(MutationLog::new(store.clone()));
        let monitor = ConnectivityMonitor::new(store.clone());
        let status = Arc::new(SyncStatusBoard::new(store.clone()));

        let timeout = Duration::from_secs(config.sync.request_timeout_seconds);
        let (api, probe): (Arc<dyn RemoteApi>, Option<HttpProbe>) = match config.server_url() {
            Some(url) => {
                let api = HttpApi::new(url, config.sync.api_token.clone(), timeout)
                    .context("Failed to build HTTP client")?;
                let probe = HttpProbe::new(
                    url,
                    &config.network.health_path,
                    Duration::from_secs(config.network.probe_timeout_seconds),
                )
                .context("Failed to build reachability probe")?;
                (Arc::new(api), Some(probe))
            }
            None => {
                tracing::info!("no server configured, running in local-only mode");
                monitor.set_online(false);
                (Arc::new(LocalOnlyApi), None)
            }
        };

        let ctx = SyncContext {
            api,
            log: log.clone(),
            store: store.clone(),
            monitor: monitor.clone(),
            queries: Arc::new(InvalidationTracker::new()),
            policy: config.retry_policy(),
        };
        let mood = Arc::new(MoodSync::new(ctx.clone()));
        let favorites = Arc::new(FavoritesSync::new(ctx.clone()));
        let planner = Arc::new(PlannerSync::new(ctx));

        let domains: Vec<Arc<dyn DomainSync>> =
            vec![mood.clone(), favorites.clone(), planner.clone()];
        let lease = SyncLease::new(store.clone(), config.lease_ttl());
        let orchestrator = SyncOrchestrator::new(
            domains,
            monitor.clone(),
            log.clone(),
            status.clone(),
            lease,
        );

        Ok(Self {
            config,
            store,
            log,
            monitor,
            status,
            mood,
            favorites,
            planner,
            orchestrator,
            probe,
        })
    }

    /// Probe once so one-shot commands act on current connectivity.
    async fn check_connectivity(&self) -> bool {
        if let Some(probe) = &self.probe {
            self.monitor.report(probe.probe().await);
        }
        self.monitor.get_status()
    }

    fn update_pending(&self) {
        match self.log.pending_total() {
            Ok(pending) => self.status.set_pending(pending),
            Err(e) => tracing::warn!("could not count pending mutations: {e}"),
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load_or_init(&expand_home(path))?,
        None => Config::load()?,
    };
    let services = Services::build(config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(&services).await,
        Command::Sync => sync_once(&services).await,
        Command::Status => show_status(&services),
        Command::Mood { level, note, tags } => {
            let online = services.check_connectivity().await;
            let check_in = MoodCheckIn {
                note,
                tags,
                ..MoodCheckIn::new(level)
            };
            let entry = services.mood.record(check_in).await?;
            services.update_pending();
            report_write("Mood check-in", entry.status, online);
            Ok(())
        }
        Command::Favorite { coach_id, remove } => {
            let online = services.check_connectivity().await;
            services.favorites.toggle(&coach_id, !remove).await?;
            services.update_pending();
            let status = match services.favorites.favorites()?.iter().find(|f| f.id == coach_id) {
                Some(entry) => entry.status,
                None => SyncStatus::Synced,
            };
            let what = if remove { "Unfavorite" } else { "Favorite" };
            report_write(&format!("{what} {coach_id}"), status, online);
            Ok(())
        }
        Command::Task { text, project, due } => {
            let online = services.check_connectivity().await;
            let draft = TaskDraft {
                project_id: project,
                due_date: due,
                ..TaskDraft::new(text)
            };
            let task = services.planner.create_task(draft).await?;
            services.update_pending();
            report_write(&format!("Task '{}'", task.data.text), task.status, online);
            Ok(())
        }
    }
}

async fn run_daemon(services: &Services) -> Result<()> {
    tracing::info!("tend-syncd v{} starting", env!("CARGO_PKG_VERSION"));
    if let Some(url) = services.config.server_url() {
        tracing::info!("syncing with {url}");
    }

    services.orchestrator.init();
    let probe_task = services.probe.clone().map(|probe| {
        spawn_probe_loop(
            services.monitor.clone(),
            probe,
            Duration::from_secs(services.config.network.probe_interval_seconds.max(1)),
        )
    });

    // catches items whose backoff elapsed while the connection stayed up
    let mut sweep = sweep_timer(Duration::from_secs(
        services.config.sync.interval_seconds.max(1),
    ));

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                if services.monitor.get_status() && services.probe.is_some() {
                    tracing::debug!("periodic sync sweep");
                    services.orchestrator.trigger().await;
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal, stopping tend-syncd");
                break;
            }
        }
    }

    services.orchestrator.dispose();
    if let Some(task) = probe_task {
        task.abort();
    }
    Ok(())
}

/// Ticks every `period`, starting one period from now so the first sweep
/// runs after the probe loop has reported real connectivity.
fn sweep_timer(period: Duration) -> Interval {
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn sync_once(services: &Services) -> Result<()> {
    if services.probe.is_none() {
        println!("{}", "No server configured - nothing to sync".yellow());
        return Ok(());
    }
    if !services.check_connectivity().await {
        let reason = services
            .monitor
            .get_detailed_info()
            .and_then(|info| info.error)
            .unwrap_or_else(|| "unreachable".to_string());
        println!("{} ({reason}); changes stay queued", "Offline".red());
        return Ok(());
    }

    match services.orchestrator.trigger().await {
        TriggerOutcome::Completed { passes } => {
            let status = services.status.snapshot();
            println!(
                "{} ({passes} pass{}), {} change(s) still pending",
                "Synced".green(),
                if passes == 1 { "" } else { "es" },
                status.pending_changes
            );
            if let Some(error) = status.last_error {
                println!("  {} {error}", "Errors:".red());
            }
        }
        TriggerOutcome::Coalesced => println!("Sync already in progress"),
        TriggerOutcome::Skipped => println!(
            "{} another tend-syncd is syncing; changes stay queued",
            "Busy:".yellow()
        ),
    }
    Ok(())
}

fn show_status(services: &Services) -> Result<()> {
    let persisted = SyncStatusBoard::load_persisted(services.store.as_ref()).unwrap_or_default();

    println!("{}", "Sync status".cyan().bold());
    match services.config.server_url() {
        Some(url) => println!("  Server: {url}"),
        None => println!("  Mode: {}", "Local-only".yellow()),
    }
    println!(
        "  Network: {}",
        if services.monitor.get_status() {
            "Online".green()
        } else {
            "Offline".red()
        }
    );
    match persisted.last_sync {
        Some(at) => println!("  Last sync: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("  Last sync: {}", "never".dimmed()),
    }
    if let Some(error) = &persisted.last_error {
        println!("  Last error: {}", error.as_str().red());
    }
    match SyncLease::new(services.store.clone(), services.config.lease_ttl()).held_by() {
        Ok(Some(pid)) => println!("  Syncing now (process {pid})"),
        Ok(None) => {}
        Err(e) => tracing::warn!("could not read the sync lease: {e}"),
    }
    if persisted.is_stale(chrono::Utc::now()) {
        println!("  {}", "(no recent update from the daemon)".dimmed());
    }

    println!("{}", "Queued changes".cyan().bold());
    let mut any = false;
    for key in QueueKey::all() {
        let pending = services.log.len(key)?;
        let dead = services.log.dead_letters(key)?.len();
        if pending == 0 && dead == 0 {
            continue;
        }
        any = true;
        let dead = if dead > 0 {
            format!(", {dead} failed permanently").as_str().red().to_string()
        } else {
            String::new()
        };
        println!("  {key}: {pending} pending{dead}");
    }
    if !any {
        println!("  {}", "nothing queued".dimmed());
    }
    Ok(())
}

fn report_write(what: &str, status: SyncStatus, online: bool) {
    match status {
        SyncStatus::Synced => println!("{} {what}", "Saved".green()),
        SyncStatus::LocalOnly if online => {
            println!("{} {what} (server error, will retry)", "Queued".yellow())
        }
        SyncStatus::LocalOnly => println!("{} {what} (offline)", "Queued".yellow()),
    }
}
