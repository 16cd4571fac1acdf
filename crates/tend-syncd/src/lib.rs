pub mod api;
pub mod domains;
pub mod orchestrator;
pub mod probe;

pub use api::{ApiError, HttpApi, LocalOnlyApi, RemoteApi};
pub use domains::{
    DomainReport, DomainSync, FavoritesSync, MoodSync, PlannerSync, ReplayOutcome, SyncContext,
};
pub use orchestrator::{SyncOrchestrator, SyncPhase, TriggerOutcome};
pub use probe::{spawn_probe_loop, HttpProbe, Reachability};
