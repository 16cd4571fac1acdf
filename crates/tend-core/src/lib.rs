pub mod cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod lease;
pub mod queue;
pub mod status;
pub mod storage;

// Re-export commonly used types
pub use cache::{EntityCache, InvalidationTracker, QueryCache, SyncStatus, Tracked};
pub use config::Config;
pub use connectivity::{ConnectivityMonitor, NetworkInfo, Subscription};
pub use error::{StorageError, StorageResult};
pub use lease::{LeaseGuard, SyncLease};
pub use queue::{
    CreateFate, Domain, MutationKind, MutationLog, PendingMutation, QueueKey, RetryPolicy,
};
pub use status::{SyncStatusBoard, SyncStatusInfo};
pub use storage::{transaction, JsonStore, KeyValueStore, MemoryStore, SqliteStore};
