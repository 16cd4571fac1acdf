//! Online/offline signal shared by everything that needs the network.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::storage::{JsonStore, KeyValueStore};

const ONLINE_KEY: &str = "network/online";

/// Result of the latest reachability check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NetworkInfo {
    pub fn online() -> Self {
        Self {
            online: true,
            endpoint: None,
            latency_ms: None,
            checked_at: Utc::now(),
            error: None,
        }
    }

    pub fn offline(error: impl Into<String>) -> Self {
        Self {
            online: false,
            endpoint: None,
            latency_ms: None,
            checked_at: Utc::now(),
            error: Some(error.into()),
        }
    }
}

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

struct MonitorState {
    online: bool,
    info: Option<NetworkInfo>,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    state: Mutex<MonitorState>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

/// Tracks reachability and fans transitions out to listeners.
///
/// Cloning is cheap; all clones share the same state and listeners.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl ConnectivityMonitor {
    /// Starts from the last persisted value, or online when there is none.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let online = match store.get_json::<bool>(ONLINE_KEY) {
            Ok(Some(online)) => online,
            Ok(None) => true,
            Err(e) => {
                tracing::warn!("could not read persisted connectivity state: {e}");
                true
            }
        };
        Self {
            inner: Arc::new(Inner {
                store,
                state: Mutex::new(MonitorState { online, info: None }),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn get_status(&self) -> bool {
        match self.inner.state.lock() {
            Ok(state) => state.online,
            Err(poisoned) => poisoned.into_inner().online,
        }
    }

    pub fn get_detailed_info(&self) -> Option<NetworkInfo> {
        match self.inner.state.lock() {
            Ok(state) => state.info.clone(),
            Err(poisoned) => poisoned.into_inner().info.clone(),
        }
    }

    /// Register a listener called with the new value on every transition.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }
        Subscription {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Feed one reachability observation into the monitor.
    ///
    /// Returns true when the online flag changed. Listeners run
    /// synchronously on the calling thread, after the state lock is released.
    pub fn report(&self, info: NetworkInfo) -> bool {
        let online = info.online;
        let changed = {
            let mut state = match self.inner.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            let changed = state.online != online;
            state.online = online;
            state.info = Some(info);
            changed
        };
        if !changed {
            return false;
        }

        if online {
            tracing::info!("network: online");
        } else {
            tracing::warn!("network: offline");
        }

        if let Err(e) = self.inner.store.set_json(ONLINE_KEY, &online) {
            tracing::warn!("failed to persist connectivity state: {e}");
        }

        let listeners: Vec<Listener> = match self.inner.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => Vec::new(),
        };
        for listener in listeners {
            listener(online);
        }
        true
    }

    /// Shorthand for reports that carry no probe details.
    pub fn set_online(&self, online: bool) -> bool {
        if online {
            self.report(NetworkInfo::online())
        } else {
            self.report(NetworkInfo::offline("reported offline"))
        }
    }
}

/// Handle returned by [`ConnectivityMonitor::subscribe`]. Dropping it
/// removes the listener.
pub struct Subscription {
    id: u64,
    monitor: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.monitor.upgrade() {
            if let Ok(mut listeners) = inner.listeners.lock() {
                listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}
