use async_trait::async_trait;
use chrono::Utc;
use std::time::{Duration, Instant};
use tend_core::{ConnectivityMonitor, NetworkInfo};
use tokio::task::JoinHandle;

/// Source of reachability observations.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn probe(&self) -> NetworkInfo;
}

/// Checks reachability with a GET against the server's health endpoint.
#[derive(Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(server_url: &str, health_path: &str, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let url = format!(
            "{}/{}",
            server_url.trim_end_matches('/'),
            health_path.trim_start_matches('/')
        );
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Reachability for HttpProbe {
    async fn probe(&self) -> NetworkInfo {
        let started = Instant::now();
        let result = self.client.get(&self.url).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        // Any HTTP answer means the network path works; only the
        // health endpoint's 5xx counts as the server being down.
        let error = match result {
            Ok(resp) if resp.status().is_server_error() => {
                Some(format!("health check returned {}", resp.status()))
            }
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        };

        NetworkInfo {
            online: error.is_none(),
            endpoint: Some(self.url.clone()),
            latency_ms: error.is_none().then_some(latency_ms),
            checked_at: Utc::now(),
            error,
        }
    }
}

/// Report a probe result into the monitor every `interval` until aborted.
pub fn spawn_probe_loop<P>(
    monitor: ConnectivityMonitor,
    probe: P,
    interval: Duration,
) -> JoinHandle<()>
where
    P: Reachability + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let info = probe.probe().await;
            if let Some(ref error) = info.error {
                tracing::debug!("reachability probe failed: {error}");
            }
            monitor.report(info);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tend_core::MemoryStore;

    #[tokio::test]
    async fn healthy_server_reports_online() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/health")
            .with_status(200)
            .with_body("OK")
            .create_async()
            .await;

        let probe = HttpProbe::new(&server.url(), "/api/health", Duration::from_secs(2)).unwrap();
        let info = probe.probe().await;
        assert!(info.online);
        assert!(info.latency_ms.is_some());
        assert_eq!(info.endpoint.as_deref(), Some(probe.url()));
    }

    #[tokio::test]
    async fn unreachable_server_reports_offline() {
        // nothing listens on port 9 locally
        let probe = HttpProbe::new("http://127.0.0.1:9", "api/health", Duration::from_millis(500)).unwrap();
        let info = probe.probe().await;
        assert!(!info.online);
        assert!(info.error.is_some());
    }

    #[tokio::test]
    async fn probe_loop_feeds_monitor() {
        struct Down;

        #[async_trait]
        impl Reachability for Down {
            async fn probe(&self) -> NetworkInfo {
                NetworkInfo::offline("no route")
            }
        }

        let monitor = ConnectivityMonitor::new(Arc::new(MemoryStore::new()));
        assert!(monitor.get_status());

        let handle = spawn_probe_loop(monitor.clone(), Down, Duration::from_millis(10));
        for _ in 0..50 {
            if !monitor.get_status() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(!monitor.get_status());
    }
}
