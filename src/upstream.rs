use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::GatewayConfig;

#[derive(Clone, Debug)]
struct ClientSettings {
    request_timeout: Duration,
    proxy_url: Option<String>,
    rebuild_threshold: u32,
}

/// Long-lived upstream HTTP client. After enough consecutive client-level
/// failures (DNS, TLS, reset connections) the inner `reqwest::Client` is
/// torn down and recreated to escape pathological keep-alive state.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Arc<RwLock<reqwest::Client>>,
    consecutive_failures: Arc<AtomicU32>,
    rebuild_guard: Arc<tokio::sync::Mutex<()>>,
    settings: ClientSettings,
}

impl UpstreamClient {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, reqwest::Error> {
        Self::new(
            config.request_timeout(),
            config.upstream_proxy_url.clone(),
            config.client_rebuild_failure_threshold,
        )
    }

    pub fn new(
        request_timeout: Duration,
        proxy_url: Option<String>,
        rebuild_threshold: u32,
    ) -> Result<Self, reqwest::Error> {
        let settings = ClientSettings {
            request_timeout,
            proxy_url,
            rebuild_threshold: rebuild_threshold.max(1),
        };
        let client = build_client(&settings)?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            rebuild_guard: Arc::new(tokio::sync::Mutex::new(())),
            settings,
        })
    }

    /// Cheap handle to the current client; `reqwest::Client` is an `Arc`
    /// internally so the clone shares its connection pool.
    pub async fn client(&self) -> reqwest::Client {
        self.client.read().await.clone()
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Counts a client-level failure and rebuilds the client once per
    /// failure burst when the threshold is crossed.
    pub async fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures < self.settings.rebuild_threshold {
            return;
        }
        // try_lock keeps a burst of failing requests from stacking up
        // rebuilds; whoever loses the race rides the fresh client.
        let Ok(_guard) = self.rebuild_guard.try_lock() else {
            return;
        };
        if self.consecutive_failures.load(Ordering::Relaxed) < self.settings.rebuild_threshold {
            return;
        }
        match build_client(&self.settings) {
            Ok(fresh) => {
                *self.client.write().await = fresh;
                self.consecutive_failures.store(0, Ordering::Relaxed);
                info!("rebuilt upstream HTTP client after repeated connection failures");
            }
            Err(err) => {
                warn!(%err, "failed to rebuild upstream HTTP client");
            }
        }
    }

    #[cfg(test)]
    fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

fn build_client(settings: &ClientSettings) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(settings.request_timeout)
        .connect_timeout(Duration::from_secs(10));
    if let Some(proxy_url) = &settings.proxy_url {
        builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
    }
    builder.build()
}
