use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Runtime configuration, loaded from a JSON file by the binary. Every
/// field has a default except the administrative credentials.
#[derive(Clone, Deserialize)]
pub struct GatewayConfig {
    /// Concurrency gate capacity for outbound upstream requests.
    #[serde(default = "default_max_concurrent_upstream")]
    pub max_concurrent_upstream: usize,
    /// How long an admitted request waits for an upstream key.
    #[serde(default = "default_acquire_timeout_seconds")]
    pub acquire_timeout_seconds: u64,
    /// Total deadline for one upstream call.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Maximum gap between chunks of a streaming upstream response.
    #[serde(default = "default_stream_idle_timeout_seconds")]
    pub stream_idle_timeout_seconds: u64,
    #[serde(default = "default_base_cooldown_seconds")]
    pub base_cooldown_seconds: u64,
    #[serde(default = "default_max_cooldown_seconds")]
    pub max_cooldown_seconds: u64,
    /// Consecutive failures before a key enters cooldown.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cooldown to assume for a 429 that carries no retry-after header.
    #[serde(default = "default_rate_limit_default_wait_seconds")]
    pub rate_limit_default_wait_seconds: u64,
    /// A lease older than this is considered stuck and reclaimed.
    #[serde(default = "default_stuck_timeout_seconds")]
    pub stuck_timeout_seconds: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,
    #[serde(default)]
    pub upstream_proxy_url: Option<String>,
    /// Consecutive client-level failures before the upstream HTTP client
    /// is torn down and rebuilt.
    #[serde(default = "default_client_rebuild_failure_threshold")]
    pub client_rebuild_failure_threshold: u32,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// HS256 signing key for administrative bearer tokens.
    pub secret_key: String,
    /// Administrative login password.
    pub password: String,
    #[serde(default = "default_access_token_expire_minutes")]
    pub access_token_expire_minutes: u64,
}

fn default_max_concurrent_upstream() -> usize {
    64
}
fn default_acquire_timeout_seconds() -> u64 {
    10
}
fn default_request_timeout_seconds() -> u64 {
    120
}
fn default_stream_idle_timeout_seconds() -> u64 {
    30
}
fn default_base_cooldown_seconds() -> u64 {
    300
}
fn default_max_cooldown_seconds() -> u64 {
    43_200
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_rate_limit_default_wait_seconds() -> u64 {
    90
}
fn default_stuck_timeout_seconds() -> u64 {
    300
}
fn default_sweep_interval_seconds() -> u64 {
    60
}
fn default_upstream_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_client_rebuild_failure_threshold() -> u32 {
    3
}
fn default_database_path() -> PathBuf {
    PathBuf::from("data/rotor.sqlite")
}
fn default_access_token_expire_minutes() -> u64 {
    30
}

impl GatewayConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("max_concurrent_upstream", &self.max_concurrent_upstream)
            .field("acquire_timeout_seconds", &self.acquire_timeout_seconds)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field(
                "stream_idle_timeout_seconds",
                &self.stream_idle_timeout_seconds,
            )
            .field("base_cooldown_seconds", &self.base_cooldown_seconds)
            .field("max_cooldown_seconds", &self.max_cooldown_seconds)
            .field("failure_threshold", &self.failure_threshold)
            .field(
                "rate_limit_default_wait_seconds",
                &self.rate_limit_default_wait_seconds,
            )
            .field("stuck_timeout_seconds", &self.stuck_timeout_seconds)
            .field("sweep_interval_seconds", &self.sweep_interval_seconds)
            .field("upstream_base_url", &self.upstream_base_url)
            .field("upstream_proxy_url", &self.upstream_proxy_url)
            .field(
                "client_rebuild_failure_threshold",
                &self.client_rebuild_failure_threshold,
            )
            .field("database_path", &self.database_path)
            .field("secret_key", &"<redacted>")
            .field("password", &"<redacted>")
            .field(
                "access_token_expire_minutes",
                &self.access_token_expire_minutes,
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"secret_key":"s","password":"p"}"#).expect("parse");
        assert_eq!(config.max_concurrent_upstream, 64);
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.base_cooldown_seconds, 300);
        assert_eq!(config.max_cooldown_seconds, 43_200);
        assert_eq!(
            config.upstream_base_url,
            "https://generativelanguage.googleapis.com"
        );
        assert!(config.upstream_proxy_url.is_none());
    }

    #[test]
    fn debug_redacts_credentials() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"secret_key":"topsecret","password":"hunter2"}"#)
                .expect("parse");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("topsecret"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn missing_credentials_fail_to_parse() {
        let result = serde_json::from_str::<GatewayConfig>("{}");
        assert!(result.is_err());
    }
}
