//! Worker Configuration
//!
//! Defines the configuration for the crawl worker including:
//! - Remote assignment API location and credentials
//! - Worker intake cadence (poll, heartbeat, SSE backoff)
//! - Crawler sidecar container
//! - Supervised node subprocess
//! - Uptime cycle tracking
//!
//! Every section has a `Default` so a missing or partial TOML file still
//! yields a usable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crawler::CacheMode;

/// Environment override for the API base URL
pub const ENV_API_URL: &str = "CRAWL_WORKER_API_URL";
/// Environment override for the bearer token
pub const ENV_TOKEN: &str = "CRAWL_WORKER_TOKEN";
/// Environment override for the local data directory
pub const ENV_DATA_DIR: &str = "CRAWL_WORKER_DATA_DIR";

/// Complete worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api: ApiConfig,
    pub worker: WorkerConfig,
    pub sidecar: SidecarConfig,
    pub crawler: CrawlerConfig,
    pub node: NodeConfig,
    pub uptime: UptimeConfig,
}

impl Settings {
    /// Parse settings from a TOML string
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Invalid worker configuration")
    }

    /// Read settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&raw)
    }

    /// Load settings from an optional file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Apply `CRAWL_WORKER_*` environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_API_URL) {
            if !url.trim().is_empty() {
                self.api.base_url = url;
            }
        }
        if let Ok(token) = std::env::var(ENV_TOKEN) {
            if !token.trim().is_empty() {
                self.api.token = Some(token);
            }
        }
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            if !dir.trim().is_empty() {
                self.uptime.data_dir = PathBuf::from(dir);
            }
        }
    }
}

/// Remote assignment API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the job-distribution API
    pub base_url: String,
    /// Static bearer token (normally supplied by the embedding shell)
    pub token: Option<String>,
    /// Timeout for regular API requests
    pub request_timeout_secs: u64,
    /// Connect timeout for the SSE stream (the stream itself has no deadline)
    pub stream_connect_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            token: None,
            request_timeout_secs: 30,
            stream_connect_timeout_secs: 10,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_connect_timeout_secs)
    }
}

/// Assignment worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Fallback poll interval
    pub poll_interval_secs: u64,
    /// Heartbeat interval
    pub heartbeat_interval_secs: u64,
    /// First SSE reconnect delay
    pub sse_backoff_base_ms: u64,
    /// Maximum SSE reconnect delay
    pub sse_backoff_max_ms: u64,
    /// Page size for assignment listing
    pub fetch_limit: u32,
    /// Platforms this worker accepts (empty = all)
    pub platforms: Vec<String>,
    /// How long a claim protects an assignment from being picked up again
    pub claim_ttl_secs: u64,
    /// Maximum assignments processed at the same time
    pub max_concurrent: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            heartbeat_interval_secs: 30,
            sse_backoff_base_ms: 2_000,
            sse_backoff_max_ms: 10_000,
            fetch_limit: 10,
            platforms: Vec::new(),
            claim_ttl_secs: 600,
            max_concurrent: 2,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn sse_backoff_base(&self) -> Duration {
        Duration::from_millis(self.sse_backoff_base_ms)
    }

    pub fn sse_backoff_max(&self) -> Duration {
        Duration::from_millis(self.sse_backoff_max_ms)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }
}

/// Crawler sidecar container configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Container name (deterministic, reused across restarts)
    pub container_name: String,
    /// Image reference
    pub image: String,
    /// Port published on the host loopback
    pub host_port: u16,
    /// Port the crawler listens on inside the container
    pub container_port: u16,
    /// Docker restart policy
    pub restart_policy: String,
    /// Extra environment for the container
    pub env: BTreeMap<String, String>,
    /// Health polls before giving up
    pub health_retries: u32,
    /// Delay between health polls
    pub health_delay_ms: u64,
    /// Extra directories to search for the docker binary
    pub docker_search_paths: Vec<PathBuf>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            container_name: "crawl-worker-crawler".to_string(),
            image: "unclecode/crawl4ai:latest".to_string(),
            host_port: 11235,
            container_port: 11235,
            restart_policy: "unless-stopped".to_string(),
            env: BTreeMap::new(),
            health_retries: 30,
            health_delay_ms: 2_000,
            docker_search_paths: Vec::new(),
        }
    }
}

impl SidecarConfig {
    pub fn health_delay(&self) -> Duration {
        Duration::from_millis(self.health_delay_ms)
    }
}

/// Crawler HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Timeout for a single crawl call
    pub crawl_timeout_secs: u64,
    /// Timeout for the sidecar health probe
    pub health_timeout_ms: u64,
    /// Default cache policy sent with crawls
    pub cache_mode: CacheMode,
    /// Render without images/heavy assets
    pub light_mode: bool,
    /// Text-only rendering
    pub text_mode: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            crawl_timeout_secs: 90,
            health_timeout_ms: 2_000,
            cache_mode: CacheMode::Bypass,
            light_mode: true,
            text_mode: false,
        }
    }
}

impl CrawlerConfig {
    pub fn crawl_timeout(&self) -> Duration {
        Duration::from_secs(self.crawl_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

/// Supervised node subprocess configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Path to the CLI binary; `None` disables supervision
    pub program: Option<PathBuf>,
    /// Arguments placed before `--port <n>`
    pub args: Vec<String>,
    /// Health polls during start
    pub health_retries: u32,
    /// Delay between health polls
    pub health_delay_ms: u64,
    /// Timeout for one health request
    pub health_timeout_ms: u64,
    /// Restarts allowed before giving up
    pub max_restarts: u32,
    /// Delay before each restart
    pub restart_delay_ms: u64,
    /// Time a process must stay ready before the restart budget refills
    pub stable_after_secs: u64,
    /// Grace period for the process to exit after termination
    pub stop_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            health_retries: 20,
            health_delay_ms: 500,
            health_timeout_ms: 2_000,
            max_restarts: 5,
            restart_delay_ms: 2_000,
            stable_after_secs: 60,
            stop_timeout_ms: 5_000,
        }
    }
}

impl NodeConfig {
    pub fn health_delay(&self) -> Duration {
        Duration::from_millis(self.health_delay_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_secs(self.stable_after_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Uptime cycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UptimeConfig {
    /// Tick size (also the uptime increment per tick)
    pub tick_secs: u64,
    /// Length of one reward cycle
    pub cycle_secs: u64,
    /// Directory holding the persisted cycle
    pub data_dir: PathBuf,
}

impl Default for UptimeConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            cycle_secs: 3_600,
            data_dir: default_data_dir(),
        }
    }
}

impl UptimeConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn cycle_ms(&self) -> i64 {
        (self.cycle_secs as i64).saturating_mul(1_000)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("uptime.json")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("crawl-worker")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.worker.poll_interval(), Duration::from_secs(30));
        assert_eq!(settings.worker.sse_backoff_base(), Duration::from_secs(2));
        assert_eq!(settings.worker.sse_backoff_max(), Duration::from_secs(10));
        assert_eq!(settings.crawler.crawl_timeout(), Duration::from_secs(90));
        assert_eq!(settings.crawler.health_timeout(), Duration::from_secs(2));
        assert_eq!(settings.node.max_restarts, 5);
        assert_eq!(settings.node.restart_delay(), Duration::from_secs(2));
        assert!(settings.node.program.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let settings = Settings::from_toml(
            r#"
            [api]
            base_url = "https://jobs.example.com"

            [worker]
            platforms = ["reddit", "x"]

            [sidecar]
            host_port = 12000
            "#,
        )
        .unwrap();

        assert_eq!(settings.api.base_url, "https://jobs.example.com");
        assert_eq!(settings.worker.platforms, vec!["reddit", "x"]);
        assert_eq!(settings.worker.poll_interval_secs, 30);
        assert_eq!(settings.sidecar.host_port, 12000);
        assert_eq!(settings.sidecar.container_port, 11235);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(Settings::from_toml("[worker]\npoll_interval_secs = \"soon\"").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, "[uptime]\ncycle_secs = 120\n").unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.uptime.cycle_ms(), 120_000);
        assert!(Settings::from_file(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var(ENV_API_URL, "https://override.example.com");
        std::env::set_var(ENV_TOKEN, "secret");
        std::env::set_var(ENV_DATA_DIR, "/tmp/crawl-worker-test");

        let settings = Settings::load(None).unwrap();

        std::env::remove_var(ENV_API_URL);
        std::env::remove_var(ENV_TOKEN);
        std::env::remove_var(ENV_DATA_DIR);

        assert_eq!(settings.api.base_url, "https://override.example.com");
        assert_eq!(settings.api.token.as_deref(), Some("secret"));
        assert_eq!(
            settings.uptime.state_path(),
            PathBuf::from("/tmp/crawl-worker-test/uptime.json")
        );
    }

    #[test]
    #[serial]
    fn test_blank_env_ignored() {
        std::env::set_var(ENV_API_URL, "  ");
        let settings = Settings::load(None).unwrap();
        std::env::remove_var(ENV_API_URL);

        assert_eq!(settings.api.base_url, ApiConfig::default().base_url);
    }
}
