use anyhow::{Result, bail};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Keeper configuration, read from `config.toml` in the data directory.
/// Every key is optional; missing keys fall back to the defaults below.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    pub poll_interval_secs: u64,
    /// Watchdog: how long a run may go without a session URL before it is restarted.
    pub stall_timeout_secs: u64,
    /// Consecutive transient failures tolerated before entering `Degraded`.
    pub degraded_threshold: u32,
    pub workflow_id: String,
    pub git_ref: String,
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub log_timeout_secs: u64,
    pub run_list_limit: usize,
    pub session_history_limit: usize,
    pub run_history_limit: usize,
    pub log_level: String,
    pub retry: RetryConfig,
    pub dispatch: DispatchConfig,
    pub session: SessionPatternConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Pause between the dispatch request and looking the new run up.
    pub settle_delay_ms: u64,
    pub lookup_attempts: u32,
}

/// Grammar of the connection URL printed by the workflow: `scheme://host<path_prefix><id>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionPatternConfig {
    pub scheme: String,
    pub host: String,
    pub path_prefix: String,
    /// Also accept `host<path_prefix><id>` without the scheme and normalize it.
    pub allow_bare_host: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token required when the API listens on a non-loopback address.
    pub token: Option<String>,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            stall_timeout_secs: 300,
            degraded_threshold: 5,
            workflow_id: "vm-worker.yml".to_string(),
            git_ref: "main".to_string(),
            api_base_url: "https://api.github.com".to_string(),
            request_timeout_secs: 10,
            log_timeout_secs: 30,
            run_list_limit: 10,
            session_history_limit: 20,
            run_history_limit: 20,
            log_level: "info".to_string(),
            retry: RetryConfig::default(),
            dispatch: DispatchConfig::default(),
            session: SessionPatternConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 2000,
            lookup_attempts: 5,
        }
    }
}

impl Default for SessionPatternConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            host: "sshx.io".to_string(),
            path_prefix: "/s/".to_string(),
            allow_bare_host: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 17900,
            token: None,
        }
    }
}

impl KeeperConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join("config.toml");
        if !config_path.exists() {
            info!("No config.toml found, using defaults.");
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let config = Self::parse(&content)?;
        info!(
            "Loaded config: workflow={}, poll={}s, stall={}s, degraded_threshold={}",
            config.workflow_id,
            config.poll_interval_secs,
            config.stall_timeout_secs,
            config.degraded_threshold
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: KeeperConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        if self.stall_timeout_secs == 0 {
            bail!("stall_timeout_secs must be greater than zero");
        }
        if self.degraded_threshold == 0 {
            bail!("degraded_threshold must be greater than zero");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be greater than zero");
        }
        if self.dispatch.lookup_attempts == 0 {
            bail!("dispatch.lookup_attempts must be greater than zero");
        }
        if self.workflow_id.trim().is_empty() {
            bail!("workflow_id must not be empty");
        }
        if self.session.host.trim().is_empty() {
            bail!("session.host must not be empty");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn log_timeout(&self) -> Duration {
        Duration::from_secs(self.log_timeout_secs)
    }
}
