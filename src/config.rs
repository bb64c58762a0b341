//! Configuration loader and validator for the offload service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub storage: Storage,
    #[serde(default)]
    pub sweeps: Sweeps,
    #[serde(default)]
    pub optimizer: Optimizer,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub uploads_dir: String,
    /// Interval between orchestrated batch calls.
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

/// Object storage gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Storage {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub token: String,
    pub bucket: String,
    #[serde(default)]
    pub base_prefix: String,
    #[serde(default)]
    pub public_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_list_page_size")]
    pub list_page_size: u32,
}

/// Defaults applied to sweeps started without explicit options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Sweeps {
    pub batch_size: u32,
    pub error_log_limit: usize,
    pub remove_local: bool,
    pub auto_fix: bool,
}

impl Default for Sweeps {
    fn default() -> Self {
        Self {
            batch_size: 50,
            error_log_limit: 50,
            remove_local: false,
            auto_fix: false,
        }
    }
}

/// External image optimizer invocation. `{file}` in `args` is replaced by the
/// file path; when absent the path is appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Optimizer {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_optimizer_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: default_optimizer_timeout_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_list_page_size() -> u32 {
    1000
}

fn default_optimizer_timeout_secs() -> u64 {
    120
}

impl App {
    /// Expand a leading `~/` in `data_dir`.
    pub fn resolved_data_dir(&self) -> String {
        expand_home(&self.data_dir)
    }

    pub fn resolved_uploads_dir(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.uploads_dir))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl Storage {
    /// Storage is usable once an endpoint is set.
    pub fn is_configured(&self) -> bool {
        !self.endpoint.trim().is_empty()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home.trim_end_matches('/'), rest);
        }
    }
    path.to_string()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// SQLite URL, honouring a `DATABASE_URL` override.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/offload.db", self.app.resolved_data_dir()))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
///
/// An empty `storage.endpoint` is accepted here; sweeps that need storage
/// reject it when they start.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.uploads_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.uploads_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.storage.bucket.trim().is_empty() {
        return Err(ConfigError::Invalid("storage.bucket must be non-empty"));
    }
    if cfg.storage.base_prefix.starts_with('/') {
        return Err(ConfigError::Invalid(
            "storage.base_prefix must be relative (no leading '/')",
        ));
    }
    if cfg.storage.list_page_size == 0 {
        return Err(ConfigError::Invalid("storage.list_page_size must be > 0"));
    }

    if cfg.sweeps.batch_size == 0 {
        return Err(ConfigError::Invalid("sweeps.batch_size must be > 0"));
    }
    if cfg.sweeps.error_log_limit == 0 {
        return Err(ConfigError::Invalid("sweeps.error_log_limit must be > 0"));
    }

    if let Some(cmd) = &cfg.optimizer.command {
        if cmd.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "optimizer.command must be non-empty when set",
            ));
        }
    }

    Ok(())
}

/// Returns the example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  uploads_dir: "./uploads"
  poll_interval_ms: 2000
  max_retries: 3
  retry_base_delay_ms: 1000

storage:
  endpoint: "https://objects.example.com/"
  token: "YOUR_STORAGE_TOKEN"
  bucket: "media"
  base_prefix: "site/uploads"
  public_url: "https://cdn.example.com"
  request_timeout_secs: 60
  list_page_size: 1000

sweeps:
  batch_size: 50
  error_log_limit: 50
  remove_local: false
  auto_fix: false

optimizer:
  command: "jpegoptim"
  args: ["--strip-all", "--max=85", "{file}"]
  timeout_secs: 120
"#
}
