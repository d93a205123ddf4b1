use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Resolve the pipeline data directory path based on priority:
/// 1. Explicit path (with tilde expansion)
/// 2. TRACEPIPE_PATH environment variable (with tilde expansion)
/// 3. XDG data directory (recommended default)
/// 4. ~/.tracepipe (fallback for systems without XDG)
pub fn resolve_data_dir(explicit_path: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit_path {
        return Ok(expand_tilde(path));
    }

    if let Ok(env_path) = std::env::var("TRACEPIPE_PATH") {
        return Ok(expand_tilde(&env_path));
    }

    if let Some(data_dir) = dirs::data_dir() {
        return Ok(data_dir.join("tracepipe"));
    }

    if let Some(home) = std::env::var_os("HOME") {
        return Ok(PathBuf::from(home).join(".tracepipe"));
    }

    Err(Error::Config(
        "Could not determine data directory: no HOME directory or XDG data directory found"
            .to_string(),
    ))
}

/// Expand tilde (~) in paths to the user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(stripped);
    }
    PathBuf::from(path)
}

/// Fast-path consumer and batch-writer tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastPathConfig {
    /// Maximum events per batch
    #[serde(default = "default_b_max")]
    pub b_max: usize,

    /// Ingress poll interval when idle (ms)
    #[serde(default = "default_t_poll_ms")]
    pub t_poll_ms: u64,

    /// Wall-clock budget from the first event until the batch closes (ms)
    #[serde(default = "default_t_batch_ms")]
    pub t_batch_ms: u64,

    /// Pending age after which entries are claimed from dead consumers (ms)
    #[serde(default = "default_t_stuck_ms")]
    pub t_stuck_ms: u64,

    /// Delivery attempts before a poison entry goes to the DLQ
    #[serde(default = "default_r_max")]
    pub r_max: u32,

    /// Pause between batches while in shed+pause mode (ms)
    #[serde(default = "default_t_pause_ms")]
    pub t_pause_ms: u64,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            b_max: default_b_max(),
            t_poll_ms: default_t_poll_ms(),
            t_batch_ms: default_t_batch_ms(),
            t_stuck_ms: default_t_stuck_ms(),
            r_max: default_r_max(),
            t_pause_ms: default_t_pause_ms(),
        }
    }
}

impl FastPathConfig {
    pub fn t_poll(&self) -> Duration {
        Duration::from_millis(self.t_poll_ms)
    }
    pub fn t_batch(&self) -> Duration {
        Duration::from_millis(self.t_batch_ms)
    }
    pub fn t_stuck(&self) -> Duration {
        Duration::from_millis(self.t_stuck_ms)
    }
    pub fn t_pause(&self) -> Duration {
        Duration::from_millis(self.t_pause_ms)
    }
}

/// Worker-pool tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_n_workers")]
    pub n_workers: usize,

    /// CDC poll interval when idle (ms)
    #[serde(default = "default_t_poll_ms")]
    pub t_poll_ms: u64,

    /// Pending age after which CDC entries are claimed (ms)
    #[serde(default = "default_t_stuck_ms")]
    pub t_stuck_ms: u64,

    /// Builder retry attempts before a record is deadlettered
    #[serde(default = "default_r_max")]
    pub r_max_builder: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            n_workers: default_n_workers(),
            t_poll_ms: default_t_poll_ms(),
            t_stuck_ms: default_t_stuck_ms(),
            r_max_builder: default_r_max(),
        }
    }
}

impl WorkerConfig {
    pub fn t_poll(&self) -> Duration {
        Duration::from_millis(self.t_poll_ms)
    }
    pub fn t_stuck(&self) -> Duration {
        Duration::from_millis(self.t_stuck_ms)
    }
}

/// Backpressure monitor thresholds over CDC pending depth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Probe interval (ms)
    #[serde(default = "default_t_mon_ms")]
    pub t_mon_ms: u64,

    #[serde(default = "default_warn_depth")]
    pub warn_depth: u64,

    #[serde(default = "default_shed_depth")]
    pub shed_depth: u64,

    #[serde(default = "default_pause_depth")]
    pub pause_depth: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            t_mon_ms: default_t_mon_ms(),
            warn_depth: default_warn_depth(),
            shed_depth: default_shed_depth(),
            pause_depth: default_pause_depth(),
        }
    }
}

impl BackpressureConfig {
    pub fn t_mon(&self) -> Duration {
        Duration::from_millis(self.t_mon_ms)
    }
}

/// Stream retention bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_ingress_maxlen")]
    pub ingress_maxlen: u64,

    #[serde(default = "default_cdc_maxlen")]
    pub cdc_maxlen: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ingress_maxlen: default_ingress_maxlen(),
            cdc_maxlen: default_cdc_maxlen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline data directory; empty means "resolve at open time"
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub fast_path: FastPathConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub backpressure: BackpressureConfig,

    #[serde(default)]
    pub streams: StreamConfig,

    /// Aggregate graceful-shutdown budget (ms)
    #[serde(default = "default_t_shutdown_ms")]
    pub t_shutdown_ms: u64,

    /// CDC fallback sweep interval (ms)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            fast_path: FastPathConfig::default(),
            workers: WorkerConfig::default(),
            backpressure: BackpressureConfig::default(),
            streams: StreamConfig::default(),
            t_shutdown_ms: default_t_shutdown_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn load() -> Result<Self> {
        let config_path = Self::default_path()?;
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(resolve_data_dir(None)?.join("config.toml"))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => resolve_data_dir(None),
        }
    }

    pub fn t_shutdown(&self) -> Duration {
        Duration::from_millis(self.t_shutdown_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn default_b_max() -> usize {
    100
}
fn default_t_poll_ms() -> u64 {
    100
}
fn default_t_batch_ms() -> u64 {
    100
}
fn default_t_stuck_ms() -> u64 {
    30_000
}
fn default_r_max() -> u32 {
    5
}
fn default_t_pause_ms() -> u64 {
    1_000
}
fn default_n_workers() -> usize {
    4
}
fn default_t_mon_ms() -> u64 {
    5_000
}
fn default_warn_depth() -> u64 {
    10_000
}
fn default_shed_depth() -> u64 {
    50_000
}
fn default_pause_depth() -> u64 {
    100_000
}
fn default_ingress_maxlen() -> u64 {
    10_000
}
fn default_cdc_maxlen() -> u64 {
    100_000
}
fn default_t_shutdown_ms() -> u64 {
    10_000
}
fn default_sweep_interval_ms() -> u64 {
    5_000
}
