//! Pool limits and batch settings, loaded from YAML with `TRAJFUNC_*`
//! environment overrides.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::queue::StdFilesRemoval;

pub const ENV_MAX_PROCESSES: &str = "TRAJFUNC_MAX_PROCESSES";
pub const ENV_MAX_FILES_OPEN: &str = "TRAJFUNC_MAX_FILES_OPEN";
pub const ENV_MAX_QUEUED_JOBS: &str = "TRAJFUNC_MAX_QUEUED_JOBS";
pub const ENV_POLL_INTERVAL_SECS: &str = "TRAJFUNC_POLL_INTERVAL_SECS";

const DEFAULT_MAX_FILES_OPEN: usize = 512;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Capacities of the shared permit pools. `None` (or 0) disables a limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Concurrent local worker launches. Defaults to the available parallelism.
    pub max_processes: Option<usize>,
    /// Concurrently open files while writing submission scripts.
    pub max_files_open: Option<usize>,
    /// Outstanding batch jobs. Unbounded by default.
    pub max_queued_jobs: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        Self {
            max_processes: Some(cpus),
            max_files_open: Some(DEFAULT_MAX_FILES_OPEN),
            max_queued_jobs: None,
        }
    }
}

/// Per-wrapper settings of the batch backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Job name override; defaults to `CVfunc_id_<wrapper id>`.
    pub job_name: Option<String>,
    /// Seconds between job state polls.
    pub poll_interval_secs: u64,
    /// When the job's stdout/stderr files are removed.
    pub std_files_removal: StdFilesRemoval,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            job_name: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            std_files_removal: StdFilesRemoval::Success,
        }
    }
}

impl RemoteConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Top-level settings document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pools: PoolConfig,
    pub remote: RemoteConfig,
}

impl Settings {
    /// Load a YAML settings file, then apply environment overrides.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
        let mut settings: Settings = serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut settings = Settings::default();
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_usize(ENV_MAX_PROCESSES)? {
            self.pools.max_processes = limit(v);
        }
        if let Some(v) = env_usize(ENV_MAX_FILES_OPEN)? {
            self.pools.max_files_open = limit(v);
        }
        if let Some(v) = env_usize(ENV_MAX_QUEUED_JOBS)? {
            self.pools.max_queued_jobs = limit(v);
        }
        if let Some(v) = env_usize(ENV_POLL_INTERVAL_SECS)? {
            if v == 0 {
                return Err(anyhow!(
                    "invalid {ENV_POLL_INTERVAL_SECS}: '0' (must be a positive integer)"
                ));
            }
            self.remote.poll_interval_secs = v as u64;
        }
        Ok(())
    }
}

fn limit(v: usize) -> Option<usize> {
    (v > 0).then_some(v)
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    let Some(raw) = env::var_os(key) else {
        return Ok(None);
    };
    let raw = raw.to_string_lossy();
    let parsed: usize = raw
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid {key}: '{raw}' (must be a non-negative integer)"))?;
    Ok(Some(parsed))
}
