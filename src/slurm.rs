//! Slurm implementation of [`BatchQueue`].
//!
//! Jobs are submitted with `sbatch`, their state is polled with `sacct` and
//! they are cancelled with `scancel`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, WrapperError};
use crate::queue::{collect_std_files, std_file_paths, BatchJob, BatchQueue, JobOutput, JobSpec};

/// Submits jobs with `sbatch`, polls them with `sacct` and cancels with `scancel`.
#[derive(Debug, Clone)]
pub struct SlurmQueue {
    sbatch: PathBuf,
    sacct: PathBuf,
    scancel: PathBuf,
}

impl SlurmQueue {
    pub fn new() -> Self {
        Self {
            sbatch: PathBuf::from("sbatch"),
            sacct: PathBuf::from("sacct"),
            scancel: PathBuf::from("scancel"),
        }
    }

    /// Use non-default binaries (wrappers, absolute paths, test doubles).
    pub fn with_binaries(
        sbatch: impl Into<PathBuf>,
        sacct: impl Into<PathBuf>,
        scancel: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sbatch: sbatch.into(),
            sacct: sacct.into(),
            scancel: scancel.into(),
        }
    }
}

impl Default for SlurmQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchQueue for SlurmQueue {
    fn name(&self) -> &str {
        "slurm"
    }

    async fn submit(&self, spec: JobSpec) -> Result<Arc<dyn BatchJob>> {
        let output = Command::new(&self.sbatch)
            .arg("--parsable")
            .arg(format!("--job-name={}", spec.job_name))
            .arg(format!("--chdir={}", spec.workdir.display()))
            .arg(format!("--output={}.out.%j", spec.job_name))
            .arg(format!("--error={}.err.%j", spec.job_name))
            .arg(&spec.script)
            .stdin(Stdio::null())
            // killed if the call is dropped while sbatch runs
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                WrapperError::Submission(format!(
                    "failed to run '{}' (is slurm available?): {err}",
                    self.sbatch.display()
                ))
            })?;
        if !output.status.success() {
            return Err(WrapperError::Submission(format!(
                "sbatch exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let job_id = parse_job_id(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            WrapperError::Submission(format!(
                "could not parse job id from sbatch output '{}'",
                String::from_utf8_lossy(&output.stdout).trim()
            ))
        })?;
        info!(job_id = %job_id, job_name = %spec.job_name, "submitted slurm job");

        Ok(Arc::new(SlurmJob {
            sacct: self.sacct.clone(),
            scancel: self.scancel.clone(),
            job_id,
            spec,
            exit_code: OnceLock::new(),
        }))
    }
}

struct SlurmJob {
    sacct: PathBuf,
    scancel: PathBuf,
    job_id: String,
    spec: JobSpec,
    exit_code: OnceLock<i32>,
}

impl SlurmJob {
    async fn poll_state(&self) -> Result<Option<JobState>> {
        let output = Command::new(&self.sacct)
            .args(["--noheader", "--parsable2", "--format=State,ExitCode", "-j"])
            .arg(&self.job_id)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| {
                WrapperError::Computation(format!(
                    "failed to run '{}' for job {}: {err}",
                    self.sacct.display(),
                    self.job_id
                ))
            })?;
        if !output.status.success() {
            // accounting can lag behind submission; treat as "not yet known"
            warn!(job_id = %self.job_id, "sacct failed: {}", String::from_utf8_lossy(&output.stderr).trim());
            return Ok(None);
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .find_map(parse_sacct_line))
    }
}

#[async_trait]
impl BatchJob for SlurmJob {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    async fn wait(&self) -> Result<JobOutput> {
        let code = loop {
            if let Some(code) = self.exit_code.get() {
                break *code;
            }
            if let Some(state) = self.poll_state().await? {
                if let Some(code) = state.terminal_exit_code() {
                    debug!(job_id = %self.job_id, state = %state.state, code, "slurm job terminal");
                    break *self.exit_code.get_or_init(|| code);
                }
            }
            tokio::time::sleep(self.spec.poll_interval).await;
        };
        let (out_path, err_path) =
            std_file_paths(&self.spec.workdir, &self.spec.job_name, &self.job_id);
        Ok(collect_std_files(&out_path, &err_path, code, self.spec.std_files_removal).await)
    }

    async fn kill(&self) -> Result<()> {
        if self.exit_code.get().is_some() {
            return Ok(());
        }
        info!(job_id = %self.job_id, "cancelling slurm job");
        let status = Command::new(&self.scancel)
            .arg(&self.job_id)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|err| {
                WrapperError::Computation(format!(
                    "failed to run '{}' for job {}: {err}",
                    self.scancel.display(),
                    self.job_id
                ))
            })?;
        if !status.success() {
            return Err(WrapperError::Computation(format!(
                "scancel {} exited with {:?}",
                self.job_id,
                status.code()
            )));
        }
        Ok(())
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct JobState {
    state: String,
    exit_code: i32,
    signal: i32,
}

const TERMINAL_STATES: &[&str] = &[
    "COMPLETED",
    "FAILED",
    "CANCELLED",
    "TIMEOUT",
    "OUT_OF_MEMORY",
    "NODE_FAIL",
    "PREEMPTED",
    "BOOT_FAIL",
    "DEADLINE",
];

impl JobState {
    /// Exit code if terminal. Non-completed jobs never report success.
    fn terminal_exit_code(&self) -> Option<i32> {
        if !TERMINAL_STATES.contains(&self.state.as_str()) {
            return None;
        }
        if self.state == "COMPLETED" {
            return Some(self.exit_code);
        }
        Some(match (self.exit_code, self.signal) {
            (0, 0) => 1,
            (0, sig) => 128 + sig,
            (code, _) => code,
        })
    }
}

/// `12345` or `12345;cluster`.
fn parse_job_id(stdout: &str) -> Option<String> {
    let first = stdout.lines().next()?.trim();
    let id = first.split(';').next()?.trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_')).then(|| id.to_string())
}

/// One `--parsable2` line `STATE|EXIT:SIGNAL`, e.g. `CANCELLED by 1000|0:15`.
fn parse_sacct_line(line: &str) -> Option<JobState> {
    let (state, code) = line.trim().split_once('|')?;
    let state = state.split_whitespace().next()?.to_string();
    let (exit, signal) = code.split_once(':')?;
    Some(JobState {
        state,
        exit_code: exit.trim().parse().ok()?,
        signal: signal.trim().parse().ok()?,
    })
}
