//! Batch queueing system boundary.
//!
//! [`BatchQueue`] accepts a submission script and hands back a live
//! [`BatchJob`]. Two implementations ship with the crate: [`SlurmQueue`]
//! (see `slurm.rs`) for clusters, and [`ShellQueue`], which runs the script
//! with `sh` on the local machine.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{Result, WrapperError};

pub use crate::slurm::SlurmQueue;

/// When to delete a job's stdout/stderr files after it terminates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdFilesRemoval {
    /// Only after a zero exit code.
    #[default]
    Success,
    Always,
    Never,
}

impl StdFilesRemoval {
    pub fn should_remove(self, exit_code: i32) -> bool {
        match self {
            StdFilesRemoval::Success => exit_code == 0,
            StdFilesRemoval::Always => true,
            StdFilesRemoval::Never => false,
        }
    }
}

/// Everything a queue needs to submit one job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_name: String,
    pub script: PathBuf,
    pub workdir: PathBuf,
    pub std_files_removal: StdFilesRemoval,
    pub poll_interval: Duration,
}

/// Terminal state of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait BatchQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, spec: JobSpec) -> Result<Arc<dyn BatchJob>>;
}

/// Handle on one submitted job.
#[async_trait]
pub trait BatchJob: Send + Sync {
    /// Queue-assigned id.
    fn job_id(&self) -> &str;

    /// Suspend until the job is terminal. Dropping the future does not
    /// affect the job.
    async fn wait(&self) -> Result<JobOutput>;

    /// Forcefully terminate the job.
    async fn kill(&self) -> Result<()>;

    /// `Some` once a terminal state was observed.
    fn exit_code(&self) -> Option<i32>;
}

pub(crate) fn std_file_paths(workdir: &Path, job_name: &str, job_id: &str) -> (PathBuf, PathBuf) {
    (
        workdir.join(format!("{job_name}.out.{job_id}")),
        workdir.join(format!("{job_name}.err.{job_id}")),
    )
}

/// Read a job's captured output and apply the removal policy.
pub(crate) async fn collect_std_files(
    out_path: &Path,
    err_path: &Path,
    exit_code: i32,
    removal: StdFilesRemoval,
) -> JobOutput {
    let stdout = tokio::fs::read_to_string(out_path).await.unwrap_or_default();
    let stderr = tokio::fs::read_to_string(err_path).await.unwrap_or_default();
    if removal.should_remove(exit_code) {
        for p in [out_path, err_path] {
            if let Err(err) = tokio::fs::remove_file(p).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %p.display(), "failed to remove job std file: {err}");
                }
            }
        }
    }
    JobOutput {
        exit_code,
        stdout,
        stderr,
    }
}

/// Runs submission scripts with `sh` in the job's workdir.
///
/// Job ids are local sequence numbers. The child's exit state is polled, so
/// `wait` and `kill` can run concurrently on a shared handle.
#[derive(Debug)]
pub struct ShellQueue {
    shell: PathBuf,
    poll_interval: Duration,
    next_id: AtomicU64,
}

impl ShellQueue {
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("sh"),
            poll_interval: Duration::from_millis(50),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for ShellQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchQueue for ShellQueue {
    fn name(&self) -> &str {
        "shell"
    }

    async fn submit(&self, spec: JobSpec) -> Result<Arc<dyn BatchJob>> {
        let job_id = format!("local-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (out_path, err_path) = std_file_paths(&spec.workdir, &spec.job_name, &job_id);
        let stdout = std::fs::File::create(&out_path)
            .map_err(|err| WrapperError::Submission(format!("{}: {err}", out_path.display())))?;
        let stderr = std::fs::File::create(&err_path)
            .map_err(|err| WrapperError::Submission(format!("{}: {err}", err_path.display())))?;

        let mut cmd = Command::new(&self.shell);
        cmd.arg(&spec.script)
            .current_dir(&spec.workdir)
            .env("TRAJFUNC_JOB_NAME", &spec.job_name)
            .env("TRAJFUNC_JOB_ID", &job_id)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        // own process group, so kill() also reaches what the script started
        #[cfg(unix)]
        cmd.process_group(0);
        let child = cmd.spawn().map_err(|err| {
            WrapperError::Submission(format!(
                "failed to run '{}' with {}: {err}",
                spec.script.display(),
                self.shell.display()
            ))
        })?;
        let pgid = child.id();
        debug!(job_id = %job_id, job_name = %spec.job_name, pgid, "shell job started");

        Ok(Arc::new(ShellJob {
            job_id,
            shell: self.shell.clone(),
            pgid,
            child: Mutex::new(child),
            out_path,
            err_path,
            removal: spec.std_files_removal,
            poll_interval: self.poll_interval,
            exit_code: OnceLock::new(),
        }))
    }
}

struct ShellJob {
    job_id: String,
    shell: PathBuf,
    pgid: Option<u32>,
    child: Mutex<Child>,
    out_path: PathBuf,
    err_path: PathBuf,
    removal: StdFilesRemoval,
    poll_interval: Duration,
    exit_code: OnceLock<i32>,
}

impl ShellJob {
    fn lock_child(&self) -> MutexGuard<'_, Child> {
        match self.child.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// SIGKILL every process in the job's group via the shell's `kill`.
    #[cfg(unix)]
    async fn kill_group(&self, pgid: u32) -> std::io::Result<()> {
        let status = Command::new(&self.shell)
            .arg("-c")
            .arg(format!("kill -s KILL -- -{pgid}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!("kill exited with {status}")))
        }
    }

    #[cfg(not(unix))]
    async fn kill_group(&self, _pgid: u32) -> std::io::Result<()> {
        Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
    }
}

#[async_trait]
impl BatchJob for ShellJob {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    async fn wait(&self) -> Result<JobOutput> {
        let code = loop {
            if let Some(code) = self.exit_code.get() {
                break *code;
            }
            let status = self
                .lock_child()
                .try_wait()
                .map_err(|err| WrapperError::Computation(format!("failed to poll job: {err}")))?;
            if let Some(status) = status {
                // killed by a signal: no code
                let code = status.code().unwrap_or(-1);
                break *self.exit_code.get_or_init(|| code);
            }
            tokio::time::sleep(self.poll_interval).await;
        };
        Ok(collect_std_files(&self.out_path, &self.err_path, code, self.removal).await)
    }

    async fn kill(&self) -> Result<()> {
        if self.exit_code.get().is_some() {
            return Ok(());
        }
        debug!(job_id = %self.job_id, "killing shell job");
        if let Some(pgid) = self.pgid {
            match self.kill_group(pgid).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(job_id = %self.job_id, pgid, "failed to kill process group, killing the shell only: {err}")
                }
            }
        }
        self.lock_child()
            .start_kill()
            .map_err(|err| WrapperError::Computation(format!("failed to kill job: {err}")))
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }
}
