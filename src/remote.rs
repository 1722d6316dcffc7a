//! Batch-queue execution backend.
//!
//! Wraps an external executable. For every trajectory a submission script is
//! rendered from a template and submitted to a [`BatchQueue`]; the executable
//! is called as
//!
//! ```text
//! <executable> <structure_file> <trajectory_file>... <result_file> [ <key> <value>]...
//! ```
//!
//! and is expected to write its values to `<result_file>.npy`, unless a
//! custom result loader is configured.
//!
//! All jobs of one wrapper share a job name (`CVfunc_id_<id>` by default) so
//! they can be cancelled as a group independent of the trajectory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RemoteConfig;
use crate::error::{Result, WrapperError};
use crate::identity::{derive_identity, CallKwargs, KwargValue, WrapperId};
use crate::pool::{PermitKind, ResourcePools};
use crate::queue::{BatchJob, BatchQueue, JobSpec};
use crate::trajectory::Trajectory;
use crate::values::{read_npy, Values};
use crate::wrapper::TrajectoryFunction;

pub const CMD_PLACEHOLDER: &str = "{cmd_str}";
pub const JOB_NAME_PREFIX: &str = "CVfunc_id_";
pub const SCRIPT_SUFFIX: &str = ".slurm";
pub const RESULT_SUFFIX: &str = ".npy";
const HASH_PART_LEN: usize = 5;

/// Custom result loader; gets the result path without extension and owns
/// cleanup of whatever it reads.
pub type ResultLoader = dyn Fn(&Path) -> anyhow::Result<Values> + Send + Sync;

/// Lifecycle of one `compute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Building,
    Submitted,
    Awaiting,
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Building => "building",
            CallState::Submitted => "submitted",
            CallState::Awaiting => "awaiting",
            CallState::Succeeded => "succeeded",
            CallState::Failed => "failed",
            CallState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Everything derived for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_name: String,
    pub workdir: PathBuf,
    pub result_file: PathBuf,
    pub script_path: PathBuf,
    pub cmd_str: String,
    pub script: String,
}

pub struct RemoteFunction {
    executable: PathBuf,
    script_template: String,
    call_kwargs: CallKwargs,
    id: WrapperId,
    queue: Arc<dyn BatchQueue>,
    pools: Arc<ResourcePools>,
    config: RemoteConfig,
    loader: Option<Arc<ResultLoader>>,
}

impl RemoteFunction {
    /// `executable` is a path or a name on `PATH`. `script_template` is the
    /// template text (recognised by a leading `#!`) or a path to a template
    /// file; it must contain exactly one `{cmd_str}`.
    pub fn new(
        executable: impl AsRef<Path>,
        script_template: &str,
        call_kwargs: CallKwargs,
        queue: Arc<dyn BatchQueue>,
        pools: Arc<ResourcePools>,
        config: RemoteConfig,
    ) -> Result<Self> {
        let executable = resolve_executable(executable.as_ref())?;
        let script_template = load_template(script_template)?;
        let id = executable_identity(&executable, &call_kwargs)?;
        debug!(executable = %executable.display(), wrapper_id = %id, "remote wrapper configured");
        Ok(Self {
            executable,
            script_template,
            call_kwargs,
            id,
            queue,
            pools,
            config,
            loader: None,
        })
    }

    pub fn with_result_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn(&Path) -> anyhow::Result<Values> + Send + Sync + 'static,
    {
        self.loader = Some(Arc::new(loader));
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn script_template(&self) -> &str {
        &self.script_template
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Swap the executable (re-validated, id recomputed).
    pub fn set_executable(&mut self, executable: impl AsRef<Path>) -> Result<()> {
        let executable = resolve_executable(executable.as_ref())?;
        self.id = executable_identity(&executable, &self.call_kwargs)?;
        self.executable = executable;
        Ok(())
    }

    pub fn job_name(&self) -> String {
        match &self.config.job_name {
            Some(name) => name.clone(),
            None => format!("{JOB_NAME_PREFIX}{}", self.id),
        }
    }

    /// Derive paths, command line and script for `traj` without touching disk.
    pub fn prepare(&self, traj: &Trajectory) -> Result<Submission> {
        let first = traj.trajectory_files().first().ok_or_else(|| {
            WrapperError::Usage(format!("{traj} has no trajectory files"))
        })?;
        let workdir = match first.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let traj_name = first
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                WrapperError::Usage(format!("'{}' has no file name", first.display()))
            })?;
        let hash_part: String = traj.trajectory_hash().chars().take(HASH_PART_LEN).collect();
        // the hash covers all parts, so multipart trajectories sharing the
        // first part never share a result file
        let result_file =
            workdir.join(format!("{traj_name}_{hash_part}_{JOB_NAME_PREFIX}{}", self.id));

        let mut cmd_str = quote(&self.executable.to_string_lossy())?;
        cmd_str.push(' ');
        cmd_str.push_str(&quote(&traj.structure_file().to_string_lossy())?);
        for part in traj.trajectory_files() {
            cmd_str.push(' ');
            cmd_str.push_str(&quote(&part.to_string_lossy())?);
        }
        cmd_str.push(' ');
        cmd_str.push_str(&quote(&result_file.to_string_lossy())?);
        cmd_str.push_str(&render_kwargs(&self.call_kwargs)?);

        let job_name = self.job_name();
        let script = self.script_template.replacen(CMD_PLACEHOLDER, &cmd_str, 1);
        let script_path = workdir.join(format!("{traj_name}_{job_name}{SCRIPT_SUFFIX}"));

        Ok(Submission {
            job_name,
            workdir,
            result_file,
            script_path,
            cmd_str,
            script,
        })
    }

    async fn write_script(&self, sub: &Submission) -> Result<()> {
        if tokio::fs::try_exists(&sub.script_path).await.unwrap_or(false) {
            error!(path = %sub.script_path.display(), "overwriting existing submission file");
        }
        let _files = self.pools.acquire(PermitKind::OpenFiles).await?;
        tokio::fs::write(&sub.script_path, &sub.script)
            .await
            .map_err(|err| {
                WrapperError::Submission(format!(
                    "failed to write submission script '{}': {err}",
                    sub.script_path.display()
                ))
            })
    }

    /// Submit, await and collect. The caller holds the queued-job permit.
    async fn run_job(
        &self,
        traj: &Trajectory,
        sub: &Submission,
        cancel: &CancellationToken,
    ) -> Result<Values> {
        let job = self
            .queue
            .submit(JobSpec {
                job_name: sub.job_name.clone(),
                script: sub.script_path.clone(),
                workdir: sub.workdir.clone(),
                std_files_removal: self.config.std_files_removal,
                poll_interval: self.config.poll_interval(),
            })
            .await?;
        trace_state(CallState::Submitted, &self.id, job.job_id());

        // Kills the job if this future is dropped before the job is terminal.
        let mut guard = KillOnDrop::new(Arc::clone(&job));
        trace_state(CallState::Awaiting, &self.id, job.job_id());

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                guard.disarm();
                if let Err(err) = job.kill().await {
                    warn!(job_id = %job.job_id(), "failed to kill cancelled job: {err}");
                }
                trace_state(CallState::Cancelled, &self.id, job.job_id());
                return Err(WrapperError::Cancelled);
            }
            out = job.wait() => out?,
        };
        guard.disarm();

        if output.exit_code != 0 {
            trace_state(CallState::Failed, &self.id, job.job_id());
            return Err(WrapperError::Execution {
                executable: self.executable.display().to_string(),
                trajectory: traj.to_string(),
                job_id: job.job_id().to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
                stdout: output.stdout,
            });
        }

        remove_quietly(&sub.script_path).await;
        let values = self.load_results(&sub.result_file).await?;
        trace_state(CallState::Succeeded, &self.id, job.job_id());
        Ok(values)
    }

    async fn load_results(&self, result_file: &Path) -> Result<Values> {
        match &self.loader {
            Some(loader) => {
                let loader = Arc::clone(loader);
                let path = result_file.to_path_buf();
                tokio::task::spawn_blocking(move || loader(&path))
                    .await
                    .map_err(|err| {
                        WrapperError::Computation(format!(
                            "custom loader on '{}' did not finish: {err}",
                            result_file.display()
                        ))
                    })?
                    .map_err(|err| {
                        WrapperError::Computation(format!(
                            "custom loader failed on '{}': {err:#}",
                            result_file.display()
                        ))
                    })
            }
            None => {
                let mut npy = result_file.as_os_str().to_owned();
                npy.push(RESULT_SUFFIX);
                let npy = PathBuf::from(npy);
                let values = read_npy(&npy).await?;
                remove_quietly(&npy).await;
                Ok(values)
            }
        }
    }
}

impl fmt::Debug for RemoteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFunction")
            .field("executable", &self.executable)
            .field("call_kwargs", &self.call_kwargs)
            .field("id", &self.id)
            .field("queue", &self.queue.name())
            .field("custom_loader", &self.loader.is_some())
            .finish()
    }
}

#[async_trait]
impl TrajectoryFunction for RemoteFunction {
    fn id(&self) -> Option<&WrapperId> {
        Some(&self.id)
    }

    fn call_kwargs(&self) -> &CallKwargs {
        &self.call_kwargs
    }

    fn set_call_kwargs(&mut self, call_kwargs: CallKwargs) -> Result<()> {
        self.id = executable_identity(&self.executable, &call_kwargs)?;
        self.call_kwargs = call_kwargs;
        Ok(())
    }

    async fn compute(&self, traj: &Trajectory, cancel: &CancellationToken) -> Result<Values> {
        trace_state(CallState::Building, &self.id, "-");
        let sub = self.prepare(traj)?;
        self.write_script(&sub).await?;

        let queued = tokio::select! {
            p = self.pools.acquire(PermitKind::QueuedJobs) => p?,
            _ = cancel.cancelled() => return Err(WrapperError::Cancelled),
        };
        let res = self.run_job(traj, &sub, cancel).await;
        drop(queued);
        res
    }
}

struct KillOnDrop {
    job: Option<Arc<dyn BatchJob>>,
}

impl KillOnDrop {
    fn new(job: Arc<dyn BatchJob>) -> Self {
        Self { job: Some(job) }
    }

    fn disarm(&mut self) {
        self.job = None;
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let Some(job) = self.job.take() else {
            return;
        };
        if job.exit_code().is_some() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(job_id = %job.job_id(), "call dropped while job in flight, killing job");
                handle.spawn(async move {
                    if let Err(err) = job.kill().await {
                        warn!(job_id = %job.job_id(), "failed to kill orphaned job: {err}");
                    }
                });
            }
            Err(_) => {
                error!(job_id = %job.job_id(), "no runtime to kill orphaned job");
            }
        }
    }
}

fn trace_state(state: CallState, id: &WrapperId, job_id: &str) {
    match state {
        CallState::Failed | CallState::Cancelled => {
            info!(wrapper_id = %id, job_id, state = %state, "batch call finished")
        }
        _ => debug!(wrapper_id = %id, job_id, state = %state, "batch call state"),
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), "failed to remove file: {err}");
    }
}

/// POSIX shell quoting: safe tokens stay bare, everything else is wrapped
/// in single quotes with embedded quotes spliced as `'"'"'`.
pub fn quote(token: &str) -> Result<String> {
    if token.contains('\0') {
        return Err(WrapperError::Config(format!(
            "cannot pass {token:?} on a command line (contains NUL)"
        )));
    }
    if token.is_empty() {
        return Ok("''".to_string());
    }
    let safe = token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        return Ok(token.to_string());
    }
    Ok(format!("'{}'", token.replace('\'', "'\"'\"'")))
}

/// ` {key} {value}` per kwarg; values are quoted, keys are option names and
/// are used as is.
pub fn render_kwargs(kwargs: &CallKwargs) -> Result<String> {
    let mut out = String::new();
    for (key, value) in kwargs.iter() {
        out.push(' ');
        out.push_str(key);
        if matches!(value, KwargValue::Flag) {
            continue;
        }
        let quoted = value
            .tokens()
            .iter()
            .map(|t| quote(t))
            .collect::<Result<Vec<_>>>()?;
        out.push(' ');
        out.push_str(&quoted.join(" "));
    }
    Ok(out)
}

/// Literal template text (leading shebang) or the contents of a template file.
pub fn load_template(template: &str) -> Result<String> {
    let text = if template.starts_with("#!") {
        template.to_string()
    } else {
        std::fs::read_to_string(template).map_err(|err| {
            WrapperError::Config(format!(
                "submission template is neither a script (no '#!') nor a readable file '{template}': {err}"
            ))
        })?
    };
    match text.matches(CMD_PLACEHOLDER).count() {
        1 => Ok(text),
        n => Err(WrapperError::Config(format!(
            "submission template must contain exactly one {CMD_PLACEHOLDER} placeholder, found {n}"
        ))),
    }
}

/// Find `name` as a path or on `PATH`; it must be an executable file.
pub fn resolve_executable(name: &Path) -> Result<PathBuf> {
    if name.components().count() > 1 || name.is_absolute() {
        return if is_executable(name) {
            Ok(name.to_path_buf())
        } else {
            Err(WrapperError::Config(format!(
                "'{}' is not an executable file",
                name.display()
            )))
        };
    }
    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| {
            WrapperError::Config(format!(
                "executable '{}' not found on PATH",
                name.display()
            ))
        })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Identity of a remote wrapper for `executable` called with `call_kwargs`.
pub fn executable_identity(executable: &Path, call_kwargs: &CallKwargs) -> Result<WrapperId> {
    let bytes = std::fs::read(executable).map_err(|err| {
        WrapperError::Config(format!(
            "failed to read executable '{}': {err}",
            executable.display()
        ))
    })?;
    Ok(derive_identity(&bytes, call_kwargs))
}
