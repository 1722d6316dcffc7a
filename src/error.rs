use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by wrappers, backends and the permit pool.
///
/// Configuration problems are raised when a wrapper is built, never deferred
/// into a running call. Everything else is returned from `compute`/`apply`
/// unchanged; backends do not retry.
#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("submission failed: {0}")]
    Submission(String),

    #[error(
        "non-zero exit code from batch job for executable {executable} on trajectory {trajectory} \
(job id {job_id}). Exit code was: {exit_code}. stderr was: {stderr}. stdout was: {stdout}"
    )]
    Execution {
        executable: String,
        trajectory: String,
        job_id: String,
        exit_code: i32,
        stderr: String,
        stdout: String,
    },

    #[error("computation failed: {0}")]
    Computation(String),

    #[error("call cancelled")]
    Cancelled,

    #[error("resource pool closed")]
    PoolClosed,

    #[error("i/o error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WrapperError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, WrapperError>;
