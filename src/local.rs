//! In-process execution backend.
//!
//! Each call runs on its own named OS thread so the caller's runtime keeps
//! making progress while the function works. Wrapped functions mostly end up
//! in native numeric code, so a thread is cheaper than a separate process.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, WrapperError};
use crate::identity::{derive_identity, CallKwargs, WrapperId};
use crate::pool::{PermitKind, ResourcePools};
use crate::trajectory::Trajectory;
use crate::values::Values;
use crate::wrapper::TrajectoryFunction;

/// Signature of a wrappable in-process function.
pub type LocalFn = dyn Fn(&Trajectory, &CallKwargs) -> anyhow::Result<Values> + Send + Sync;

/// Build a [`LocalFunction`] whose identity is derived from the closure's
/// own source text.
///
/// ```ignore
/// let f = local_function!(pools, |traj, kwargs| {
///     Ok(Values::from_column(vec![traj.trajectory_files().len() as f64]))
/// });
/// ```
#[macro_export]
macro_rules! local_function {
    ($pools:expr, $func:expr $(,)?) => {
        $crate::local::LocalFunction::with_source(stringify!($func), $func, $pools)
    };
}

pub struct LocalFunction {
    func: Arc<LocalFn>,
    source: Option<String>,
    call_kwargs: CallKwargs,
    id: Option<WrapperId>,
    pools: Arc<ResourcePools>,
}

impl LocalFunction {
    /// Wrap `func` identified by `source` (its definition text).
    pub fn with_source<F>(source: impl Into<String>, func: F, pools: Arc<ResourcePools>) -> Self
    where
        F: Fn(&Trajectory, &CallKwargs) -> anyhow::Result<Values> + Send + Sync + 'static,
    {
        let source = source.into();
        let call_kwargs = CallKwargs::new();
        let id = Some(derive_identity(source.as_bytes(), &call_kwargs));
        Self {
            func: Arc::new(func),
            source: Some(source),
            call_kwargs,
            id,
            pools,
        }
    }

    /// Wrap `func` without a known definition. Such a wrapper can `compute`
    /// but refuses `apply`, since its results cannot be cached safely.
    pub fn new<F>(func: F, pools: Arc<ResourcePools>) -> Self
    where
        F: Fn(&Trajectory, &CallKwargs) -> anyhow::Result<Values> + Send + Sync + 'static,
    {
        warn!("no source text for wrapped function, no caching can/will be performed");
        Self {
            func: Arc::new(func),
            source: None,
            call_kwargs: CallKwargs::new(),
            id: None,
            pools,
        }
    }

    /// Builder-style kwargs setter.
    pub fn with_call_kwargs(mut self, call_kwargs: CallKwargs) -> Self {
        self.call_kwargs = call_kwargs;
        self.refresh_id();
        self
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn refresh_id(&mut self) {
        self.id = self
            .source
            .as_ref()
            .map(|src| derive_identity(src.as_bytes(), &self.call_kwargs));
    }
}

impl fmt::Debug for LocalFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFunction")
            .field("source", &self.source)
            .field("call_kwargs", &self.call_kwargs)
            .field("id", &self.id)
            .finish()
    }
}

#[async_trait]
impl TrajectoryFunction for LocalFunction {
    fn id(&self) -> Option<&WrapperId> {
        self.id.as_ref()
    }

    fn call_kwargs(&self) -> &CallKwargs {
        &self.call_kwargs
    }

    fn set_call_kwargs(&mut self, call_kwargs: CallKwargs) -> Result<()> {
        self.call_kwargs = call_kwargs;
        self.refresh_id();
        Ok(())
    }

    async fn compute(&self, traj: &Trajectory, cancel: &CancellationToken) -> Result<Values> {
        // The permit travels with the worker: it is released when the
        // function returns, not when an impatient caller gives up.
        let permit = tokio::select! {
            p = self.pools.acquire(PermitKind::LocalProcess) => p?,
            _ = cancel.cancelled() => return Err(WrapperError::Cancelled),
        };

        let func = Arc::clone(&self.func);
        let kwargs = self.call_kwargs.clone();
        let worker_traj = traj.clone();
        let (tx, rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("trajfunc-local".to_string())
            .spawn(move || {
                let _permit = permit;
                let out = func(&worker_traj, &kwargs);
                let _ = tx.send(out);
            })
            .map_err(|err| {
                WrapperError::Computation(format!("failed to spawn local worker: {err}"))
            })?;
        debug!(trajectory = %traj, "local worker started");

        tokio::select! {
            res = rx => match res {
                Ok(Ok(values)) => Ok(values),
                Ok(Err(err)) => Err(WrapperError::Computation(format!(
                    "wrapped function failed on {traj}: {err:#}"
                ))),
                Err(_) => Err(WrapperError::Computation(format!(
                    "local worker for {traj} exited without a result (panicked)"
                ))),
            },
            _ = cancel.cancelled() => {
                debug!(trajectory = %traj, "local call cancelled, worker result will be dropped");
                Err(WrapperError::Cancelled)
            }
        }
    }
}
