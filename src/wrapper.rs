//! The contract shared by all execution backends.
//!
//! Backends only supply `compute`; identity handling and the cache-aware
//! `apply` entry point are default methods layered on top.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WrapperError};
use crate::identity::{CallKwargs, WrapperId};
use crate::local::LocalFunction;
use crate::remote::RemoteFunction;
use crate::trajectory::Trajectory;
use crate::values::Values;

/// A configured, cacheable function of a trajectory.
#[async_trait]
pub trait TrajectoryFunction: Send + Sync {
    /// Cache key; `None` if this wrapper cannot be identified reproducibly.
    fn id(&self) -> Option<&WrapperId>;

    fn call_kwargs(&self) -> &CallKwargs;

    /// Replace the call kwargs and recompute the id.
    fn set_call_kwargs(&mut self, call_kwargs: CallKwargs) -> Result<()>;

    /// Compute values for `traj`, shape `(n_frames, n_dim)`, bypassing the cache.
    async fn compute(&self, traj: &Trajectory, cancel: &CancellationToken) -> Result<Values>;

    /// Cached application on `traj`.
    async fn apply(&self, traj: &Trajectory) -> Result<Values> {
        self.apply_with_cancel(traj, &CancellationToken::new()).await
    }

    /// Cached application on `traj` that stops (and kills any external job)
    /// once `cancel` fires.
    async fn apply_with_cancel(
        &self,
        traj: &Trajectory,
        cancel: &CancellationToken,
    ) -> Result<Values> {
        match self.id() {
            Some(id) => traj.apply_wrapped(id, self, cancel).await,
            None => Err(WrapperError::Usage(
                "wrapper has no identity (function source unavailable), \
its results could not be told apart from another configuration's cached values"
                    .to_string(),
            )),
        }
    }
}

/// Either backend behind one type.
#[derive(Debug)]
pub enum FunctionWrapper {
    Local(LocalFunction),
    Remote(RemoteFunction),
}

impl From<LocalFunction> for FunctionWrapper {
    fn from(f: LocalFunction) -> Self {
        FunctionWrapper::Local(f)
    }
}

impl From<RemoteFunction> for FunctionWrapper {
    fn from(f: RemoteFunction) -> Self {
        FunctionWrapper::Remote(f)
    }
}

#[async_trait]
impl TrajectoryFunction for FunctionWrapper {
    fn id(&self) -> Option<&WrapperId> {
        match self {
            FunctionWrapper::Local(f) => f.id(),
            FunctionWrapper::Remote(f) => f.id(),
        }
    }

    fn call_kwargs(&self) -> &CallKwargs {
        match self {
            FunctionWrapper::Local(f) => f.call_kwargs(),
            FunctionWrapper::Remote(f) => f.call_kwargs(),
        }
    }

    fn set_call_kwargs(&mut self, call_kwargs: CallKwargs) -> Result<()> {
        match self {
            FunctionWrapper::Local(f) => f.set_call_kwargs(call_kwargs),
            FunctionWrapper::Remote(f) => f.set_call_kwargs(call_kwargs),
        }
    }

    async fn compute(&self, traj: &Trajectory, cancel: &CancellationToken) -> Result<Values> {
        match self {
            FunctionWrapper::Local(f) => f.compute(traj, cancel).await,
            FunctionWrapper::Remote(f) => f.compute(traj, cancel).await,
        }
    }
}
