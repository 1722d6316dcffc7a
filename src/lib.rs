//! `trajfunc`: cached, resource-bounded application of analysis functions to
//! simulation trajectories.
//!
//! A wrapper binds a computation to fixed call kwargs and derives a
//! deterministic identity from both. Trajectories cache results per identity,
//! so equal configurations are computed once. Two backends exist:
//!
//! - `local`: an in-process function run on a dedicated worker thread
//! - `remote`: an external executable submitted to a batch queue (Slurm or
//!   a local shell)
//!
//! Invariants:
//! - identities never depend on kwarg insertion order
//! - at most one computation per `(trajectory, identity)`
//! - every permit is released on every exit path
//! - a cancelled batch call kills its job before the cancellation surfaces

pub mod config;
pub mod error;
pub mod identity;
pub mod local;
pub mod pool;
pub mod queue;
pub mod remote;
pub mod slurm;
pub mod trajectory;
pub mod values;
pub mod wrapper;

pub use error::{Result, WrapperError};
pub use identity::{derive_identity, CallKwargs, KwargValue, WrapperId};
pub use local::LocalFunction;
pub use pool::{PermitKind, ResourcePools};
pub use queue::{BatchJob, BatchQueue, JobOutput, JobSpec, ShellQueue, SlurmQueue, StdFilesRemoval};
pub use remote::RemoteFunction;
pub use trajectory::Trajectory;
pub use values::Values;
pub use wrapper::{FunctionWrapper, TrajectoryFunction};
