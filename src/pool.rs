//! Shared counting permits bounding local workers, open files and queued jobs.
//!
//! Every backend receives an `Arc<ResourcePools>` at construction time and
//! acquires a permit from the matching pool before entering a constrained
//! section. A pool without a capacity applies no limit; its permits are
//! handed out immediately and only counted.
//!
//! Permits are RAII guards: dropping one releases the slot, which makes the
//! release happen exactly once on success, error and cancellation alike.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{Result, WrapperError};

/// What a permit is guarding.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum PermitKind {
    /// Concurrent in-process worker launches.
    LocalProcess,
    /// Concurrently open files (submission script writes).
    OpenFiles,
    /// Submitted batch jobs that have not terminated yet.
    QueuedJobs,
}

impl fmt::Display for PermitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalProcess => write!(f, "LocalProcess"),
            Self::OpenFiles => write!(f, "OpenFiles"),
            Self::QueuedJobs => write!(f, "QueuedJobs"),
        }
    }
}

/// A single counting pool. `semaphore` is `None` for unbounded pools.
#[derive(Debug)]
pub struct ResourcePool {
    kind: PermitKind,
    semaphore: Option<Arc<Semaphore>>,
    capacity: Option<usize>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: AtomicUsize,
    closed: AtomicBool,
}

impl ResourcePool {
    /// `None` or `Some(0)` means unbounded.
    pub fn new(kind: PermitKind, capacity: Option<usize>) -> Self {
        let capacity = capacity.filter(|c| *c > 0);
        Self {
            kind,
            semaphore: capacity.map(|c| Arc::new(Semaphore::new(c))),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Acquires a permit, suspending until one is available.
    pub async fn acquire(&self) -> Result<ResourcePermit> {
        if self.is_closed() {
            return Err(WrapperError::PoolClosed);
        }
        let permit = match &self.semaphore {
            Some(sem) => {
                let sem = Arc::clone(sem);
                Some(
                    sem.acquire_owned()
                        .await
                        .map_err(|_| WrapperError::PoolClosed)?,
                )
            }
            None => None,
        };
        Ok(self.track(permit))
    }

    /// Returns `None` if the pool is saturated or closed.
    pub fn try_acquire(&self) -> Option<ResourcePermit> {
        if self.is_closed() {
            return None;
        }
        let permit = match &self.semaphore {
            Some(sem) => Some(Arc::clone(sem).try_acquire_owned().ok()?),
            None => None,
        };
        Some(self.track(permit))
    }

    fn track(&self, permit: Option<OwnedSemaphorePermit>) -> ResourcePermit {
        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::Relaxed);
        debug!(kind = %self.kind, in_flight = current, "permit acquired");
        ResourcePermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
            kind: self.kind,
        }
    }

    pub fn kind(&self) -> PermitKind {
        self.kind
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn is_bounded(&self) -> bool {
        self.semaphore.is_some()
    }

    /// Free slots; `None` for unbounded pools.
    pub fn available(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    pub fn reset_peak(&self) {
        self.peak_in_flight.store(0, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(sem) = &self.semaphore {
            sem.close();
        }
    }
}

/// A held slot in a [`ResourcePool`]; released on drop.
pub struct ResourcePermit {
    _permit: Option<OwnedSemaphorePermit>,
    in_flight: Arc<AtomicUsize>,
    kind: PermitKind,
}

impl ResourcePermit {
    pub fn kind(&self) -> PermitKind {
        self.kind
    }
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for ResourcePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePermit")
            .field("kind", &self.kind)
            .field("bounded", &self._permit.is_some())
            .finish()
    }
}

/// The process' set of pools, one per [`PermitKind`].
pub struct ResourcePools {
    local_process: ResourcePool,
    open_files: ResourcePool,
    queued_jobs: ResourcePool,
}

impl ResourcePools {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            local_process: ResourcePool::new(PermitKind::LocalProcess, config.max_processes),
            open_files: ResourcePool::new(PermitKind::OpenFiles, config.max_files_open),
            queued_jobs: ResourcePool::new(PermitKind::QueuedJobs, config.max_queued_jobs),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(&PoolConfig::default())
    }

    /// Pools that never block. Handy for tests and one-off tools.
    pub fn unbounded() -> Self {
        Self::new(&PoolConfig {
            max_processes: None,
            max_files_open: None,
            max_queued_jobs: None,
        })
    }

    pub fn get(&self, kind: PermitKind) -> &ResourcePool {
        match kind {
            PermitKind::LocalProcess => &self.local_process,
            PermitKind::OpenFiles => &self.open_files,
            PermitKind::QueuedJobs => &self.queued_jobs,
        }
    }

    pub async fn acquire(&self, kind: PermitKind) -> Result<ResourcePermit> {
        self.get(kind).acquire().await
    }

    pub fn try_acquire(&self, kind: PermitKind) -> Option<ResourcePermit> {
        self.get(kind).try_acquire()
    }

    pub fn capacity(&self, kind: PermitKind) -> Option<usize> {
        self.get(kind).capacity()
    }

    pub fn available(&self, kind: PermitKind) -> Option<usize> {
        self.get(kind).available()
    }

    pub fn in_flight(&self, kind: PermitKind) -> usize {
        self.get(kind).in_flight()
    }

    pub fn peak_in_flight(&self, kind: PermitKind) -> usize {
        self.get(kind).peak_in_flight()
    }

    /// Tear down: waiting and future acquisitions fail with `PoolClosed`.
    /// Permits already held stay valid until dropped.
    pub fn close(&self) {
        self.local_process.close();
        self.open_files.close();
        self.queued_jobs.close();
    }
}

impl fmt::Debug for ResourcePools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn show(p: &ResourcePool) -> String {
            match p.capacity() {
                Some(c) => format!("{}/{}", p.in_flight(), c),
                None => format!("{}/unbounded", p.in_flight()),
            }
        }
        f.debug_struct("ResourcePools")
            .field("local_process", &show(&self.local_process))
            .field("open_files", &show(&self.open_files))
            .field("queued_jobs", &show(&self.queued_jobs))
            .finish()
    }
}
