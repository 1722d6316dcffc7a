//! The trajectory side of the wrapper contract.
//!
//! A [`Trajectory`] only knows its files and a content hash; it never reads
//! frames. It keeps a per-identity result cache so that wrapped functions are
//! computed at most once per `(trajectory, wrapper id)`, even when many tasks
//! apply the same wrapper concurrently.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, WrapperError};
use crate::identity::WrapperId;
use crate::values::Values;
use crate::wrapper::TrajectoryFunction;

type ResultCell = Arc<OnceCell<Values>>;

struct Inner {
    structure_file: PathBuf,
    trajectory_files: Vec<PathBuf>,
    trajectory_hash: String,
    cache: Mutex<HashMap<WrapperId, ResultCell>>,
}

/// Cheap-to-clone handle on an immutable trajectory.
#[derive(Clone)]
pub struct Trajectory {
    inner: Arc<Inner>,
}

impl Trajectory {
    /// Open a (possibly multipart) trajectory and hash the contents of all parts.
    pub fn new(
        structure_file: impl Into<PathBuf>,
        trajectory_files: Vec<PathBuf>,
    ) -> Result<Self> {
        let structure_file = structure_file.into();
        if trajectory_files.is_empty() {
            return Err(WrapperError::Config(
                "a trajectory needs at least one trajectory file".to_string(),
            ));
        }
        if !structure_file.is_file() {
            return Err(WrapperError::Config(format!(
                "structure file '{}' does not exist",
                structure_file.display()
            )));
        }
        let hash = hash_files(&trajectory_files)?;
        Ok(Self::with_hash(structure_file, trajectory_files, hash))
    }

    /// Build from a hash the caller already knows.
    pub fn with_hash(
        structure_file: impl Into<PathBuf>,
        trajectory_files: Vec<PathBuf>,
        trajectory_hash: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                structure_file: structure_file.into(),
                trajectory_files,
                trajectory_hash: trajectory_hash.into(),
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn structure_file(&self) -> &Path {
        &self.inner.structure_file
    }

    pub fn trajectory_files(&self) -> &[PathBuf] {
        &self.inner.trajectory_files
    }

    /// Hex digest over the contents of all trajectory parts.
    pub fn trajectory_hash(&self) -> &str {
        &self.inner.trajectory_hash
    }

    /// Return the cached values for `id`, or compute them with `wrapper`.
    ///
    /// Concurrent callers with the same `id` share one computation. A failed
    /// or cancelled computation leaves the slot empty so a later call retries.
    pub async fn apply_wrapped<W>(
        &self,
        id: &WrapperId,
        wrapper: &W,
        cancel: &CancellationToken,
    ) -> Result<Values>
    where
        W: TrajectoryFunction + ?Sized,
    {
        let cell = {
            let mut cache = self.lock_cache();
            Arc::clone(cache.entry(id.clone()).or_default())
        };
        if cell.initialized() {
            debug!(wrapper_id = %id, trajectory = %self, "cache hit");
        }
        let values = cell
            .get_or_try_init(|| async {
                debug!(wrapper_id = %id, trajectory = %self, "cache miss, computing");
                wrapper.compute(self, cancel).await
            })
            .await?;
        Ok(values.clone())
    }

    /// Previously computed values for `id`, if any.
    pub fn cached(&self, id: &WrapperId) -> Option<Values> {
        self.lock_cache().get(id).and_then(|c| c.get().cloned())
    }

    pub fn cache_len(&self) -> usize {
        self.lock_cache()
            .values()
            .filter(|c| c.initialized())
            .count()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<WrapperId, ResultCell>> {
        match self.inner.cache.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Display for Trajectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let files: Vec<String> = self
            .inner
            .trajectory_files
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        write!(
            f,
            "Trajectory(trajectory_files=[{}], structure_file={})",
            files.join(", "),
            self.inner.structure_file.display()
        )
    }
}

impl fmt::Debug for Trajectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trajectory")
            .field("structure_file", &self.inner.structure_file)
            .field("trajectory_files", &self.inner.trajectory_files)
            .field("trajectory_hash", &self.inner.trajectory_hash)
            .finish()
    }
}

fn hash_files(files: &[PathBuf]) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in files {
        let mut f = File::open(path).map_err(|err| WrapperError::io(path, err))?;
        std::io::copy(&mut f, &mut hasher).map_err(|err| WrapperError::io(path, err))?;
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}
