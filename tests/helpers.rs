#![allow(dead_code)]

use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use trajfunc::Trajectory;

pub const SH_TEMPLATE: &str = "#!/bin/sh\n{cmd_str}\n";

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

fn env_lock() -> MutexGuard<'static, ()> {
    match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(g) => g,
        // a test that panicked while holding the lock must not wedge the rest
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// RAII guard for test-only env var mutation.
///
/// All mutations through this guard are serialized with a global lock;
/// mutations made elsewhere are not.
#[must_use]
pub struct EnvVarGuard {
    key: String,
    old: Option<OsString>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvVarGuard {
    pub fn set<K: Into<String>, V: AsRef<OsStr>>(key: K, value: V) -> Self {
        let key = key.into();
        let lock = env_lock();
        let old = env::var_os(&key);
        env::set_var(&key, value);
        Self {
            key,
            old,
            _lock: lock,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match &self.old {
            Some(v) => env::set_var(&self.key, v),
            None => env::remove_var(&self.key),
        }
    }
}

pub fn unique_test_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let seq = DIR_SEQ.fetch_add(1, Ordering::Relaxed);
    let p = env::temp_dir().join(format!(
        "trajfunc-{prefix}-{}-{nanos}-{seq}",
        std::process::id()
    ));
    fs::create_dir_all(&p).unwrap();
    p
}

/// Write an executable `sh` script.
pub fn write_stub_executable(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Stub body that copies `npy` to `<result_file>.npy` for a one-part
/// trajectory (`$1` structure, `$2` part, `$3` result file).
pub fn copy_result_body(npy: &Path) -> String {
    format!("cp '{}' \"$3.npy\"", npy.display())
}

/// A one-part trajectory with dummy files in `dir`.
pub fn write_trajectory(dir: &Path, name: &str) -> Trajectory {
    let gro = dir.join("conf.gro");
    fs::write(&gro, "dummy structure\n").unwrap();
    let xtc = dir.join(name);
    fs::write(&xtc, format!("frames of {name}\n")).unwrap();
    Trajectory::new(gro, vec![xtc]).unwrap()
}

pub fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.to_string_lossy().ends_with(suffix))
        .collect();
    out.sort();
    out
}
