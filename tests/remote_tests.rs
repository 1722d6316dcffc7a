use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use trajfunc::config::{PoolConfig, RemoteConfig};
use trajfunc::values::save_npy;
use trajfunc::{
    BatchJob, BatchQueue, CallKwargs, JobOutput, JobSpec, PermitKind, RemoteFunction,
    ResourcePools, ShellQueue, SlurmQueue, StdFilesRemoval, TrajectoryFunction, Values,
    WrapperError,
};

mod helpers;
use helpers::{
    copy_result_body, files_with_suffix, unique_test_temp_dir, write_stub_executable,
    write_trajectory, SH_TEMPLATE,
};

fn pools_with_queue_limit(n: usize) -> Arc<ResourcePools> {
    Arc::new(ResourcePools::new(&PoolConfig {
        max_processes: None,
        max_files_open: Some(4),
        max_queued_jobs: Some(n),
    }))
}

fn shell_queue() -> Arc<dyn BatchQueue> {
    Arc::new(ShellQueue::new().with_poll_interval(Duration::from_millis(20)))
}

fn fast_config() -> RemoteConfig {
    RemoteConfig {
        poll_interval_secs: 1,
        ..RemoteConfig::default()
    }
}

#[test]
fn identical_executables_and_reordered_kwargs_share_identity() {
    let dir = unique_test_temp_dir("remote-identity");
    let a = write_stub_executable(&dir, "cv_a", "echo same");
    let b = write_stub_executable(&dir, "cv_b", "echo same");
    let c = write_stub_executable(&dir, "cv_c", "echo different");
    let pools = Arc::new(ResourcePools::unbounded());

    let kw1 = CallKwargs::from_json(r#"{"--stride": 2, "--sel": "name CA"}"#).unwrap();
    let kw2 = CallKwargs::from_json(r#"{"--sel": "name CA", "--stride": 2}"#).unwrap();

    let build = |exe: &Path, kw: CallKwargs| {
        RemoteFunction::new(
            exe,
            SH_TEMPLATE,
            kw,
            shell_queue(),
            Arc::clone(&pools),
            fast_config(),
        )
        .unwrap()
    };
    let fa = build(a.as_path(), kw1.clone());
    let fb = build(b.as_path(), kw2);
    let fc = build(c.as_path(), kw1);
    let fd = build(a.as_path(), CallKwargs::new().with("--stride", 3));

    assert_eq!(fa.id(), fb.id());
    assert_ne!(fa.id(), fc.id());
    assert_ne!(fa.id(), fd.id());
    assert_eq!(fa.job_name(), fb.job_name());
    assert!(fa.job_name().starts_with("CVfunc_id_"));
}

#[test]
fn construction_rejects_bad_configuration() {
    let dir = unique_test_temp_dir("remote-config");
    let exe = write_stub_executable(&dir, "cv", "true");
    let pools = Arc::new(ResourcePools::unbounded());

    let missing = RemoteFunction::new(
        dir.join("nope"),
        SH_TEMPLATE,
        CallKwargs::new(),
        shell_queue(),
        Arc::clone(&pools),
        fast_config(),
    );
    assert!(matches!(missing, Err(WrapperError::Config(_))));

    let no_placeholder = RemoteFunction::new(
        &exe,
        "#!/bin/sh\necho hi\n",
        CallKwargs::new(),
        shell_queue(),
        Arc::clone(&pools),
        fast_config(),
    );
    assert!(matches!(no_placeholder, Err(WrapperError::Config(_))));
}

#[test]
fn prepare_derives_paths_and_command_line() {
    let dir = unique_test_temp_dir("remote-prepare");
    let exe = write_stub_executable(&dir, "cv", "true");
    let traj = write_trajectory(&dir, "run 1.xtc");
    let f = RemoteFunction::new(
        &exe,
        SH_TEMPLATE,
        CallKwargs::new().with("--stride", 2).flag("--pbc"),
        shell_queue(),
        Arc::new(ResourcePools::unbounded()),
        RemoteConfig {
            job_name: Some("cv_job".to_string()),
            ..fast_config()
        },
    )
    .unwrap();

    let sub = f.prepare(&traj).unwrap();
    let id = f.id().unwrap();
    let hash5: String = traj.trajectory_hash().chars().take(5).collect();
    assert_eq!(sub.job_name, "cv_job");
    assert_eq!(sub.workdir, dir);
    assert_eq!(
        sub.result_file,
        dir.join(format!("run 1.xtc_{hash5}_CVfunc_id_{id}"))
    );
    assert_eq!(sub.script_path, dir.join("run 1.xtc_cv_job.slurm"));
    assert!(sub.cmd_str.ends_with(" --pbc --stride 2"), "{}", sub.cmd_str);
    assert!(sub.cmd_str.contains("'"), "path with a space must be quoted");
    assert_eq!(sub.script, format!("#!/bin/sh\n{}\n", sub.cmd_str));
}

#[tokio::test]
async fn successful_job_loads_values_and_cleans_up() {
    let dir = unique_test_temp_dir("remote-success");
    let expected = Values::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
    let known = dir.join("known.npy");
    save_npy(&known, &expected).unwrap();
    let exe = write_stub_executable(&dir, "cv", &copy_result_body(&known));
    let traj = write_trajectory(&dir, "traj.xtc");
    let pools = pools_with_queue_limit(2);

    let f = RemoteFunction::new(
        &exe,
        SH_TEMPLATE,
        CallKwargs::new(),
        shell_queue(),
        Arc::clone(&pools),
        fast_config(),
    )
    .unwrap();

    let values = f.apply(&traj).await.unwrap();
    assert_eq!(values, expected);
    assert_eq!(values.shape(), (3, 2));

    assert!(files_with_suffix(&dir, ".slurm").is_empty());
    // only the fixture remains
    assert_eq!(files_with_suffix(&dir, ".npy"), vec![known.clone()]);
    assert!(files_with_suffix(&dir, ".out.local-1").is_empty());
    assert_eq!(pools.in_flight(PermitKind::QueuedJobs), 0);
    assert_eq!(pools.in_flight(PermitKind::OpenFiles), 0);

    // a second apply is served from the cache
    fs::remove_file(&known).unwrap();
    assert_eq!(f.apply(&traj).await.unwrap(), expected);
}

#[tokio::test]
async fn failing_job_reports_exit_code_and_stderr() {
    let dir = unique_test_temp_dir("remote-failure");
    let exe = write_stub_executable(&dir, "cv", "echo boom >&2\nexit 7");
    let traj = write_trajectory(&dir, "traj.xtc");
    let pools = pools_with_queue_limit(2);
    let before = pools.available(PermitKind::QueuedJobs);

    let f = RemoteFunction::new(
        &exe,
        SH_TEMPLATE,
        CallKwargs::new(),
        shell_queue(),
        Arc::clone(&pools),
        fast_config(),
    )
    .unwrap();

    let err = f.apply(&traj).await.unwrap_err();
    match &err {
        WrapperError::Execution {
            exit_code, stderr, ..
        } => {
            assert_eq!(*exit_code, 7);
            assert!(stderr.contains("boom"), "{stderr}");
        }
        other => panic!("unexpected error: {other}"),
    }
    let msg = err.to_string();
    assert!(msg.contains("Exit code was: 7"), "{msg}");
    assert!(msg.contains("boom"), "{msg}");

    assert_eq!(pools.available(PermitKind::QueuedJobs), before);
    assert_eq!(pools.in_flight(PermitKind::QueuedJobs), 0);
    // kept for inspection
    assert_eq!(files_with_suffix(&dir, ".slurm").len(), 1);
    assert_eq!(traj.cache_len(), 0);
}

#[tokio::test]
async fn custom_loader_gets_result_path_without_extension() {
    let dir = unique_test_temp_dir("remote-loader");
    let exe = write_stub_executable(&dir, "cv", "printf '0.5\\n1.5\\n' > \"$3.txt\"");
    let traj = write_trajectory(&dir, "traj.xtc");
    let seen = Arc::new(Mutex::new(None));
    let seen_by_loader = Arc::clone(&seen);

    let f = RemoteFunction::new(
        &exe,
        SH_TEMPLATE,
        CallKwargs::new(),
        shell_queue(),
        Arc::new(ResourcePools::unbounded()),
        fast_config(),
    )
    .unwrap()
    .with_result_loader(move |base: &Path| {
        *seen_by_loader.lock().unwrap() = Some(base.to_path_buf());
        let mut txt = base.as_os_str().to_owned();
        txt.push(".txt");
        let text = fs::read_to_string(&txt)?;
        fs::remove_file(&txt)?;
        let col = text
            .lines()
            .map(|l| l.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Values::from_column(col))
    });

    let sub = f.prepare(&traj).unwrap();
    let values = f.apply(&traj).await.unwrap();
    assert_eq!(values.as_slice(), &[0.5, 1.5]);
    assert_eq!(seen.lock().unwrap().as_deref(), Some(sub.result_file.as_path()));
    assert!(files_with_suffix(&dir, ".txt").is_empty());
}

/// Queue double whose jobs never finish on their own.
#[derive(Default)]
struct StuckQueue {
    events: Arc<Mutex<Vec<String>>>,
}

struct StuckJob {
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl BatchQueue for StuckQueue {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn submit(&self, spec: JobSpec) -> trajfunc::Result<Arc<dyn BatchJob>> {
        self.events
            .lock()
            .unwrap()
            .push(format!("submit {}", spec.job_name));
        Ok(Arc::new(StuckJob {
            events: Arc::clone(&self.events),
        }))
    }
}

#[async_trait]
impl BatchJob for StuckJob {
    fn job_id(&self) -> &str {
        "stuck-1"
    }

    async fn wait(&self) -> trajfunc::Result<JobOutput> {
        std::future::pending().await
    }

    async fn kill(&self) -> trajfunc::Result<()> {
        self.events.lock().unwrap().push("kill".to_string());
        Ok(())
    }

    fn exit_code(&self) -> Option<i32> {
        None
    }
}

async fn wait_for_event(events: &Mutex<Vec<String>>, prefix: &str) {
    for _ in 0..200 {
        if events.lock().unwrap().iter().any(|e| e.starts_with(prefix)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("event '{prefix}' never recorded");
}

#[tokio::test]
async fn cancellation_kills_job_before_returning() {
    let dir = unique_test_temp_dir("remote-cancel");
    let exe = write_stub_executable(&dir, "cv", "true");
    let traj = write_trajectory(&dir, "traj.xtc");
    let queue = StuckQueue::default();
    let events = Arc::clone(&queue.events);
    let pools = pools_with_queue_limit(1);

    let f = Arc::new(
        RemoteFunction::new(
            &exe,
            SH_TEMPLATE,
            CallKwargs::new(),
            Arc::new(queue),
            Arc::clone(&pools),
            fast_config(),
        )
        .unwrap(),
    );
    let cancel = CancellationToken::new();
    let call = {
        let f = Arc::clone(&f);
        let traj = traj.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { f.apply_with_cancel(&traj, &cancel).await })
    };

    wait_for_event(&events, "submit").await;
    assert_eq!(pools.in_flight(PermitKind::QueuedJobs), 1);
    cancel.cancel();
    let res = call.await.unwrap();

    assert!(matches!(res, Err(WrapperError::Cancelled)));
    // kill happened before the cancellation surfaced
    assert_eq!(events.lock().unwrap().last().map(String::as_str), Some("kill"));
    assert_eq!(pools.in_flight(PermitKind::QueuedJobs), 0);
    assert_eq!(traj.cache_len(), 0);
    // script stays behind for inspection
    assert_eq!(files_with_suffix(&dir, ".slurm").len(), 1);
}

#[tokio::test]
async fn dropping_an_in_flight_call_kills_its_job() {
    let dir = unique_test_temp_dir("remote-abort");
    let exe = write_stub_executable(&dir, "cv", "true");
    let traj = write_trajectory(&dir, "traj.xtc");
    let queue = StuckQueue::default();
    let events = Arc::clone(&queue.events);
    let pools = pools_with_queue_limit(1);

    let f = Arc::new(
        RemoteFunction::new(
            &exe,
            SH_TEMPLATE,
            CallKwargs::new(),
            Arc::new(queue),
            Arc::clone(&pools),
            fast_config(),
        )
        .unwrap(),
    );
    let call = {
        let f = Arc::clone(&f);
        let traj = traj.clone();
        tokio::spawn(async move { f.apply(&traj).await })
    };

    wait_for_event(&events, "submit").await;
    call.abort();
    assert!(call.await.unwrap_err().is_cancelled());

    wait_for_event(&events, "kill").await;
    assert_eq!(pools.in_flight(PermitKind::QueuedJobs), 0);
}

#[tokio::test]
async fn queued_job_limit_bounds_outstanding_jobs() {
    let dir = unique_test_temp_dir("remote-limit");
    let exe = write_stub_executable(&dir, "cv", "true");
    let queue = StuckQueue::default();
    let events = Arc::clone(&queue.events);
    let pools = pools_with_queue_limit(1);
    let queue: Arc<dyn BatchQueue> = Arc::new(queue);

    let f = Arc::new(
        RemoteFunction::new(
            &exe,
            SH_TEMPLATE,
            CallKwargs::new(),
            queue,
            Arc::clone(&pools),
            fast_config(),
        )
        .unwrap(),
    );
    let cancel = CancellationToken::new();
    let mut calls = Vec::new();
    for name in ["a.xtc", "b.xtc"] {
        let f = Arc::clone(&f);
        let traj = write_trajectory(&dir, name);
        let cancel = cancel.clone();
        calls.push(tokio::spawn(async move {
            f.apply_with_cancel(&traj, &cancel).await
        }));
    }

    wait_for_event(&events, "submit").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let submits = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.starts_with("submit"))
        .count();
    assert_eq!(submits, 1);
    assert_eq!(pools.peak_in_flight(PermitKind::QueuedJobs), 1);

    cancel.cancel();
    for call in calls {
        assert!(matches!(call.await.unwrap(), Err(WrapperError::Cancelled)));
    }
}

/// Fake `sbatch`/`sacct`/`scancel` recording into `state`.
fn fake_slurm(dir: &Path, state: &Path, job_id: &str, run_script: bool) -> SlurmQueue {
    let run = if run_script {
        format!(
            "cd \"$dir\" || exit 1\nsh \"$last\" > \"$name.out.{job_id}\" 2> \"$name.err.{job_id}\"\necho $? > '{state}/rc'\n",
            state = state.display()
        )
    } else {
        String::new()
    };
    let sbatch = write_stub_executable(
        dir,
        "sbatch",
        &format!(
            "for a in \"$@\"; do\n  case \"$a\" in\n    --chdir=*) dir=\"${{a#--chdir=}}\" ;;\n    --job-name=*) name=\"${{a#--job-name=}}\" ;;\n  esac\n  last=\"$a\"\ndone\n{run}echo '{job_id};testcluster'"
        ),
    );
    let sacct = write_stub_executable(
        dir,
        "sacct",
        &format!(
            "rc_file='{state}/rc'\nif [ ! -f \"$rc_file\" ]; then echo 'RUNNING|0:0'; exit 0; fi\nrc=$(cat \"$rc_file\")\nif [ \"$rc\" = 0 ]; then echo 'COMPLETED|0:0'; else echo \"FAILED|$rc:0\"; fi",
            state = state.display()
        ),
    );
    let scancel = write_stub_executable(
        dir,
        "scancel",
        &format!("echo \"$1\" > '{}/cancelled'", state.display()),
    );
    SlurmQueue::with_binaries(sbatch, sacct, scancel)
}

#[tokio::test]
async fn slurm_queue_runs_job_to_completion() {
    let bin = unique_test_temp_dir("slurm-bin");
    let state = unique_test_temp_dir("slurm-state");
    let work = unique_test_temp_dir("slurm-work");
    let expected = Values::from_column(vec![0.25, 0.5]);
    let known = bin.join("known.npy");
    save_npy(&known, &expected).unwrap();
    let exe = write_stub_executable(&bin, "cv", &copy_result_body(&known));
    let traj = write_trajectory(&work, "traj.xtc");

    let f = RemoteFunction::new(
        &exe,
        SH_TEMPLATE,
        CallKwargs::new(),
        Arc::new(fake_slurm(&bin, &state, "4242", true)),
        Arc::new(ResourcePools::unbounded()),
        fast_config(),
    )
    .unwrap();

    assert_eq!(f.apply(&traj).await.unwrap(), expected);
    assert!(files_with_suffix(&work, ".slurm").is_empty());
    assert!(files_with_suffix(&work, ".out.4242").is_empty());
}

#[tokio::test]
async fn slurm_failure_keeps_std_files_under_success_policy() {
    let bin = unique_test_temp_dir("slurm-bin");
    let state = unique_test_temp_dir("slurm-state");
    let work = unique_test_temp_dir("slurm-work");
    let exe = write_stub_executable(&bin, "cv", "echo 'no frames' >&2\nexit 3");
    let traj = write_trajectory(&work, "traj.xtc");

    let f = RemoteFunction::new(
        &exe,
        SH_TEMPLATE,
        CallKwargs::new(),
        Arc::new(fake_slurm(&bin, &state, "4243", true)),
        Arc::new(ResourcePools::unbounded()),
        RemoteConfig {
            std_files_removal: StdFilesRemoval::Success,
            ..fast_config()
        },
    )
    .unwrap();

    let err = f.apply(&traj).await.unwrap_err();
    match err {
        WrapperError::Execution {
            exit_code,
            stderr,
            job_id,
            ..
        } => {
            assert_eq!(exit_code, 3);
            assert!(stderr.contains("no frames"), "{stderr}");
            assert_eq!(job_id, "4243");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(files_with_suffix(&work, ".err.4243").len(), 1);
}

#[tokio::test]
async fn slurm_cancellation_runs_scancel() {
    let bin = unique_test_temp_dir("slurm-bin");
    let state = unique_test_temp_dir("slurm-state");
    let work = unique_test_temp_dir("slurm-work");
    let exe = write_stub_executable(&bin, "cv", "true");
    let traj = write_trajectory(&work, "traj.xtc");

    let f = RemoteFunction::new(
        &exe,
        SH_TEMPLATE,
        CallKwargs::new(),
        Arc::new(fake_slurm(&bin, &state, "4244", false)),
        Arc::new(ResourcePools::unbounded()),
        fast_config(),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });
    let res = f.apply_with_cancel(&traj, &cancel).await;
    assert!(matches!(res, Err(WrapperError::Cancelled)));
    let cancelled = fs::read_to_string(state.join("cancelled")).unwrap();
    assert_eq!(cancelled.trim(), "4244");
}

fn has_std_files(dir: &Path) -> bool {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.contains(".out.") || name.contains(".err.")
        })
}

#[tokio::test]
async fn rejected_submission_releases_queued_permit() {
    let bin = unique_test_temp_dir("slurm-bin");
    let work = unique_test_temp_dir("slurm-work");
    let exe = write_stub_executable(&bin, "cv", "true");
    let sbatch = write_stub_executable(&bin, "sbatch", "echo 'nope' >&2\nexit 1");
    let sacct = write_stub_executable(&bin, "sacct", "echo 'RUNNING|0:0'");
    let scancel = write_stub_executable(&bin, "scancel", "true");
    let traj = write_trajectory(&work, "traj.xtc");
    let pools = pools_with_queue_limit(1);

    let f = RemoteFunction::new(
        &exe,
        SH_TEMPLATE,
        CallKwargs::new(),
        Arc::new(SlurmQueue::with_binaries(sbatch, sacct, scancel)),
        Arc::clone(&pools),
        fast_config(),
    )
    .unwrap();

    let err = f.apply(&traj).await.unwrap_err();
    match &err {
        WrapperError::Submission(msg) => assert!(msg.contains("nope"), "{msg}"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(pools.in_flight(PermitKind::QueuedJobs), 0);
    assert_eq!(pools.available(PermitKind::QueuedJobs), Some(1));
    assert!(!has_std_files(&work));
    assert_eq!(traj.cache_len(), 0);
}

#[tokio::test]
async fn unwritable_script_path_is_a_submission_error() {
    let dir = unique_test_temp_dir("remote-unwritable");
    let exe = write_stub_executable(&dir, "cv", "true");
    let traj = write_trajectory(&dir, "traj.xtc");
    let queue = StuckQueue::default();
    let events = Arc::clone(&queue.events);
    let pools = pools_with_queue_limit(1);

    let f = RemoteFunction::new(
        &exe,
        SH_TEMPLATE,
        CallKwargs::new(),
        Arc::new(queue),
        Arc::clone(&pools),
        fast_config(),
    )
    .unwrap();
    // a directory where the script should go
    let sub = f.prepare(&traj).unwrap();
    fs::create_dir(&sub.script_path).unwrap();

    let err = f.apply(&traj).await.unwrap_err();
    assert!(matches!(err, WrapperError::Submission(_)), "{err}");
    assert!(events.lock().unwrap().is_empty(), "nothing may be submitted");
    assert_eq!(pools.in_flight(PermitKind::QueuedJobs), 0);
    assert_eq!(pools.in_flight(PermitKind::OpenFiles), 0);
}

#[tokio::test]
async fn dropping_a_call_during_sbatch_stops_the_submission() {
    let bin = unique_test_temp_dir("slurm-bin");
    let work = unique_test_temp_dir("slurm-work");
    let marker = bin.join("submitted");
    let exe = write_stub_executable(&bin, "cv", "true");
    let sbatch = write_stub_executable(
        &bin,
        "sbatch",
        &format!("sleep 1\ntouch '{}'\necho 99", marker.display()),
    );
    let sacct = write_stub_executable(&bin, "sacct", "echo 'COMPLETED|0:0'");
    let scancel = write_stub_executable(&bin, "scancel", "true");
    let traj = write_trajectory(&work, "traj.xtc");
    let pools = pools_with_queue_limit(1);

    let f = Arc::new(
        RemoteFunction::new(
            &exe,
            SH_TEMPLATE,
            CallKwargs::new(),
            Arc::new(SlurmQueue::with_binaries(sbatch, sacct, scancel)),
            Arc::clone(&pools),
            fast_config(),
        )
        .unwrap(),
    );
    let call = {
        let f = Arc::clone(&f);
        let traj = traj.clone();
        tokio::spawn(async move { f.apply(&traj).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    call.abort();
    assert!(call.await.unwrap_err().is_cancelled());
    assert_eq!(pools.in_flight(PermitKind::QueuedJobs), 0);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!marker.exists(), "sbatch kept running after the call was dropped");
}
