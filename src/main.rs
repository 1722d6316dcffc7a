//! `trajfunc` command line: print a wrapper id or run an executable on one
//! trajectory through a batch queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use trajfunc::config::Settings;
use trajfunc::remote::{executable_identity, resolve_executable};
use trajfunc::{
    BatchQueue, CallKwargs, RemoteFunction, ResourcePools, ShellQueue, SlurmQueue, Trajectory,
    TrajectoryFunction,
};

/// Apply an external analysis executable to a trajectory through a batch queue.
#[derive(Parser, Debug)]
#[command(name = "trajfunc")]
#[command(about = "Cached trajectory function application via local shell or Slurm", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the identity (cache key) of an executable with the given kwargs
    Id {
        /// Executable path or name on PATH
        executable: PathBuf,

        /// Call kwargs as a JSON object, e.g. '{"--stride": 2}'
        #[arg(long)]
        kwargs: Option<String>,
    },
    /// Run the executable on one trajectory and print the values as TSV
    Run {
        /// Executable path or name on PATH
        executable: PathBuf,

        /// Submission script template (text starting with '#!' or a file path)
        #[arg(long)]
        template: String,

        /// Structure file of the trajectory
        #[arg(long)]
        structure: PathBuf,

        /// Trajectory part(s), in order
        #[arg(long = "traj", required = true)]
        trajectory_files: Vec<PathBuf>,

        /// Call kwargs as a JSON object
        #[arg(long)]
        kwargs: Option<String>,

        /// Queue to submit to
        #[arg(long, value_enum, default_value_t = QueueKind::Shell)]
        queue: QueueKind,

        /// YAML settings file (pool limits, job name, polling)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum QueueKind {
    Shell,
    Slurm,
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = real_main(cli) {
        print_error_chain(&err);
        std::process::exit(1);
    }
}

fn parse_kwargs(raw: Option<&str>) -> Result<CallKwargs> {
    match raw {
        Some(text) => CallKwargs::from_json(text).context("invalid --kwargs"),
        None => Ok(CallKwargs::new()),
    }
}

fn real_main(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Id { executable, kwargs } => {
            let kwargs = parse_kwargs(kwargs.as_deref())?;
            let exe = resolve_executable(&executable)?;
            let id = executable_identity(&exe, &kwargs)?;
            println!("{id}");
            Ok(())
        }
        Command::Run {
            executable,
            template,
            structure,
            trajectory_files,
            kwargs,
            queue,
            config,
        } => {
            let settings = match config.as_deref() {
                Some(path) => Settings::load_from_file(path)?,
                None => Settings::from_env()?,
            };
            let kwargs = parse_kwargs(kwargs.as_deref())?;
            let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
            runtime.block_on(run(
                &executable,
                &template,
                structure,
                trajectory_files,
                kwargs,
                queue,
                settings,
            ))
        }
    }
}

async fn run(
    executable: &Path,
    template: &str,
    structure: PathBuf,
    trajectory_files: Vec<PathBuf>,
    kwargs: CallKwargs,
    queue: QueueKind,
    settings: Settings,
) -> Result<()> {
    let pools = Arc::new(ResourcePools::new(&settings.pools));
    let queue: Arc<dyn BatchQueue> = match queue {
        QueueKind::Shell => Arc::new(ShellQueue::new()),
        QueueKind::Slurm => Arc::new(SlurmQueue::new()),
    };
    let wrapper = RemoteFunction::new(
        executable,
        template,
        kwargs,
        queue,
        Arc::clone(&pools),
        settings.remote,
    )
    .with_context(|| format!("failed to configure '{}'", executable.display()))?;
    let traj = Trajectory::new(structure, trajectory_files).context("failed to open trajectory")?;

    let values = wrapper
        .apply(&traj)
        .await
        .with_context(|| format!("failed to apply '{}' to {traj}", executable.display()))?;
    info!(
        frames = values.n_frames(),
        dims = values.n_dim(),
        "values computed"
    );
    for row in values.rows() {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        println!("{}", cells.join("\t"));
    }
    pools.close();
    Ok(())
}
