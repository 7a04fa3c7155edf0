//! workflow — entry point
//!
//! Parses the CLI, wires the admission budget + launcher + status store,
//! drives the file producer on the calling thread while the consumer's
//! scheduling loop runs on its own thread, and forwards SIGTERM/SIGINT into
//! `kill_all`.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use codar_workflow::consumer::PipelineRunner;
use codar_workflow::launcher::Launcher;
use codar_workflow::producer;
use codar_workflow::status_store::StatusStore;

#[derive(Debug, Parser)]
#[command(name = "workflow")]
#[command(about = "Node-budgeted execution engine for pipelines of HPC processes", long_about = None)]
struct Cli {
    /// Total process budget, modeled as one node per process slot. Mutually
    /// exclusive with --max-nodes.
    #[arg(long, value_name = "N")]
    max_procs: Option<u32>,

    /// Total node budget. Requires --processes-per-node.
    #[arg(long, value_name = "N")]
    max_nodes: Option<u32>,

    /// Tasks placed on each node by the default layout. Only valid with
    /// --max-nodes.
    #[arg(long, value_name = "N")]
    processes_per_node: Option<u32>,

    /// MPI-style launcher wrapping every run's command.
    #[arg(long, value_enum)]
    runner: RunnerArg,

    /// Source of pipeline descriptions.
    #[arg(long, value_enum, default_value = "file")]
    producer: ProducerArg,

    /// Path to the producer's input document (required for --producer file).
    #[arg(long)]
    producer_input_file: Option<PathBuf>,

    /// Write logs here instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevelArg,

    /// Enables the atomically-rewritten status file at this path.
    #[arg(long)]
    status_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum RunnerArg {
    Mpiexec,
    Aprun,
    None,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ProducerArg {
    File,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogLevelArg {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevelArg {
    /// `tracing` has no CRITICAL level; it collapses onto ERROR.
    fn as_filter(self) -> &'static str {
        match self {
            LogLevelArg::Debug => "debug",
            LogLevelArg::Info => "info",
            LogLevelArg::Warning => "warn",
            LogLevelArg::Error => "error",
            LogLevelArg::Critical => "error",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        // clap itself has already exited with code 2 for CLI syntax errors
        // before `run()` is ever reached; everything that fails inside
        // `run()` (budget validation, status file I/O, ...) is an
        // unrecoverable startup/config error, which exits 1.
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let (max_nodes, ppn) = resolve_budget(&cli)?;
    let _guard = init_tracing(&cli)?;

    let launcher = match cli.runner {
        RunnerArg::Mpiexec => Launcher::mpiexec(),
        RunnerArg::Aprun => Launcher::aprun(),
        RunnerArg::None => Launcher::None,
    };

    let status_store = match &cli.status_file {
        Some(path) => Some(Arc::new(
            StatusStore::open(path).with_context(|| format!("open status file {}", path.display()))?,
        )),
        None => None,
    };

    let runner = Arc::new(PipelineRunner::new(launcher, max_nodes, ppn, status_store));
    install_signal_handlers(Arc::clone(&runner));

    let ProducerArg::File = cli.producer;
    let input_file = cli
        .producer_input_file
        .context("--producer-input-file is required for --producer file")?;

    let consumer_runner = Arc::clone(&runner);
    let consumer_handle = std::thread::Builder::new()
        .name("consumer".into())
        .spawn(move || consumer_runner.run_pipelines())
        .context("spawn consumer thread")?;

    producer::run_file_producer(&input_file, &runner)?;
    runner.stop();

    consumer_handle
        .join()
        .map_err(|_| anyhow!("consumer thread panicked"))?;

    info!("drained cleanly");
    Ok(())
}

/// Reconcile `--max-procs`/`--max-nodes`/`--processes-per-node` into the
/// `(max_nodes, processes_per_node)` pair `PipelineRunner` expects. In
/// `--max-procs` mode each process slot is modeled as its own one-task node
/// (`ppn = 1`), so a run's node count equals its process count directly.
fn resolve_budget(cli: &Cli) -> Result<(u32, u32)> {
    match (cli.max_procs, cli.max_nodes) {
        (Some(_), Some(_)) => bail!("--max-procs and --max-nodes are mutually exclusive"),
        (None, None) => bail!("one of --max-procs or --max-nodes is required"),
        (Some(procs), None) => {
            if cli.processes_per_node.is_some() {
                bail!("--processes-per-node is only valid together with --max-nodes");
            }
            Ok((procs, 1))
        }
        (None, Some(nodes)) => {
            let ppn = cli
                .processes_per_node
                .context("--max-nodes requires --processes-per-node")?;
            Ok((nodes, ppn))
        }
    }
}

fn init_tracing(cli: &Cli) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter()));

    match &cli.log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("create log file {}", path.display()))?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_env_filter(filter)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
            Ok(None)
        }
    }
}

static SIGNAL_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: libc::c_int) {
    SIGNAL_RECEIVED.store(true, Ordering::SeqCst);
}

/// Forward SIGTERM/SIGINT into `kill_all`. The handler itself only flips an
/// atomic flag (signal-safe); a watcher thread polls it and does the actual
/// work, per spec.md §5 ("child signals are the engine's explicit
/// CONT/TERM/KILL sequence", never raw signal-handler logic).
fn install_signal_handlers(runner: Arc<PipelineRunner>) {
    unsafe {
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
    }
    std::thread::Builder::new()
        .name("signal-watcher".into())
        .spawn(move || {
            loop {
                if SIGNAL_RECEIVED.load(Ordering::SeqCst) {
                    warn!("signal received, killing all pipelines");
                    runner.kill_all();
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        })
        .expect("spawn signal watcher thread");
}
