//! `taskforge`: runs the shell commands declared in a TOML file under the orchestrator.

mod command;
mod config;

use clap::{Parser, Subcommand};
use config::{BackendKind, TaskforgeConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskforge_orchestrator::{
    truncate_fmt, CheckpointStore, ClusterBackend, ExecutionBackend, Orchestrator, RunReport,
    Status,
};
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskforge", about = "taskforge: supervised parallel task runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "taskforge.toml")]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every task declared in the config file
    Run {
        /// Worker count of the local pool (overrides config)
        #[arg(long)]
        children: Option<usize>,
        /// Per-attempt timeout in seconds (overrides config)
        #[arg(long)]
        timeout: Option<f64>,
        /// Attempts per task (overrides config)
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Checkpoint directory (overrides config)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
        /// Skip tasks recorded DONE in the latest checkpoint
        #[arg(long)]
        resume: bool,
        /// Write the final report as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Inspect checkpoints
    Checkpoints {
        /// Checkpoint directory (overrides config)
        #[arg(long)]
        dir: Option<PathBuf>,
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List checkpoint files, oldest first
    List,
    /// Show one checkpoint, the latest by default
    Show {
        /// Checkpoint file to show
        path: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let builder = tracing_subscriber::fmt().with_env_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
    );
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    match cli.command {
        Commands::Run {
            children,
            timeout,
            max_attempts,
            checkpoint_dir,
            resume,
            output,
        } => {
            let mut config = TaskforgeConfig::load(&cli.config).await?;
            let settings = &mut config.orchestrator;
            if let Some(children) = children {
                settings.children = children;
            }
            if let Some(timeout) = timeout {
                settings.timeout_sec = Some(timeout);
            }
            if let Some(max_attempts) = max_attempts {
                settings.max_attempts = Some(max_attempts);
            }
            if let Some(dir) = checkpoint_dir {
                settings.checkpoint_dir = Some(dir);
            }
            if cli.verbose {
                settings.log_level = "debug".to_string();
            }

            let report = run(config, &cli.config, resume).await?;
            print_report(&report);

            if let Some(path) = output {
                tokio::fs::write(&path, serde_json::to_vec_pretty(&report)?).await?;
                info!(path = %path.display(), "Report written");
            }

            let failed = report.count(Status::Failed);
            if failed > 0 {
                anyhow::bail!("{failed} of {} task(s) failed", report.len());
            }
        }
        Commands::Checkpoints { dir, action } => {
            let store = CheckpointStore::new(checkpoint_dir(dir, &cli.config).await?);
            match action {
                CheckpointAction::List => {
                    let files = store.list().await?;
                    if files.is_empty() {
                        println!("No checkpoints in {}", store.dir().display());
                    }
                    for file in &files {
                        println!("{}", file.display());
                    }
                }
                CheckpointAction::Show { path } => {
                    let snapshot = match path {
                        Some(path) => store.load(&path).await?,
                        None => match store.load_latest().await? {
                            Some(snapshot) => snapshot,
                            None => anyhow::bail!("No checkpoints in {}", store.dir().display()),
                        },
                    };
                    for (id, (status, value)) in &snapshot {
                        println!("  {id}: {status} ({})", truncate_fmt(value, 60));
                    }
                    println!("\nTotal: {} task(s)", snapshot.len());
                }
            }
        }
    }

    Ok(())
}

/// `--dir` when given, else the config file's `checkpoint_dir`. The config file
/// is only read in the second case.
async fn checkpoint_dir(dir: Option<PathBuf>, config_path: &Path) -> anyhow::Result<PathBuf> {
    if let Some(dir) = dir {
        return Ok(dir);
    }
    let config = TaskforgeConfig::load(config_path).await?;
    match config.checkpoint_dir() {
        Some(dir) => Ok(dir.clone()),
        None => anyhow::bail!("no checkpoint directory: set orchestrator.checkpoint_dir or pass --dir"),
    }
}

async fn run(config: TaskforgeConfig, config_path: &Path, resume: bool) -> anyhow::Result<RunReport> {
    if config.tasks.is_empty() {
        warn!(config = %config_path.display(), "No [[task]] entries, nothing to run");
    }

    let cluster = match config.backend {
        BackendKind::Local => None,
        BackendKind::Cluster => Some(Arc::new(ClusterBackend::new(config.cluster.clone())?)),
    };
    let checkpoint_dir = config.checkpoint_dir().cloned();

    let mut orchestrator = match &cluster {
        Some(cluster) => Orchestrator::with_backend(
            config.orchestrator,
            Arc::clone(cluster) as Arc<dyn ExecutionBackend>,
        ),
        None => Orchestrator::new(config.orchestrator),
    }
    .with_span(info_span!("run", config = %config_path.display()));

    if !config.retry_on.is_empty() {
        let retry_on = config.retry_on;
        orchestrator =
            orchestrator.with_retry_predicate(move |e| command::retry_matches(&retry_on, e));
    }

    if resume {
        let Some(dir) = checkpoint_dir else {
            anyhow::bail!("--resume needs a checkpoint directory");
        };
        match CheckpointStore::new(dir).load_latest().await? {
            Some(snapshot) => orchestrator = orchestrator.resume_from(snapshot),
            None => warn!("No checkpoint to resume from, running everything"),
        }
    }

    let tasks = config.tasks.into_iter().map(command::CommandSpec::into_task);
    let report = orchestrator.run(tasks).await?;

    if let Some(cluster) = cluster {
        cluster.shutdown().await;
    }
    Ok(report)
}

fn print_report(report: &RunReport) {
    for (id, task) in &report.tasks {
        let attempts = if task.attempts == 1 { "attempt" } else { "attempts" };
        println!(
            "  {id}: {} after {} {attempts} ({})",
            task.status,
            task.attempts,
            truncate_fmt(task.result.repr(), 60)
        );
    }
    println!(
        "\nTotal: {} task(s), {} done, {} failed",
        report.len(),
        report.count(Status::Done),
        report.count(Status::Failed)
    );
}
