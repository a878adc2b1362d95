use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use rigpipe::config::Config;
use rigpipe::descriptor::{query, store};
use rigpipe::pipeline::{build_pipeline, Engine, TaskRegistry};
use rigpipe::{rlog, Error, Result};

/// Rigpipe - session descriptor aggregation and preprocessing pipelines
#[derive(Parser, Debug)]
#[command(name = "rigpipe")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    RIGPIPE_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.rigpipe/rigpipe.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the task graph for a session without running anything
    Plan {
        /// Session folder containing the experiment description
        session: PathBuf,
    },

    /// Build and execute the session's pipeline
    Run {
        /// Session folder containing the experiment description
        session: PathBuf,

        /// Re-run tasks even when their outputs already exist
        #[arg(long)]
        force: bool,

        /// Number of concurrent workers (defaults to the config value)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Merge a device stub descriptor into a shared target descriptor
    Aggregate {
        /// Device stub descriptor file
        stub: PathBuf,

        /// Target descriptor file or session folder
        target: PathBuf,

        /// Delete the stub (and its emptied _devices folder) once merged
        #[arg(long)]
        unlink: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    rigpipe::log::init_with_debug(cli.debug);
    rlog!("rigpipe starting");

    let config = Config::load()?;
    match cli.command {
        Command::Plan { session } => run_plan(&session),
        Command::Run {
            session,
            force,
            workers,
        } => run_pipeline(&session, force, workers, &config),
        Command::Aggregate {
            stub,
            target,
            unlink,
        } => run_aggregate(&stub, &target, unlink, &config),
    }
}

fn load_graph(session: &PathBuf) -> Result<rigpipe::TaskGraph> {
    let descriptor = store::read(session)?.ok_or_else(|| {
        Error::Config(format!(
            "no experiment description found in {}",
            session.display()
        ))
    })?;
    build_pipeline(session, &descriptor, &TaskRegistry::with_builtins())
}

fn run_plan(session: &PathBuf) -> Result<()> {
    let graph = load_graph(session)?;
    let mut tasks: Vec<_> = graph.topological_order()?;
    tasks.sort_by_key(|t| t.level);
    for task in tasks {
        println!("{:>3}  {}", task.level, task.name);
    }
    Ok(())
}

fn run_pipeline(
    session: &PathBuf,
    force: bool,
    workers: Option<usize>,
    config: &Config,
) -> Result<()> {
    let graph = load_graph(session)?;
    let workers = workers.unwrap_or_else(|| config.effective_workers()).max(1);

    let cancel = CancellationToken::new();
    let runtime = tokio::runtime::Runtime::new()?;
    let ctrl_c_cancel = cancel.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            rlog!("interrupt received, stopping after in-flight tasks");
            ctrl_c_cancel.cancel();
        }
    });

    let mut engine = Engine::new(graph, session)
        .with_workers(workers)
        .with_force(force)
        .with_cancel(cancel);
    let summary = runtime.block_on(engine.run())?;

    for name in &summary.complete {
        println!("complete  {}", name);
    }
    for (name, reason) in &summary.skipped {
        println!("skipped   {} ({:?})", name, reason);
    }
    for (name, error) in &summary.failed {
        println!("FAILED    {}: {}", name, error);
    }
    if summary.is_success() {
        Ok(())
    } else {
        Err(Error::TaskExecution {
            task: summary.failed[0].0.clone(),
            reason: format!("{} task(s) failed", summary.failed.len()),
        })
    }
}

fn run_aggregate(stub: &PathBuf, target: &PathBuf, unlink: bool, config: &Config) -> Result<()> {
    match store::aggregate_device(stub, target, unlink, &config.lock)? {
        Some(descriptor) => {
            println!(
                "merged {} into {} ({} device kind(s), sync: {})",
                stub.display(),
                target.display(),
                descriptor.devices.len(),
                query::sync_label(&descriptor).unwrap_or("none"),
            );
        }
        None => {
            println!("stub {} was empty, nothing merged", stub.display());
        }
    }
    Ok(())
}
