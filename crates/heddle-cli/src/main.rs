mod activities;
mod workflows;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use heddle_core::app::CommandLauncher;
use heddle_core::config::CONFIG_ENV;
use heddle_core::{HeddleBuilder, HeddleConfig, Supervisor, WorkerSpec};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::workflows::{FAN_IN, HELLO};

#[derive(Parser)]
#[command(name = "heddle", about = "Task graph orchestration demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the demo workflows on an in-process worker pool
    Run {
        /// Only this workflow (`hello` or `fan-in`)
        workflow: Option<String>,
    },
    /// Supervise `n` worker processes of this binary until Ctrl-C
    Pool {
        #[arg(default_value_t = 3)]
        workers: usize,
    },
    /// One worker process; exits when stdin closes or on a termination signal
    Worker {
        id: String,
        /// Queues to subscribe to (default: all demo queues)
        queues: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config()?;

    match cli.command {
        Command::Run { workflow } => run_demo(config, workflow).await,
        Command::Pool { workers } => run_pool(config, workers).await,
        Command::Worker { id, queues } => run_worker(config, id, queues).await,
    }
}

fn load_config() -> Result<HeddleConfig> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => {
            let config = HeddleConfig::from_path(&path)
                .with_context(|| format!("loading {}", path.to_string_lossy()))?;
            info!(path = %path.to_string_lossy(), "config loaded");
            Ok(config)
        }
        None => Ok(HeddleConfig::default()),
    }
}

async fn run_demo(mut config: HeddleConfig, only: Option<String>) -> Result<()> {
    if config.workers.is_empty() {
        config.workers = workflows::demo_workers();
    }

    let mut builder = HeddleBuilder::new(config).handlers(workflows::demo_handlers()?);
    for graph in workflows::workflows()? {
        builder = builder.workflow(graph);
    }
    let app = builder.build()?;
    let pool = app.start_pool().await?;
    info!(workers = pool.live_count(), "pool started");

    let mut inputs = Vec::new();
    if only.as_deref().is_none_or(|w| w == HELLO) {
        inputs.push((HELLO, json!("World-42")));
        inputs.push((HELLO, json!("World-7")));
    }
    if only.as_deref().is_none_or(|w| w == FAN_IN) {
        inputs.push((
            FAN_IN,
            json!({ "A": "apples", "B": "bananas", "C": "cherries", "delays": { "A": 50 } }),
        ));
    }
    if inputs.is_empty() {
        anyhow::bail!("unknown workflow {:?}; known: {:?}", only, app.orchestrator().workflow_names());
    }

    let orchestrator = app.orchestrator();
    let runs = inputs
        .into_iter()
        .map(|(workflow, input)| Ok((workflow, orchestrator.submit(workflow, input)?)))
        .collect::<Result<Vec<_>, heddle_core::HeddleError>>()?;

    for (workflow, run_id) in runs {
        match orchestrator.await_run(run_id).await {
            Ok(result) => println!("{workflow} [{run_id}]: {result}"),
            Err(err) => println!("{workflow} [{run_id}] failed: {err}"),
        }
    }

    let report = pool.shutdown().await;
    info!(graceful = report.graceful, killed = report.killed, "pool stopped");
    Ok(())
}

async fn run_pool(config: HeddleConfig, workers: usize) -> Result<()> {
    let exe = std::env::current_exe().context("locating own executable")?;
    let launcher = Arc::new(CommandLauncher::new(exe).arg("worker"));
    let specs: Vec<WorkerSpec> = (1..=workers)
        .map(|i| WorkerSpec::new(i.to_string(), workflows::ALL_QUEUES))
        .collect();

    let pool = Supervisor::new(config.pool).start(specs, launcher).await?;
    info!(workers = pool.live_count(), "all workers started, Ctrl-C to stop");

    wait_for_shutdown_signal().await?;
    info!("shutting down all workers");
    let report = pool.shutdown().await;
    info!(graceful = report.graceful, killed = report.killed, "all workers stopped");
    Ok(())
}

/// A self-contained node: its own orchestrator plus one supervised worker.
///
/// Runs `hello` once for `World-<id>` if its queues allow it, then serves until
/// told to stop.
async fn run_worker(mut config: HeddleConfig, id: String, queues: Vec<String>) -> Result<()> {
    let spec = if queues.is_empty() {
        WorkerSpec::new(id.clone(), workflows::all_queues())
    } else {
        WorkerSpec::new(id.clone(), queues)
    };
    config.workers = vec![spec.clone()];

    let mut builder = HeddleBuilder::new(config).handlers(workflows::demo_handlers()?);
    for graph in workflows::workflows()? {
        if workflows::covers(&spec, &graph) {
            builder = builder.workflow(graph);
        }
    }
    let app = builder.build()?;
    let pool = app.start_pool().await?;
    info!(worker = %spec.id, queues = ?spec.queues, "worker started");

    if app.orchestrator().workflow(HELLO).is_some() {
        let name = format!("World-{id}");
        match app.orchestrator().execute(HELLO, json!(name)).await {
            Ok(result) => info!(worker = %spec.id, %result, "hello finished"),
            Err(err) => error!(worker = %spec.id, error = %err, "hello failed"),
        }
    }

    tokio::select! {
        _ = stdin_closed() => info!(worker = %spec.id, "stdin closed"),
        res = wait_for_shutdown_signal() => {
            if let Err(err) = res {
                warn!(error = %err, "signal handling failed");
            }
        }
    }

    let report = pool.shutdown().await;
    app.close().await;
    info!(worker = %spec.id, graceful = report.graceful, killed = report.killed, "worker stopped");
    Ok(())
}

async fn stdin_closed() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 256];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
