//! Storage Resource Manager daemon
//!
//! `run` starts the store, plugin manager, resource manager, scan and agent
//! daemons and the control RPC. `validate-plugin` checks one plugin module.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_resource_manager::daemon::{control_router, serve_control};
use storage_resource_manager::jobs::JobRequest;
use storage_resource_manager::{
    plugins, AgentDaemon, AgentMessage, DaemonConfig, PluginManager, QueuedJobScheduler,
    ResourceManager, ScanDaemon, Store,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Resource Manager - storage resource graph daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemons and the control RPC
    Run(RunArgs),

    /// Check a plugin module and print its errors
    ValidatePlugin {
        /// Plugin module name
        module: String,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// YAML configuration file
    #[arg(long, env = "SRM_CONFIG")]
    config: Option<PathBuf>,

    /// Control RPC bind address
    #[arg(long, env = "SRM_CONTROL_ADDR")]
    control_addr: Option<String>,

    /// JSON snapshot file for the store
    #[arg(long, env = "SRM_SNAPSHOT")]
    snapshot: Option<PathBuf>,

    /// Read agent messages as JSON lines from stdin
    #[arg(long, env = "SRM_AGENT_STDIN")]
    agent_stdin: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    match args.command {
        Command::Run(run_args) => run(run_args).await,
        Command::ValidatePlugin { module } => {
            let errors = PluginManager::validate_plugin(&plugins::catalog(), &module);
            if errors.is_empty() {
                println!("{}: OK", module);
                return Ok(());
            }
            for e in &errors {
                println!("{}: {}", module, e);
            }
            std::process::exit(1);
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(addr) = args.control_addr {
        config.control_addr = addr;
    }
    if args.snapshot.is_some() {
        config.snapshot_path = args.snapshot;
    }
    config.validate()?;

    info!("Starting Storage Resource Manager");
    info!("  Version: {}", storage_resource_manager::VERSION);
    info!("  Control RPC: {}", config.control_addr);
    info!("  Plugins: {:?}", config.installed_plugins);

    let store = Arc::new(match &config.snapshot_path {
        Some(path) => Store::open(path)
            .with_context(|| format!("opening store snapshot {}", path.display()))?,
        None => Store::in_memory(),
    });

    let plugin_manager = Arc::new(PluginManager::load_plugins(
        &plugins::catalog(),
        &config.installed_plugins,
        store.clone(),
    )?);
    for (plugin, e) in plugin_manager.errored_plugins() {
        warn!(%plugin, error = %e, "Plugin not loaded");
    }

    let (jobs, job_requests) = QueuedJobScheduler::new();
    let manager = Arc::new(ResourceManager::new(
        plugin_manager.registry(),
        store.clone(),
        Arc::new(jobs),
    ));
    info!("Resource manager initialized");

    let shutdown = CancellationToken::new();

    let scan = ScanDaemon::new(plugin_manager.clone(), manager.clone(), config.clone());
    let agents = AgentDaemon::new(plugin_manager.clone(), manager.clone(), config.clone());
    let (agent_tx, agent_rx) = mpsc::channel::<AgentMessage>(256);

    let router = control_router(scan.clone(), manager.clone())?;
    let control_addr = config.control_socket_addr()?;

    let mut tasks = vec![
        tokio::spawn(scan.clone().run()),
        tokio::spawn(agents.clone().run(agent_rx, shutdown.child_token())),
        tokio::spawn(log_job_requests(job_requests, shutdown.child_token())),
    ];
    if args.agent_stdin {
        tasks.push(tokio::spawn(read_agent_messages(agent_tx.clone(), shutdown.child_token())));
    }
    tasks.push(tokio::spawn({
        let shutdown = shutdown.child_token();
        async move {
            if let Err(e) = serve_control(control_addr, router, shutdown).await {
                error!("Control server error: {}", e);
            }
        }
    }));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");
    shutdown.cancel();
    scan.shutdown();
    drop(agent_tx);

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!("Task failed during shutdown: {}", e);
        }
    }

    info!("Storage Resource Manager shutdown complete");
    Ok(())
}

// =============================================================================
// Queues
// =============================================================================

async fn read_agent_messages(tx: mpsc::Sender<AgentMessage>, shutdown: CancellationToken) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read agent messages: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AgentMessage>(&line) {
            Ok(message) => {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Discarding malformed agent message"),
        }
    }
}

async fn log_job_requests(mut requests: mpsc::UnboundedReceiver<JobRequest>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            request = requests.recv() => match request {
                Some(JobRequest::CreateHost { host_id, address }) => {
                    info!(host_id, %address, "Queued host creation");
                }
                None => break,
            },
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn", "axum=info"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
