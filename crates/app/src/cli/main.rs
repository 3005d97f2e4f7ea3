//! patchbay CLI Application

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use patchbay_core::domain::config::{ConfigManager, PatchbayConfig};
use patchbay_core::domain::graph::{GraphBackend, StreamInfo};
use patchbay_core::domain::resolver::{PortResolver, PortRole, RoleTable};
use patchbay_core::domain::snapshot::GraphSnapshot;
use patchbay_core::domain::watcher::EventWatcher;
use patchbay_infra::graph::{EventHub, GraphPoller, MemoryGraph, PwDumpGraph};

#[derive(Parser)]
#[command(name = "patchbay")]
#[command(about = "Automatic stream routing for multi-port audio sinks", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to ~/.config/patchbay/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the PipeWire graph and route new streams (default)
    Run,
    /// Show how the target device's ports resolve right now
    Check,
    /// Print the effective configuration
    PrintConfig,
    /// Route a stream through an in-memory graph and show the result
    Simulate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(cli.config).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Check => check(config).await,
        Command::PrintConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Simulate => simulate(config).await,
    }
}

async fn load_config(path: Option<PathBuf>) -> anyhow::Result<PatchbayConfig> {
    match path {
        Some(path) => PatchbayConfig::load_from_file(&path)
            .await
            .with_context(|| format!("loading {}", path.display())),
        None => {
            let dir = ConfigManager::default_config_dir()?;
            Ok(ConfigManager::new(dir).load().await)
        }
    }
}

async fn run(config: PatchbayConfig) -> anyhow::Result<()> {
    info!(device = %config.routing.target_device_name, "patchbay starting");

    let hub = Arc::new(EventHub::new());
    let backend: Arc<dyn GraphBackend> = Arc::new(PwDumpGraph::new(hub.clone()));
    let lifecycle = backend
        .subscribe_lifecycle()
        .await
        .context("subscribing to graph lifecycle events")?;

    let poller = GraphPoller::new(backend.clone(), hub, &config.engine);
    let (stop_tx, mut stop_rx) = watch::channel(());
    let poller_task = tokio::spawn(poller.run(async move {
        let _ = stop_rx.changed().await;
    }));

    let mut watcher = EventWatcher::new(backend, config.routing, &config.engine);
    watcher
        .run(lifecycle, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    let _ = stop_tx.send(());
    poller_task.await.context("joining graph poller")?;

    let stats = watcher.stats();
    info!(
        passes = stats.passes,
        links_created = stats.links_created,
        links_removed = stats.links_removed,
        failures = stats.failures,
        deferred = stats.deferred,
        "patchbay stopped"
    );
    Ok(())
}

async fn check(config: PatchbayConfig) -> anyhow::Result<()> {
    let backend = PwDumpGraph::new(Arc::new(EventHub::new()));
    let snapshot = GraphSnapshot::capture(&backend, config.engine.operation_timeout())
        .await
        .context("reading the PipeWire graph")?;

    let device = &config.routing.target_device_name;
    let ports = PortResolver::resolve_roles(&snapshot, device, &RoleTable::from(&config.routing));

    if !ports.device_present {
        println!("{device}: not present");
        return Ok(());
    }

    let table = RoleTable::from(&config.routing);
    println!("{device}: present");
    for role in PortRole::ALL {
        let name = table.port_name(role).unwrap_or("?");
        match ports.get(role) {
            Some(id) => println!("  {role:<14} {name} -> port {id}"),
            None => println!("  {role:<14} {name} -> not found"),
        }
    }
    Ok(())
}

async fn simulate(config: PatchbayConfig) -> anyhow::Result<()> {
    let routing = config.routing.clone();
    let graph = Arc::new(MemoryGraph::new());

    let (mon_l, mon_r) = &routing.monitor_port_names;
    let (main_l, main_r) = &routing.main_port_names;
    graph.add_device(
        &routing.target_device_name,
        &[mon_l.as_str(), mon_r.as_str(), main_l.as_str(), main_r.as_str()],
    );

    let mut watcher = EventWatcher::new(graph.clone(), routing.clone(), &config.engine);
    watcher.on_device_ready(&routing.target_device_name).await;

    let node = graph.add_stream("simulated-player", 2);
    let report = watcher
        .on_stream_appeared(StreamInfo {
            node,
            name: "simulated-player".to_string(),
            channel_count: 2,
            linked: false,
        })
        .await
        .context("simulated stream was not routed")?;

    println!("decision: {}", report.decision.outcome);
    for (pair, outcome) in &report.result.created {
        println!("  {pair}: {outcome:?}");
    }
    println!("links in graph: {}", graph.link_count());
    Ok(())
}
