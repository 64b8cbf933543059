// src/bin/main.rs

use clap::{Parser, Subcommand};
use ledger_fleet_simulator::report::format_duration;
use ledger_fleet_simulator::{
    FleetManager, FleetMonitor, HttpClientFactory, JsonReportWriter, Orchestrator,
    ProcessLauncher, SimulatorConfig,
};
use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Ledger fleet simulator
///
/// Launches a local fleet of ledger nodes and drives randomized transfer
/// workloads across its transaction nodes.
#[derive(Parser, Debug)]
#[command(name = "ledger-fleet-sim")]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON file with configuration overrides
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the fleet data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one simulation and print its sealed result as JSON
    Simulate {
        #[arg(short, long, default_value = "2")]
        nodes: usize,

        #[arg(short, long, default_value = "10")]
        transactions: usize,
    },

    /// Manage the node fleet directly
    Fleet {
        #[command(subcommand)]
        action: FleetAction,
    },

    /// Periodically recover failed nodes and refill low balances
    Monitor,
}

#[derive(Subcommand, Debug)]
enum FleetAction {
    /// Bring up (or resume and rescale) the fleet
    Start {
        #[arg(short, long, default_value = "2")]
        count: usize,

        /// Discard existing fleet state first
        #[arg(long)]
        fresh: bool,
    },
    Stop,
    /// Revive the persisted fleet, or force-restart the named nodes
    Restart { ids: Vec<String> },
    Status,
    /// Recover a single failed node
    Recover { id: String },
}

fn load_config(args: &Args) -> Result<SimulatorConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => SimulatorConfig::from_file(path)?,
        None => SimulatorConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ledger_fleet_simulator=info")),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(load_config(&args)?);

    let clients = Arc::new(HttpClientFactory::new(&config)?);
    let launcher = Arc::new(
        ProcessLauncher::new(config.node_binary())
            .with_support_files(config.node_support_files.clone()),
    );
    let fleet = Arc::new(FleetManager::new(
        config.clone(),
        launcher,
        clients.clone(),
    ));

    match args.command {
        Command::Simulate {
            nodes,
            transactions,
        } => {
            let reports = Arc::new(JsonReportWriter::new(&config.reports_dir));
            let orchestrator = Orchestrator::new(config.clone(), fleet, clients, reports);
            let id = orchestrator.start(nodes, transactions)?;
            info!(run = %id, "simulation started");

            let run = orchestrator.wait_for(&id, Duration::from_secs(1)).await?;
            info!(
                run = %id,
                success = run.stats.success_count,
                failure = run.stats.failure_count,
                took = %format_duration(Duration::from_millis(run.total_time_ms)),
                "simulation finished"
            );
            println!("{}", serde_json::to_string_pretty(&run)?);
            if let Some(error) = &run.error {
                return Err(error.clone().into());
            }
        }

        Command::Fleet { action } => match action {
            FleetAction::Start { count, fresh } => {
                let nodes = fleet.ensure_fleet(count, fresh).await?;
                if let Some(summary) = fleet.last_bootstrap() {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                println!("{}", serde_json::to_string_pretty(&nodes)?);
            }
            FleetAction::Stop => {
                fleet.stop_fleet().await?;
            }
            FleetAction::Restart { ids } if ids.is_empty() => {
                let nodes = fleet.restart_fleet().await?;
                println!("{}", serde_json::to_string_pretty(&nodes)?);
            }
            FleetAction::Restart { ids } => {
                fleet.attach().await?;
                fleet.restart_nodes(&ids).await?;
                info!(nodes = ?ids, "restarted");
            }
            FleetAction::Status => {
                fleet.attach().await?;
                let statuses = fleet.check_all_status().await;
                let peers = fleet.peer_counts().await;
                let report: BTreeMap<_, _> = statuses
                    .iter()
                    .map(|(id, status)| {
                        (id, serde_json::json!({ "status": status, "peers": peers.get(id) }))
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            FleetAction::Recover { id } => {
                fleet.attach().await?;
                fleet.recover_node(&id).await?;
                info!(node = %id, "recovered");
            }
        },

        Command::Monitor => {
            if !config.monitor.enabled {
                warn!("monitor disabled in configuration");
                return Ok(());
            }
            fleet.attach().await?;

            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            let monitor = tokio::spawn(FleetMonitor::new(fleet.clone(), shutdown_rx).run());
            tokio::signal::ctrl_c().await?;
            shutdown_tx.send(()).await?;
            monitor.await?;
        }
    }

    Ok(())
}
