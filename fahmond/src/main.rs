//! fahmon daemon
//!
//! Connects to every configured Folding@home client, keeps a live model of
//! their slots and work units, records completed units and protein
//! benchmarks, and estimates production.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use fahmon_common::{ClientIdentifier, LogConfig, init_logging};
use fahmon_telemetry::{ProteinBenchmarkService, ProteinCatalog};
use fahmond::client::{ClientServices, ConnectionState, Connector, SlotModel, TcpConnector};
use fahmond::config::{self, DaemonConfig};
use fahmond::events::{EventBus, FleetEvent};
use fahmond::fleet::ClientFleet;
use fahmond::history::WorkUnitHistory;
use fahmond::poller::RetrievePoller;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Passes `--once` makes while clients are still sending their first burst.
const ONCE_MAX_PASSES: usize = 10;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExampleConfig {
    Clients,
    Daemon,
}

#[derive(Parser)]
#[command(name = "fahmond")]
#[command(author, version, about = "fahmon daemon - Folding@home client fleet monitoring")]
struct Cli {
    /// Path to clients configuration
    #[arg(short, long, env = "FAHMON_CLIENTS")]
    clients_config: Option<PathBuf>,

    /// Path to daemon configuration
    #[arg(long, env = "FAHMON_CONFIG")]
    config: Option<PathBuf>,

    /// Path to completed unit history (JSONL format)
    #[arg(long)]
    history_file: Option<PathBuf>,

    /// Path to protein benchmark file
    #[arg(long)]
    benchmarks_file: Option<PathBuf>,

    /// Path to protein catalog (JSON)
    #[arg(long)]
    project_summary: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Retrieve every client once, print the fleet as JSON and exit
    #[arg(long)]
    once: bool,

    /// Print fleet events to stdout as JSON lines
    #[arg(long)]
    events: bool,

    /// Print an example configuration file and exit
    #[arg(long, value_enum)]
    print_example: Option<ExampleConfig>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(example) = cli.print_example {
        match example {
            ExampleConfig::Clients => print!("{}", config::example_clients_config()),
            ExampleConfig::Daemon => print!("{}", config::example_daemon_config()),
        }
        return Ok(());
    }

    let mut daemon = config::load_daemon_config(cli.config.as_deref())?;
    apply_overrides(&mut daemon, &cli);

    let mut log_config = LogConfig::from_env(&daemon.log_level).with_verbosity(cli.verbose);
    if cli.once || cli.events {
        // stdout carries the report and event lines
        log_config = log_config.with_stderr();
    }
    let _logging_guards = init_logging(&log_config)?;

    info!("Starting fahmon daemon...");

    let history = open_history(&daemon);
    let services = build_services(&daemon, Arc::clone(&history))?;
    let connector = TcpConnector {
        connect_timeout: daemon.connect_timeout(),
        heartbeat_timeout: daemon.heartbeat_timeout(),
    };
    let fleet = Arc::new(ClientFleet::new(connector, services.clone()));

    let clients = config::load_clients(cli.clients_config.as_deref())?;
    for settings in clients {
        let name = settings.name.clone();
        if let Err(e) = fleet.add(settings).await {
            warn!(client = %name, error = %e, "skipping client");
        }
    }
    info!("Monitoring {} clients", fleet.len().await);

    let printer = cli
        .events
        .then(|| tokio::spawn(print_events(services.events.subscribe())));

    let poller = RetrievePoller::new(Arc::clone(&fleet), daemon.retrieve_interval());
    if cli.once {
        run_once(&poller, &fleet).await?;
    } else {
        let handle = poller.start();
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Shutdown signal received");
        poller.stop();
        if let Err(e) = handle.await {
            warn!("Poller task failed: {}", e);
        }
    }

    fleet.clear().await;
    if let Some(printer) = printer {
        printer.abort();
    }

    services.flush_benchmarks().await;
    history.flush().await;
    let stats = history.stats();
    info!(
        total = stats.total,
        finished = stats.finished,
        failed = stats.failed,
        "unit history"
    );
    if let Err(e) = history.compact() {
        warn!("Failed to compact unit history: {}", e);
    }

    info!("Daemon stopped");
    Ok(())
}

fn apply_overrides(daemon: &mut DaemonConfig, cli: &Cli) {
    if let Some(path) = &cli.history_file {
        daemon.history_file = Some(path.clone());
    }
    if let Some(path) = &cli.benchmarks_file {
        daemon.benchmarks_file = Some(path.clone());
    }
    if let Some(path) = &cli.project_summary {
        daemon.project_summary = Some(path.clone());
    }
}

fn open_history(daemon: &DaemonConfig) -> Arc<WorkUnitHistory> {
    let capacity = daemon.history_capacity;
    let Some(path) = daemon.history_path() else {
        info!("Unit history in-memory only (no persistence)");
        return Arc::new(WorkUnitHistory::new(capacity));
    };

    if path.exists() {
        match WorkUnitHistory::load_from_file(&path, capacity) {
            Ok(h) => {
                info!("Loaded unit history from {:?} ({} entries)", path, h.len());
                Arc::new(h)
            }
            Err(e) => {
                warn!("Failed to load history from {:?}: {}", path, e);
                Arc::new(WorkUnitHistory::new(capacity).with_persistence(path))
            }
        }
    } else {
        info!("Creating new unit history at {:?}", path);
        Arc::new(WorkUnitHistory::new(capacity).with_persistence(path))
    }
}

fn build_services(daemon: &DaemonConfig, history: Arc<WorkUnitHistory>) -> Result<ClientServices> {
    let benchmarks = match daemon.benchmarks_path() {
        Some(path) => ProteinBenchmarkService::load_from_file(&path)?,
        None => ProteinBenchmarkService::new(),
    };
    info!("Loaded {} protein benchmarks", benchmarks.len());

    let catalog = match &daemon.project_summary {
        Some(path) => ProteinCatalog::load(path)?,
        None => {
            warn!("No protein catalog configured; production estimates disabled");
            ProteinCatalog::new()
        }
    };

    Ok(ClientServices {
        benchmarks: Arc::new(benchmarks),
        repository: history,
        catalog: Arc::new(catalog),
        events: EventBus::new(daemon.event_buffer),
        bonus: daemon.bonus,
    })
}

#[derive(Serialize)]
struct ClientReport {
    client: ClientIdentifier,
    state: ConnectionState,
    retrieved_at: Option<DateTime<Utc>>,
    slots: Vec<SlotModel>,
}

/// Retrieve until no client is still waiting for its first burst, then print
/// every client's slots.
async fn run_once<C: Connector>(poller: &RetrievePoller<C>, fleet: &ClientFleet<C>) -> Result<()> {
    for pass in 1..=ONCE_MAX_PASSES {
        let summary = poller.poll_once().await;
        if summary.waiting == 0 {
            break;
        }
        if pass < ONCE_MAX_PASSES {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    let clients: Vec<ClientReport> = fleet
        .clients()
        .await
        .iter()
        .map(|client| ClientReport {
            client: client.identifier().clone(),
            state: client.state(),
            retrieved_at: client.last_retrieved(),
            slots: client.slots(),
        })
        .collect();
    let report = serde_json::to_string_pretty(&clients).context("Failed to serialize fleet")?;
    println!("{report}");
    Ok(())
}

async fn print_events(mut rx: broadcast::Receiver<FleetEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Some(line) = event.to_json_line() {
                    println!("{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event printer lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "fahmond",
            "-vv",
            "--once",
            "--clients-config",
            "/tmp/clients.toml",
            "--history-file",
            "/tmp/history.jsonl",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.once);
        assert!(!cli.events);
        assert_eq!(cli.clients_config, Some(PathBuf::from("/tmp/clients.toml")));
    }

    #[test]
    fn test_overrides_replace_config_paths() {
        let cli = Cli::try_parse_from([
            "fahmond",
            "--history-file",
            "/tmp/h.jsonl",
            "--project-summary",
            "/tmp/psummary.json",
        ])
        .unwrap();
        let mut daemon = DaemonConfig::default();
        apply_overrides(&mut daemon, &cli);
        assert_eq!(daemon.history_path(), Some(PathBuf::from("/tmp/h.jsonl")));
        assert_eq!(daemon.project_summary, Some(PathBuf::from("/tmp/psummary.json")));
        assert_eq!(daemon.benchmarks_file, None);
    }

    #[test]
    fn test_build_services_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let summary = dir.path().join("psummary.json");
        std::fs::write(&summary, r#"[{"id": 13406, "credit": 9405, "frames": 100}]"#).unwrap();

        let daemon = DaemonConfig {
            benchmarks_file: Some(dir.path().join("benchmarks.json")),
            project_summary: Some(summary),
            ..DaemonConfig::default()
        };
        let history = Arc::new(WorkUnitHistory::new(10));
        let services = build_services(&daemon, history).unwrap();
        assert!(services.benchmarks.is_empty());
        assert_eq!(services.catalog.len(), 1);
    }

    #[test]
    fn test_open_history_creates_persistent_history() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = DaemonConfig {
            history_file: Some(dir.path().join("history.jsonl")),
            ..DaemonConfig::default()
        };
        let history = open_history(&daemon);
        assert!(history.is_empty());
    }
}
