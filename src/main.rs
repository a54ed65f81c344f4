use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use time::{format_description::well_known, OffsetDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use portwatch::agent::Agent;
use portwatch::config::{AgentConfig, ScanConfig};
use portwatch::logging;
use portwatch::scanner::PortScanner;
use portwatch::server;
use portwatch::store::{ScanStore, SqliteStore};
use portwatch::types::{ImportDocument, ImportSummary, ScanId, ServerId, Settings};

/// portwatch — scheduled TCP port discovery for a fleet of servers.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "portwatch",
    version,
    about = "Scheduled TCP port discovery: queues per-server scans, runs them with bounded concurrency and records open ports.",
    long_about = None
)]
struct Cli {
    /// SQLite database path or URI.
    #[arg(long, env = "DATABASE_URL")]
    database: String,

    /// Seconds between scheduler ticks.
    #[arg(long = "tick-secs", default_value_t = 10)]
    tick_secs: u64,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the scheduler loop until Ctrl+C (default).
    Run {
        /// Also serve the control API on this address, e.g. 127.0.0.1:8080.
        #[arg(long)]
        serve: Option<String>,
    },
    /// Run a single scheduling pass and exit.
    Tick,
    /// Register a scan target.
    AddServer {
        #[arg(long)]
        name: String,
        #[arg(long)]
        ip: String,
        /// Never schedule periodic scans for this server.
        #[arg(long, default_value_t = false)]
        exclude: bool,
    },
    /// Queue a full-range scan for a server (no-op if one is already active).
    Scan { server_id: ServerId },
    /// Queue a full-range scan for every non-excluded server without an active one.
    ScanAll,
    /// Cancel a queued or running scan.
    Cancel { scan_id: ScanId },
    /// Print (or write as JSON) the open ports recorded for a server.
    Ports {
        server_id: ServerId,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Import servers and their ports from a JSON file.
    Import { file: PathBuf },
    /// Show or change the scheduling settings.
    Settings {
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long = "interval-minutes")]
        interval_minutes: Option<u32>,
        #[arg(long)]
        concurrency: Option<u32>,
    },
}

#[derive(Debug, Serialize)]
struct PortsExport {
    server_id: ServerId,
    exported_at: String,
    ports: Vec<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let config = AgentConfig {
        database_url: cli.database.clone(),
        tick_interval: Duration::from_secs(cli.tick_secs.max(1)),
        scan: ScanConfig::from_env(),
    };

    let store = Arc::new(
        SqliteStore::open(&config.database_url)
            .with_context(|| format!("unable to open database {}", config.database_url))?,
    );

    match cli.command.unwrap_or(Command::Run { serve: None }) {
        Command::Run { serve } => run_agent(config, store, serve).await,
        Command::Tick => {
            let agent = build_agent(&config, Arc::clone(&store));
            let outcomes = agent.tick(&CancellationToken::new()).await;
            for (scan_id, outcome) in outcomes {
                println!("scan {scan_id}: {outcome:?}");
            }
            Ok(())
        }
        Command::AddServer { name, ip, exclude } => {
            let id = store.add_server(&name, &ip, exclude).await?;
            println!("server {id} added ({name} @ {ip})");
            Ok(())
        }
        Command::Scan { server_id } => {
            let (scan_id, created) = store.request_scan(server_id).await?;
            if created {
                println!("scan {scan_id} queued for server {server_id}");
            } else {
                println!("scan {scan_id} already in progress for server {server_id}");
            }
            Ok(())
        }
        Command::ScanAll => {
            let queued = store.queue_all().await?;
            println!("{queued} scan(s) queued");
            Ok(())
        }
        Command::Import { file } => {
            let summary = import_ports_json(&store, &file).await?;
            println!(
                "{} server(s) created, {} port(s) created, {} skipped",
                summary.servers_created, summary.ports_created, summary.ports_skipped
            );
            Ok(())
        }
        Command::Cancel { scan_id } => {
            if store.cancel_scan(scan_id).await? {
                println!("scan {scan_id} canceled");
            } else {
                println!("scan {scan_id} is not queued or running");
            }
            Ok(())
        }
        Command::Ports { server_id, output } => {
            let ports = store.list_ports(server_id).await?;
            match output.as_deref() {
                Some(path) => {
                    write_ports_json(path, server_id, ports)?;
                    println!("Wrote JSON ports to {}", path.display());
                }
                None => {
                    println!("server {server_id}: {} open port(s)", ports.len());
                    for port in ports {
                        println!("  {port}");
                    }
                }
            }
            Ok(())
        }
        Command::Settings {
            enabled,
            interval_minutes,
            concurrency,
        } => {
            let current = store.get_settings().await?;
            let updated = Settings {
                scan_enabled: enabled.unwrap_or(current.scan_enabled),
                scan_interval_minutes: interval_minutes.unwrap_or(current.scan_interval_minutes),
                scan_concurrency: concurrency.unwrap_or(current.scan_concurrency),
            };
            if updated != current {
                store.update_settings(updated).await?;
            }
            println!("{}", serde_json::to_string_pretty(&store.get_settings().await?)?);
            Ok(())
        }
    }
}

fn build_agent(config: &AgentConfig, store: Arc<SqliteStore>) -> Agent {
    let store: Arc<dyn ScanStore> = store;
    Agent::new(store, PortScanner::new(config.scan.clone()), config.tick_interval)
}

async fn run_agent(config: AgentConfig, store: Arc<SqliteStore>, serve: Option<String>) -> Result<()> {
    info!(
        database = %config.database_url,
        workers = config.scan.workers,
        dial_timeout_ms = config.scan.dial_timeout.as_millis() as u64,
        retries = config.scan.max_retries,
        "portwatch starting"
    );

    let shutdown = CancellationToken::new();
    let ctrlc = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        info!("shutdown requested");
        ctrlc.cancel();
    });

    if let Some(bind) = serve {
        let api_store = Arc::clone(&store);
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, api_store).await {
                error!(error = %e, "control API server error");
            }
        });
    }

    let agent = build_agent(&config, store);
    agent.run(shutdown).await;
    Ok(())
}

fn write_ports_json(path: &Path, server_id: ServerId, ports: Vec<u16>) -> Result<()> {
    let export = PortsExport {
        server_id,
        exported_at: now_rfc3339(),
        ports,
    };
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, &export)?;
    Ok(())
}

async fn import_ports_json(store: &SqliteStore, path: &Path) -> Result<ImportSummary> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let doc: ImportDocument = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("invalid import format in {}", path.display()))?;
    Ok(store.import_servers(doc.into_servers()).await?)
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
