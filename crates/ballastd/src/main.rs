//! ballastd — the Ballast control-plane daemon.
//!
//! Wires the subsystems of one control-plane process:
//! - Local store (redb metadata + in-process leases)
//! - Leadership driver
//! - Scheduling loop with the default schedulers
//!
//! # Usage
//!
//! ```text
//! ballastd run --config ballast.toml --data-dir /var/lib/ballast --node-id 1 --name ballast-1
//! ballastd config > ballast.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ballast_coordinator::{DriverOptions, LeadershipDriver, LoggingSink, ScheduleLoop};
use ballast_core::{Config, Node};
use ballast_scheduler::default_schedulers;
use ballast_state::LocalStore;

#[derive(Parser)]
#[command(name = "ballastd", about = "Ballast control-plane daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a control-plane node.
    Run {
        /// Scheduling configuration (ballast.toml). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the metadata store.
        #[arg(long, default_value = "/var/lib/ballast")]
        data_dir: PathBuf,

        /// Unique id of this node.
        #[arg(long, default_value = "1")]
        node_id: u64,

        /// Name of this node.
        #[arg(long, default_value = "ballast-1")]
        name: String,

        /// Address other nodes forward requests to.
        #[arg(long, default_value = "127.0.0.1:2379")]
        addr: String,

        /// Leader lease TTL in seconds.
        #[arg(long, default_value = "5")]
        lease_ttl: i64,

        /// Hold the leader lock across leader activation, so a successor
        /// only activates after this node's step-down has finished.
        #[arg(long)]
        lock_if_become_leader: bool,

        /// Runtime refresh interval in milliseconds.
        #[arg(long, default_value = "1000")]
        refresh_ms: u64,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            node_id,
            name,
            addr,
            lease_ttl,
            lock_if_become_leader,
            refresh_ms,
        } => {
            let config = load_config(config.as_ref())?;
            let node = Node::new(node_id, name, addr);
            let options = DriverOptions {
                lease_ttl_secs: lease_ttl,
                lock_if_become_leader,
                ..DriverOptions::default()
            };
            run(config, data_dir, node, options, Duration::from_millis(refresh_ms)).await
        }
        Command::Config { config } => {
            print!("{}", load_config(config.as_ref())?.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ballastd=debug,ballast_coordinator=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            let config = Config::from_file(path)?;
            info!(path = ?path, "configuration loaded");
            Ok(config)
        }
        None => Ok(Config::default()),
    }
}

async fn run(
    config: Config,
    data_dir: PathBuf,
    node: Node,
    options: DriverOptions,
    refresh: Duration,
) -> anyhow::Result<()> {
    info!(node = %node, lease_ttl = options.lease_ttl_secs, "Ballast daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("ballast.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = LocalStore::open(&db_path)?;
    info!(path = ?db_path, "store opened");

    let driver = LeadershipDriver::new(Arc::new(store), node, config.clone(), options)?;

    let schedule = ScheduleLoop::new(driver.clone(), config.clone(), Arc::new(LoggingSink))
        .with_refresh_interval(refresh);

    // ── Start background tasks ─────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let election_handle = driver.start(shutdown_rx.clone()).await;
    info!(leader = driver.is_leader(), "leadership driver started");

    let schedulers = default_schedulers(&config);
    let names: Vec<String> = schedulers.iter().map(|s| s.name().to_string()).collect();
    let schedule_handles = schedule.spawn(schedulers, shutdown_rx);
    info!(schedulers = ?names, "scheduling loop started");

    // ── Shutdown ───────────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = election_handle.await;
    for handle in schedule_handles {
        let _ = handle.await;
    }

    info!("Ballast daemon stopped");
    Ok(())
}
