//! warmpoold — the warmpool daemon.
//!
//! Loads `warmpool.toml`, opens the inventory store, builds the configured
//! providers and hands everything to the supervisor.
//!
//! # Usage
//!
//! ```text
//! warmpoold run --config /etc/warmpool/warmpool.toml --data-dir /var/lib/warmpool
//! warmpoold check --config /etc/warmpool/warmpool.toml
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use warmpool_core::Config;
use warmpool_manager::{Context, Supervisor};
use warmpool_provider::ProviderRegistry;
use warmpool_state::InventoryStore;

#[derive(Parser)]
#[command(name = "warmpoold", about = "warmpool daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pool manager until interrupted.
    Run {
        /// Path to warmpool.toml.
        #[arg(long, default_value = "warmpool.toml")]
        config: PathBuf,

        /// Data directory for the inventory store.
        #[arg(long, default_value = "/var/lib/warmpool")]
        data_dir: PathBuf,

        /// Stop after this many supervisor sweeps.
        #[arg(long)]
        max_loops: Option<u64>,
    },
    /// Validate the configuration and print it with defaults applied.
    Check {
        #[arg(long, default_value = "warmpool.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            max_loops,
        } => run(&config, &data_dir, max_loops).await,
        Command::Check { config } => check(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,warmpool=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = Config::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let providers = ProviderRegistry::new().build_all(&config)?;
    info!(
        pools = config.pools.len(),
        providers = providers.len(),
        "configuration is valid"
    );
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn run(config_path: &Path, data_dir: &Path, max_loops: Option<u64>) -> anyhow::Result<()> {
    info!("warmpool daemon starting");

    let config = load_config(config_path)?;
    info!(path = %config_path.display(), pools = config.pools.len(), "configuration loaded");

    // ── Initialize subsystems ──────────────────────────────────

    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("warmpool.redb");
    let store = InventoryStore::open(&db_path)?;
    info!(path = ?db_path, "inventory store opened");

    let providers = ProviderRegistry::new().build_all(&config)?;
    let ctx = Context::new(config, store, providers)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => {
                // Keep the sender alive so workers are not told to stop.
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
        let _ = shutdown_tx.send(true);
    });

    Supervisor::new(ctx.clone()).run(shutdown_rx, max_loops).await?;

    let snapshot = ctx.metrics.snapshot().await;
    for (name, value) in &snapshot.counters {
        info!(metric = %name, value, "counter");
    }
    for (name, value) in &snapshot.gauges {
        info!(metric = %name, value, "gauge");
    }
    for (name, timing) in &snapshot.timings {
        info!(
            metric = %name,
            count = timing.count,
            mean_secs = timing.mean_secs,
            max_secs = timing.max_secs,
            "timing"
        );
    }

    info!("warmpool daemon stopped");
    Ok(())
}
