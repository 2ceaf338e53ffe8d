//! Storefront Loyalty — points ledger and tier-progression service.
//!
//! Main entry point: loads configuration, replays the journal, and starts
//! the HTTP API, the metrics exporter, and the expiration sweep.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use storefront_api::ApiServer;
use storefront_core::config::AppConfig;
use storefront_core::event_bus::noop_sink;
use storefront_loyalty::{FileJournal, Journal, LoyaltyEngine, MemoryJournal, Program};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "storefront-loyalty")]
#[command(about = "Loyalty points ledger and tier-progression engine")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, env = "STOREFRONT_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "STOREFRONT__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "STOREFRONT__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Journal file (overrides config)
    #[arg(long, env = "STOREFRONT__LOYALTY__STORAGE__JOURNAL_PATH")]
    journal: Option<String>,

    /// Keep the ledger in memory only; nothing survives a restart
    #[arg(long, default_value_t = false)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "storefront_loyalty=info,storefront_api=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Storefront Loyalty starting up");

    // A named config file must load; without one, fall back to defaults.
    let mut config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) if cli.config.is_none() => {
            warn!(error = %e, "Failed to load config, using defaults");
            AppConfig::default()
        }
        Err(e) => return Err(e.into()),
    };

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(journal) = cli.journal {
        config.loyalty.storage.journal_path = Some(journal);
    }
    if cli.in_memory {
        config.loyalty.storage.journal_path = None;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        journal = ?config.loyalty.storage.journal_path,
        program = %config.loyalty.program.program_id,
        version = config.loyalty.program.version,
        "Configuration loaded"
    );

    // An invalid program is fatal.
    let program = Arc::new(Program::new(config.loyalty.program.clone())?);

    let journal: Arc<dyn Journal> = match &config.loyalty.storage.journal_path {
        Some(path) => Arc::new(FileJournal::open(path, config.loyalty.storage.sync_writes)?),
        None => {
            warn!("No journal configured, ledger is in memory only");
            Arc::new(MemoryJournal::new())
        }
    };

    let engine = Arc::new(LoyaltyEngine::new(program, journal, noop_sink())?);

    let api_server = ApiServer::new(config.clone(), engine.clone());

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    // Spawn expiration sweep
    let sweep_engine = engine.clone();
    let sweep_every = Duration::from_secs(config.loyalty.expiry_sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let engine = sweep_engine.clone();
            let result =
                tokio::task::spawn_blocking(move || engine.expire_points(chrono::Utc::now())).await;
            match result {
                Ok(report) if !report.failed.is_empty() => warn!(
                    failed = ?report.failed,
                    swept = report.accounts_swept,
                    "Expiration sweep incomplete, failed accounts retry next tick"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Expiration sweep task panicked"),
            }
        }
    });

    info!(
        accounts = engine.account_count(),
        "Storefront Loyalty is ready to serve traffic"
    );

    // Start HTTP server (blocks until shutdown)
    api_server.start_http().await?;

    Ok(())
}
