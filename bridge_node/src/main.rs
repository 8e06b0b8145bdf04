use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use payment_bridge::archiver::PackArchiver;
use payment_bridge::chain::ChainGatewayFactory;
use payment_bridge::config::Config;
use payment_bridge::jobs::{BundlingJob, DealSubmissionJob, Scheduler, UnlockRefundJob};
use payment_bridge::marketplace::HttpMarketplace;
use payment_bridge::storage::{RocksDbStore, StateStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Payment bridge daemon
#[derive(Parser)]
#[command(name = "payment-bridge")]
#[command(about = "Bundles uploads, submits storage deals and settles escrow payments")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config/payment_bridge.yaml")]
    config: PathBuf,

    /// Override the database path from the configuration
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    info!("Starting payment bridge, config {:?}", args.config);

    let mut config = if args.config.exists() {
        Config::from_file(&args.config).context("failed to load configuration")?
    } else {
        warn!("Config file not found, using defaults");
        let mut config = Config::default();
        config.apply_overrides(std::env::var(payment_bridge::config::PRIVATE_KEY_ENV).ok());
        config
    };
    if let Some(dir) = args.data_dir {
        config.database.path = dir;
    }
    config.validate().context("invalid configuration")?;

    let store: Arc<dyn StateStore> = Arc::new(
        RocksDbStore::open(&config.database.path)
            .with_context(|| format!("failed to open database at {:?}", config.database.path))?,
    );
    info!("State store opened at {:?}", config.database.path);

    let chain = ChainGatewayFactory::create(&config.chain)
        .await
        .context("failed to connect chain gateway")?;
    let marketplace = Arc::new(
        HttpMarketplace::new(config.marketplace.clone()).context("failed to build marketplace client")?,
    );

    let bundling = Arc::new(BundlingJob::new(
        store.clone(),
        Arc::new(PackArchiver::new()),
        config.bundling.clone(),
        config.marketplace.deal_duration,
    ));
    let submission = Arc::new(DealSubmissionJob::new(
        store.clone(),
        marketplace,
        config.marketplace.batch_size,
    ));
    let unlock = Arc::new(UnlockRefundJob::new(store.clone(), chain));

    let schedule = &config.schedule;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = Scheduler::new()
        .every(Duration::from_secs(schedule.bundling_interval_secs), bundling)
        .every(Duration::from_secs(schedule.deal_submission_interval_secs), submission)
        .every(Duration::from_secs(schedule.unlock_interval_secs), unlock)
        .spawn(shutdown_rx);
    info!("Payment bridge running with {} jobs", handles.len());

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("Shutdown requested, waiting for running ticks");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Job task ended abnormally: {}", e);
        }
    }

    info!("Payment bridge stopped");
    Ok(())
}
