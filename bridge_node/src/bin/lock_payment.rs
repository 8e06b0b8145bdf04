use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ethers::types::U256;
use log::{error, info};
use payment_bridge::chain::{ChainGatewayFactory, Credential};
use payment_bridge::config::Config;
use payment_bridge::payment::{LockPaymentRequest, LockPaymentService};
use payment_bridge::storage::RocksDbStore;
use std::path::PathBuf;
use std::sync::Arc;
use zeroize::Zeroize;

/// Environment variable holding the depositor's private key
const DEPOSITOR_KEY_ENV: &str = "LOCK_PAYMENT_PRIVATE_KEY";

/// Escrow a storage fee for one content id
#[derive(Parser)]
#[command(name = "lock-payment")]
#[command(about = "Lock a storage fee in the escrow contract for an uploaded file")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config/payment_bridge.yaml")]
    config: PathBuf,

    /// Depositor wallet address
    #[arg(long)]
    depositor: String,

    /// Content id of the uploaded file
    #[arg(long)]
    content_id: String,

    /// Fee in the token's smallest unit
    #[arg(long)]
    fee: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::from_file(&args.config).context("failed to load configuration")?;

    let mut raw_key =
        std::env::var(DEPOSITOR_KEY_ENV).with_context(|| format!("{DEPOSITOR_KEY_ENV} is not set"))?;
    let credential = Credential::parse(&raw_key);
    raw_key.zeroize();
    let credential = credential?;
    let fee = U256::from_dec_str(args.fee.trim()).map_err(|e| anyhow!("invalid fee {:?}: {}", args.fee, e))?;

    let store = Arc::new(
        RocksDbStore::open(&config.database.path)
            .with_context(|| format!("failed to open database at {:?}", config.database.path))?,
    );
    let chain = ChainGatewayFactory::create(&config.chain)
        .await
        .context("failed to connect chain gateway")?;
    let service = LockPaymentService::new(store, chain, config.billing.clone());

    let outcome = service
        .lock_payment(LockPaymentRequest {
            depositor: args.depositor,
            credential,
            content_id: args.content_id,
            fee,
        })
        .await?;

    if outcome.success {
        info!("Lock payment confirmed: {:?}", outcome.tx_hash);
        if let Some(bundle_id) = outcome.promoted_bundle {
            info!("Bundle {} is now fully paid", bundle_id);
        }
        Ok(())
    } else {
        error!("Lock payment failed on chain, look up {:?}", outcome.tx_hash);
        Err(anyhow!("lock payment {:?} failed", outcome.tx_hash))
    }
}
