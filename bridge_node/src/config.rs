use crate::common::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `chain.private_key`
pub const PRIVATE_KEY_ENV: &str = "PAYMENT_BRIDGE_PRIVATE_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    pub marketplace: MarketplaceConfig,
    pub bundling: BundlingConfig,
    pub schedule: ScheduleConfig,
    pub billing: BillingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: PathBuf::from("data/payment_bridge"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainNetwork {
    Polygon,
    PolygonMumbai,
    Ethereum,
    Local,
}

impl ChainNetwork {
    /// Chain id expected on this network. Local nodes are asked instead.
    pub fn default_chain_id(&self) -> Option<u64> {
        match self {
            ChainNetwork::Polygon => Some(137),
            ChainNetwork::PolygonMumbai => Some(80001),
            ChainNetwork::Ethereum => Some(1),
            ChainNetwork::Local => None,
        }
    }
}

impl fmt::Display for ChainNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainNetwork::Polygon => "polygon",
            ChainNetwork::PolygonMumbai => "polygon-mumbai",
            ChainNetwork::Ethereum => "ethereum",
            ChainNetwork::Local => "local",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub network: ChainNetwork,
    pub rpc_url: String,
    /// Overrides the network's default chain id.
    pub chain_id: Option<u64>,
    pub escrow_address: String,
    pub oracle_address: String,
    /// Receives unlocked funds.
    pub recipient_address: String,
    pub gas_limit: u64,
    pub call_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
    pub receipt_timeout_secs: u64,
    /// Operator key used for unlock and refund.
    #[serde(skip_serializing)]
    pub private_key: Option<String>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            network: ChainNetwork::Local,
            rpc_url: "http://127.0.0.1:8545".to_string(),
            chain_id: None,
            escrow_address: String::new(),
            oracle_address: String::new(),
            recipient_address: String::new(),
            gas_limit: 8_000_000,
            call_timeout_secs: 30,
            receipt_poll_interval_ms: 2_000,
            receipt_timeout_secs: 300,
            private_key: None,
        }
    }
}

impl ChainConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    pub fn expected_chain_id(&self) -> Option<u64> {
        self.chain_id.or_else(|| self.network.default_chain_id())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketplaceConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub request_timeout_secs: u64,
    /// Hours between submission and the deal's start epoch.
    pub start_epoch_hours: u64,
    pub verified_deal: bool,
    pub fast_retrieval: bool,
    /// Deal duration recorded on every new bundle.
    pub deal_duration: u64,
    pub max_price: String,
    /// Bundles examined per submission tick.
    pub batch_size: usize,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        MarketplaceConfig {
            api_url: "http://127.0.0.1:8888/api/v1".to_string(),
            api_key: None,
            access_token: None,
            request_timeout_secs: 30,
            start_epoch_hours: 96,
            verified_deal: false,
            fast_retrieval: true,
            deal_duration: 500,
            max_price: "0".to_string(),
            batch_size: 10,
        }
    }
}

impl MarketplaceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundlingConfig {
    /// Per-run staging directories are created under this root.
    pub deal_root: PathBuf,
    /// Upload directories whose source files are bundled.
    pub source_dirs: Vec<PathBuf>,
    pub min_source_bytes: u64,
    pub min_archive_bytes: u64,
}

impl Default for BundlingConfig {
    fn default() -> Self {
        BundlingConfig {
            deal_root: PathBuf::from("data/deals"),
            source_dirs: vec![PathBuf::from("data/uploads")],
            min_source_bytes: 1024,
            min_archive_bytes: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub bundling_interval_secs: u64,
    pub deal_submission_interval_secs: u64,
    pub unlock_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            bundling_interval_secs: 60,
            deal_submission_interval_secs: 60,
            unlock_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub coin_id: u32,
    pub network_id: u32,
    /// Deadline of a lock relative to its lock time.
    pub lock_window_days: i64,
    /// CoinGecko-style `simple/price` endpoint.
    pub price_api_url: String,
    pub price_coin: String,
    pub price_currency: String,
    pub price_timeout_secs: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        BillingConfig {
            coin_id: 1,
            network_id: 1,
            lock_window_days: 6,
            price_api_url: "https://api.coingecko.com/api/v3/simple/price".to_string(),
            price_coin: "filecoin".to_string(),
            price_currency: "usd".to_string(),
            price_timeout_secs: 15,
        }
    }
}

impl Config {
    /// Load a YAML configuration file and apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        config.apply_overrides(std::env::var(PRIVATE_KEY_ENV).ok());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| BridgeError::Config(e.to_string()))
    }

    pub fn apply_overrides(&mut self, private_key: Option<String>) {
        if let Some(key) = private_key.filter(|k| !k.trim().is_empty()) {
            self.chain.private_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("chain.rpc_url", &self.chain.rpc_url),
            ("chain.escrow_address", &self.chain.escrow_address),
            ("chain.oracle_address", &self.chain.oracle_address),
            ("chain.recipient_address", &self.chain.recipient_address),
            ("marketplace.api_url", &self.marketplace.api_url),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(BridgeError::Config(format!("{name} must not be empty")));
            }
        }

        let intervals = [
            ("schedule.bundling_interval_secs", self.schedule.bundling_interval_secs),
            ("schedule.deal_submission_interval_secs", self.schedule.deal_submission_interval_secs),
            ("schedule.unlock_interval_secs", self.schedule.unlock_interval_secs),
            ("chain.call_timeout_secs", self.chain.call_timeout_secs),
            ("chain.receipt_timeout_secs", self.chain.receipt_timeout_secs),
            ("marketplace.request_timeout_secs", self.marketplace.request_timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(BridgeError::Config(format!("{name} must be greater than zero")));
            }
        }

        if self.bundling.source_dirs.is_empty() {
            return Err(BridgeError::Config("bundling.source_dirs must not be empty".to_string()));
        }
        if self.marketplace.batch_size == 0 {
            return Err(BridgeError::Config("marketplace.batch_size must be greater than zero".to_string()));
        }
        Ok(())
    }
}
