use crate::archiver::ArchiveError;
use crate::chain::ChainError;
use crate::marketplace::MarketplaceError;
use crate::storage::StoreError;
use ethers::types::H256;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Unified error for every bridge operation
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Marketplace error: {0}")]
    Marketplace(#[from] MarketplaceError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Price feed error: {0}")]
    Price(String),

    /// The lock transaction was broadcast but its outcome is unknown.
    #[error("Lock payment {tx_hash:?} not confirmed: {source}")]
    Unconfirmed {
        tx_hash: H256,
        #[source]
        source: ChainError,
    },
}

impl BridgeError {
    /// Whether the failed record stays eligible for the next tick.
    ///
    /// Setup failures (bad credentials, bad addresses, bad config) need an
    /// operator and are reported as non-transient.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::Config(_) | BridgeError::InvalidInput(_) => false,
            BridgeError::Chain(e) => e.is_transient(),
            BridgeError::Marketplace(e) => e.is_transient(),
            BridgeError::Unconfirmed { .. } => false,
            BridgeError::Store(_) | BridgeError::Archive(_) | BridgeError::Io(_) | BridgeError::Price(_) => true,
        }
    }
}
