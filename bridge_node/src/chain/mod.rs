//! Chain Gateway - escrow contract access
//! Lock, unlock, refund and oracle queries as signed transactions with receipt waits

pub mod escrow_abi;
pub mod evm;

use crate::config::{ChainConfig, ChainNetwork};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroize;

pub use escrow_abi::{decode_unlock_events, UnlockEventLog};
pub use evm::EvmChainGateway;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("RPC failure: {0}")]
    Rpc(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },

    #[error("Transaction {0:?} reverted")]
    Reverted(H256),

    #[error("Invalid credential: {0}")]
    Credential(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("ABI error: {0}")]
    Abi(String),

    #[error("Chain setup failed: {0}")]
    Setup(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Rpc(_) | ChainError::Timeout { .. } | ChainError::Reverted(_))
    }
}

pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Hex private key with any `0x` prefix removed. Wiped on drop.
pub struct Credential(String);

impl Credential {
    pub fn parse(raw: &str) -> ChainResult<Self> {
        let trimmed = raw.trim();
        let body = match trimmed.get(..2) {
            Some(prefix) if prefix.eq_ignore_ascii_case("0x") => &trimmed[2..],
            _ => trimmed,
        };
        if body.len() != 64 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ChainError::Credential("expected 32-byte hex private key".to_string()));
        }
        Ok(Self(body.to_ascii_lowercase()))
    }

    pub fn expose_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Arguments of the escrow's lock entry point
#[derive(Debug, Clone, PartialEq)]
pub struct LockPaymentCall {
    pub content_id: String,
    /// Lock time in UTC milliseconds.
    pub lock_time: i64,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxLog {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub success: bool,
    pub block_number: Option<u64>,
    pub logs: Vec<TxLog>,
}

/// Handles acquired once per unlock/refund tick and shared by every deal in it
#[async_trait]
pub trait EscrowSession: Send + Sync {
    /// Address unlocked funds are released to.
    fn recipient(&self) -> Address;

    /// Escrow contract whose logs carry unlock events.
    fn escrow(&self) -> Address;

    async fn is_payment_available(&self, deal_id: &str, recipient: Address) -> ChainResult<bool>;

    async fn unlock_payment(&self, deal_id: &str, recipient: Address) -> ChainResult<H256>;

    async fn refund(&self, content_ids: &[String]) -> ChainResult<H256>;
}

#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Acquire the recipient, escrow transactor, oracle session and
    /// transaction options for one tick.
    async fn open_session(&self) -> ChainResult<Arc<dyn EscrowSession>>;

    /// Sign and broadcast a lock with the depositor's own key. Nonce and gas
    /// price are fetched right before signing.
    async fn lock_payment(
        &self,
        depositor: Address,
        credential: &Credential,
        call: &LockPaymentCall,
    ) -> ChainResult<H256>;

    /// Block until the receipt is available or the configured wait elapses.
    async fn wait_for_receipt(&self, tx_hash: H256) -> ChainResult<TxReceipt>;
}

/// Factory for chain gateways, one implementation per target network
pub struct ChainGatewayFactory;

impl ChainGatewayFactory {
    pub async fn create(config: &ChainConfig) -> ChainResult<Arc<dyn ChainGateway>> {
        match config.network {
            ChainNetwork::Polygon | ChainNetwork::PolygonMumbai | ChainNetwork::Ethereum | ChainNetwork::Local => {
                let gateway = EvmChainGateway::connect(config.clone()).await?;
                Ok(Arc::new(gateway))
            }
        }
    }
}

/// Bound a chain call by the configured deadline.
pub async fn with_deadline<T, F>(operation: &'static str, after: Duration, fut: F) -> ChainResult<T>
where
    F: std::future::Future<Output = ChainResult<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ChainError::Timeout { operation, after }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn test_credential_strips_hex_prefix() {
        let plain = Credential::parse(KEY).unwrap();
        let prefixed = Credential::parse(&format!("0x{KEY}")).unwrap();
        let upper = Credential::parse(&format!("0X{}", KEY.to_uppercase())).unwrap();
        assert_eq!(plain.expose_hex(), KEY);
        assert_eq!(prefixed.expose_hex(), KEY);
        assert_eq!(upper.expose_hex(), KEY);
    }

    #[test]
    fn test_credential_rejects_malformed_keys() {
        assert!(Credential::parse("0x1234").is_err());
        assert!(Credential::parse(&"zz".repeat(32)).is_err());
        assert!(format!("{:?}", Credential::parse(KEY).unwrap()).contains("redacted"));
    }

    #[tokio::test]
    async fn test_deadline_maps_to_timeout() {
        let result: ChainResult<()> = with_deadline("probe", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(ChainError::Timeout { operation: "probe", .. })));
    }
}
