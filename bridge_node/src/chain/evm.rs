//! EVM chain gateway using ethers-rs
//!
//! Talks to the escrow and oracle contracts over JSON-RPC. Transactions are
//! signed locally, either with the bridge operator key (unlock, refund) or
//! with the depositor's own key (lock).

use super::escrow_abi::{
    decode_bool, encode_lock_payment, encode_payment_available, encode_refund, encode_unlock_payment,
};
use super::{
    with_deadline, ChainError, ChainGateway, ChainResult, Credential, EscrowSession, LockPaymentCall, TxLog,
    TxReceipt,
};
use crate::config::ChainConfig;
use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, TransactionRequest, H256, U256, U64};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

fn parse_address(label: &str, raw: &str) -> ChainResult<Address> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| ChainError::Address(format!("{label} {raw:?}: {e}")))
}

fn wallet_from(credential: &Credential, chain_id: u64) -> ChainResult<LocalWallet> {
    credential
        .expose_hex()
        .parse::<LocalWallet>()
        .map(|w| w.with_chain_id(chain_id))
        .map_err(|e| ChainError::Credential(e.to_string()))
}

/// Gateway to an EVM network hosting the escrow
pub struct EvmChainGateway {
    provider: Provider<Http>,
    chain_id: u64,
    escrow: Address,
    oracle: Address,
    recipient: Address,
    config: ChainConfig,
}

impl EvmChainGateway {
    pub async fn connect(config: ChainConfig) -> ChainResult<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| ChainError::Setup(format!("failed to create HTTP provider: {e}")))?
            .interval(config.receipt_poll_interval());

        let escrow = parse_address("escrow", &config.escrow_address)?;
        let oracle = parse_address("oracle", &config.oracle_address)?;
        let recipient = parse_address("recipient", &config.recipient_address)?;

        let chain_id = match config.expected_chain_id() {
            Some(id) => id,
            None => with_deadline("get_chainid", config.call_timeout(), async {
                provider
                    .get_chainid()
                    .await
                    .map(|id| id.as_u64())
                    .map_err(|e| ChainError::Rpc(format!("failed to get chain ID: {e}")))
            })
            .await?,
        };

        info!(
            "Chain gateway connected to {} (chain id {}), escrow {:?}",
            config.network, chain_id, escrow
        );

        Ok(Self {
            provider,
            chain_id,
            escrow,
            oracle,
            recipient,
            config,
        })
    }

    async fn gas_price(&self) -> ChainResult<U256> {
        with_deadline("get_gas_price", self.config.call_timeout(), async {
            self.provider
                .get_gas_price()
                .await
                .map_err(|e| ChainError::Rpc(format!("failed to get gas price: {e}")))
        })
        .await
    }
}

#[async_trait]
impl ChainGateway for EvmChainGateway {
    async fn open_session(&self) -> ChainResult<Arc<dyn EscrowSession>> {
        let raw_key = self
            .config
            .private_key
            .as_deref()
            .ok_or_else(|| ChainError::Credential("no operator key configured".to_string()))?;
        let credential = Credential::parse(raw_key)?;
        let wallet = wallet_from(&credential, self.chain_id)?;
        let gas_price = self.gas_price().await?;

        debug!(
            "Escrow session opened by {:?}, gas price {}, gas limit {}",
            wallet.address(),
            gas_price,
            self.config.gas_limit
        );

        Ok(Arc::new(EvmEscrowSession {
            client: Arc::new(SignerMiddleware::new(self.provider.clone(), wallet)),
            escrow: self.escrow,
            oracle: self.oracle,
            recipient: self.recipient,
            gas_limit: U256::from(self.config.gas_limit),
            gas_price,
            call_timeout: self.config.call_timeout(),
        }))
    }

    async fn lock_payment(
        &self,
        depositor: Address,
        credential: &Credential,
        call: &LockPaymentCall,
    ) -> ChainResult<H256> {
        let wallet = wallet_from(credential, self.chain_id)?;
        if wallet.address() != depositor {
            return Err(ChainError::Credential(format!(
                "key does not control depositor {depositor:?}"
            )));
        }

        let timeout = self.config.call_timeout();
        let nonce = with_deadline("get_transaction_count", timeout, async {
            self.provider
                .get_transaction_count(depositor, Some(BlockNumber::Pending.into()))
                .await
                .map_err(|e| ChainError::Rpc(format!("failed to get pending nonce: {e}")))
        })
        .await?;
        let gas_price = self.gas_price().await?;

        let tx = TransactionRequest::new()
            .from(depositor)
            .to(self.escrow)
            .nonce(nonce)
            .gas(self.config.gas_limit)
            .gas_price(gas_price)
            .chain_id(self.chain_id)
            .data(encode_lock_payment(call)?);

        let client = SignerMiddleware::new(self.provider.clone(), wallet);
        let tx_hash = with_deadline("lock_payment", timeout, async {
            client
                .send_transaction(tx, None)
                .await
                .map(|pending| pending.tx_hash())
                .map_err(|e| ChainError::Rpc(format!("failed to send lock transaction: {e}")))
        })
        .await?;

        info!("Lock payment submitted for {}: {:?}", call.content_id, tx_hash);
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, tx_hash: H256) -> ChainResult<TxReceipt> {
        let deadline = self.config.receipt_timeout();
        let poll = self.config.receipt_poll_interval();

        let receipt = with_deadline("wait_for_receipt", deadline, async {
            loop {
                match self.provider.get_transaction_receipt(tx_hash).await {
                    Ok(Some(receipt)) => return Ok(receipt),
                    Ok(None) => debug!("Receipt for {:?} not yet available", tx_hash),
                    Err(e) => warn!("Receipt query for {:?} failed: {}", tx_hash, e),
                }
                tokio::time::sleep(poll).await;
            }
        })
        .await?;

        Ok(TxReceipt {
            tx_hash,
            success: receipt.status == Some(U64::from(1)),
            block_number: receipt.block_number.map(|n| n.as_u64()),
            logs: receipt
                .logs
                .into_iter()
                .map(|log| TxLog {
                    address: log.address,
                    topics: log.topics,
                    data: log.data.to_vec(),
                })
                .collect(),
        })
    }
}

/// Operator-signed session against the escrow and oracle
struct EvmEscrowSession {
    client: Arc<SignerClient>,
    escrow: Address,
    oracle: Address,
    recipient: Address,
    gas_limit: U256,
    gas_price: U256,
    call_timeout: Duration,
}

impl EvmEscrowSession {
    async fn transact(&self, operation: &'static str, data: Bytes) -> ChainResult<H256> {
        let tx = TransactionRequest::new()
            .to(self.escrow)
            .gas(self.gas_limit)
            .gas_price(self.gas_price)
            .data(data);

        with_deadline(operation, self.call_timeout, async {
            self.client
                .send_transaction(tx, None)
                .await
                .map(|pending| pending.tx_hash())
                .map_err(|e| ChainError::Rpc(format!("{operation} failed: {e}")))
        })
        .await
    }
}

#[async_trait]
impl EscrowSession for EvmEscrowSession {
    fn recipient(&self) -> Address {
        self.recipient
    }

    fn escrow(&self) -> Address {
        self.escrow
    }

    async fn is_payment_available(&self, deal_id: &str, recipient: Address) -> ChainResult<bool> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.oracle)
            .data(encode_payment_available(deal_id, recipient))
            .into();

        let output = with_deadline("is_payment_available", self.call_timeout, async {
            self.client
                .call(&tx, None)
                .await
                .map_err(|e| ChainError::Rpc(format!("oracle query failed: {e}")))
        })
        .await?;
        decode_bool(&output)
    }

    async fn unlock_payment(&self, deal_id: &str, recipient: Address) -> ChainResult<H256> {
        self.transact("unlock_payment", encode_unlock_payment(deal_id, recipient))
            .await
    }

    async fn refund(&self, content_ids: &[String]) -> ChainResult<H256> {
        self.transact("refund", encode_refund(content_ids)).await
    }
}
