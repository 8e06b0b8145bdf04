use crate::chain::{ChainError, ChainGateway, Credential, LockPaymentCall};
use crate::common::{now_millis, BridgeError, Result};
use crate::config::BillingConfig;
use super::promotion::promote_if_paid;
use crate::storage::{LockPaymentEvent, SourceFile, StateStore, StoreError};
use ethers::types::{Address, H256, U256};
use log::{error, info, warn};
use std::sync::Arc;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// User request to escrow a fee for one content id
#[derive(Debug)]
pub struct LockPaymentRequest {
    /// Depositor address, hex.
    pub depositor: String,
    /// Depositor signing key.
    pub credential: Credential,
    pub content_id: String,
    /// Fee in the token's smallest unit.
    pub fee: U256,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockPaymentOutcome {
    /// Always returned so the caller can look the transaction up.
    pub tx_hash: H256,
    pub success: bool,
    /// Stored lock event; `None` on a failed receipt or when storing failed.
    pub event: Option<LockPaymentEvent>,
    /// Bundle moved from WAITING to SUCCESS by this lock.
    pub promoted_bundle: Option<u64>,
}

/// Escrows fees on behalf of depositors
pub struct LockPaymentService {
    store: Arc<dyn StateStore>,
    chain: Arc<dyn ChainGateway>,
    billing: BillingConfig,
}

impl LockPaymentService {
    pub fn new(store: Arc<dyn StateStore>, chain: Arc<dyn ChainGateway>, billing: BillingConfig) -> Self {
        Self { store, chain, billing }
    }

    /// Lock `fee` for `content_id` and wait for the receipt. Not retried: a
    /// failed or unconfirmed lock is reported to the caller as is.
    pub async fn lock_payment(&self, request: LockPaymentRequest) -> Result<LockPaymentOutcome> {
        let depositor = request
            .depositor
            .trim()
            .parse::<Address>()
            .map_err(|e| ChainError::Address(format!("depositor {:?}: {}", request.depositor, e)))?;
        if request.content_id.trim().is_empty() {
            return Err(BridgeError::InvalidInput("content id must not be empty".to_string()));
        }

        let lock_time = now_millis();
        let call = LockPaymentCall {
            content_id: request.content_id.clone(),
            lock_time,
            amount: request.fee,
        };
        let tx_hash = self.chain.lock_payment(depositor, &request.credential, &call).await?;
        let receipt = self
            .chain
            .wait_for_receipt(tx_hash)
            .await
            .map_err(|source| BridgeError::Unconfirmed { tx_hash, source })?;

        if !receipt.success {
            error!(
                "Lock payment {:?} for {} failed on chain, fee not escrowed",
                tx_hash, request.content_id
            );
            return Ok(LockPaymentOutcome {
                tx_hash,
                success: false,
                event: None,
                promoted_bundle: None,
            });
        }
        info!("Lock payment {:?} for {} confirmed", tx_hash, request.content_id);

        let owner = self.owning_file(&request.content_id, depositor).await;
        let event = LockPaymentEvent {
            id: 0,
            tx_hash: format!("{:?}", tx_hash),
            content_id: request.content_id.clone(),
            locked_fee: request.fee.to_string(),
            coin_id: self.billing.coin_id,
            network_id: self.billing.network_id,
            address_from: format!("{:?}", depositor),
            lock_time,
            deadline: lock_time + self.billing.lock_window_days * MILLIS_PER_DAY,
            source_file_id: owner.as_ref().map(|f| f.id),
        };

        let event = match self.store.insert_lock_payment_event(event).await {
            Ok(event) => event,
            Err(e) => {
                error!(
                    "Lock {:?} confirmed but its event was not stored, needs reconciliation: {}",
                    tx_hash, e
                );
                return Ok(LockPaymentOutcome {
                    tx_hash,
                    success: true,
                    event: None,
                    promoted_bundle: None,
                });
            }
        };

        let promoted_bundle = match owner {
            Some(file) => self.promote_bundle(&file).await,
            None => None,
        };

        Ok(LockPaymentOutcome {
            tx_hash,
            success: true,
            event: Some(event),
            promoted_bundle,
        })
    }

    /// Depositor's file with this content id that no lock event pays for
    /// yet. `None` records the event unattached; a later bundle of the
    /// depositor claims it.
    async fn owning_file(&self, content_id: &str, depositor: Address) -> Option<SourceFile> {
        let lookup = async {
            let files = self.store.source_files_by_content_id(content_id).await?;
            let events = self.store.lock_payment_events_by_content_id(content_id).await?;
            Ok::<_, StoreError>((files, events))
        };
        let (files, events) = match lookup.await {
            Ok(found) => found,
            Err(e) => {
                warn!("Source files for {} unavailable: {}", content_id, e);
                return None;
            }
        };
        let depositor = format!("{:?}", depositor);
        files.into_iter().find(|f| {
            f.wallet_address.eq_ignore_ascii_case(&depositor)
                && !events.iter().any(|e| e.source_file_id == Some(f.id))
        })
    }

    /// Promote the file's bundle once every file in it is paid for.
    async fn promote_bundle(&self, file: &SourceFile) -> Option<u64> {
        let promoted = async {
            match self.store.bundle_id_for_source_file(file.id).await? {
                Some(bundle_id) => promote_if_paid(self.store.as_ref(), bundle_id).await,
                None => Ok::<_, BridgeError>(None),
            }
        };
        match promoted.await {
            Ok(promoted) => promoted,
            Err(e) => {
                warn!("Bundle promotion for source file {} failed: {}", file.id, e);
                None
            }
        }
    }
}
