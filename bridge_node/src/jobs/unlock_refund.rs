//! Unlock/Refund Job
//!
//! Releases escrow for every offline deal the oracle reports as payable and
//! refunds the remainder of a bundle once all its deals are unlocked. Chain
//! handles are opened once per tick and shared by every deal in it.

use super::{JobKind, PeriodicJob, SingleFlight};
use crate::chain::{decode_unlock_events, ChainError, ChainGateway, EscrowSession, TxLog};
use crate::common::{now_millis, Result};
use crate::storage::{DealQuery, LockPaymentStatus, OfflineDeal, StateStore, StoreError, UnlockPaymentEvent};
use async_trait::async_trait;
use ethers::types::H256;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlockRefundReport {
    pub deals_examined: usize,
    pub unlocked: usize,
    pub not_available: usize,
    pub failed: usize,
    pub refunds_deferred: usize,
    pub refunded: usize,
    pub refund_failed: usize,
}

impl fmt::Display for UnlockRefundReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "examined={} unlocked={} not_available={} failed={} deferred={} refunded={} refund_failed={}",
            self.deals_examined,
            self.unlocked,
            self.not_available,
            self.failed,
            self.refunds_deferred,
            self.refunded,
            self.refund_failed
        )
    }
}

pub struct UnlockRefundJob {
    store: Arc<dyn StateStore>,
    chain: Arc<dyn ChainGateway>,
    flight: SingleFlight,
}

impl UnlockRefundJob {
    pub fn new(store: Arc<dyn StateStore>, chain: Arc<dyn ChainGateway>) -> Self {
        Self {
            store,
            chain,
            flight: SingleFlight::new(),
        }
    }

    pub async fn run_once(&self) -> Result<UnlockRefundReport> {
        self.flight.run(self.tick()).await
    }

    async fn tick(&self) -> Result<UnlockRefundReport> {
        let mut report = UnlockRefundReport::default();
        let deals = self.store.find_offline_deals(&DealQuery::to_unlock()).await?;
        if deals.is_empty() {
            debug!("No offline deals awaiting unlock");
            return Ok(report);
        }
        info!("Unlock tick started for {} deals", deals.len());

        let session = self.chain.open_session().await?;

        for deal in &deals {
            report.deals_examined += 1;
            match self.unlock_deal(session.as_ref(), deal).await {
                Ok(true) => {
                    report.unlocked += 1;
                    if let Err(e) = self.settle_bundle(session.as_ref(), deal.bundle_id, &mut report).await {
                        error!("Refund evaluation for bundle {} failed: {}", deal.bundle_id, e);
                    }
                }
                Ok(false) => report.not_available += 1,
                Err(e) => {
                    report.failed += 1;
                    error!("Unlock of deal {} failed, retrying next tick: {}", deal.deal_id, e);
                }
            }
        }

        info!("Unlock tick finished: {}", report);
        Ok(report)
    }

    /// Unlock one deal. `Ok(false)` when the oracle does not report it payable.
    async fn unlock_deal(&self, session: &dyn EscrowSession, deal: &OfflineDeal) -> Result<bool> {
        let deal_id = deal.deal_id.to_string();
        let recipient = session.recipient();

        if !session.is_payment_available(&deal_id, recipient).await? {
            info!("Payment not available for deal {}, recipient {:?}", deal_id, recipient);
            return Ok(false);
        }

        let tx_hash = session.unlock_payment(&deal_id, recipient).await?;
        let receipt = self.chain.wait_for_receipt(tx_hash).await?;
        if !receipt.success {
            return Err(ChainError::Reverted(tx_hash).into());
        }
        info!("Deal {} unlocked in {:?}", deal_id, tx_hash);

        match self.store.mark_offline_deal_unlocked(deal.id).await {
            Ok(true) => {}
            Ok(false) => warn!("Deal {} was already marked unlocked", deal_id),
            Err(e) => {
                error!(
                    "Deal {} unlocked on chain in {:?} but not marked, needs reconciliation: {}",
                    deal_id, tx_hash, e
                );
                return Err(e.into());
            }
        }

        self.record_unlock_events(session, deal, tx_hash, &receipt.logs).await;
        Ok(true)
    }

    async fn record_unlock_events(
        &self,
        session: &dyn EscrowSession,
        deal: &OfflineDeal,
        tx_hash: H256,
        logs: &[TxLog],
    ) {
        let decoded = match decode_unlock_events(logs, session.escrow()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Unlock events of {:?} undecodable: {}", tx_hash, e);
                return;
            }
        };
        if decoded.is_empty() {
            debug!("Unlock {:?} emitted no events", tx_hash);
            return;
        }

        let unlock_time = now_millis();
        let events = decoded
            .into_iter()
            .map(|event| UnlockPaymentEvent {
                id: 0,
                tx_hash: format!("{:?}", tx_hash),
                deal_id: event.deal_id.parse().unwrap_or(deal.deal_id),
                recipient: format!("{:?}", event.recipient),
                amount: event.amount.to_string(),
                unlock_time,
            })
            .collect();
        if let Err(e) = self.store.insert_unlock_payment_events(events).await {
            error!("Unlock events of deal {} ({:?}) not stored: {}", deal.deal_id, tx_hash, e);
        }
    }

    /// Refund the bundle once none of its deals is left locked.
    async fn settle_bundle(
        &self,
        session: &dyn EscrowSession,
        bundle_id: u64,
        report: &mut UnlockRefundReport,
    ) -> Result<()> {
        let remaining = self
            .store
            .find_offline_deals(&DealQuery::not_unlocked_in_bundle(bundle_id))
            .await?;
        if !remaining.is_empty() {
            report.refunds_deferred += 1;
            info!("Bundle {} still has {} locked deals, refund deferred", bundle_id, remaining.len());
            return Ok(());
        }

        let bundle = self
            .store
            .get_bundle(bundle_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("bundle {bundle_id}")))?;
        if bundle.lock_payment_status != LockPaymentStatus::Success {
            debug!("Bundle {} is {}, no refund", bundle_id, bundle.lock_payment_status);
            return Ok(());
        }

        let files = self.store.source_files_by_bundle(bundle_id).await?;
        let content_ids: Option<Vec<String>> = files.iter().map(|f| f.content_id.clone()).collect();

        let outcome = match content_ids {
            Some(content_ids) if !content_ids.is_empty() => match self.refund(session, &content_ids).await {
                Ok(tx_hash) => {
                    info!("Bundle {} refunded in {:?}", bundle_id, tx_hash);
                    LockPaymentStatus::UnlockRefunded
                }
                Err(e) => {
                    error!("Refund of bundle {} failed: {}", bundle_id, e);
                    LockPaymentStatus::UnlockRefundFailed
                }
            },
            _ => {
                error!(
                    "Bundle {} has {} files and not all carry a content id, refund not sent",
                    bundle_id,
                    files.len()
                );
                LockPaymentStatus::UnlockRefundFailed
            }
        };

        if self
            .store
            .transition_lock_payment_status(bundle_id, LockPaymentStatus::Success, outcome)
            .await?
        {
            match outcome {
                LockPaymentStatus::UnlockRefunded => report.refunded += 1,
                _ => report.refund_failed += 1,
            }
        } else {
            warn!("Bundle {} left SUCCESS before its refund outcome {} was stored", bundle_id, outcome);
        }
        Ok(())
    }

    async fn refund(&self, session: &dyn EscrowSession, content_ids: &[String]) -> Result<H256> {
        let tx_hash = session.refund(content_ids).await?;
        let receipt = self.chain.wait_for_receipt(tx_hash).await?;
        if !receipt.success {
            return Err(ChainError::Reverted(tx_hash).into());
        }
        Ok(tx_hash)
    }
}

#[async_trait]
impl PeriodicJob for UnlockRefundJob {
    fn kind(&self) -> JobKind {
        JobKind::UnlockRefund
    }

    async fn try_tick(&self) -> Option<Result<()>> {
        self.flight.try_run(self.tick()).await.map(|r| r.map(|_| ()))
    }
}
