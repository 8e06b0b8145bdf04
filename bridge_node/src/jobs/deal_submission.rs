//! Deal Submission Job
//!
//! Three phases per tick:
//! 1. locked bundles without a marketplace task get one,
//! 2. locked, unsubmitted bundles whose task is assigned are submitted,
//!    newest first, and the outcome is written back,
//! 3. deals the marketplace confirmed for submitted bundles are recorded as
//!    offline deals awaiting unlock.

use super::{JobKind, PeriodicJob, SingleFlight};
use crate::common::{now_millis, Result};
use crate::marketplace::MarketplaceGateway;
use crate::storage::{BundleQuery, DealBundle, LockPaymentStatus, OfflineDeal, SendDealStatus, StateStore};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DealSubmissionReport {
    pub tasks_registered: usize,
    pub submitted: usize,
    pub failed: usize,
    pub not_assigned: usize,
    /// Transient errors and unpersisted outcomes; retried or reconciled later.
    pub errors: usize,
    pub deals_synced: usize,
}

impl fmt::Display for DealSubmissionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tasks={} submitted={} failed={} not_assigned={} errors={} deals_synced={}",
            self.tasks_registered, self.submitted, self.failed, self.not_assigned, self.errors, self.deals_synced
        )
    }
}

pub struct DealSubmissionJob {
    store: Arc<dyn StateStore>,
    marketplace: Arc<dyn MarketplaceGateway>,
    batch_size: usize,
    flight: SingleFlight,
}

impl DealSubmissionJob {
    pub fn new(store: Arc<dyn StateStore>, marketplace: Arc<dyn MarketplaceGateway>, batch_size: usize) -> Self {
        Self {
            store,
            marketplace,
            batch_size,
            flight: SingleFlight::new(),
        }
    }

    pub async fn run_once(&self) -> Result<DealSubmissionReport> {
        self.flight.run(self.tick()).await
    }

    async fn tick(&self) -> Result<DealSubmissionReport> {
        let mut report = DealSubmissionReport::default();

        self.register_tasks(&mut report).await?;

        let ready = self
            .store
            .find_bundles(&BundleQuery::ready_for_submission(self.batch_size))
            .await?;
        info!("Deal submission tick: {} bundles ready", ready.len());
        for bundle in &ready {
            self.submit_bundle(bundle, &mut report).await;
        }

        self.sync_offline_deals(&mut report).await?;

        info!("Deal submission tick finished: {}", report);
        Ok(report)
    }

    async fn register_tasks(&self, report: &mut DealSubmissionReport) -> Result<()> {
        let bundles = self
            .store
            .find_bundles(&BundleQuery::awaiting_task(self.batch_size))
            .await?;
        for bundle in bundles {
            let task_id = match self.marketplace.create_task(&bundle).await {
                Ok(task_id) => task_id,
                Err(e) => {
                    report.errors += 1;
                    warn!("Task creation for bundle {} failed: {}", bundle.id, e);
                    continue;
                }
            };
            match self.store.assign_task_id(bundle.id, &task_id).await {
                Ok(true) => {
                    report.tasks_registered += 1;
                    info!("Bundle {} registered as task {}", bundle.id, task_id);
                }
                Ok(false) => warn!("Bundle {} already had a task, {} left unused", bundle.id, task_id),
                Err(e) => {
                    report.errors += 1;
                    error!(
                        "Task {} created but not stored for bundle {}, needs reconciliation: {}",
                        task_id, bundle.id, e
                    );
                }
            }
        }
        Ok(())
    }

    async fn submit_bundle(&self, bundle: &DealBundle, report: &mut DealSubmissionReport) {
        let task_id = match bundle.task_id.as_deref() {
            Some(task_id) => task_id,
            None => return,
        };

        let status = match self.marketplace.get_task_status(task_id).await {
            Ok(info) => info.status,
            Err(e) => {
                report.errors += 1;
                warn!("Status of task {} (bundle {}) unavailable: {}", task_id, bundle.id, e);
                return;
            }
        };
        if !status.is_assigned() {
            report.not_assigned += 1;
            debug!("Task {} of bundle {} is {}, not assigned yet", task_id, bundle.id, status);
            return;
        }

        // The escrow must still be locked at the moment of submission.
        match self.store.get_bundle(bundle.id).await {
            Ok(Some(current))
                if current.lock_payment_status == LockPaymentStatus::Success
                    && current.send_deal_status == SendDealStatus::Empty => {}
            Ok(_) => {
                debug!("Bundle {} changed since the scan, not submitted", bundle.id);
                return;
            }
            Err(e) => {
                report.errors += 1;
                warn!("Could not re-read bundle {}: {}", bundle.id, e);
                return;
            }
        }

        let outcome = match self.marketplace.submit_deal(bundle).await {
            Ok(submission) => {
                info!(
                    "Bundle {} submitted: sent_count={}, report={}, archives={}",
                    bundle.id,
                    submission.sent_count,
                    submission.report_path,
                    submission.archives.len()
                );
                SendDealStatus::Success
            }
            Err(e) if e.is_transient() => {
                report.errors += 1;
                warn!("Submission of bundle {} interrupted, retrying next tick: {}", bundle.id, e);
                return;
            }
            Err(e) => {
                error!("Submission of bundle {} rejected: {}", bundle.id, e);
                SendDealStatus::Fail
            }
        };

        match self.store.record_send_deal_outcome(bundle.id, outcome).await {
            Ok(true) if outcome == SendDealStatus::Success => report.submitted += 1,
            Ok(true) => report.failed += 1,
            Ok(false) => warn!("Bundle {} outcome {} not applied, status moved", bundle.id, outcome),
            Err(e) => {
                report.errors += 1;
                error!(
                    "Bundle {} outcome {} not persisted, needs reconciliation with the marketplace: {}",
                    bundle.id, outcome, e
                );
            }
        }
    }

    async fn sync_offline_deals(&self, report: &mut DealSubmissionReport) -> Result<()> {
        let submitted = self.store.find_bundles(&BundleQuery::submitted()).await?;
        for bundle in submitted {
            let task_id = match bundle.task_id.as_deref() {
                Some(task_id) => task_id,
                None => continue,
            };
            let deals = match self.marketplace.task_deals(task_id).await {
                Ok(deals) => deals,
                Err(e) => {
                    report.errors += 1;
                    warn!("Deals of task {} unavailable: {}", task_id, e);
                    continue;
                }
            };
            for deal_id in deals.iter().filter_map(|d| d.deal_id) {
                match self
                    .store
                    .insert_offline_deal(OfflineDeal::new(deal_id, bundle.id, now_millis()))
                    .await
                {
                    Ok(Some(_)) => {
                        report.deals_synced += 1;
                        info!("Deal {} recorded for bundle {}", deal_id, bundle.id);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        report.errors += 1;
                        warn!("Deal {} of bundle {} not recorded: {}", deal_id, bundle.id, e);
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PeriodicJob for DealSubmissionJob {
    fn kind(&self) -> JobKind {
        JobKind::DealSubmission
    }

    async fn try_tick(&self) -> Option<Result<()>> {
        self.flight.try_run(self.tick()).await.map(|r| r.map(|_| ()))
    }
}
