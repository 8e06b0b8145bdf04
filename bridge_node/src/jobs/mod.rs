//! Periodic jobs driving bundles through bundling, submission, unlock and refund.
//!
//! Each job type owns a [`SingleFlight`] gate, so a tick never overlaps the
//! previous tick of the same job while different job types run concurrently.

pub mod bundling;
pub mod deal_submission;
pub mod scheduler;
pub mod unlock_refund;

use crate::common::Result;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use bundling::{BundlingJob, BundlingReport};
pub use deal_submission::{DealSubmissionJob, DealSubmissionReport};
pub use scheduler::Scheduler;
pub use unlock_refund::{UnlockRefundJob, UnlockRefundReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Bundling,
    DealSubmission,
    UnlockRefund,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Bundling => write!(f, "bundling"),
            JobKind::DealSubmission => write!(f, "deal-submission"),
            JobKind::UnlockRefund => write!(f, "unlock-refund"),
        }
    }
}

/// Mutual exclusion between ticks of one job type
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    gate: Arc<Mutex<()>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for any running tick to finish, then run `work`.
    pub async fn run<F, T>(&self, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.gate.lock().await;
        work.await
    }

    /// Run `work` unless a tick is already in progress.
    pub async fn try_run<F, T>(&self, work: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let _guard = self.gate.try_lock().ok()?;
        Some(work.await)
    }

    pub fn is_running(&self) -> bool {
        self.gate.try_lock().is_err()
    }
}

/// A job the scheduler ticks on an interval
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn kind(&self) -> JobKind;

    /// One tick, or `None` when the previous tick is still running.
    async fn try_tick(&self) -> Option<Result<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_try_run_skips_while_busy() {
        let flight = SingleFlight::new();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let busy = flight.clone();
        let first = tokio::spawn(async move {
            busy.run(async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                1
            })
            .await
        });

        started_rx.await.unwrap();
        assert!(flight.is_running());
        assert_eq!(flight.try_run(async { 2 }).await, None);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(flight.try_run(async { 3 }).await, Some(3));
    }

    #[tokio::test]
    async fn test_run_serialises_overlapping_calls() {
        let flight = SingleFlight::new();
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let flight = flight.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run(async {
                        let now = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                        peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
