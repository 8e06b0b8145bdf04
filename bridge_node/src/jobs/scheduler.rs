use super::PeriodicJob;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Ticks every registered job on its own interval until shutdown
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<(Arc<dyn PeriodicJob>, Duration)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn every(mut self, period: Duration, job: Arc<dyn PeriodicJob>) -> Self {
        self.jobs.push((job, period));
        self
    }

    /// Spawn one task per job. Tasks exit once `shutdown` turns true or its
    /// sender is dropped.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.jobs
            .into_iter()
            .map(|(job, period)| tokio::spawn(Self::drive(job, period, shutdown.clone())))
            .collect()
    }

    async fn drive(job: Arc<dyn PeriodicJob>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let kind = job.kind();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Scheduling {} job every {:?}", kind, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match job.try_tick().await {
                        Some(Ok(())) => {}
                        Some(Err(e)) => error!("{} tick aborted: {}", kind, e),
                        None => debug!("{} tick skipped, previous tick still running", kind),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("{} job stopped", kind);
    }
}
