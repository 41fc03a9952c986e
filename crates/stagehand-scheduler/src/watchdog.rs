//! Periodic scan for job instances that stopped reporting.

use crate::scheduler::Scheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

pub struct Watchdog {
    scheduler: Arc<Scheduler>,
    scan_interval: Duration,
}

impl Watchdog {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        let scan_interval = scheduler.config().watchdog.scan_interval();
        Self {
            scheduler,
            scan_interval,
        }
    }

    /// Run scans until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.scan_interval.as_secs(),
            timeout_secs = self.scheduler.config().watchdog.job_timeout_secs,
            "Starting job watchdog"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Job watchdog shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single scan. Returns the number of jobs failed.
    pub async fn scan(&self) -> usize {
        match self.scheduler.expire_stale_jobs().await {
            Ok(0) => 0,
            Ok(expired) => {
                warn!(expired, "Watchdog failed stale jobs");
                expired
            }
            Err(e) => {
                error!(error = %e, "Watchdog scan failed");
                0
            }
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
