use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::{OwnerJobConfig, PriceJobConfig};
use crate::database_ops::marketplace::{MarketplaceFeed, PriceSync};
use crate::database_ops::store::ItemStore;
use crate::database_ops::subgraph::{OwnerSync, SubgraphClient};

#[async_trait::async_trait]
pub trait CodexJob: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self) -> Result<()>;
}

/// Non-reentrant run flag. At most one permit exists at a time.
#[derive(Debug, Clone, Default)]
pub struct JobGuard {
    running: Arc<AtomicBool>,
}

/// Releases its guard on drop.
#[derive(Debug)]
pub struct JobPermit {
    running: Arc<AtomicBool>,
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl JobGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<JobPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| JobPermit {
                running: self.running.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

struct Scheduled {
    job: Arc<dyn CodexJob>,
    every: Duration,
}

/// Runs each registered job on its own fixed interval. A tick that arrives
/// while the previous run of the same job is still going is skipped.
#[derive(Default)]
pub struct WorkerManager {
    jobs: Vec<Scheduled>,
}

impl WorkerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, job: Arc<dyn CodexJob>, every: Duration) -> &mut Self {
        self.jobs.push(Scheduled { job, every });
        self
    }

    /// Run once per job now and then on every tick, until `shutdown` flips to
    /// true. In-flight runs are awaited before returning.
    pub async fn run_until(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut loops = JoinSet::new();
        for Scheduled { job, every } in self.jobs {
            let stop = shutdown.clone();
            loops.spawn(job_loop(job, every, stop));
        }
        info!(target = "scheduler", jobs = loops.len(), "scheduler started");

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!(target = "scheduler", "shutdown requested; waiting for running jobs");
        while let Some(res) = loops.join_next().await {
            if let Err(join_err) = res {
                error!(target = "scheduler", error = %join_err, "job loop panicked");
            }
        }
        Ok(())
    }
}

async fn job_loop(job: Arc<dyn CodexJob>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let guard = JobGuard::new();
    let mut runs = JoinSet::new();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        // reap finished runs so the set does not grow
        while runs.try_join_next().is_some() {}

        let Some(permit) = guard.try_acquire() else {
            warn!(target = "scheduler", job = job.name(), "previous run still in progress; skipping tick");
            continue;
        };
        let job = job.clone();
        runs.spawn(async move {
            let _permit = permit;
            info!(target = "scheduler", job = job.name(), "job starting");
            match job.run().await {
                Ok(()) => info!(target = "scheduler", job = job.name(), "job finished"),
                Err(e) => error!(target = "scheduler", job = job.name(), error = %e, "job failed"),
            }
        });
    }
    while runs.join_next().await.is_some() {}
}

// Adapters binding the reconciliation jobs to the scheduler.

pub struct OwnerSyncJob {
    pub items: Arc<dyn ItemStore>,
    pub http: Client,
    pub cfg: OwnerJobConfig,
}

#[async_trait::async_trait]
impl CodexJob for OwnerSyncJob {
    fn name(&self) -> &'static str {
        "owner-sync"
    }

    async fn run(&self) -> Result<()> {
        let Some(api_key) = self.cfg.api_key.as_deref() else {
            error!(target = "owners", "SUBGRAPH_API_KEY not set; skipping owner sync");
            return Ok(());
        };
        let index = SubgraphClient::new(self.http.clone(), &self.cfg.endpoint, api_key);
        OwnerSync::new(self.items.as_ref(), &index, self.cfg.sync.clone())
            .run()
            .await?;
        Ok(())
    }
}

pub struct PriceSyncJob {
    pub items: Arc<dyn ItemStore>,
    pub http: Client,
    pub cfg: PriceJobConfig,
}

#[async_trait::async_trait]
impl CodexJob for PriceSyncJob {
    fn name(&self) -> &'static str {
        "price-sync"
    }

    async fn run(&self) -> Result<()> {
        let Some(base_url) = self.cfg.base_url.as_deref() else {
            error!(target = "prices", "MARKETPLACE_BASE_URL not set; skipping price sync");
            return Ok(());
        };
        let feed = MarketplaceFeed::new(self.http.clone(), base_url);
        PriceSync::new(self.items.as_ref(), &feed).run().await?;
        Ok(())
    }
}
