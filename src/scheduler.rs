/// Scheduler - periodic background jobs owned by the composition root
///
/// Jobs:
/// - Resolve expired markets on both chains from the oracle feed
/// - Sweep the bridge journal and resume unfinished transfers
///
/// Nothing runs until `start()`; `stop()` signals every loop and waits for
/// in-progress ticks to finish.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::BridgeCoordinator;
use crate::chain::Signer;
use crate::clock::Clock;
use crate::error::Result;
use crate::facade::MarketFacade;
use crate::models::Chain;
use crate::oracle::OracleFeed;

// ============================================================================
// JOB STATUS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobState {
    /// Waiting for the next tick
    Idle,
    Running,
    /// Last tick failed, will retry next interval
    Error(String),
}

/// Result of one tick
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TickSummary {
    pub processed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub name: String,
    pub state: JobState,
    pub runs: u64,
    pub last_run: Option<i64>,
    pub last_summary: Option<TickSummary>,
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    async fn tick(&self) -> Result<TickSummary>;
}

// ============================================================================
// SCHEDULER
// ============================================================================

type StatusMap = Arc<RwLock<HashMap<String, JobStatus>>>;

pub struct Scheduler {
    interval: Duration,
    jobs: Vec<Arc<dyn Job>>,
    clock: Arc<dyn Clock>,
    status: StatusMap,
    shutdown: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval,
            jobs: Vec::new(),
            clock,
            status: Arc::new(RwLock::new(HashMap::new())),
            shutdown: None,
            handles: Vec::new(),
        }
    }

    pub fn add_job(&mut self, job: Arc<dyn Job>) {
        if let Ok(mut status) = self.status.write() {
            status.insert(
                job.name().to_string(),
                JobStatus {
                    name: job.name().to_string(),
                    state: JobState::Idle,
                    runs: 0,
                    last_run: None,
                    last_summary: None,
                },
            );
        }
        self.jobs.push(job);
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Spawn one loop per job. Calling `start` twice is a no-op.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        for job in &self.jobs {
            let job = job.clone();
            let mut shutdown = rx.clone();
            let status = self.status.clone();
            let clock = self.clock.clone();
            let period = self.interval;
            self.handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            run_job(job.as_ref(), &status, clock.as_ref()).await;
                        }
                    }
                }
                debug!(job = job.name(), "job loop stopped");
            }));
        }
        self.shutdown = Some(tx);
        info!(jobs = self.jobs.len(), interval_secs = self.interval.as_secs(), "scheduler started");
    }

    /// Signal all loops and wait for them to exit
    pub async fn stop(&mut self) {
        let Some(tx) = self.shutdown.take() else {
            return;
        };
        let _ = tx.send(true);
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                error!(error = %err, "job loop panicked");
            }
        }
        info!("scheduler stopped");
    }

    /// Run every job once, in order, on the caller's task
    pub async fn run_once(&self) -> Vec<(String, Result<TickSummary>)> {
        let mut results = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let result = run_job(job.as_ref(), &self.status, self.clock.as_ref()).await;
            results.push((job.name().to_string(), result));
        }
        results
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        let mut out: Vec<JobStatus> = self
            .status
            .read()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Shared view of job statuses for the HTTP layer
    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle(self.status.clone())
    }
}

#[derive(Clone)]
pub struct StatusHandle(StatusMap);

impl StatusHandle {
    pub fn snapshot(&self) -> Vec<JobStatus> {
        let mut out: Vec<JobStatus> = self.0.read().map(|s| s.values().cloned().collect()).unwrap_or_default();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

async fn run_job(job: &dyn Job, status: &StatusMap, clock: &dyn Clock) -> Result<TickSummary> {
    update(status, job.name(), |s| s.state = JobState::Running);
    let result = job.tick().await;
    let now = clock.now();
    match &result {
        Ok(summary) => {
            if summary.processed > 0 || summary.failed > 0 {
                info!(job = job.name(), processed = summary.processed, failed = summary.failed, "job tick");
            } else {
                debug!(job = job.name(), "job tick, nothing to do");
            }
            update(status, job.name(), |s| {
                s.state = JobState::Idle;
                s.last_summary = Some(summary.clone());
            });
        }
        Err(err) => {
            warn!(job = job.name(), error = %err, "job tick failed");
            update(status, job.name(), |s| s.state = JobState::Error(err.to_string()));
        }
    }
    update(status, job.name(), |s| {
        s.runs += 1;
        s.last_run = Some(now);
    });
    result
}

fn update(status: &StatusMap, name: &str, f: impl FnOnce(&mut JobStatus)) {
    if let Ok(mut map) = status.write() {
        if let Some(entry) = map.get_mut(name) {
            f(entry);
        }
    }
}

// ============================================================================
// JOBS
// ============================================================================

/// Resolves every unresolved market whose target date has passed, on every
/// chain a resolver signer is configured for.
pub struct ResolutionJob {
    facade: Arc<MarketFacade>,
    oracle: Arc<dyn OracleFeed>,
    resolvers: HashMap<Chain, Arc<dyn Signer>>,
    clock: Arc<dyn Clock>,
}

impl ResolutionJob {
    pub fn new(facade: Arc<MarketFacade>, oracle: Arc<dyn OracleFeed>, clock: Arc<dyn Clock>) -> Self {
        Self {
            facade,
            oracle,
            resolvers: HashMap::new(),
            clock,
        }
    }

    pub fn with_resolver(mut self, signer: Arc<dyn Signer>) -> Self {
        self.resolvers.insert(signer.chain(), signer);
        self
    }
}

#[async_trait]
impl Job for ResolutionJob {
    fn name(&self) -> &str {
        "market_resolution"
    }

    async fn tick(&self) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        let now = self.clock.now();
        for chain in self.facade.chains() {
            let Some(resolver) = self.resolvers.get(&chain) else {
                continue;
            };
            let markets = match self.facade.list_markets(chain).await {
                Ok(markets) => markets,
                Err(err) => {
                    warn!(chain = %chain, error = %err, "cannot list markets");
                    summary.failed += 1;
                    continue;
                }
            };
            for market in markets.into_iter().filter(|m| !m.resolved && m.is_expired(now)) {
                let outcome = async {
                    let price = self.oracle.latest_price(&market.commodity).await?;
                    self.facade.resolve(&market.key, &price, resolver.as_ref()).await
                }
                .await;
                match outcome {
                    Ok(_) => summary.processed += 1,
                    Err(err) => {
                        warn!(market = %market.key, error = %err, "resolution failed");
                        summary.failed += 1;
                    }
                }
            }
        }
        Ok(summary)
    }
}

/// Resumes bridge transfers left unfinished by a crash or an exhausted retry budget
pub struct BridgeSweepJob {
    coordinator: BridgeCoordinator,
}

impl BridgeSweepJob {
    pub fn new(coordinator: BridgeCoordinator) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Job for BridgeSweepJob {
    fn name(&self) -> &str {
        "bridge_sweep"
    }

    async fn tick(&self) -> Result<TickSummary> {
        let resumed = self.coordinator.resume_pending()?;
        Ok(TickSummary {
            processed: resumed.len(),
            failed: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        ticks: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &str {
            "counting"
        }

        async fn tick(&self) -> Result<TickSummary> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::Oracle("feed down".into()));
            }
            Ok(TickSummary {
                processed: 1,
                failed: 0,
            })
        }
    }

    fn scheduler(fail: bool) -> (Scheduler, Arc<CountingJob>) {
        let job = Arc::new(CountingJob {
            ticks: AtomicUsize::new(0),
            fail,
        });
        let mut scheduler = Scheduler::new(Duration::from_millis(10), Arc::new(ManualClock::new(500)));
        scheduler.add_job(job.clone());
        (scheduler, job)
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_runs_before_start() {
        let (scheduler, job) = scheduler(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(job.ticks.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_then_stop() {
        let (mut scheduler, job) = scheduler(false);
        scheduler.start();
        assert!(scheduler.is_running());
        // ticks at 0, 10, 20 and 30ms
        tokio::time::sleep(Duration::from_millis(35)).await;
        scheduler.stop().await;
        assert!(!scheduler.is_running());
        assert_eq!(job.ticks.load(Ordering::SeqCst), 4);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(job.ticks.load(Ordering::SeqCst), 4);

        let status = &scheduler.statuses()[0];
        assert_eq!(status.state, JobState::Idle);
        assert_eq!(status.runs, 4);
        assert_eq!(status.last_run, Some(500));
    }

    #[tokio::test]
    async fn test_failed_tick_is_recorded() {
        let (scheduler, _job) = scheduler(true);
        let results = scheduler.run_once().await;
        assert!(results[0].1.is_err());
        assert_eq!(scheduler.status_handle().snapshot()[0].state, JobState::Error("oracle: feed down".into()));
    }
}
