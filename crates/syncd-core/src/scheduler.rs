//! Periodic drivers for the reconciliation loops.
//!
//! Each driver is an owned background task holding its own timer, a
//! `Reconciler` and a child of the scheduler's shutdown token. Drivers share
//! nothing but the store behind their services, so a slow or failing
//! deployment round never delays build status rounds and vice versa.
//!
//! - `Cadence::FixedRate`: every `interval` a round is spawned as its own
//!   task, so a slow round N can overlap round N+1. Missed fires are skipped.
//!   The first round fires after one interval.
//! - `Cadence::FixedDelay`: a round runs immediately, then the driver sleeps
//!   `interval` after each completed round.
//!
//! A driver only stops when the shutdown token is cancelled. Rounds still in
//! flight at that point are aborted; the claims they stamped expire after
//! `claim_ttl`.

use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Cadence, ReconcileConfig};
use crate::reconcile::{deadline_after, Reconciler, TickOutcome, TickPhase};
use crate::record::{BuildArtifact, Deployment, RecordKind};
use crate::service::SyncService;
use std::sync::Arc;

pub struct Scheduler {
    shutdown: CancellationToken,
    drivers: Vec<JoinHandle<()>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            drivers: Vec::new(),
        }
    }

    /// Start the deployment and build artifact drivers with the settings
    /// from `config`.
    pub fn start<D, B>(config: &ReconcileConfig, deployments: Arc<D>, builds: Arc<B>) -> Self
    where
        D: SyncService<Record = Deployment>,
        B: SyncService<Record = BuildArtifact>,
    {
        let mut scheduler = Self::new();
        scheduler.spawn(Reconciler::new(deployments, config.deployment_settings()));
        scheduler.spawn(Reconciler::new(builds, config.build_artifact_settings()));
        scheduler
    }

    /// Start a driver for `reconciler` according to its cadence.
    pub fn spawn<S: SyncService>(&mut self, reconciler: Reconciler<S>) {
        let shutdown = self.shutdown.child_token();
        info!(
            kind = %reconciler.kind(),
            cadence = ?reconciler.settings().cadence,
            interval = ?reconciler.settings().interval,
            "starting driver"
        );
        let handle = match reconciler.settings().cadence {
            Cadence::FixedRate => tokio::spawn(run_fixed_rate(reconciler, shutdown)),
            Cadence::FixedDelay => tokio::spawn(run_fixed_delay(reconciler, shutdown)),
        };
        self.drivers.push(handle);
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    /// Stop every driver and wait for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.drivers {
            let _ = handle.await;
        }
    }
}

async fn run_fixed_rate<S: SyncService>(reconciler: Reconciler<S>, shutdown: CancellationToken) {
    let kind = reconciler.kind();
    let period = reconciler.settings().interval;
    let mut ticker = interval_at(deadline_after(Instant::now(), period), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut rounds = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let reconciler = reconciler.clone();
                rounds.spawn(async move { log_round(&reconciler).await });
            }
            Some(joined) = rounds.join_next(), if !rounds.is_empty() => {
                if let Err(e) = joined {
                    log_aborted_round(kind, &e);
                }
            }
        }
    }

    if !rounds.is_empty() {
        info!(%kind, in_flight = rounds.len(), "aborting in-flight rounds");
    }
    rounds.shutdown().await;
    info!(%kind, "driver stopped");
}

/// Each round runs as its own task so a panicking round is logged and the
/// driver carries on with the next one.
async fn run_fixed_delay<S: SyncService>(reconciler: Reconciler<S>, shutdown: CancellationToken) {
    let kind = reconciler.kind();
    let period = reconciler.settings().interval;

    loop {
        let round = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { log_round(&reconciler).await })
        };
        let abort = round.abort_handle();
        tokio::select! {
            _ = shutdown.cancelled() => {
                abort.abort();
                break;
            }
            joined = round => {
                if let Err(e) = joined {
                    log_aborted_round(kind, &e);
                }
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
    }
    info!(%kind, "driver stopped");
}

fn log_aborted_round(kind: RecordKind, e: &JoinError) {
    if e.is_panic() {
        error!(%kind, error = %e, "round panicked");
    } else {
        warn!(%kind, error = %e, "round did not complete");
    }
}

async fn log_round<S: SyncService>(reconciler: &Reconciler<S>) {
    let report = reconciler.run_tick().await;
    let kind = report.kind;
    match &report.outcome {
        TickOutcome::Succeeded => debug!(
            %kind,
            selected = report.selected,
            claimed = report.claimed,
            failed = report.sync_errors().len(),
            elapsed = ?report.elapsed,
            phase = %TickPhase::Idle,
            "round succeeded"
        ),
        TickOutcome::TimedOut => info!(
            %kind,
            claimed = report.claimed,
            elapsed = ?report.elapsed,
            phase = %TickPhase::Idle,
            "round timed out"
        ),
        TickOutcome::Failed { phase, error } => info!(
            %kind,
            failed_in = %phase,
            error = %error,
            phase = %TickPhase::Idle,
            "round failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverSettings;
    use crate::error::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts rounds by counting selector calls.
    struct CountingService {
        lists: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        list_delay: Duration,
    }

    impl CountingService {
        fn new(list_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                lists: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                list_delay,
            })
        }
    }

    #[async_trait]
    impl SyncService for CountingService {
        type Record = Deployment;

        async fn list_unsynced(&self) -> Result<Vec<Deployment>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.list_delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn mark_syncing(&self, record: &Deployment, _at: DateTime<Utc>) -> Result<Deployment> {
            Ok(record.clone())
        }

        async fn sync_status(&self, record: Deployment) -> Result<Deployment> {
            Ok(record)
        }
    }

    fn settings(cadence: Cadence, interval: Duration) -> DriverSettings {
        DriverSettings {
            cadence,
            interval,
            select_timeout: Duration::from_secs(5),
            dispatch_timeout: Duration::from_secs(5),
            claim_ttl: Duration::from_secs(60),
            max_concurrency: 4,
        }
    }

    #[tokio::test]
    async fn fixed_delay_runs_immediately_and_repeats() {
        let service = CountingService::new(Duration::ZERO);
        let mut scheduler = Scheduler::new();
        scheduler.spawn(Reconciler::new(
            Arc::clone(&service),
            settings(Cadence::FixedDelay, Duration::from_millis(20)),
        ));

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(service.lists.load(Ordering::SeqCst) >= 1, "first round should be immediate");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(service.lists.load(Ordering::SeqCst) >= 3);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn fixed_delay_never_overlaps_itself() {
        let service = CountingService::new(Duration::from_millis(40));
        let mut scheduler = Scheduler::new();
        scheduler.spawn(Reconciler::new(
            Arc::clone(&service),
            settings(Cadence::FixedDelay, Duration::from_millis(1)),
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.shutdown().await;
        assert_eq!(service.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fixed_rate_waits_one_interval_then_allows_overlap() {
        let service = CountingService::new(Duration::from_millis(150));
        let mut scheduler = Scheduler::new();
        scheduler.spawn(Reconciler::new(
            Arc::clone(&service),
            settings(Cadence::FixedRate, Duration::from_millis(30)),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(service.lists.load(Ordering::SeqCst), 0, "no round before the first interval");

        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.shutdown().await;
        assert!(
            service.peak.load(Ordering::SeqCst) >= 2,
            "slow rounds should overlap on a fixed rate"
        );
    }

    /// Panics inside the selector on the first round only.
    struct PanicsOnce {
        lists: AtomicUsize,
    }

    #[async_trait]
    impl SyncService for PanicsOnce {
        type Record = Deployment;

        async fn list_unsynced(&self) -> Result<Vec<Deployment>> {
            if self.lists.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("selector blew up");
            }
            Ok(Vec::new())
        }

        async fn mark_syncing(&self, record: &Deployment, _at: DateTime<Utc>) -> Result<Deployment> {
            Ok(record.clone())
        }

        async fn sync_status(&self, record: Deployment) -> Result<Deployment> {
            Ok(record)
        }
    }

    #[tokio::test]
    async fn drivers_survive_a_panicking_round() {
        for cadence in [Cadence::FixedDelay, Cadence::FixedRate] {
            let service = Arc::new(PanicsOnce {
                lists: AtomicUsize::new(0),
            });
            let mut scheduler = Scheduler::new();
            scheduler.spawn(Reconciler::new(
                Arc::clone(&service),
                settings(cadence, Duration::from_millis(10)),
            ));

            tokio::time::sleep(Duration::from_millis(200)).await;
            scheduler.shutdown().await;
            let rounds = service.lists.load(Ordering::SeqCst);
            assert!(rounds >= 3, "{cadence:?} driver ran {rounds} round(s)");
        }
    }

    #[tokio::test]
    async fn huge_select_budget_does_not_panic_the_round() {
        let service = CountingService::new(Duration::ZERO);
        let mut s = settings(Cadence::FixedDelay, Duration::from_millis(10));
        s.select_timeout = Duration::MAX;
        let report = Reconciler::new(Arc::clone(&service), s).run_tick().await;
        assert!(matches!(report.outcome, TickOutcome::Succeeded));
    }

    #[tokio::test]
    async fn shutdown_stops_drivers() {
        let service = CountingService::new(Duration::ZERO);
        let mut scheduler = Scheduler::new();
        scheduler.spawn(Reconciler::new(
            Arc::clone(&service),
            settings(Cadence::FixedDelay, Duration::from_millis(10)),
        ));
        scheduler.spawn(Reconciler::new(
            Arc::clone(&service),
            settings(Cadence::FixedRate, Duration::from_millis(10)),
        ));
        assert_eq!(scheduler.driver_count(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.shutdown().await;
        let after = service.lists.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(service.lists.load(Ordering::SeqCst), after);
    }
}
