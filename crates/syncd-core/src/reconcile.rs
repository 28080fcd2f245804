//! One reconciliation round: select -> claim -> dispatch.
//!
//! ```text
//! Idle ─► Selecting ─► Claiming ─► Dispatching ─► Succeeded | TimedOut | Failed ─► Idle
//! ```
//!
//! Selection and claiming share one deadline (`select_timeout`); the fan-out
//! gets its own (`dispatch_timeout`). Every claim write of a round is
//! committed before the first sync task of that round is spawned. All errors
//! are absorbed into the `TickReport` and logged; nothing propagates.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

use crate::config::DriverSettings;
use crate::dispatch::{AggregateOutcome, BoundedDispatcher, ItemError};
use crate::error::SyncError;
use crate::record::{RecordKind, SyncableRecord};
use crate::service::SyncService;

// ---------------------------------------------------------------------------
// TickPhase / TickOutcome / TickReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    Idle,
    Selecting,
    Claiming,
    Dispatching,
}

impl fmt::Display for TickPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Selecting => "selecting",
            Self::Claiming => "claiming",
            Self::Dispatching => "dispatching",
        })
    }
}

/// Terminal state of a round. Per-item sync failures do not make a round
/// fail; they are listed in the dispatch outcome.
#[derive(Debug)]
pub enum TickOutcome {
    Succeeded,
    TimedOut,
    Failed { phase: TickPhase, error: SyncError },
}

#[derive(Debug)]
pub struct TickReport {
    pub kind: RecordKind,
    /// Candidates returned by the selector.
    pub selected: usize,
    /// Candidates whose claim write succeeded and were dispatched.
    pub claimed: usize,
    pub claim_errors: Vec<ItemError>,
    /// `None` when the round ended before dispatching.
    pub dispatch: Option<AggregateOutcome>,
    pub outcome: TickOutcome,
    pub elapsed: Duration,
}

impl TickReport {
    fn failed(kind: RecordKind, phase: TickPhase, error: SyncError, started: Instant) -> Self {
        Self {
            kind,
            selected: 0,
            claimed: 0,
            claim_errors: Vec::new(),
            dispatch: None,
            outcome: TickOutcome::Failed { phase, error },
            elapsed: started.elapsed(),
        }
    }

    pub fn sync_errors(&self) -> &[ItemError] {
        self.dispatch.as_ref().map(|d| d.errors()).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// `start + budget`, saturating at roughly thirty years out.
pub(crate) fn deadline_after(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Runs rounds of one record variant against its `SyncService`.
pub struct Reconciler<S: SyncService> {
    service: Arc<S>,
    settings: DriverSettings,
}

impl<S: SyncService> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            settings: self.settings.clone(),
        }
    }
}

impl<S: SyncService> Reconciler<S> {
    pub fn new(service: Arc<S>, settings: DriverSettings) -> Self {
        Self { service, settings }
    }

    pub fn kind(&self) -> RecordKind {
        S::Record::KIND
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Run one full round and report how it ended.
    pub async fn run_tick(&self) -> TickReport {
        let kind = self.kind();
        let started = Instant::now();
        let select_deadline = deadline_after(started, self.settings.select_timeout);

        // Selecting
        info!(%kind, phase = %TickPhase::Selecting, "listing unsynced records");
        let candidates = match timeout_at(select_deadline, self.service.list_unsynced()).await {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                error!(%kind, phase = %TickPhase::Selecting, error = %e, "list unsynced failed");
                return TickReport::failed(kind, TickPhase::Selecting, e, started);
            }
            Err(_) => {
                let e = SyncError::SelectTimeout(self.settings.select_timeout);
                error!(%kind, phase = %TickPhase::Selecting, error = %e, "list unsynced timed out");
                return TickReport::failed(kind, TickPhase::Selecting, e, started);
            }
        };
        let selected = candidates.len();

        if candidates.is_empty() {
            info!(%kind, "no unsynced records");
            return TickReport {
                kind,
                selected: 0,
                claimed: 0,
                claim_errors: Vec::new(),
                dispatch: Some(AggregateOutcome::AllCompleted { errors: Vec::new() }),
                outcome: TickOutcome::Succeeded,
                elapsed: started.elapsed(),
            };
        }

        // Claiming
        info!(%kind, phase = %TickPhase::Claiming, selected, "updating syncing_at");
        let claim = timeout_at(select_deadline, self.claim_all(candidates)).await;
        let (claimed, claim_errors) = match claim {
            Ok(result) => result,
            Err(_) => {
                let e = SyncError::SelectTimeout(self.settings.select_timeout);
                error!(%kind, phase = %TickPhase::Claiming, error = %e, "claiming timed out");
                let mut report = TickReport::failed(kind, TickPhase::Claiming, e, started);
                report.selected = selected;
                return report;
            }
        };
        info!(%kind, claimed = claimed.len(), failed = claim_errors.len(), "updated syncing_at");

        // Dispatching
        let claimed_count = claimed.len();
        let mut dispatcher = BoundedDispatcher::new(self.settings.max_concurrency);
        for record in claimed {
            let service = Arc::clone(&self.service);
            dispatcher.spawn(record.id(), async move {
                service.sync_status(record).await.map(|_| ())
            });
        }

        info!(%kind, phase = %TickPhase::Dispatching, count = claimed_count, "syncing unsynced records");
        let dispatch = dispatcher
            .wait_with_timeout(self.settings.dispatch_timeout)
            .await;

        for item in dispatch.errors() {
            error!(%kind, id = %item.id, error = %item.error, "sync failed");
        }

        let outcome = match &dispatch {
            AggregateOutcome::AllCompleted { errors } => {
                info!(%kind, count = claimed_count, failed = errors.len(), "synced unsynced records");
                TickOutcome::Succeeded
            }
            AggregateOutcome::TimedOut { outstanding, .. } => {
                let e = SyncError::BatchTimeout(self.settings.dispatch_timeout);
                warn!(%kind, outstanding, error = %e, "stopped waiting for sync tasks");
                TickOutcome::TimedOut
            }
        };

        TickReport {
            kind,
            selected,
            claimed: claimed_count,
            claim_errors,
            dispatch: Some(dispatch),
            outcome,
            elapsed: started.elapsed(),
        }
    }

    /// Stamp one claim timestamp on every candidate, one write at a time.
    /// Candidates whose write fails are left out of the round.
    async fn claim_all(
        &self,
        candidates: Vec<S::Record>,
    ) -> (Vec<S::Record>, Vec<ItemError>) {
        let kind = self.kind();
        let now = Utc::now();
        let mut claimed = Vec::with_capacity(candidates.len());
        let mut errors = Vec::new();
        for record in candidates {
            let id = record.id();
            match self.service.mark_syncing(&record, now).await {
                Ok(updated) => claimed.push(updated),
                Err(error) => {
                    error!(%kind, %id, error = %error, "update syncing_at failed");
                    errors.push(ItemError { id, error });
                }
            }
        }
        (claimed, errors)
    }
}
