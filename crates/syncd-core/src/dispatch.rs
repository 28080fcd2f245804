//! Bounded task dispatcher with a batch timeout guard.
//!
//! One unit of work per claimed record is spawned onto a `JoinSet`; a
//! semaphore admits at most `max_concurrency` of them at a time, the rest
//! wait for a permit. `wait_with_timeout` collects per-item failures and
//! stops waiting once the batch budget is spent.
//!
//! A timeout only releases the caller. Units that were already admitted (or
//! are still queued for a permit) are detached and keep running, so their
//! writes may land after the tick has moved on. Every unit listens on a child
//! of the dispatcher's cancellation token; `cancel()` is the explicit way to
//! stop them.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, SyncError};

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// A failure attributed to a single record of the batch.
#[derive(Debug)]
pub struct ItemError {
    pub id: Uuid,
    pub error: SyncError,
}

#[derive(Debug)]
pub enum AggregateOutcome {
    /// Every unit finished within the budget.
    AllCompleted { errors: Vec<ItemError> },
    /// The budget expired. `errors` holds failures collected so far and
    /// `outstanding` the units that were still running or queued.
    TimedOut {
        errors: Vec<ItemError>,
        outstanding: usize,
    },
}

impl AggregateOutcome {
    pub fn errors(&self) -> &[ItemError] {
        match self {
            Self::AllCompleted { errors } | Self::TimedOut { errors, .. } => errors,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

// ---------------------------------------------------------------------------
// BoundedDispatcher
// ---------------------------------------------------------------------------

/// Dropping a dispatcher without calling `wait_with_timeout` aborts its
/// units.
pub struct BoundedDispatcher {
    permits: Arc<Semaphore>,
    tasks: JoinSet<(Uuid, Result<()>)>,
    cancel: CancellationToken,
}

impl BoundedDispatcher {
    /// A `max_concurrency` of zero is raised to one.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Units spawned and not yet collected.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Parent token of every unit. It outlives the dispatcher, so it can
    /// still stop units detached by a timeout.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve every unfinished unit with `SyncError::Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Queue `work` for record `id`. It starts once a permit is free.
    pub fn spawn<F>(&mut self, id: Uuid, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let token = self.cancel.child_token();
        self.tasks.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(SyncError::Cancelled),
                r = run_admitted(permits, work) => r,
            };
            (id, result)
        });
    }

    /// Wait for every unit, but no longer than `limit`.
    pub async fn wait_with_timeout(mut self, limit: Duration) -> AggregateOutcome {
        let mut errors = Vec::new();
        let finished = tokio::time::timeout(limit, async {
            while let Some(joined) = self.tasks.join_next().await {
                match joined {
                    Ok((_, Ok(()))) => {}
                    Ok((id, Err(error))) => errors.push(ItemError { id, error }),
                    Err(e) => tracing::warn!(error = %e, "sync task did not complete"),
                }
            }
        })
        .await;

        match finished {
            Ok(()) => AggregateOutcome::AllCompleted { errors },
            Err(_) => {
                let outstanding = self.tasks.len();
                self.tasks.detach_all();
                AggregateOutcome::TimedOut {
                    errors,
                    outstanding,
                }
            }
        }
    }
}

async fn run_admitted<F>(permits: Arc<Semaphore>, work: F) -> Result<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|_| SyncError::Cancelled)?;
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(SyncError::Panicked(panic_message(payload))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
