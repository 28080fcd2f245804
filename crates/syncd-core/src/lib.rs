//! `syncd-core`: status reconciliation engine for a model-deployment
//! platform.
//!
//! Two periodic drivers keep locally stored status of deployments and build
//! artifacts in line with the systems that own the truth (the orchestrator
//! and the image build pipeline).
//!
//! ```text
//! Scheduler (FixedRate | FixedDelay driver)
//!     │
//!     ▼
//! Reconciler::run_tick
//!     ├─ SyncService::list_unsynced      (select)
//!     ├─ SyncService::mark_syncing       (claim, sequential)
//!     └─ BoundedDispatcher               (≤ C concurrent sync_status calls)
//!           └─ wait_with_timeout ─► AggregateOutcome
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod reconcile;
pub mod record;
pub mod remote;
pub mod scheduler;
pub mod service;
pub mod store;

pub use config::{Cadence, Config, DriverSettings};
pub use dispatch::{AggregateOutcome, BoundedDispatcher, ItemError};
pub use error::{Result, SyncError};
pub use reconcile::{Reconciler, TickOutcome, TickPhase, TickReport};
pub use record::{
    BuildArtifact, BuildStatus, Deployment, DeploymentStatus, RecordKind, SyncableRecord,
};
pub use remote::{HttpStatusSource, RemoteStatusSource};
pub use scheduler::Scheduler;
pub use service::{StoreSyncService, SyncService};
pub use store::RecordDb;
