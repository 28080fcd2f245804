//! Domain services the reconciliation loops drive.
//!
//! A `SyncService` bundles the three operations a loop needs for one record
//! variant: list candidates, stamp a claim, and reconcile against the remote
//! source. `StoreSyncService` is the production implementation over
//! `RecordDb` and a `RemoteStatusSource`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, SyncError};
use crate::record::SyncableRecord;
use crate::remote::RemoteStatusSource;
use crate::store::RecordDb;

#[async_trait]
pub trait SyncService: Send + Sync + 'static {
    type Record: SyncableRecord;

    /// Records whose status needs confirming and which no fresh round has
    /// claimed. Fails with `SyncError::Retrieval`.
    async fn list_unsynced(&self) -> Result<Vec<Self::Record>>;

    /// Persist the claim timestamp `at` on `record`. Fails with
    /// `SyncError::Update`.
    async fn mark_syncing(&self, record: &Self::Record, at: DateTime<Utc>)
        -> Result<Self::Record>;

    /// Fetch the remote status and store it if it differs. Must be
    /// idempotent. Fails with `SyncError::Sync`.
    async fn sync_status(&self, record: Self::Record) -> Result<Self::Record>;
}

// ---------------------------------------------------------------------------
// StoreSyncService
// ---------------------------------------------------------------------------

pub struct StoreSyncService<R: SyncableRecord> {
    db: Arc<RecordDb>,
    remote: Arc<dyn RemoteStatusSource<R>>,
    claim_ttl: Duration,
}

impl<R: SyncableRecord> StoreSyncService<R> {
    pub fn new(
        db: Arc<RecordDb>,
        remote: Arc<dyn RemoteStatusSource<R>>,
        claim_ttl: Duration,
    ) -> Self {
        Self {
            db,
            remote,
            claim_ttl,
        }
    }

    /// Run a redb call on the blocking pool.
    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RecordDb) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| SyncError::Store(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl<R: SyncableRecord> SyncService for StoreSyncService<R> {
    type Record = R;

    async fn list_unsynced(&self) -> Result<Vec<R>> {
        let ttl = self.claim_ttl;
        self.with_db(move |db| db.list_unsynced::<R>(Utc::now(), ttl))
            .await
            .map_err(|e| SyncError::Retrieval {
                kind: R::KIND,
                reason: e.to_string(),
            })
    }

    async fn mark_syncing(&self, record: &R, at: DateTime<Utc>) -> Result<R> {
        let id = record.id();
        self.with_db(move |db| db.set_syncing_at::<R>(id, at))
            .await
            .map_err(|e| SyncError::Update {
                kind: R::KIND,
                id,
                reason: e.to_string(),
            })
    }

    async fn sync_status(&self, record: R) -> Result<R> {
        let id = record.id();
        let sync_err = |e: SyncError| SyncError::Sync {
            kind: R::KIND,
            id,
            reason: e.to_string(),
        };

        let status = self.remote.fetch_status(&record).await.map_err(sync_err)?;
        if &status == record.status() {
            return Ok(record);
        }

        let (updated, changed) = self
            .with_db(move |db| db.set_status::<R>(id, status, Utc::now()))
            .await
            .map_err(sync_err)?;
        if changed {
            tracing::info!(
                kind = %R::KIND,
                %id,
                name = updated.name(),
                status = %updated.status(),
                "status changed"
            );
        }
        Ok(updated)
    }
}
