//! Persistent storage for syncable records using redb.
//!
//! # Table design
//!
//! One table per `RecordKind` (`deployments`, `build_artifacts`), keyed by
//! the 16 raw bytes of the record UUID:
//! ```text
//! key:   uuid (16 bytes)
//! value: JSON-encoded record
//! ```
//!
//! The reconciliation loops touch only the claim timestamp and the status.
//! Both writes are read-modify-write inside a single write transaction, so a
//! concurrent writer of other fields is never clobbered with a stale copy
//! from an earlier listing.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::record::{RecordKind, SyncableRecord};

// ---------------------------------------------------------------------------
// Table helpers
// ---------------------------------------------------------------------------

fn table_for(kind: RecordKind) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    TableDefinition::new(kind.table_name())
}

fn db_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::Store(e.to_string())
}

// ---------------------------------------------------------------------------
// RecordDb
// ---------------------------------------------------------------------------

/// Persistent store for `Deployment` and `BuildArtifact` records.
pub struct RecordDb {
    db: Database,
}

impl RecordDb {
    /// Open or create the redb database at `path`.
    ///
    /// Creates both record tables if they don't already exist.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        for kind in [RecordKind::Deployment, RecordKind::BuildArtifact] {
            wt.open_table(table_for(kind)).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Insert a record, replacing any record with the same id.
    pub fn insert<R: SyncableRecord>(&self, record: &R) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(table_for(R::KIND)).map_err(db_err)?;
            table
                .insert(record.id().as_bytes().as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn get<R: SyncableRecord>(&self, id: Uuid) -> Result<Option<R>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(table_for(R::KIND)).map_err(db_err)?;
        let record = table
            .get(id.as_bytes().as_slice())
            .map_err(db_err)?
            .map(|v| serde_json::from_slice::<R>(v.value()))
            .transpose()?;
        Ok(record)
    }

    /// List every record of kind `R`, in key order.
    pub fn list_all<R: SyncableRecord>(&self) -> Result<Vec<R>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(table_for(R::KIND)).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            result.push(serde_json::from_slice::<R>(v.value())?);
        }
        Ok(result)
    }

    /// Records that still need syncing and carry no claim younger than
    /// `claim_ttl`.
    ///
    /// Rows that no longer decode as `R` are logged and skipped so the rest
    /// of the table keeps syncing.
    pub fn list_unsynced<R: SyncableRecord>(
        &self,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<Vec<R>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(table_for(R::KIND)).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (k, v) = entry.map_err(db_err)?;
            match serde_json::from_slice::<R>(v.value()) {
                Ok(record) if record.is_unsynced(now, claim_ttl) => result.push(record),
                Ok(_) => {}
                Err(e) => {
                    let key = Uuid::from_slice(k.value())
                        .map(|id| id.to_string())
                        .unwrap_or_else(|_| format!("{:02x?}", k.value()));
                    warn!(kind = %R::KIND, %key, error = %e, "skipping undecodable record");
                }
            }
        }
        Ok(result)
    }

    /// Stamp the claim timestamp on the stored copy of record `id`.
    pub fn set_syncing_at<R: SyncableRecord>(&self, id: Uuid, at: DateTime<Utc>) -> Result<R> {
        let (record, _) = self.update::<R, _>(id, |r| {
            r.set_syncing_at(at);
            true
        })?;
        Ok(record)
    }

    /// Store a freshly observed status. Returns the current record and
    /// whether anything was written; an unchanged status commits nothing.
    pub fn set_status<R: SyncableRecord>(
        &self,
        id: Uuid,
        status: R::Status,
        at: DateTime<Utc>,
    ) -> Result<(R, bool)> {
        self.update::<R, _>(id, |r| r.apply_status(status, at))
    }

    fn update<R, F>(&self, id: Uuid, apply: F) -> Result<(R, bool)>
    where
        R: SyncableRecord,
        F: FnOnce(&mut R) -> bool,
    {
        let wt = self.db.begin_write().map_err(db_err)?;
        let (record, changed) = {
            let mut table = wt.open_table(table_for(R::KIND)).map_err(db_err)?;
            let key = id.as_bytes().as_slice();
            let existing = table
                .get(key)
                .map_err(db_err)?
                .map(|v| serde_json::from_slice::<R>(v.value()))
                .transpose()?;
            let mut record = existing.ok_or(SyncError::NotFound { kind: R::KIND, id })?;
            let changed = apply(&mut record);
            if changed {
                let value = serde_json::to_vec(&record)?;
                table.insert(key, value.as_slice()).map_err(db_err)?;
            }
            (record, changed)
        };
        if changed {
            wt.commit().map_err(db_err)?;
        } else {
            wt.abort().map_err(db_err)?;
        }
        Ok((record, changed))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BuildArtifact, BuildStatus, Deployment, DeploymentStatus};
    use chrono::Duration as CDur;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(60);

    fn open_tmp() -> (TempDir, RecordDb) {
        let dir = TempDir::new().unwrap();
        let db = RecordDb::open(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    /// Write `record` raw, bypassing the claim/status helpers.
    fn put_raw<R: SyncableRecord>(db: &RecordDb, record: &R) {
        let wt = db.db.begin_write().unwrap();
        {
            let mut table = wt.open_table(table_for(R::KIND)).unwrap();
            table
                .insert(
                    record.id().as_bytes().as_slice(),
                    serde_json::to_vec(record).unwrap().as_slice(),
                )
                .unwrap();
        }
        wt.commit().unwrap();
    }

    fn get_raw<R: SyncableRecord>(db: &RecordDb, id: Uuid) -> Vec<u8> {
        let rt = db.db.begin_read().unwrap();
        let table = rt.open_table(table_for(R::KIND)).unwrap();
        let guard = table.get(id.as_bytes().as_slice()).unwrap().unwrap();
        guard.value().to_vec()
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let (_dir, db) = open_tmp();
        let d = Deployment::new("iris", "default");
        db.insert(&d).unwrap();
        let loaded: Deployment = db.get(d.id).unwrap().unwrap();
        assert_eq!(loaded, d);
    }

    #[test]
    fn get_missing_returns_none() {
        let (_dir, db) = open_tmp();
        let loaded: Option<Deployment> = db.get(Uuid::new_v4()).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn kinds_live_in_separate_tables() {
        let (_dir, db) = open_tmp();
        db.insert(&Deployment::new("iris", "default")).unwrap();
        db.insert(&BuildArtifact::new("iris_classifier", "v1")).unwrap();
        db.insert(&BuildArtifact::new("iris_classifier", "v2")).unwrap();

        assert_eq!(db.list_all::<Deployment>().unwrap().len(), 1);
        assert_eq!(db.list_all::<BuildArtifact>().unwrap().len(), 2);
    }

    #[test]
    fn list_unsynced_excludes_fresh_claims() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let open = Deployment::new("open", "default");
        let claimed = Deployment::new("claimed", "default");
        db.insert(&open).unwrap();
        db.insert(&claimed).unwrap();
        db.set_syncing_at::<Deployment>(claimed.id, now).unwrap();

        let unsynced = db.list_unsynced::<Deployment>(now, TTL).unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].name, "open");
    }

    #[test]
    fn list_unsynced_reconsiders_stale_claims() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let mut stale = Deployment::new("stale", "default");
        stale.status_syncing_at = Some(now - CDur::minutes(10));
        put_raw(&db, &stale);

        let unsynced = db.list_unsynced::<Deployment>(now, TTL).unwrap();
        assert_eq!(unsynced.len(), 1, "claim older than ttl must expire");
    }

    #[test]
    fn list_unsynced_skips_settled_builds() {
        let (_dir, db) = open_tmp();
        let mut done = BuildArtifact::new("iris_classifier", "v1");
        done.image_build_status = BuildStatus::Success;
        put_raw(&db, &done);
        db.insert(&BuildArtifact::new("iris_classifier", "v2"))
            .unwrap();

        let unsynced = db
            .list_unsynced::<BuildArtifact>(Utc::now(), TTL)
            .unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].version, "v2");
    }

    #[test]
    fn set_syncing_at_persists_claim() {
        let (_dir, db) = open_tmp();
        let d = Deployment::new("iris", "default");
        db.insert(&d).unwrap();
        let at = Utc::now();
        let updated = db.set_syncing_at::<Deployment>(d.id, at).unwrap();
        assert_eq!(updated.status_syncing_at, Some(at));

        let loaded: Deployment = db.get(d.id).unwrap().unwrap();
        assert_eq!(loaded.status_syncing_at, Some(at));
    }

    #[test]
    fn set_syncing_at_on_missing_record_is_not_found() {
        let (_dir, db) = open_tmp();
        let err = db
            .set_syncing_at::<Deployment>(Uuid::new_v4(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }), "got {err:?}");
    }

    #[test]
    fn set_status_writes_changed_status() {
        let (_dir, db) = open_tmp();
        let d = Deployment::new("iris", "default");
        db.insert(&d).unwrap();

        let (updated, changed) = db
            .set_status::<Deployment>(d.id, DeploymentStatus::Running, Utc::now())
            .unwrap();
        assert!(changed);
        assert_eq!(updated.status, DeploymentStatus::Running);
        let loaded: Deployment = db.get(d.id).unwrap().unwrap();
        assert_eq!(loaded.status, DeploymentStatus::Running);
    }

    #[test]
    fn set_status_unchanged_leaves_bytes_identical() {
        let (_dir, db) = open_tmp();
        let d = Deployment::new("iris", "default");
        db.insert(&d).unwrap();
        let before = get_raw::<Deployment>(&db, d.id);

        let (_, changed) = db
            .set_status::<Deployment>(d.id, DeploymentStatus::Unknown, Utc::now())
            .unwrap();
        assert!(!changed);
        assert_eq!(get_raw::<Deployment>(&db, d.id), before);
    }

    #[test]
    fn set_status_keeps_concurrent_field_writes() {
        let (_dir, db) = open_tmp();
        let d = Deployment::new("iris", "default");
        db.insert(&d).unwrap();
        // Another writer moves the deployment to a new cluster after listing.
        let mut moved = d.clone();
        moved.cluster = "gpu".into();
        db.insert(&moved).unwrap();

        db.set_status::<Deployment>(d.id, DeploymentStatus::Deploying, Utc::now())
            .unwrap();
        let loaded: Deployment = db.get(d.id).unwrap().unwrap();
        assert_eq!(loaded.cluster, "gpu");
        assert_eq!(loaded.status, DeploymentStatus::Deploying);
    }

    #[test]
    fn list_unsynced_skips_rows_that_no_longer_decode() {
        let (_dir, db) = open_tmp();
        let good: Vec<BuildArtifact> = (0..3)
            .map(|i| BuildArtifact::new("iris_classifier", format!("v{i}")))
            .collect();
        for b in &good {
            db.insert(b).unwrap();
        }

        let odd = BuildArtifact::new("iris_classifier", "v9");
        let mut value = serde_json::to_value(&odd).unwrap();
        value["image_build_status"] = serde_json::json!("image_pushed");
        let wt = db.db.begin_write().unwrap();
        {
            let mut table = wt.open_table(table_for(RecordKind::BuildArtifact)).unwrap();
            table
                .insert(
                    odd.id.as_bytes().as_slice(),
                    serde_json::to_vec(&value).unwrap().as_slice(),
                )
                .unwrap();
        }
        wt.commit().unwrap();

        let mut ids: Vec<Uuid> = db
            .list_unsynced::<BuildArtifact>(Utc::now(), TTL)
            .unwrap()
            .iter()
            .map(|b| b.id)
            .collect();
        let mut expected: Vec<Uuid> = good.iter().map(|b| b.id).collect();
        ids.sort();
        expected.sort();
        assert_eq!(ids, expected);

        assert!(db.list_all::<BuildArtifact>().is_err(), "list_all stays strict");
    }

    #[test]
    fn empty_db_list_unsynced_returns_empty() {
        let (_dir, db) = open_tmp();
        assert!(db
            .list_unsynced::<Deployment>(Utc::now(), TTL)
            .unwrap()
            .is_empty());
    }
}
