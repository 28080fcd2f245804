//! Record data model for the reconciliation loops.
//!
//! Two variants carry locally stored status that must track a remote system
//! of record: a `Deployment` (truth lives in the orchestrator) and a
//! `BuildArtifact` (truth lives in the image build pipeline). Both implement
//! `SyncableRecord`, which is all the engine needs to select, claim and
//! reconcile them.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RecordKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Deployment,
    BuildArtifact,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::BuildArtifact => "build_artifact",
        }
    }

    /// Name of the redb table holding records of this kind.
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Deployment => "deployments",
            Self::BuildArtifact => "build_artifacts",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SyncableRecord
// ---------------------------------------------------------------------------

/// A locally stored record whose status is owned by a remote system.
///
/// The claim timestamp (`syncing_at`) records that a reconciliation round
/// took responsibility for the record at that instant. It is a hint for the
/// candidate selector, not a lock.
pub trait SyncableRecord:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Status: Clone
        + fmt::Debug
        + fmt::Display
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    const KIND: RecordKind;

    fn id(&self) -> Uuid;

    /// Name used to address the record at the remote source.
    fn name(&self) -> &str;

    fn status(&self) -> &Self::Status;

    fn syncing_at(&self) -> Option<DateTime<Utc>>;

    fn set_syncing_at(&mut self, at: DateTime<Utc>);

    /// Store `status` as observed at `at`. Returns `false` and leaves the
    /// record untouched when the status is already current.
    fn apply_status(&mut self, status: Self::Status, at: DateTime<Utc>) -> bool;

    /// Whether the current status can still change remotely.
    fn needs_sync(&self) -> bool;

    /// A claim younger than `ttl` means another round may still be working
    /// on the record. Claims stamped in the future count as fresh.
    fn claim_is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match self.syncing_at() {
            Some(at) => match (now - at).to_std() {
                Ok(age) => age < ttl,
                Err(_) => true,
            },
            None => false,
        }
    }

    fn is_unsynced(&self, now: DateTime<Utc>, claim_ttl: Duration) -> bool {
        self.needs_sync() && !self.claim_is_fresh(now, claim_ttl)
    }
}

// ---------------------------------------------------------------------------
// Deployment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Unknown,
    NonDeployed,
    Deploying,
    Running,
    Unhealthy,
    Failed,
    Terminating,
    Terminated,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::NonDeployed => "non_deployed",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Unhealthy => "unhealthy",
            Self::Failed => "failed",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A model deployment whose runtime state lives in the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub name: String,
    /// Cluster the deployment runs in.
    pub cluster: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_syncing_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(name: impl Into<String>, cluster: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            cluster: cluster.into(),
            status: DeploymentStatus::Unknown,
            status_syncing_at: None,
            status_updated_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl SyncableRecord for Deployment {
    type Status = DeploymentStatus;

    const KIND: RecordKind = RecordKind::Deployment;

    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> &DeploymentStatus {
        &self.status
    }

    fn syncing_at(&self) -> Option<DateTime<Utc>> {
        self.status_syncing_at
    }

    fn set_syncing_at(&mut self, at: DateTime<Utc>) {
        self.status_syncing_at = Some(at);
    }

    fn apply_status(&mut self, status: DeploymentStatus, at: DateTime<Utc>) -> bool {
        if self.status == status {
            return false;
        }
        self.status = status;
        self.status_updated_at = Some(at);
        self.updated_at = at;
        true
    }

    /// Running deployments drift (pods crash, scale, get evicted), so only a
    /// terminated deployment is settled.
    fn needs_sync(&self) -> bool {
        self.status != DeploymentStatus::Terminated
    }
}

// ---------------------------------------------------------------------------
// BuildArtifact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Building,
    Success,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A packaged model version whose container image is produced by the build
/// pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub id: Uuid,
    /// Repository name, e.g. `iris_classifier`.
    pub name: String,
    pub version: String,
    pub image_build_status: BuildStatus,
    #[serde(default)]
    pub image_build_status_syncing_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub image_build_status_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BuildArtifact {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: version.into(),
            image_build_status: BuildStatus::Pending,
            image_build_status_syncing_at: None,
            image_build_status_updated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `name:version`, the tag the build pipeline knows the artifact by.
    pub fn tag(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}

impl SyncableRecord for BuildArtifact {
    type Status = BuildStatus;

    const KIND: RecordKind = RecordKind::BuildArtifact;

    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> &BuildStatus {
        &self.image_build_status
    }

    fn syncing_at(&self) -> Option<DateTime<Utc>> {
        self.image_build_status_syncing_at
    }

    fn set_syncing_at(&mut self, at: DateTime<Utc>) {
        self.image_build_status_syncing_at = Some(at);
    }

    fn apply_status(&mut self, status: BuildStatus, at: DateTime<Utc>) -> bool {
        if self.image_build_status == status {
            return false;
        }
        self.image_build_status = status;
        self.image_build_status_updated_at = Some(at);
        self.updated_at = at;
        true
    }

    fn needs_sync(&self) -> bool {
        !self.image_build_status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
