//! Remote systems of record for deployment and build status.
//!
//! The engine only needs one question answered per record: "what is the
//! status right now?". `RemoteStatusSource` is that question; the HTTP
//! implementation asks a status gateway in front of the orchestrator and the
//! image build pipeline.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{Result, SyncError};
use crate::record::{BuildArtifact, BuildStatus, Deployment, DeploymentStatus, SyncableRecord};

/// Source of truth for the status of records of kind `R`.
#[async_trait]
pub trait RemoteStatusSource<R: SyncableRecord>: Send + Sync {
    async fn fetch_status(&self, record: &R) -> Result<R::Status>;
}

// ---------------------------------------------------------------------------
// HttpStatusSource
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StatusBody<S> {
    status: S,
}

/// Status gateway client.
///
/// ```text
/// GET {base}/clusters/{cluster}/deployments/{name}/status
/// GET {base}/build-artifacts/{name}/versions/{version}/status
/// -> 200 {"status": "<snake_case status>"}
/// ```
///
/// Record fields are percent-encoded as single path segments.
#[derive(Debug, Clone)]
pub struct HttpStatusSource {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpStatusSource {
    pub fn new(base_url: impl AsRef<str>, request_timeout: Duration) -> Result<Self> {
        let raw = base_url.as_ref();
        let base_url = Url::parse(raw)
            .map_err(|e| SyncError::Remote(format!("invalid base url '{raw}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Remote(format!(
                "base url '{raw}' cannot carry a path"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::Remote(format!("build http client: {e}")))?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                SyncError::Remote(format!("base url '{}' cannot carry a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_status<S: DeserializeOwned>(&self, segments: &[&str]) -> Result<S> {
        let url = self.endpoint(segments)?;
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| SyncError::Remote(format!("GET {url}: {e}")))?;

        let code = resp.status();
        if !code.is_success() {
            return Err(SyncError::Remote(format!("GET {url}: HTTP {code}")));
        }

        let body: StatusBody<S> = resp
            .json()
            .await
            .map_err(|e| SyncError::Remote(format!("decode {url}: {e}")))?;
        Ok(body.status)
    }
}

#[async_trait]
impl RemoteStatusSource<Deployment> for HttpStatusSource {
    async fn fetch_status(&self, record: &Deployment) -> Result<DeploymentStatus> {
        self.get_status(&[
            "clusters",
            record.cluster.as_str(),
            "deployments",
            record.name.as_str(),
            "status",
        ])
        .await
    }
}

#[async_trait]
impl RemoteStatusSource<BuildArtifact> for HttpStatusSource {
    async fn fetch_status(&self, record: &BuildArtifact) -> Result<BuildStatus> {
        self.get_status(&[
            "build-artifacts",
            record.name.as_str(),
            "versions",
            record.version.as_str(),
            "status",
        ])
        .await
    }
}
