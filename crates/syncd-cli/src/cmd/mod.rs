pub mod config;
pub mod records;
pub mod serve;
pub mod tick;

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use syncd_core::{
    Config, HttpStatusSource, RecordDb, RemoteStatusSource, StoreSyncService,
    SyncableRecord,
};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum KindArg {
    Deployments,
    BuildArtifacts,
}

/// Load the config at `path`, falling back to defaults when the file does
/// not exist.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }
    Config::load(path).with_context(|| format!("failed to load config {}", path.display()))
}

pub fn open_db(config: &Config) -> anyhow::Result<Arc<RecordDb>> {
    let path = &config.database.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let db = RecordDb::open(path)
        .with_context(|| format!("failed to open record store {}", path.display()))?;
    Ok(Arc::new(db))
}

pub fn status_source(config: &Config) -> anyhow::Result<HttpStatusSource> {
    HttpStatusSource::new(&config.remote.base_url, config.request_timeout())
        .context("failed to build status client")
}

pub fn sync_service<R>(
    db: &Arc<RecordDb>,
    remote: &HttpStatusSource,
    claim_ttl: Duration,
) -> Arc<StoreSyncService<R>>
where
    R: SyncableRecord,
    HttpStatusSource: RemoteStatusSource<R>,
{
    Arc::new(StoreSyncService::new(
        Arc::clone(db),
        Arc::new(remote.clone()),
        claim_ttl,
    ))
}
