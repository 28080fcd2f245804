use crate::cmd::{load_config, open_db, status_source, sync_service};
use std::path::Path;
use syncd_core::config::WarnLevel;
use syncd_core::{BuildArtifact, Deployment, Scheduler};

pub fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    for w in config.validate() {
        match w.level {
            WarnLevel::Warning => tracing::warn!("{}", w.message),
            WarnLevel::Error => anyhow::bail!("invalid config: {}", w.message),
        }
    }

    let db = open_db(&config)?;
    let remote = status_source(&config)?;
    let deployment_settings = config.reconcile.deployment_settings();
    let build_settings = config.reconcile.build_artifact_settings();
    let deployments = sync_service::<Deployment>(&db, &remote, deployment_settings.claim_ttl);
    let builds = sync_service::<BuildArtifact>(&db, &remote, build_settings.claim_ttl);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let scheduler = Scheduler::start(&config.reconcile, deployments, builds);
        tracing::info!(
            db = %config.database.path.display(),
            remote = %config.remote.base_url,
            drivers = scheduler.driver_count(),
            "syncd running"
        );

        tokio::signal::ctrl_c().await?;
        tracing::info!("shutting down");
        scheduler.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
}
