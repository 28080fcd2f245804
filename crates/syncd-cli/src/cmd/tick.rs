use crate::cmd::{load_config, open_db, status_source, sync_service, KindArg};
use crate::output::print_json;
use serde::Serialize;
use std::path::Path;
use syncd_core::{
    AggregateOutcome, BuildArtifact, Deployment, ItemError, Reconciler, TickOutcome, TickReport,
};
use uuid::Uuid;

/// Serializable view of a `TickReport`.
#[derive(Debug, Serialize)]
struct TickSummary {
    kind: String,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    selected: usize,
    claimed: usize,
    claim_errors: Vec<ItemSummary>,
    sync_errors: Vec<ItemSummary>,
    outstanding: usize,
    elapsed_ms: u128,
}

#[derive(Debug, Serialize)]
struct ItemSummary {
    id: Uuid,
    error: String,
}

impl From<&ItemError> for ItemSummary {
    fn from(item: &ItemError) -> Self {
        Self {
            id: item.id,
            error: item.error.to_string(),
        }
    }
}

impl From<&TickReport> for TickSummary {
    fn from(report: &TickReport) -> Self {
        let (outcome, failed_phase, error) = match &report.outcome {
            TickOutcome::Succeeded => ("succeeded", None, None),
            TickOutcome::TimedOut => ("timed_out", None, None),
            TickOutcome::Failed { phase, error } => {
                ("failed", Some(phase.to_string()), Some(error.to_string()))
            }
        };
        let outstanding = match &report.dispatch {
            Some(AggregateOutcome::TimedOut { outstanding, .. }) => *outstanding,
            _ => 0,
        };
        Self {
            kind: report.kind.to_string(),
            outcome,
            failed_phase,
            error,
            selected: report.selected,
            claimed: report.claimed,
            claim_errors: report.claim_errors.iter().map(ItemSummary::from).collect(),
            sync_errors: report.sync_errors().iter().map(ItemSummary::from).collect(),
            outstanding,
            elapsed_ms: report.elapsed.as_millis(),
        }
    }
}

pub fn run(config_path: &Path, kind: KindArg, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let db = open_db(&config)?;
    let remote = status_source(&config)?;

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        match kind {
            KindArg::Deployments => {
                let settings = config.reconcile.deployment_settings();
                let service = sync_service::<Deployment>(&db, &remote, settings.claim_ttl);
                Reconciler::new(service, settings).run_tick().await
            }
            KindArg::BuildArtifacts => {
                let settings = config.reconcile.build_artifact_settings();
                let service = sync_service::<BuildArtifact>(&db, &remote, settings.claim_ttl);
                Reconciler::new(service, settings).run_tick().await
            }
        }
    });
    let summary = TickSummary::from(&report);

    if json {
        print_json(&summary)?;
    } else {
        println!(
            "{}: {} (selected {}, claimed {}, {}ms)",
            summary.kind, summary.outcome, summary.selected, summary.claimed, summary.elapsed_ms
        );
        if let (Some(phase), Some(error)) = (&summary.failed_phase, &summary.error) {
            println!("  failed while {phase}: {error}");
        }
        for item in &summary.claim_errors {
            println!("  claim {}: {}", item.id, item.error);
        }
        for item in &summary.sync_errors {
            println!("  sync {}: {}", item.id, item.error);
        }
        if summary.outstanding > 0 {
            println!("  {} sync task(s) still running", summary.outstanding);
        }
    }

    if let TickOutcome::Failed { error, .. } = report.outcome {
        return Err(anyhow::Error::new(error).context("reconciliation round failed"));
    }
    Ok(())
}
