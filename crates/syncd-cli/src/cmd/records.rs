use crate::cmd::{load_config, open_db, KindArg};
use crate::output::{fmt_time, print_json, print_table};
use std::path::Path;
use syncd_core::{BuildArtifact, Deployment};

pub fn run(config_path: &Path, kind: KindArg, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let db = open_db(&config)?;

    match kind {
        KindArg::Deployments => {
            let mut records: Vec<Deployment> = db.list_all()?;
            records.sort_by(|a, b| (&a.cluster, &a.name).cmp(&(&b.cluster, &b.name)));
            if json {
                return print_json(&records);
            }
            if records.is_empty() {
                println!("No deployments.");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = records
                .iter()
                .map(|d| {
                    vec![
                        d.id.to_string(),
                        d.cluster.clone(),
                        d.name.clone(),
                        d.status.to_string(),
                        fmt_time(d.status_syncing_at),
                        fmt_time(d.status_updated_at),
                    ]
                })
                .collect();
            print_table(
                &["ID", "CLUSTER", "NAME", "STATUS", "SYNCING AT", "UPDATED AT"],
                &rows,
            );
        }
        KindArg::BuildArtifacts => {
            let mut records: Vec<BuildArtifact> = db.list_all()?;
            records.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
            if json {
                return print_json(&records);
            }
            if records.is_empty() {
                println!("No build artifacts.");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = records
                .iter()
                .map(|b| {
                    vec![
                        b.id.to_string(),
                        b.tag(),
                        b.image_build_status.to_string(),
                        fmt_time(b.image_build_status_syncing_at),
                        fmt_time(b.image_build_status_updated_at),
                    ]
                })
                .collect();
            print_table(
                &["ID", "TAG", "BUILD STATUS", "SYNCING AT", "UPDATED AT"],
                &rows,
            );
        }
    }
    Ok(())
}
