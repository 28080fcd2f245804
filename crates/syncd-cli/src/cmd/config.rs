use crate::cmd::load_config;
use crate::output::print_json;
use clap::Subcommand;
use std::path::Path;
use syncd_core::config::WarnLevel;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Validate the config for common mistakes
    Validate,

    /// Print the effective driver settings
    Show,
}

pub fn run(path: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Validate => validate(path, json),
        ConfigSubcommand::Show => show(path, json),
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let drivers = [
        ("deployments", config.reconcile.deployment_settings()),
        ("build_artifacts", config.reconcile.build_artifact_settings()),
    ];

    if json {
        let value: serde_json::Map<String, serde_json::Value> = drivers
            .iter()
            .map(|(name, s)| {
                (
                    name.to_string(),
                    serde_json::json!({
                        "cadence": s.cadence,
                        "interval_secs": s.interval.as_secs(),
                        "select_timeout_secs": s.select_timeout.as_secs(),
                        "dispatch_timeout_secs": s.dispatch_timeout.as_secs(),
                        "claim_ttl_secs": s.claim_ttl.as_secs(),
                        "max_concurrency": s.max_concurrency,
                    }),
                )
            })
            .collect();
        return print_json(&serde_json::json!({
            "database": config.database.path,
            "remote": config.remote.base_url,
            "drivers": value,
        }));
    }

    println!("database: {}", config.database.path.display());
    println!("remote:   {}", config.remote.base_url);
    for (name, s) in &drivers {
        println!(
            "{name}: {:?} every {}s, select budget {}s, dispatch budget {}s, claim ttl {}s, concurrency {}",
            s.cadence,
            s.interval.as_secs(),
            s.select_timeout.as_secs(),
            s.dispatch_timeout.as_secs(),
            s.claim_ttl.as_secs(),
            s.max_concurrency
        );
    }
    Ok(())
}
