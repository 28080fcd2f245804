#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use syncd_core::{Deployment, DeploymentStatus, RecordDb};
use tempfile::TempDir;

fn syncd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("syncd").unwrap();
    cmd.current_dir(dir.path())
        .env("SYNCD_CONFIG", dir.path().join("syncd.yaml"))
        .env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &TempDir, base_url: &str) {
    let yaml = format!(
        "database:\n  path: {}\nremote:\n  base_url: {base_url}\n  request_timeout_secs: 5\n",
        dir.path().join("records.db").display()
    );
    std::fs::write(dir.path().join("syncd.yaml"), yaml).unwrap();
}

fn seed(dir: &TempDir, records: &[Deployment]) {
    let db = RecordDb::open(&dir.path().join("records.db")).unwrap();
    for r in records {
        db.insert(r).unwrap();
    }
}

fn stored(path: &Path, id: uuid::Uuid) -> Deployment {
    let db = RecordDb::open(path).unwrap();
    db.get(id).unwrap().unwrap()
}

// ---------------------------------------------------------------------------
// syncd config
// ---------------------------------------------------------------------------

#[test]
fn config_validate_accepts_defaults() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "http://localhost:8080");
    syncd(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_validate_rejects_zero_concurrency() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("syncd.yaml"),
        "reconcile:\n  deployments:\n    max_concurrency: 0\n",
    )
    .unwrap();
    syncd(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] reconcile.deployments.max_concurrency"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_validate_json_lists_warnings() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("syncd.yaml"),
        "reconcile:\n  build_artifacts:\n    claim_ttl_secs: 5\n",
    )
    .unwrap();
    let out = syncd(&dir)
        .args(["config", "validate", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let warnings = value["warnings"].as_array().unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0]["level"], "warning");
}

#[test]
fn config_show_reports_driver_cadences() {
    let dir = TempDir::new().unwrap();
    syncd(&dir)
        .args(["config", "show", "-j"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"fixed_rate\""))
        .stdout(predicate::str::contains("\"fixed_delay\""));
}

#[test]
fn malformed_config_is_reported() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("syncd.yaml"), "reconcile: [not, a, map]\n").unwrap();
    syncd(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

// ---------------------------------------------------------------------------
// syncd records / tick
// ---------------------------------------------------------------------------

#[test]
fn records_on_empty_store() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "http://localhost:8080");
    syncd(&dir)
        .args(["records", "--kind", "deployments"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No deployments."));
}

#[test]
fn tick_on_empty_store_selects_nothing() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "http://127.0.0.1:9");
    syncd(&dir)
        .args(["tick", "--kind", "build-artifacts", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"outcome\": \"succeeded\""))
        .stdout(predicate::str::contains("\"selected\": 0"));
}

#[test]
fn tick_pulls_remote_status_into_store() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/clusters/default/deployments/iris/status")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status":"running"}"#)
        .expect(1)
        .create();

    let dir = TempDir::new().unwrap();
    write_config(&dir, &server.url());
    let deployment = Deployment::new("iris", "default");
    seed(&dir, std::slice::from_ref(&deployment));

    syncd(&dir)
        .args(["tick", "--kind", "deployments", "-j"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"claimed\": 1"))
        .stdout(predicate::str::contains("\"sync_errors\": []"));
    mock.assert();

    let after = stored(&dir.path().join("records.db"), deployment.id);
    assert_eq!(after.status, DeploymentStatus::Running);
    assert!(after.status_syncing_at.is_some());

    syncd(&dir)
        .args(["records", "--kind", "deployments"])
        .assert()
        .success()
        .stdout(predicate::str::contains("iris"))
        .stdout(predicate::str::contains("running"));
}

#[test]
fn tick_reports_unreachable_remote_per_record() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "http://127.0.0.1:9");
    let deployment = Deployment::new("iris", "default");
    seed(&dir, std::slice::from_ref(&deployment));

    syncd(&dir)
        .args(["tick", "--kind", "deployments"])
        .assert()
        .success()
        .stdout(predicate::str::contains("succeeded (selected 1, claimed 1"))
        .stdout(predicate::str::contains(format!("sync {}", deployment.id)));

    let after = stored(&dir.path().join("records.db"), deployment.id);
    assert_eq!(after.status, DeploymentStatus::Unknown);
}
