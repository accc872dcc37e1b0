//! End-to-end tests of the `ras` binary against a fake CouchDB.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use result_archive_store::ras_core::store::memory::InMemoryDocumentStore;
use result_archive_store::ras_core::store::{REQUESTORS_VIEW, TEST_NAMES_VIEW};
use result_archive_store::ras_core::ArtifactPath;
use result_archive_store::run_store::RunRecordStore;

use common::{spawn_fake_couchdb, test_config};

fn ras_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ras"))
}

fn write_config(dir: &Path, url: &str) -> PathBuf {
    let path = dir.join("ras.toml");
    std::fs::write(
        &path,
        format!(
            r#"[store]
url = "{}"
token_env = "RAS_CLI_TEST_TOKEN_UNSET"

[cache]
dir = "{}"
"#,
            url,
            dir.join("cache").display()
        ),
    )
    .unwrap();
    path
}

async fn run_ras(config: &Path, args: &[&str]) -> (bool, String, String) {
    let output = tokio::process::Command::new(ras_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .await
        .expect("failed to run ras");
    (
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    )
}

/// A fake server holding one recorded run; returns the run id.
async fn setup() -> (TempDir, PathBuf, String) {
    let backend = Arc::new(InMemoryDocumentStore::new());
    backend.register_view("galasa_run", REQUESTORS_VIEW, "requestor");
    backend.register_view("galasa_run", TEST_NAMES_VIEW, "testName");
    let url = spawn_fake_couchdb(backend.clone()).await;

    let run = RunRecordStore::start(backend, &test_config(&url), "C42")
        .await
        .unwrap();
    let mut structure = result_archive_store::ras_core::models::RunDocument::new("C42");
    structure.requestor = Some("alice".into());
    structure.test_name = Some("dev.galasa.SimBankIVT".into());
    run.update_test_structure(structure).await.unwrap();
    run.write_log("starting\nfinished").await.unwrap();
    run.store_artifact(
        &ArtifactPath::parse("/framework/cps_record.properties").unwrap(),
        "text/plain",
        b"zos.image=SIMBANK\n".to_vec(),
    )
    .await
    .unwrap();
    run.shutdown().await;
    let run_id = run.run_id().unwrap().to_string();

    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path(), &url);
    (tmp, config, run_id)
}

#[tokio::test]
async fn test_check_reports_server() {
    let (_tmp, config, _) = setup().await;
    let (ok, stdout, stderr) = run_ras(&config, &["check"]).await;
    assert!(ok, "check failed: {}", stderr);
    assert!(stdout.contains("Welcome"));
    assert!(stdout.contains("3.3.3"));
    assert!(stdout.contains("galasa_artifacts"));
}

#[tokio::test]
async fn test_runs_requestors_and_tests() {
    let (_tmp, config, run_id) = setup().await;

    let (ok, stdout, stderr) = run_ras(&config, &["runs", "--name", "C42"]).await;
    assert!(ok, "runs failed: {}", stderr);
    assert!(stdout.contains(&run_id));
    assert!(stdout.contains("alice"));

    let (ok, stdout, _) = run_ras(&config, &["runs", "--requestor", "nobody"]).await;
    assert!(ok);
    assert!(stdout.contains("No runs."));

    let (ok, stdout, _) = run_ras(&config, &["runs"]).await;
    assert!(ok);
    assert!(stdout.contains("C42"));

    let (ok, stdout, _) = run_ras(&config, &["requestors"]).await;
    assert!(ok);
    assert_eq!(stdout.trim(), "alice");

    let (ok, stdout, _) = run_ras(&config, &["tests"]).await;
    assert!(ok);
    assert_eq!(stdout.trim(), "dev.galasa.SimBankIVT");
}

#[tokio::test]
async fn test_log_ls_and_cat() {
    let (_tmp, config, run_id) = setup().await;

    let (ok, stdout, stderr) = run_ras(&config, &["log", &run_id]).await;
    assert!(ok, "log failed: {}", stderr);
    assert_eq!(stdout, "starting\nfinished\n");

    let (ok, stdout, _) = run_ras(&config, &["ls", &run_id]).await;
    assert!(ok);
    assert_eq!(stdout.trim(), "framework/");

    let (ok, stdout, _) = run_ras(&config, &["ls", &run_id, "/framework"]).await;
    assert!(ok);
    assert!(stdout.contains("cps_record.properties"));
    assert!(stdout.contains("text/plain"));

    let (ok, stdout, _) = run_ras(
        &config,
        &["cat", &run_id, "/framework/cps_record.properties"],
    )
    .await;
    assert!(ok);
    assert_eq!(stdout, "zos.image=SIMBANK\n");
}

#[tokio::test]
async fn test_unknown_run_and_bad_arguments_fail() {
    let (_tmp, config, _) = setup().await;

    let (ok, _, stderr) = run_ras(&config, &["log", "no-such-run"]).await;
    assert!(!ok);
    assert!(stderr.contains("Run not found"));

    let (ok, _, _) = run_ras(&config, &["runs", "--from", "last tuesday"]).await;
    assert!(!ok);

    let (ok, _, _) = run_ras(&config, &["runs", "--name", "C42", "--requestor", "alice"]).await;
    assert!(!ok);
}

#[tokio::test]
async fn test_missing_config_file_fails() {
    let tmp = TempDir::new().unwrap();
    let (ok, _, stderr) = run_ras(&tmp.path().join("absent.toml"), &["check"]).await;
    assert!(!ok);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_help_lists_commands() {
    let output = std::process::Command::new(ras_binary())
        .arg("--help")
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["check", "runs", "requestors", "tests", "log", "ls", "cat"] {
        assert!(stdout.contains(command), "missing {}", command);
    }
}
