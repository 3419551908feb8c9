#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::process::Output;

use anyhow::Result;
use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

fn keepsake(data_dir: &Path, env: &str, args: &[&str]) -> Result<Output> {
    let output = Command::cargo_bin("keepsake")?
        .env_remove("KEEPSAKE_ENV")
        .env_remove("KEEPSAKE_BACKUP_DIR")
        .env("KEEPSAKE_LOG", "keepsake=warn")
        .arg("--data-dir")
        .arg(data_dir)
        .args(["--env", env])
        .args(args)
        .output()?;
    Ok(output)
}

fn stdout_json(output: &Output) -> Result<Value> {
    assert!(
        output.status.success(),
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(serde_json::from_slice(&output.stdout)?)
}

#[test]
fn status_reports_a_fresh_database() -> Result<()> {
    let dir = tempdir()?;
    let status = stdout_json(&keepsake(dir.path(), "test", &["db", "status", "--json"])?)?;

    assert_eq!(status["environment"], "test");
    assert_eq!(status["health"]["passed"], true);
    assert_eq!(status["notes"], 0);
    assert_eq!(status["schemaVersion"], keepsake_lib::SCHEMA_VERSION);
    assert!(dir.path().join("appdata-test.db").exists());
    Ok(())
}

#[test]
fn backup_then_list_shows_the_new_file() -> Result<()> {
    let dir = tempdir()?;
    stdout_json(&keepsake(dir.path(), "test", &["db", "status", "--json"])?)?;

    let created = stdout_json(&keepsake(
        dir.path(),
        "test",
        &["db", "backup", "--description", "from cli", "--json"],
    )?)?;
    assert_eq!(created["success"], true);
    let filename = created["backup"]["filename"].as_str().expect("filename");
    assert!(filename.starts_with("backup-test-"));
    assert_eq!(created["backup"]["metadata"]["description"], "from cli");

    let listed = stdout_json(&keepsake(dir.path(), "test", &["db", "list", "--json"])?)?;
    let names: Vec<&str> = listed
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|b| b["filename"].as_str())
        .collect();
    assert_eq!(names, vec![filename]);
    Ok(())
}

#[test]
fn restoring_a_test_backup_onto_production_exits_nonzero() -> Result<()> {
    let dir = tempdir()?;
    stdout_json(&keepsake(dir.path(), "test", &["db", "status", "--json"])?)?;
    let created = stdout_json(&keepsake(dir.path(), "test", &["db", "backup", "--json"])?)?;
    let filename = created["backup"]["filename"].as_str().expect("filename").to_string();

    let output = keepsake(dir.path(), "production", &["db", "restore", &filename, "--json"])?;
    assert_eq!(output.status.code(), Some(1));
    let result: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(result["success"], false);
    assert_eq!(result["errorCode"], "DB_BACKUP/ENVIRONMENT_MISMATCH");
    Ok(())
}

#[test]
fn backup_without_a_database_fails() -> Result<()> {
    let dir = tempdir()?;
    let output = keepsake(dir.path(), "test", &["db", "backup"])?;
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("source database does not exist"));
    Ok(())
}
