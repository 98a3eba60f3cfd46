//! Behavioural tests for the `leasehold` binary.

use eyre::{Result, ensure, eyre};
use std::path::Path;
use std::process::{Command, Output};

fn run_cli(database: &Path, args: &[&str]) -> Result<Output> {
    let binary = env!("CARGO_BIN_EXE_leasehold");
    Command::new(binary)
        .arg("--database")
        .arg(database)
        .args(args)
        .env_remove("LEASEHOLD_CONFIG")
        .env("RUST_LOG", "error")
        .output()
        .map_err(|err| eyre!(err))
}

fn json_output(output: &Output) -> Result<serde_json::Value> {
    ensure!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).map_err(|err| eyre!(err))
}

#[test]
fn enqueue_then_inspect_and_cancel() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let database = dir.path().join("cli.db");

    let init = json_output(&run_cli(&database, &["init"])?)?;
    ensure!(init.get("schema_version").is_some(), "init should report the schema");

    let receipt = json_output(&run_cli(
        &database,
        &["enqueue", "email", "--payload", "hi", "-p", "3", "--tag", "region=eu"],
    )?)?;
    let id = receipt
        .get("task_id")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| eyre!("receipt lacks task_id: {receipt}"))?;
    let id_arg = id.to_string();

    let status = json_output(&run_cli(&database, &["status", &id_arg])?)?;
    ensure!(
        status.get("status").and_then(serde_json::Value::as_str) == Some("queued"),
        "unexpected status: {status}"
    );

    let cancelled = json_output(&run_cli(&database, &["cancel", &id_arg])?)?;
    ensure!(
        cancelled.get("cancelled").and_then(serde_json::Value::as_bool) == Some(true),
        "cancel should succeed: {cancelled}"
    );

    let stats = json_output(&run_cli(&database, &["stats"])?)?;
    ensure!(
        stats.get("total").and_then(serde_json::Value::as_u64) == Some(1),
        "unexpected stats: {stats}"
    );
    Ok(())
}

#[test]
fn unknown_task_exits_with_failure() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let database = dir.path().join("cli.db");

    let output = run_cli(&database, &["status", "999"])?;

    ensure!(!output.status.success(), "missing task should fail");
    ensure!(
        String::from_utf8_lossy(&output.stderr).contains("999"),
        "stderr should name the problem"
    );
    Ok(())
}

#[test]
fn rejects_missing_subcommand() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let output = run_cli(&dir.path().join("cli.db"), &[])?;

    ensure!(!output.status.success(), "a subcommand is required");
    Ok(())
}
