//! CLI integration tests.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn imgtest() -> Command {
    Command::cargo_bin("imgtest").unwrap()
}

fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
    let path = dir.join("imgtest.toml");
    let content = format!(
        r#"
[cluster]
name = "basic"
native_functions = ["CheckSerialConsole", "CheckHostname"]

[[machines]]
name = "m1"
host = "10.0.0.2"

[[machines]]
name = "m2"
host = "10.0.0.3"
{extra}
"#
    );
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn help_lists_commands() {
    imgtest()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("make-disk"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("drop"))
        .stdout(predicate::str::contains("check-config"));
}

#[test]
fn check_config_summarizes() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");

    imgtest()
        .args(["check-config", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Cluster: basic"))
        .stdout(predicate::str::contains("m2 -> core@10.0.0.3:22"))
        .stdout(predicate::str::contains("OEM partition 6 under /dev/mapper"));
}

#[test]
fn check_config_rejects_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"
[[machines]]
name = "m1"
host = "10.0.0.4"
"#,
    );

    imgtest()
        .args(["check-config", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate machine name: m1"));
}

#[test]
fn mock_run_reports_json_tree() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");

    let output = imgtest()
        .args(["--mock", "run", "--json", "--config"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["name"], "basic");
    assert_eq!(report["passed"], true);
    // two functions on two machines
    assert_eq!(report["subtests"].as_array().unwrap().len(), 4);
    assert_eq!(report["subtests"][0]["name"], "basic/CheckSerialConsole");
}

#[test]
fn mock_parallel_run_passes() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");

    imgtest()
        .args(["--mock", "run", "--parallel", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("--- PASS: basic"))
        .stdout(predicate::str::contains("m2: mock payload ok"));
}

#[test]
fn mock_run_drops_payload_first() {
    let dir = tempfile::tempdir().unwrap();
    let payload = dir.path().join("imgtest-agent");
    std::fs::write(&payload, b"#!/bin/sh\n").unwrap();
    let config = write_config(
        dir.path(),
        &format!("\n[payload]\nlocal_path = {:?}\n", payload.display().to_string()),
    );

    imgtest()
        .args(["--mock", "run", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Dropping payload"));
}

#[test]
fn mock_drop_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");

    imgtest()
        .args(["--mock", "drop", "--config"])
        .arg(&config)
        .arg(dir.path().join("missing.bin"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to drop file"));
}

#[test]
fn make_disk_missing_input_leaves_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("test.img");

    imgtest()
        .args(["make-disk", "--input"])
        .arg(dir.path().join("base.img"))
        .arg("--output")
        .arg(&output)
        .assert()
        .failure()
        .stderr(predicate::str::contains("copying file"));

    assert!(!output.exists());
}
