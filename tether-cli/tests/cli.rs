use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use tether_core::store;

fn tether_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("tether"));
    cmd.env("HOME", home).env("USERPROFILE", home);
    cmd
}

fn write_store(home: &Path, contents: &str) {
    let path = store::store_path_at(home);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

#[test]
fn ps_without_daemon_lists_persisted_processes() {
    let home = TempDir::new().expect("home");
    write_store(home.path(), r#"{"42":"900","43":""}"#);

    tether_cmd(home.path())
        .arg("ps")
        .assert()
        .success()
        .stdout(contains("daemon not running"))
        .stdout(contains("42"))
        .stdout(contains("900"))
        .stdout(contains("1 tracked"));
}

#[test]
fn ps_json_without_daemon() {
    let home = TempDir::new().expect("home");
    write_store(home.path(), r#"{"42":"900"}"#);

    let output = tether_cmd(home.path())
        .args(["ps", "--json"])
        .output()
        .expect("run ps");
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(value["daemon_running"], serde_json::json!(false));
    assert_eq!(value["processes"][0]["application_id"], serde_json::json!("42"));
    assert_eq!(value["processes"][0]["process_id"], serde_json::json!("900"));
    assert!(value["processes"][0]["channel_state"].is_null());
}

#[test]
fn ps_with_nothing_tracked() {
    let home = TempDir::new().expect("home");

    tether_cmd(home.path())
        .arg("ps")
        .assert()
        .success()
        .stdout(contains("No tracked processes."));
}

#[test]
fn start_without_daemon_points_at_daemon_start() {
    let home = TempDir::new().expect("home");

    tether_cmd(home.path())
        .args(["start", "42"])
        .assert()
        .failure()
        .stderr(contains("tether daemon start"));
}

#[test]
fn start_rejects_blank_application_id() {
    let home = TempDir::new().expect("home");

    tether_cmd(home.path())
        .args(["start", "  "])
        .assert()
        .failure()
        .stderr(contains("must not be empty"));
}

#[test]
fn daemon_status_and_stop_when_not_running() {
    let home = TempDir::new().expect("home");

    tether_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));

    tether_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
}

#[test]
fn unknown_subcommand_fails() {
    let home = TempDir::new().expect("home");

    tether_cmd(home.path())
        .arg("restart")
        .assert()
        .failure()
        .stderr(contains("restart").and(contains("Usage")));
}
