//! CLI integration tests for autocount
//!
//! These only exercise commands that never reach the network.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

/// Temporary state file plus an isolated (missing) config path
struct CliEnv {
    temp_dir: TempDir,
}

impl CliEnv {
    fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
        }
    }

    fn state_path(&self) -> PathBuf {
        self.temp_dir.path().join("state.json")
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("autocount").unwrap();
        cmd.env("AUTOCOUNT_CONFIG", self.temp_dir.path().join("missing.toml"))
            .env("AUTOCOUNT_STATE", self.state_path())
            .env_remove("AUTOCOUNT_TOKEN")
            .env_remove("RUST_LOG");
        cmd
    }

    fn state_json(&self) -> serde_json::Value {
        let content = std::fs::read_to_string(self.state_path()).unwrap();
        serde_json::from_str(&content).unwrap()
    }
}

#[test]
fn test_help_flag_output() {
    let env = CliEnv::new();
    env.cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Automated sequential counting"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("account"))
        .stdout(predicate::str::contains("redact"));
}

#[test]
fn test_version_flag_output() {
    let env = CliEnv::new();
    env.cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("autocount"));
}

#[test]
fn test_status_without_state_shows_defaults() {
    let env = CliEnv::new();
    env.cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Channel:        (not set)"))
        .stdout(predicate::str::contains("Count:          0"));
}

#[test]
fn test_channel_and_accounts_are_saved() {
    let env = CliEnv::new();

    env.cmd()
        .args(["channel", "set", "123456"])
        .assert()
        .success();
    env.cmd()
        .args(["account", "add", "alice", "--token", "secret-a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added account 'alice'"));
    env.cmd()
        .args(["account", "add", "bob", "--stdin", "--user-agent", "Custom/1.0"])
        .write_stdin("secret-b\n")
        .assert()
        .success();

    let state = env.state_json();
    assert_eq!(state["channel_id"], "123456");
    assert_eq!(state["identities"][0]["label"], "alice");
    assert_eq!(state["identities"][1]["token"], "secret-b");
    assert_eq!(state["identities"][1]["user_agent"], "Custom/1.0");

    env.cmd()
        .args(["account", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("alice"))
        .stdout(predicate::str::contains("bob"))
        .stdout(predicate::str::contains("secret").not());
}

#[test]
fn test_duplicate_account_is_invalid_input() {
    let env = CliEnv::new();
    env.cmd()
        .args(["account", "add", "alice", "--token", "secret-a"])
        .assert()
        .success();

    env.cmd()
        .args(["account", "add", "alice", "--token", "secret-z"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("already exists"));
    env.cmd()
        .args(["account", "add", "carol", "--token", "secret-a"])
        .assert()
        .code(3);
    env.cmd()
        .args(["account", "add", "dave"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("--token"));
}

#[test]
fn test_remove_account() {
    let env = CliEnv::new();
    env.cmd()
        .args(["account", "add", "alice", "--token", "secret-a"])
        .assert()
        .success();

    env.cmd()
        .args(["account", "remove", "alice"])
        .assert()
        .success();
    assert_eq!(env.state_json()["identities"].as_array().unwrap().len(), 0);

    env.cmd()
        .args(["account", "remove", "alice"])
        .assert()
        .code(3);
}

#[test]
fn test_pacing_set_parses_durations() {
    let env = CliEnv::new();
    env.cmd()
        .args(["pacing", "set", "--min", "800ms", "--max", "2s"])
        .assert()
        .success();

    let state = env.state_json();
    assert_eq!(state["pacing"]["min_delay_ms"], 800);
    assert_eq!(state["pacing"]["max_delay_ms"], 2000);

    env.cmd()
        .args(["pacing", "set", "--min", "3s", "--max", "1s"])
        .assert()
        .code(3);
    env.cmd()
        .args(["pacing", "set", "--min", "soon", "--max", "1s"])
        .assert()
        .failure();
    env.cmd()
        .args(["pacing", "set", "--min", "1s", "--max", "500000y"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("limit"));
    assert_eq!(env.state_json()["pacing"]["max_delay_ms"], 2000);
}

#[test]
fn test_run_hours_validation() {
    let env = CliEnv::new();
    env.cmd()
        .args(["hours", "set", "22", "6"])
        .assert()
        .success()
        .stdout(predicate::str::contains("22:00-06:00"));
    assert_eq!(env.state_json()["run_hours"]["start_hour"], 22);

    env.cmd().args(["hours", "set", "9", "24"]).assert().code(3);

    env.cmd().args(["hours", "clear"]).assert().success();
    assert!(env.state_json()["run_hours"].is_null());
}

#[test]
fn test_participants_add_list_remove() {
    let env = CliEnv::new();
    env.cmd()
        .args(["participant", "add", "HelperBot"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added counting bot 'HelperBot'"));
    env.cmd()
        .args(["participant", "add", "helperbot"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("already listed"));

    let participants = env.state_json()["automated_participants"].clone();
    assert!(participants
        .as_array()
        .unwrap()
        .iter()
        .any(|p| *p == "HelperBot"));

    env.cmd()
        .args(["participant", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("HelperBot"))
        .stdout(predicate::str::contains("CountingBot"));

    env.cmd()
        .args(["participant", "remove", "HELPERBOT"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed counting bot 'HelperBot'"));
    env.cmd()
        .args(["participant", "remove", "HelperBot"])
        .assert()
        .code(3);
}

#[test]
fn test_run_limit_is_not_saved() {
    let env = CliEnv::new();
    env.cmd()
        .args(["channel", "set", "123456"])
        .assert()
        .success();

    env.cmd()
        .args(["run", "--limit", "0"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("count limit must be positive"));
    assert!(env.state_json()["count_limit"].is_null());
}

#[test]
fn test_redact_hides_secrets() {
    let env = CliEnv::new();
    env.cmd()
        .args(["channel", "set", "987654321"])
        .assert()
        .success();
    env.cmd()
        .args(["account", "add", "alice", "--token", "very-secret"])
        .assert()
        .success();

    env.cmd()
        .arg("redact")
        .assert()
        .success()
        .stdout(predicate::str::contains("CHANNEL_ID"))
        .stdout(predicate::str::contains("account-1"))
        .stdout(predicate::str::contains("very-secret").not())
        .stdout(predicate::str::contains("987654321").not());

    let output = env.temp_dir.path().join("shared.json");
    env.cmd()
        .args(["redact", "--output"])
        .arg(&output)
        .assert()
        .success();
    let shared = std::fs::read_to_string(&output).unwrap();
    assert!(shared.contains("\"TOKEN\""));
}

#[test]
fn test_run_without_channel_is_refused() {
    let env = CliEnv::new();
    env.cmd()
        .arg("run")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no channel set"));
}

#[test]
fn test_run_without_accounts_is_refused() {
    let env = CliEnv::new();
    env.cmd()
        .args(["channel", "set", "123456"])
        .assert()
        .success();
    env.cmd()
        .arg("run")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no identities configured"));
}

#[test]
fn test_status_json_has_no_tokens() {
    let env = CliEnv::new();
    env.cmd()
        .args(["account", "add", "alice", "--token", "secret-a"])
        .assert()
        .success();

    let output = env
        .cmd()
        .args(["status", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["current_count"], 0);
    assert_eq!(status["accounts"][0]["label"], "alice");
    assert!(!String::from_utf8_lossy(&output.stdout).contains("secret-a"));
}
