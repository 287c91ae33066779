//! Black-box tests of the `duo` binary.
//!
//! Each test points the ledger root at its own temp directory through the
//! `DUO_LEDGER__ROOT_DIR` override and runs from that directory so no local
//! `duo.toml` leaks in.

use assert_cmd::Command;
use predicates::prelude::*;
use std::collections::HashSet;
use std::path::Path;
use tempfile::TempDir;

fn duo(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("duo").unwrap();
    cmd.current_dir(root)
        .env("DUO_LEDGER__ROOT_DIR", root)
        .env("DUO_MIRROR__ENABLED", "false")
        .env("DROID_REPO", "octo/widgets")
        .env("DROID_PR_NUMBER", "42")
        .env("DROID_AGENT_NAME", "orchestrator")
        .env_remove("GITHUB_TOKEN")
        .env_remove("GH_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn missing_repository_fails_before_touching_disk() {
    let dir = TempDir::new().unwrap();
    duo(dir.path())
        .env_remove("DROID_REPO")
        .args(["get", "stage"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("DROID_REPO not set"));

    assert!(!dir.path().join("duo-octo-widgets-42").exists());
}

#[test]
fn register_send_and_read_history() {
    let dir = TempDir::new().unwrap();
    duo(dir.path())
        .args(["register", "opus", "--model", "opus-4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Registered opus"));

    duo(dir.path())
        .args(["send", "opus", "please review src/lib.rs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Sent to opus (#1)"));

    duo(dir.path())
        .env("DROID_AGENT_NAME", "opus")
        .args(["send", "orchestrator", "done"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown agent 'orchestrator'"));

    duo(dir.path())
        .args(["register", "orchestrator"])
        .assert()
        .success();
    duo(dir.path())
        .env("DROID_AGENT_NAME", "opus")
        .args(["send", "orchestrator", "done"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(#2)"));

    duo(dir.path())
        .args(["messages", "-n", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("#2").and(predicate::str::contains("opus -> orchestrator: done")))
        .stdout(predicate::str::contains("please review").not());

    duo(dir.path())
        .args(["inbox", "opus"])
        .assert()
        .success()
        .stdout(predicate::str::contains("please review src/lib.rs"));
}

#[test]
fn send_reads_body_from_stdin() {
    let dir = TempDir::new().unwrap();
    duo(dir.path()).args(["register", "codex"]).assert().success();

    duo(dir.path())
        .args(["send", "codex", "--stdin"])
        .write_stdin("multi\nline body\n")
        .assert()
        .success();

    let output = duo(dir.path())
        .args(["messages", "--json"])
        .output()
        .unwrap();
    let messages: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(messages[0]["body"], "multi\nline body\n");
    assert_eq!(messages[0]["from"], "orchestrator");
}

#[test]
fn set_then_get_and_missing_key() {
    let dir = TempDir::new().unwrap();
    duo(dir.path())
        .args(["set", "stage", "2"])
        .assert()
        .success()
        .stdout("stage=2\n");

    duo(dir.path())
        .args(["get", "stage"])
        .assert()
        .success()
        .stdout("2\n");

    duo(dir.path())
        .args(["get", "stage", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"updated_by\": \"orchestrator\""));

    duo(dir.path())
        .args(["get", "verdict"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"))
        .stderr(predicate::str::contains("No changes were made").not());
}

#[test]
fn init_resets_stage_and_records_refs() {
    let dir = TempDir::new().unwrap();
    duo(dir.path()).args(["set", "stage", "4"]).assert().success();

    duo(dir.path())
        .args(["init", "--branch", "feature/x", "--base", "main"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized"));

    duo(dir.path()).args(["get", "stage"]).assert().stdout("1\n");
    duo(dir.path()).args(["get", "branch"]).assert().stdout("feature/x\n");

    duo(dir.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"repo\": \"octo/widgets\""));
}

#[test]
fn alive_for_unknown_agent_fails() {
    let dir = TempDir::new().unwrap();
    duo(dir.path())
        .args(["alive", "gemini"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown agent 'gemini'"));
}

#[test]
fn agent_without_process_is_reported_not_running() {
    let dir = TempDir::new().unwrap();
    duo(dir.path()).args(["register", "opus"]).assert().success();

    duo(dir.path())
        .args(["alive", "opus"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("dead (no process registered)"));

    duo(dir.path())
        .args(["interrupt", "opus"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not running"))
        .stderr(predicate::str::contains("unknown agent").not());
}

#[cfg(unix)]
#[test]
fn alive_reports_dead_process_with_exit_code() {
    let dir = TempDir::new().unwrap();
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();

    duo(dir.path())
        .args(["register", "codex", "--pid", &pid.to_string()])
        .assert()
        .success();

    duo(dir.path())
        .args(["alive", "codex"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains(format!("dead (was pid={pid})")));

    duo(dir.path())
        .args(["interrupt", "codex"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not running"));
}

#[test]
fn settings_require_at_least_one_option() {
    let dir = TempDir::new().unwrap();
    duo(dir.path()).args(["register", "opus"]).assert().success();

    duo(dir.path())
        .args(["settings", "opus"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no settings given"));

    duo(dir.path())
        .args(["settings", "opus", "--auto", "high", "--model", "opus-4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Updated opus"));

    duo(dir.path())
        .args(["settings", "opus", "--auto", "extreme"])
        .assert()
        .failure();
}

#[test]
fn comment_commands_need_an_enabled_mirror() {
    let dir = TempDir::new().unwrap();
    duo(dir.path())
        .args(["comment", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn config_command_prints_effective_settings() {
    let dir = TempDir::new().unwrap();
    duo(dir.path())
        .env("GITHUB_TOKEN", "ghp_should_not_print")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[ledger]"))
        .stdout(predicate::str::contains("<redacted>"))
        .stdout(predicate::str::contains("ghp_should_not_print").not());
}

#[test]
fn concurrent_processes_get_gapless_sequence_numbers() {
    const SENDERS: usize = 8;

    let dir = TempDir::new().unwrap();
    duo(dir.path()).args(["register", "orchestrator"]).assert().success();

    let handles: Vec<_> = (0..SENDERS)
        .map(|n| {
            let root = dir.path().to_path_buf();
            std::thread::spawn(move || {
                duo(&root)
                    .env("DROID_AGENT_NAME", format!("agent-{n}"))
                    .args(["send", "orchestrator", &format!("report {n}")])
                    .output()
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        let output = handle.join().unwrap();
        assert!(
            output.status.success(),
            "{}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let output = duo(dir.path())
        .args(["messages", "--json"])
        .output()
        .unwrap();
    let messages: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    let ids: Vec<u64> = messages.iter().map(|m| m["id"].as_u64().unwrap()).collect();
    assert_eq!(ids, (1..=SENDERS as u64).collect::<Vec<_>>());

    let senders: HashSet<&str> = messages.iter().map(|m| m["from"].as_str().unwrap()).collect();
    assert_eq!(senders.len(), SENDERS);
}
