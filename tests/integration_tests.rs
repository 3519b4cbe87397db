//! Integration tests for the billing-automation binary
//!
//! Each test runs the CLI in its own temporary directory, so the default
//! `.automation/` paths land inside it.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const FAST_POOL: &str = r#"
[identities]
max_identities = 2
provisioning_pause_ms = 0
allocation_delay_ms = 1
"#;

/// Helper to create a billing-automation Command
fn automation(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("billing-automation");
    cmd.current_dir(dir.path())
        .env_remove("AUTOMATION_CONFIG")
        .env_remove("AUTOMATION_ENV")
        .env_remove("AUTOMATION_STORE_BACKEND")
        .env_remove("AUTOMATION_STORE_PATH");
    cmd
}

/// Temp directory with `.automation/automation.toml` holding `content`
fn project_with_config(content: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join(".automation")).unwrap();
    fs::write(dir.path().join(".automation/automation.toml"), content).unwrap();
    dir
}

fn stdout_json(output: &[u8]) -> serde_json::Value {
    serde_json::from_slice(output).unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        automation(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("step"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        automation(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_command_fails() {
        let dir = TempDir::new().unwrap();
        automation(&dir).arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        automation(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("using defaults"))
            .stdout(predicate::str::contains("max_identities = 100"));
    }

    #[test]
    fn test_config_show_reads_file() {
        let dir = project_with_config(FAST_POOL);
        automation(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_identities = 2"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = project_with_config("[identities]\ncapacity = 0\n");
        automation(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings"))
            .stdout(predicate::str::contains("identities.capacity"));
    }

    #[test]
    fn test_config_validate_clean_file() {
        let dir = project_with_config(FAST_POOL);
        automation(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_init_writes_default_file() {
        let dir = TempDir::new().unwrap();
        automation(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));
        let written = fs::read_to_string(dir.path().join(".automation/automation.toml")).unwrap();
        assert!(written.contains("[identities]"));
    }

    #[test]
    fn test_malformed_config_fails() {
        let dir = project_with_config("[store\nbackend = ");
        automation(&dir).arg("status").assert().failure();
    }
}

// =============================================================================
// Engine commands
// =============================================================================

mod engine {
    use super::*;

    #[test]
    fn test_init_db_creates_store() {
        let dir = project_with_config(FAST_POOL);
        automation(&dir)
            .arg("init-db")
            .assert()
            .success()
            .stdout(predicate::str::contains("Metadata store initialized"));
        assert!(dir.path().join(".automation/metadata.db").exists());
    }

    #[test]
    fn test_status_of_fresh_store() {
        let dir = project_with_config(FAST_POOL);
        let output = automation(&dir).arg("status").assert().success();
        let status = stdout_json(&output.get_output().stdout);
        assert_eq!(status["manager"]["stage"], "done");
        assert_eq!(status["manager"]["version"], 0);
        assert_eq!(status["tasks"]["total"], 0);
    }

    #[test]
    fn test_create_step_and_status_persist_across_processes() {
        let dir = project_with_config(FAST_POOL);

        let output = automation(&dir)
            .args([
                "create",
                "--duration-minutes",
                "60",
                "--dummy-users",
                "3",
                "--min-kilo-rows",
                "1",
            ])
            .assert()
            .success();
        let run = stdout_json(&output.get_output().stdout);
        assert_eq!(run["version"], 1);
        assert_eq!(run["num_synthetic_accounts"], 3);

        let output = automation(&dir).arg("step").assert().success();
        let report = stdout_json(&output.get_output().stdout);
        assert_eq!(report["status"], "ran");
        assert_eq!(report["stage"], "pending");
        assert_eq!(report["next"], "writing");

        let output = automation(&dir).arg("status").assert().success();
        let status = stdout_json(&output.get_output().stdout);
        assert_eq!(status["manager"]["stage"], "writing");
        assert_eq!(status["manager"]["running"], false);
        assert_eq!(status["tasks"]["total"], 3);
        assert_eq!(status["tasks"]["active"], 3);
        assert_eq!(status["identities"]["total"], 2);
        assert_eq!(status["identities"]["bound_accounts"], 3);
    }

    #[test]
    fn test_second_create_is_rejected_while_writing() {
        let dir = project_with_config(FAST_POOL);
        let create = [
            "create",
            "--duration-minutes",
            "60",
            "--dummy-users",
            "1",
            "--min-kilo-rows",
            "1",
        ];
        automation(&dir).args(create).assert().success();
        automation(&dir)
            .args(create)
            .assert()
            .failure()
            .stderr(predicate::str::contains("an older orchestration will run for other"));

        automation(&dir).arg("stop").assert().success();
        let output = automation(&dir).args(create).assert().success();
        assert_eq!(stdout_json(&output.get_output().stdout)["version"], 2);
    }

    #[test]
    fn test_create_rejects_inverted_throughput() {
        let dir = project_with_config(FAST_POOL);
        automation(&dir)
            .args([
                "create",
                "--duration-minutes",
                "60",
                "--dummy-users",
                "1",
                "--min-kilo-rows",
                "5",
                "--max-kilo-rows",
                "2",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("maxNumOfKiloRowsPerHour"));
    }

    #[test]
    fn test_reset_returns_to_default_state() {
        let dir = project_with_config(FAST_POOL);
        automation(&dir)
            .args([
                "create",
                "--duration-minutes",
                "5",
                "--dummy-users",
                "2",
                "--min-kilo-rows",
                "1",
            ])
            .assert()
            .success();

        let output = automation(&dir).arg("reset").assert().success();
        let report = stdout_json(&output.get_output().stdout);
        assert_eq!(report["version"], 1);

        let output = automation(&dir).arg("status").assert().success();
        let status = stdout_json(&output.get_output().stdout);
        assert_eq!(status["manager"]["stage"], "done");
        assert_eq!(status["manager"]["version"], 1);
        assert_eq!(status["identities"]["total"], 2);
    }

    #[test]
    fn test_step_refuses_production_environment() {
        let dir = project_with_config(&format!("{}\n[environment]\nname = \"prod\"\n", FAST_POOL));
        automation(&dir)
            .args([
                "create",
                "--duration-minutes",
                "5",
                "--dummy-users",
                "1",
                "--min-kilo-rows",
                "1",
            ])
            .assert()
            .success();
        automation(&dir)
            .arg("step")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unable to run automation in environment prod"));
    }
}
