//! Integration tests for the river-svc binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to escape path for TOML on Windows
fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

/// Config directory with a riverpost.toml pointing at a temporary store
fn setup_test_env(extra: &str) -> (TempDir, String, String) {
    let temp_dir = TempDir::new().unwrap();
    let store_path = temp_dir.path().join("data").join("river.db");

    let config_content = format!(
        r#"
[store]
path = "{}"

[queue]
period = "200ms"
{}
"#,
        escape_path_for_toml(&store_path.to_string_lossy()),
        extra
    );
    fs::write(temp_dir.path().join("riverpost.toml"), config_content).unwrap();

    let config_dir = temp_dir.path().to_string_lossy().to_string();
    let store_path = store_path.to_string_lossy().to_string();
    (temp_dir, config_dir, store_path)
}

#[test]
fn test_help_lists_services() {
    let mut cmd = Command::cargo_bin("river-svc").unwrap();

    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("poller"))
        .stdout(predicate::str::contains("publisher"))
        .stdout(predicate::str::contains("queue"))
        .stdout(predicate::str::contains("EXIT CODES"));
}

#[test]
fn test_service_is_required() {
    let mut cmd = Command::cargo_bin("river-svc").unwrap();
    cmd.assert().failure();
}

#[test]
fn test_unknown_service_is_invalid_input() {
    let (_temp_dir, config_dir, _) = setup_test_env("");
    let mut cmd = Command::cargo_bin("river-svc").unwrap();

    cmd.args(["--service", "mailer", "--config-path", &config_dir])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("unknown service"));
}

#[test]
fn test_missing_collaborators_without_dummy() {
    let (_temp_dir, config_dir, store_path) = setup_test_env("");
    let mut cmd = Command::cargo_bin("river-svc").unwrap();

    cmd.args(["--service", "poller", "--config-path", &config_dir])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Provider not configured"));
    assert!(!std::path::Path::new(&store_path).exists());
}

#[test]
fn test_publisher_without_providers() {
    let (_temp_dir, config_dir, _) = setup_test_env("");
    let mut cmd = Command::cargo_bin("river-svc").unwrap();

    cmd.args(["--service", "publisher", "--dummy", "--config-path", &config_dir])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("at least one provider"));
}

#[test]
fn test_invalid_config_exit_code() {
    let (_temp_dir, config_dir, _) = setup_test_env(
        r#"
[publisher]
max_error_count = 2
warn_error_count = 5
"#,
    );
    let mut cmd = Command::cargo_bin("river-svc").unwrap();

    cmd.args(["--service", "queue", "--config-path", &config_dir])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("warn_error_count"));
}

#[test]
fn test_store_flag_overrides_config() {
    let (temp_dir, config_dir, store_path) = setup_test_env("");
    let other = temp_dir.path().join("other").join("river.db");
    let mut cmd = Command::cargo_bin("river-svc").unwrap();

    // Fails after the store is opened
    cmd.args([
        "--service",
        "publisher",
        "--dummy",
        "--config-path",
        &config_dir,
        "--store",
        &other.to_string_lossy(),
    ])
    .assert()
    .code(3);
    assert!(other.exists());
    assert!(!std::path::Path::new(&store_path).exists());
}

#[cfg(unix)]
#[test]
fn test_sigterm_shuts_down_cleanly() {
    use std::process::{Command as StdCommand, Stdio};
    use std::time::{Duration, Instant};

    let (temp_dir, config_dir, _) = setup_test_env("");
    let log_dir = temp_dir.path().join("logs");
    let mut child = StdCommand::new(assert_cmd::cargo::cargo_bin("river-svc"))
        .args([
            "--service",
            "queue",
            "--name",
            "queue-1",
            "--config-path",
            &config_dir,
            "--log-path",
            &log_dir.to_string_lossy(),
        ])
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // Wait for the service loop to come up
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let started = fs::read_dir(&log_dir)
            .map(|entries| {
                entries.flatten().any(|e| {
                    fs::read_to_string(e.path())
                        .map(|s| s.contains("Queue starting"))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);
        if started {
            break;
        }
        assert!(Instant::now() < deadline, "queue never started");
        std::thread::sleep(Duration::from_millis(50));
    }
    std::thread::sleep(Duration::from_millis(500));

    let status = StdCommand::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let deadline = Instant::now() + Duration::from_secs(10);
    let exit = loop {
        if let Some(exit) = child.try_wait().unwrap() {
            break exit;
        }
        assert!(Instant::now() < deadline, "queue did not stop");
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(exit.code(), Some(0));
}
