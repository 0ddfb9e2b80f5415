//! Smoke tests -- verify the binary runs and subcommands are wired.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("speedwatch")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Internet speed test"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("speedwatch")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("speedwatch"));
}

#[test]
fn test_run_subcommand_exists() {
    Command::cargo_bin("speedwatch")
        .unwrap()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--csv"));
}

#[test]
fn test_watch_subcommand_exists() {
    Command::cargo_bin("speedwatch")
        .unwrap()
        .args(["watch", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--interval"));
}

#[test]
fn test_serve_subcommand_exists() {
    Command::cargo_bin("speedwatch")
        .unwrap()
        .args(["serve", "--help"])
        .assert()
        .success();
}

#[test]
fn test_watch_rejects_zero_interval() {
    Command::cargo_bin("speedwatch")
        .unwrap()
        .args(["watch", "--interval", "0"])
        .env_remove("SPEEDWATCH_CONFIG")
        .assert()
        .failure()
        .stderr(predicates::str::contains("interval must be"));
}

#[test]
fn test_missing_config_file_fails() {
    Command::cargo_bin("speedwatch")
        .unwrap()
        .args(["--config", "/nonexistent/speedwatch.toml", "run"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("failed to read config file"));
}
