//! CLI surface tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn drydock() -> Command {
    Command::cargo_bin("drydock").expect("binary built")
}

#[test]
fn test_help() {
    drydock()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Sandbox lifecycle manager"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("check"));
}

#[test]
fn test_check_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    drydock()
        .current_dir(dir.path())
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("pool target:      3"));
}

#[test]
fn test_check_reads_config_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("drydock.toml"),
        r#"
repositories = ["myorg/frontend"]

[pool]
target_size = 5
"#,
    )
    .unwrap();

    drydock()
        .current_dir(dir.path())
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("myorg/frontend"))
        .stdout(predicate::str::contains("pool target:      5"));
}

#[test]
fn test_check_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("drydock.toml"), "repositories = not-a-list").unwrap();

    drydock()
        .current_dir(dir.path())
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
fn test_serve_requires_repositories() {
    let dir = tempfile::tempdir().unwrap();
    drydock()
        .current_dir(dir.path())
        .arg("serve")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No repositories configured"));
}

#[test]
fn test_unknown_subcommand() {
    drydock().arg("flood").assert().failure();
}

#[test]
fn test_verbose_flag_is_global() {
    let dir = tempfile::tempdir().unwrap();
    drydock()
        .current_dir(dir.path())
        .args(["check", "--verbose"])
        .assert()
        .success();
}
