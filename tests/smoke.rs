//! Smoke tests -- verify the binary runs and key subcommands load.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("proxypulse")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "Scheduled proxy pool speed testing",
        ));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("proxypulse")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn test_serve_help() {
    Command::cargo_bin("proxypulse")
        .unwrap()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--bind"));
}

#[test]
fn test_classify_prints_risk_level() {
    Command::cargo_bin("proxypulse")
        .unwrap()
        .args(["classify", "--score", "5"])
        .assert()
        .success()
        .stdout(predicates::str::contains("VeryLow"));
}

#[test]
fn test_classify_high_score() {
    Command::cargo_bin("proxypulse")
        .unwrap()
        .args(["classify", "--score", "90"])
        .assert()
        .success()
        .stdout(predicates::str::contains("VeryHigh"));
}
