//! Binary smoke checks.

use assert_cmd::Command;

#[test]
fn help_lists_the_subcommands() {
    let output = Command::cargo_bin("pacts")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("cache"));
}

#[test]
fn run_requires_a_url() {
    Command::cargo_bin("pacts")
        .unwrap()
        .args(["run", "requirements.txt"])
        .assert()
        .failure();
}
