use assert_cmd::prelude::*;
use std::process::Command;

#[test]
fn cli_help_lists_flags() {
    let output = Command::cargo_bin("memrelay")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    for flag in [
        "--addr",
        "--cache-capacity",
        "--max-msg-bytes",
        "--max-filters",
        "--max-subs",
        "--admission-filter",
        "--max-event-age",
        "--verbose",
    ] {
        assert!(text.contains(flag), "missing {flag} in help output");
    }
}

#[test]
fn cli_rejects_invalid_addr() {
    Command::cargo_bin("memrelay")
        .unwrap()
        .args(["--addr", "not-an-addr"])
        .assert()
        .failure();
}

#[test]
fn cli_rejects_invalid_admission_filter() {
    Command::cargo_bin("memrelay")
        .unwrap()
        .args(["--addr", "127.0.0.1:0", "--admission-filter", "{}"])
        .assert()
        .failure();
}
