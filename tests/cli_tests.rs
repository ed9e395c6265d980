use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn hermetic_fuzz() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("hermetic-fuzz").unwrap();
    cmd.env_remove("HERMETIC_FUZZ").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_match_reports_last_matching_rule() {
    hermetic_fuzz()
        .arg("match")
        .arg("--rules")
        .arg("com.example.**,!com.example.generated.**")
        .arg("com.example.Parser")
        .arg("com.example.generated.Lexer")
        .arg("org.junit.Test")
        .assert()
        .success()
        .stdout(predicate::str::contains("instrument com.example.Parser"))
        .stdout(predicate::str::contains("!com.example.generated.**"))
        .stdout(predicate::str::contains("org.junit.Test  (no matching rule)"));
}

#[test]
fn test_match_json_output() {
    let output = hermetic_fuzz()
        .arg("--json")
        .arg("match")
        .arg("--rules")
        .arg("com.yet.another.package.*")
        .arg("com.yet.another.package.Foo")
        .arg("com.yet.another.package.sub.Foo")
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json[0]["instrument"], true);
    assert_eq!(json[0]["rule"], "com.yet.another.package.*");
    assert_eq!(json[1]["instrument"], false);
    assert!(json[1]["rule"].is_null());
}

#[test]
fn test_match_rejects_malformed_rules() {
    hermetic_fuzz()
        .arg("match")
        .arg("--rules")
        .arg("com..example")
        .arg("com.example.Parser")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid instrumentation rules"));
}

#[test]
fn test_match_takes_rules_from_config() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("hermetic.json");
    std::fs::write(
        &config_path,
        r#"{"instrument": "com.example.**", "instrument_exclude": "com.example.Skip"}"#,
    )
    .unwrap();

    let output = hermetic_fuzz()
        .arg("--config")
        .arg(&config_path)
        .arg("--json")
        .arg("match")
        .arg("com.example.Keep")
        .arg("com.example.Skip")
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json[0]["instrument"], true);
    assert_eq!(json[1]["instrument"], false);
}

#[test]
fn test_inputs_lists_empty_input_when_nothing_is_stored() {
    let temp_dir = TempDir::new().unwrap();

    let output = hermetic_fuzz()
        .arg("--json")
        .arg("inputs")
        .arg("com.example.FuzzTest")
        .arg("fuzz_test_1")
        .arg("--basedir")
        .arg(temp_dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["target"], "com.example.FuzzTest::fuzz_test_1(bytes)");
    assert_eq!(json["stored"], 0);
    let inputs = json["inputs"].as_array().unwrap();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0]["label"], "<empty input>");
    assert_eq!(inputs[0]["size"], 0);
}

#[test]
fn test_inputs_lists_stored_inputs_in_order() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("com.example.FuzzTest").join("fuzz_test_1");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("b"), b"bb").unwrap();
    std::fs::write(dir.join("a"), b"a").unwrap();

    hermetic_fuzz()
        .arg("inputs")
        .arg("com.example.FuzzTest")
        .arg("fuzz_test_1")
        .arg("--basedir")
        .arg(temp_dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Replay inputs (2 stored)"))
        .stdout(predicate::str::is_match(r"(?s)\[1\] a .*\[2\] b ").unwrap());
}

#[test]
fn test_inputs_requires_a_base_directory() {
    hermetic_fuzz()
        .arg("inputs")
        .arg("com.example.FuzzTest")
        .arg("fuzz_test_1")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no base directory"));
}

#[test]
fn test_mode_defaults_to_regression() {
    hermetic_fuzz()
        .arg("mode")
        .assert()
        .success()
        .stdout(predicate::str::contains("regression (HERMETIC_FUZZ)"));
}

#[test]
fn test_mode_reads_the_toggle() {
    let output = hermetic_fuzz()
        .env("HERMETIC_FUZZ", "1")
        .arg("--json")
        .arg("mode")
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["mode"], "fuzzing");
    assert_eq!(json["toggle"], "HERMETIC_FUZZ");
}

#[test]
fn test_mode_treats_empty_toggle_as_regression() {
    hermetic_fuzz()
        .env("HERMETIC_FUZZ", "")
        .arg("mode")
        .assert()
        .success()
        .stdout(predicate::str::contains("regression"));
}
