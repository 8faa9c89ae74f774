//! End-to-end integration tests for the batchpilot CLI
//!
//! These tests run the built binary and check:
//! - Configuration resolution (presets, files, environment, validation)
//! - The synthetic load simulation and its JSON report

use std::fs;
use std::process::{Command, Output};

fn batchpilot(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_batchpilot"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run batchpilot")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "Command failed: {}", stderr);
    serde_json::from_str(stdout.trim()).expect("Invalid JSON on stdout")
}

/// Test `batchpilot config` with the default preset
#[test]
fn test_config_default() {
    let json = stdout_json(&batchpilot(&["config"]));

    assert_eq!(json["max_batch_size"], 32);
    assert_eq!(json["max_wait_ms"], 10);
    assert_eq!(json["target_latency_ms"], 100);
    assert_eq!(json["adaptive"], true);
}

/// Test `batchpilot config --preset low-latency` with a flag override
#[test]
fn test_config_preset_and_flags() {
    let json = stdout_json(&batchpilot(&[
        "config",
        "--preset",
        "low-latency",
        "--max-in-flight",
        "3",
        "--no-adaptive",
    ]));

    assert_eq!(json["max_batch_size"], 8);
    assert_eq!(json["max_wait_ms"], 2);
    assert_eq!(json["max_in_flight_batches"], 3);
    assert_eq!(json["adaptive"], false);
}

/// Environment variables override the preset, flags override the environment
#[test]
fn test_config_env_overrides() {
    let output = Command::new(env!("CARGO_BIN_EXE_batchpilot"))
        .args(["config", "--queue-capacity", "64"])
        .env("BATCHPILOT_MAX_BATCH_SIZE", "48")
        .env("BATCHPILOT_QUEUE_CAPACITY", "4096")
        .output()
        .expect("Failed to run batchpilot config");
    let json = stdout_json(&output);

    assert_eq!(json["max_batch_size"], 48);
    assert_eq!(json["queue_capacity"], 64);
}

/// Test `batchpilot config --file <path>`
#[test]
fn test_config_file() {
    let path = std::env::temp_dir().join("batchpilot_test_config.json");
    fs::write(&path, r#"{ "max_batch_size": 16, "min_wait_ms": 2, "idle_flush_ms": 3 }"#)
        .expect("Failed to write config file");

    let json = stdout_json(&batchpilot(&["config", "--file", path.to_str().unwrap()]));

    assert_eq!(json["max_batch_size"], 16);
    assert_eq!(json["min_wait_ms"], 2);
    assert_eq!(json["idle_flush_ms"], 3);
    // Unspecified fields keep their defaults
    assert_eq!(json["queue_capacity"], 1024);

    let _ = fs::remove_file(&path);
}

/// An invalid configuration exits non-zero with the validation message
#[test]
fn test_config_invalid() {
    let path = std::env::temp_dir().join("batchpilot_test_invalid_config.json");
    fs::write(&path, r#"{ "max_batch_size": 4, "min_batch_size": 8 }"#)
        .expect("Failed to write config file");

    let output = batchpilot(&["config", "--file", path.to_str().unwrap()]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "Invalid config was accepted");
    assert!(
        stderr.contains("min_batch_size (8) exceeds max_batch_size (4)"),
        "Missing validation message: {}",
        stderr
    );

    let _ = fs::remove_file(&path);
}

/// Test `batchpilot simulate -o <file>`
#[test]
fn test_simulate_writes_report() {
    let path = std::env::temp_dir().join("batchpilot_test_report.json");
    let _ = fs::remove_file(&path);

    let output = batchpilot(&[
        "simulate",
        "--requests",
        "60",
        "--concurrency",
        "12",
        "--overhead-ms",
        "2",
        "--per-item-ms",
        "0.1",
        "--max-batch-size",
        "8",
        "-o",
        path.to_str().unwrap(),
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    println!("stdout: {}", stdout);
    println!("stderr: {}", stderr);

    assert!(output.status.success(), "Command failed: {}", stderr);
    assert!(stdout.contains("=== Throughput ==="), "Missing throughput section");
    assert!(stdout.contains("=== Latency ==="), "Missing latency section");
    assert!(stdout.contains("=== Batching ==="), "Missing batching section");

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).expect("Report not written"))
            .expect("Invalid report JSON");

    assert!(report["run_id"].as_str().is_some_and(|id| id.len() == 36));
    assert!(report["timestamp"].as_str().is_some());
    assert_eq!(report["completed"].as_u64().unwrap() + report["rejected"].as_u64().unwrap(), 60);
    assert_eq!(report["failed"], 0);
    assert!(report["largest_batch"].as_u64().unwrap() <= 8);
    assert!(report["final_thresholds"]["max_batch_size"].as_u64().unwrap() <= 8);
    assert!(report["metrics"]["batches_completed"].as_u64().unwrap() > 0);

    let _ = fs::remove_file(&path);
}

/// Test `batchpilot simulate --prometheus`
#[test]
fn test_simulate_prometheus() {
    let output = batchpilot(&[
        "simulate",
        "--requests",
        "20",
        "--concurrency",
        "4",
        "--overhead-ms",
        "1",
        "--failure-rate",
        "0.5",
        "--prometheus",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(output.status.success(), "Command failed: {}", stderr);
    assert!(stdout.contains("=== Prometheus ==="), "Missing Prometheus section");
    assert!(stdout.contains("batchpilot_batches_total"), "Missing batch counter");
    assert!(stdout.contains("status=\"dispatch_error\""), "Missing failed batch label");
    assert!(stdout.contains("batchpilot_batch_size_bucket"), "Missing size histogram");
}

/// Test `batchpilot --help`
#[test]
fn test_help() {
    let output = batchpilot(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("config"), "Missing config command");
    assert!(stdout.contains("simulate"), "Missing simulate command");
}
