//! Concurrency tests for kegflow.
//!
//! These tests verify that multiple processes can safely:
//! - Record manual pours against the same keg simultaneously
//! - Record manual pours while the monitor is delivering metered pours

use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use tempfile::TempDir;

fn cli() -> Command {
    Command::cargo_bin("kegflow").expect("Failed to find kegflow binary")
}

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    let contents = format!(
        r#"
[data]
data_dir = "{}"

[monitor]
poll_interval_ms = 50
rate_window_ms = 250
grace_interval_ms = 300

[[taps]]
id = 1
line = "sim:20:1000:1500"
pulses_per_unit = 450.0
"#,
        dir.join("data").display()
    );
    fs::write(&path, contents).expect("Failed to write config");
    path
}

fn run(config: &Path, args: &[&str]) {
    cli().arg("--config").arg(config).args(args).assert().success();
}

fn volume_remaining(dir: &Path) -> f64 {
    let raw = fs::read_to_string(dir.join("data/ledger/kegs.json")).expect("Failed to read kegs");
    let kegs: serde_json::Value = serde_json::from_str(&raw).unwrap();
    kegs["kegs"][0]["volume_remaining"].as_f64().unwrap()
}

fn history(dir: &Path) -> Vec<serde_json::Value> {
    fs::read_to_string(dir.join("data/ledger/pours.jsonl"))
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn test_concurrent_manual_pours() {
    let temp_dir = setup_test_dir();
    let config = write_config(temp_dir.path());

    run(&config, &["keg", "add", "--name", "Shared", "--volume-l", "10"]);
    run(&config, &["keg", "tap", "--id", "1", "--tap", "1"]);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let config = config.clone();
            thread::spawn(move || run(&config, &["pour", "--keg", "1", "--volume-ml", "250"]))
        })
        .collect();
    for handle in handles {
        handle.join().expect("Pour thread panicked");
    }

    // Every decrement landed exactly once
    assert!((volume_remaining(temp_dir.path()) - 8.0).abs() < 1e-9);
    assert_eq!(history(temp_dir.path()).len(), 8);
}

#[test]
fn test_manual_pours_during_monitoring() {
    let temp_dir = setup_test_dir();
    let config = write_config(temp_dir.path());

    run(&config, &["keg", "add", "--name", "Busy", "--volume-l", "19"]);
    run(&config, &["keg", "tap", "--id", "1", "--tap", "1"]);

    let monitor_config = config.clone();
    let monitor = thread::spawn(move || {
        run(&monitor_config, &["monitor", "--duration-secs", "4"]);
    });

    for _ in 0..5 {
        thread::sleep(std::time::Duration::from_millis(300));
        run(&config, &["pour", "--keg", "1", "--volume-ml", "100"]);
    }
    monitor.join().expect("Monitor thread panicked");

    let events = history(temp_dir.path());
    let manual = events.iter().filter(|e| e["source"] == "manual").count();
    let metered = events.iter().filter(|e| e["source"] == "flow_meter").count();
    assert_eq!(manual, 5);
    assert!(metered >= 1);

    // The book and the history agree
    let poured: f64 = events.iter().map(|e| e["volume"].as_f64().unwrap()).sum();
    assert!((19.0 - poured - volume_remaining(temp_dir.path())).abs() < 1e-9);
}
