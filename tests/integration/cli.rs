//! Binary command surface

use assert_cmd::Command;
use receipt_batch::checkpoint::{CheckpointEntry, CheckpointStore, FileCheckpointStore};
use receipt_batch::{Stage, StageResult};
use tempfile::TempDir;

fn receipt_batch(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("receipt-batch").unwrap();
    cmd.env_remove("EXTRACTION_ENDPOINT")
        .env_remove("EXTRACTION_API_KEY")
        .env_remove("STRUCTURING_ENDPOINT")
        .env_remove("STRUCTURING_API_KEY")
        .args(["--data-dir", data_dir.path().to_str().unwrap()]);
    cmd
}

#[test]
fn test_help_lists_commands() {
    let output = Command::cargo_bin("receipt-batch")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in [
        "process",
        "extract",
        "resume",
        "usage",
        "invalidate",
        "checkpoints",
    ] {
        assert!(stdout.contains(command), "missing {command} in help");
    }
}

#[test]
fn test_usage_on_fresh_data_dir() {
    let data_dir = TempDir::new().unwrap();

    let output = receipt_batch(&data_dir).arg("usage").output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Calls: 0/5000"));
    assert!(data_dir.path().join("checkpoints").is_dir());
}

#[test]
fn test_usage_json_output() {
    let data_dir = TempDir::new().unwrap();

    let output = receipt_batch(&data_dir)
        .args(["--output-format", "json", "usage", "--history", "3"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["summary"]["month_to_date"], 0);
    assert_eq!(report["summary"]["monthly_limit"], 5000);
    assert_eq!(report["history"].as_array().unwrap().len(), 3);
}

#[test]
fn test_process_requires_endpoints() {
    let data_dir = TempDir::new().unwrap();

    receipt_batch(&data_dir)
        .args(["process", "a.jpg"])
        .assert()
        .failure();
}

#[test]
fn test_process_with_empty_input_dir_fails() {
    let data_dir = TempDir::new().unwrap();
    std::fs::create_dir_all(data_dir.path().join("receipts")).unwrap();

    receipt_batch(&data_dir)
        .args([
            "process",
            "--extraction-endpoint",
            "http://127.0.0.1:9/extract",
            "--structuring-endpoint",
            "http://127.0.0.1:9/structure",
        ])
        .assert()
        .failure();
}

#[test]
fn test_resume_unknown_batch_fails() {
    let data_dir = TempDir::new().unwrap();

    receipt_batch(&data_dir)
        .args([
            "resume",
            "no-such-batch",
            "--structuring-endpoint",
            "http://127.0.0.1:9/structure",
        ])
        .assert()
        .failure();
}

#[test]
fn test_rejects_zero_chunk_size() {
    let data_dir = TempDir::new().unwrap();

    receipt_batch(&data_dir)
        .args(["extract", "a.jpg", "--chunk-size", "0"])
        .assert()
        .failure();
}

#[test]
fn test_invalidate_removes_checkpoints() {
    let data_dir = TempDir::new().unwrap();
    let store = FileCheckpointStore::open(data_dir.path().join("checkpoints")).unwrap();
    store
        .put(&CheckpointEntry::new(
            StageResult::succeeded("a.jpg", Stage::Extraction, serde_json::json!({"text": "x"})),
            1,
        ))
        .unwrap();

    let output = receipt_batch(&data_dir)
        .args(["invalidate", "a.jpg", "b.jpg"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Removed 1 checkpoint(s)"));
    assert!(store.get("a.jpg", Stage::Extraction).unwrap().is_none());
}

#[test]
fn test_checkpoints_summary_json() {
    let data_dir = TempDir::new().unwrap();
    let store = FileCheckpointStore::open(data_dir.path().join("checkpoints")).unwrap();
    for id in ["a.jpg", "b.jpg"] {
        store
            .put(&CheckpointEntry::new(
                StageResult::succeeded(id, Stage::Extraction, serde_json::json!({"text": id})),
                1,
            ))
            .unwrap();
    }

    let output = receipt_batch(&data_dir)
        .args(["--output-format", "json", "checkpoints", "--list"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["summary"]["total_files"], 2);
    assert_eq!(report["summary"]["extraction_files"], 2);
    assert_eq!(report["files"].as_array().unwrap().len(), 2);
    assert!(report.get("pruned").is_none());
}

#[test]
fn test_checkpoints_prune_keeps_recent_files() {
    let data_dir = TempDir::new().unwrap();
    let store = FileCheckpointStore::open(data_dir.path().join("checkpoints")).unwrap();
    store
        .put(&CheckpointEntry::new(
            StageResult::succeeded("a.jpg", Stage::Extraction, serde_json::json!({})),
            1,
        ))
        .unwrap();

    let output = receipt_batch(&data_dir)
        .args(["checkpoints", "--prune-older-than", "24"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Pruned 0 checkpoint file(s)"));
    assert!(stdout.contains("Files: 1"));
    assert!(store.get("a.jpg", Stage::Extraction).unwrap().is_some());
}
