use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn rw_sync_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_rw-sync"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let inbox = root.join("inbox");
    fs::create_dir_all(&inbox).unwrap();
    fs::write(
        inbox.join("alpha.html"),
        r#"<html><head><title>Alpha</title><link rel="canonical" href="https://example.com/alpha?utm_source=x"></head></html>"#,
    )
    .unwrap();
    fs::write(
        inbox.join("Beta_20240102_030405_[URL]_https%3A%2F%2Fexample.com%2Fbeta.html"),
        "<html><head><title>Beta</title></head></html>",
    )
    .unwrap();
    fs::write(inbox.join("notes.txt"), "not html").unwrap();

    // Relative paths resolve against the config file's directory
    let config_content = r#"[watch]
dir = "./inbox"

[state]
db_path = "./data/state/rw_sync.db"

[reader]
base_url = "http://127.0.0.1:1"

[network]
fetch_remote_titles = false
"#;
    let config_path = root.join("rw-sync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_rw_sync(
    config_path: &Path,
    token: Option<&str>,
    args: &[&str],
) -> (String, String, Option<i32>) {
    let binary = rw_sync_binary();
    let mut command = Command::new(&binary);
    command
        .current_dir(config_path.parent().unwrap())
        .env_remove("READWISE_TOKEN")
        .env_remove("RW_SYNC_CONFIG")
        .env_remove("RW_SYNC_WATCH_DIR")
        .env_remove("RW_SYNC_DB_PATH")
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(config_path)
        .arg("--progress")
        .arg("off")
        .args(args);
    if let Some(token) = token {
        command.env("READWISE_TOKEN", token);
    }
    let output = command
        .output()
        .unwrap_or_else(|e| panic!("Failed to run rw-sync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

#[test]
fn test_init_creates_state() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_rw_sync(&config_path, None, &["init"]);
    assert_eq!(code, Some(0), "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("State initialized"));
    assert!(tmp.path().join("data/state/rw_sync.db").exists());
    assert!(tmp.path().join("data/failures").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_rw_sync(&config_path, None, &["init"]);
    assert_eq!(first, Some(0), "First init failed");

    let (_, _, second) = run_rw_sync(&config_path, None, &["init"]);
    assert_eq!(second, Some(0), "Second init failed (not idempotent)");
}

#[test]
fn test_push_requires_exactly_one_mode() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, neither) = run_rw_sync(&config_path, Some("t"), &["push"]);
    assert_eq!(neither, Some(2));

    let (_, _, both) = run_rw_sync(&config_path, Some("t"), &["push", "--all", "--new"]);
    assert_eq!(both, Some(2));
}

#[test]
fn test_push_rejects_bad_arguments() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, zero) = run_rw_sync(&config_path, Some("t"), &["push", "--all", "--max", "0"]);
    assert_eq!(zero, Some(2));

    let (_, _, since) = run_rw_sync(
        &config_path,
        Some("t"),
        &["push", "--new", "--since", "yesterday"],
    );
    assert_eq!(since, Some(2));
}

#[test]
fn test_push_without_token_fails() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_rw_sync(&config_path, None, &["push", "--new"]);
    assert_ne!(code, Some(0), "push without token succeeded: {}", stdout);
    assert!(stderr.contains("READWISE_TOKEN"), "stderr={}", stderr);
    assert!(!tmp.path().join("data/state/rw_sync.db").exists());
}

#[test]
fn test_dry_run_push_counts_without_writing() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_rw_sync(
        &config_path,
        Some("dummy-token"),
        &["--dry-run", "push", "--new"],
    );
    assert_eq!(code, Some(0), "dry run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("push new"));
    assert!(stdout.contains("created: 2"));
    assert!(stdout.contains("failed:  0"));
    assert!(stdout.contains("ok"));

    // No record, watermark, or ledger row was written
    let (stats, _, code) = run_rw_sync(&config_path, None, &["stats"]);
    assert_eq!(code, Some(0));
    assert!(stats.contains("Documents:   0"), "stats={}", stats);
    assert!(stats.contains("Watermark:   unset"), "stats={}", stats);
    assert!(stats.contains("Failures today: 0"), "stats={}", stats);
    assert!(fs::read_dir(tmp.path().join("data/failures"))
        .unwrap()
        .next()
        .is_none());
}

#[test]
fn test_failed_push_is_recorded_for_replay() {
    let (_tmp, config_path) = setup_test_env();

    // Nothing listens on the configured base URL
    let (stdout, stderr, code) = run_rw_sync(&config_path, Some("t"), &["push", "--all"]);
    assert_eq!(code, Some(0), "push failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("failed:  2"), "stdout={}", stdout);

    let (stats, _, _) = run_rw_sync(&config_path, None, &["stats"]);
    assert!(stats.contains("Failures today: 2"), "stats={}", stats);
    assert!(stats.contains("Documents:   2"), "stats={}", stats);

    let (replay, stderr, code) = run_rw_sync(&config_path, Some("t"), &["--dry-run", "replay"]);
    assert_eq!(code, Some(0), "replay failed: stderr={}", stderr);
    assert!(replay.contains("created: 2"), "replay={}", replay);
}

#[test]
fn test_replay_rejects_bad_date() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, code) = run_rw_sync(&config_path, Some("t"), &["replay", "--date", "01/02/2024"]);
    assert_eq!(code, Some(2));
}

#[test]
fn test_replay_without_failures_is_empty() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_rw_sync(
        &config_path,
        Some("t"),
        &["replay", "--date", "2000-01-01"],
    );
    assert_eq!(code, Some(0), "replay failed: stderr={}", stderr);
    assert!(stdout.contains("replay 2000-01-01"));
    assert!(stdout.contains("created: 0"));
}
