use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const ENV_OVERRIDES: &[&str] = &[
    "OPENAI_API_KEY",
    "OPENAI_BASE_URL",
    "OPENAI_MODEL",
    "OPENAI_EMBEDDING_MODEL",
    "OPENAI_EMBEDDING_DIMENSIONS",
    "BROKER_PATH",
    "BROKER_GROUP_ID",
    "BROKER_TOPIC_SNIPPET_CREATED",
    "BROKER_TOPIC_SNIPPET_UPDATED",
    "BROKER_TOPIC_SNIPPET_DELETED",
    "RUNS_PATH",
    "RUNS_NAMESPACE",
    "RUNS_TASK_QUEUE",
    "OPENSEARCH_HOST",
    "OPENSEARCH_PORT",
    "OPENSEARCH_INDEX",
    "SNIP_BIND",
];

fn snip_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_snip"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    fs::write(
        root.join("created.jsonl"),
        concat!(
            r#"{"id":"abc-123","code":"function add(a,b){return a+b}"}"#,
            "\n",
            r#"{"id":"def-456","code":"fn a() {}\n\nfn b() {}\n"}"#,
            "\n",
            "{not json\n",
        ),
    )
    .unwrap();
    fs::write(root.join("deleted.jsonl"), "{\"id\":\"abc-123\"}\n").unwrap();

    let config_content = format!(
        r#"[provider]
kind = "offline"
embedding_dims = 16

[broker]
path = "{root}/data/broker.sqlite"
partitions = 2
poll_interval_ms = 10

[orchestrator]
path = "{root}/data/runs.sqlite"
initial_backoff_ms = 1
max_backoff_ms = 4

[index]
kind = "memory"

[chunking]
max_tokens = 8
"#,
        root = root.display()
    );

    let config_path = config_dir.join("snip.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_snip(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = snip_binary();
    let mut cmd = Command::new(&binary);
    for key in ENV_OVERRIDES {
        cmd.env_remove(key);
    }
    let output = cmd
        .env("RUST_LOG", "warn")
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run snip binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn ingest_created(tmp: &TempDir, config: &Path) -> String {
    let file = tmp.path().join("created.jsonl");
    let (stdout, stderr, success) = run_snip(
        config,
        &["ingest", file.to_str().unwrap(), "--process"],
    );
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

#[test]
fn test_init_creates_databases() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_snip(&config, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Initialized successfully."));
    assert!(tmp.path().join("data/broker.sqlite").exists());
    assert!(tmp.path().join("data/runs.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (_, _, success1) = run_snip(&config, &["init", "--index"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_snip(&config, &["init", "--index"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_and_process() {
    let (tmp, config) = setup_test_env();
    let stdout = ingest_created(&tmp, &config);

    assert!(stdout.contains("published: 3"), "{}", stdout);
    assert!(stdout.contains("runs started: 2"), "{}", stdout);
    assert!(stdout.contains("discarded: 1"), "{}", stdout);
    assert!(stdout.contains("snippet-ingestion-abc-123  completed"), "{}", stdout);
    assert!(stdout.contains("snippet-ingestion-def-456  completed"), "{}", stdout);
    assert!(stdout.trim_end().ends_with("ok"));
}

#[test]
fn test_ingest_without_process_only_publishes() {
    let (tmp, config) = setup_test_env();
    let file = tmp.path().join("created.jsonl");
    let (stdout, _, success) = run_snip(&config, &["ingest", file.to_str().unwrap()]);
    assert!(success);
    assert!(stdout.contains("published: 3"));
    assert!(!stdout.contains("runs started"));

    let (stdout, _, success) = run_snip(&config, &["runs", "list"]);
    assert!(success);
    assert!(stdout.contains("No runs."));
}

#[test]
fn test_runs_show_by_entity_id() {
    let (tmp, config) = setup_test_env();
    ingest_created(&tmp, &config);

    let (stdout, stderr, success) = run_snip(&config, &["runs", "show", "abc-123"]);
    assert!(success, "show failed: {}", stderr);
    assert!(stdout.contains("run:        snippet-ingestion-abc-123"));
    assert!(stdout.contains("generation: 1"));
    assert!(stdout.contains("state:      completed (completed)"));
    assert!(stdout.contains("document:   abc-123 (success: true)"));
    assert!(stdout.contains("summarizing_chunks"));
}

#[test]
fn test_runs_show_missing() {
    let (_tmp, config) = setup_test_env();
    let (_, _, success) = run_snip(&config, &["runs", "show", "nope"]);
    assert!(!success, "show of an unknown run should fail");
}

#[test]
fn test_runs_list_by_status() {
    let (tmp, config) = setup_test_env();
    ingest_created(&tmp, &config);

    let (stdout, _, success) = run_snip(&config, &["runs", "list", "--status", "completed"]);
    assert!(success);
    assert!(stdout.contains("snippet-ingestion-abc-123"));
    assert!(stdout.contains("snippet-ingestion-def-456"));

    let (stdout, _, success) = run_snip(&config, &["runs", "list", "--status", "failed"]);
    assert!(success);
    assert!(stdout.contains("No runs."));

    let (_, _, success) = run_snip(&config, &["runs", "list", "--status", "sleeping"]);
    assert!(!success);
}

#[test]
fn test_delete_events_are_skipped() {
    let (tmp, config) = setup_test_env();
    let file = tmp.path().join("deleted.jsonl");
    let (stdout, stderr, success) = run_snip(
        &config,
        &["ingest", file.to_str().unwrap(), "--topic", "deleted", "--process"],
    );
    assert!(success, "ingest failed: {}", stderr);
    assert!(stdout.contains("deletes skipped: 1"));
    assert!(stdout.contains("runs started: 0"));
}

#[test]
fn test_unknown_topic_fails() {
    let (tmp, config) = setup_test_env();
    let file = tmp.path().join("created.jsonl");
    let (_, stderr, success) = run_snip(
        &config,
        &["ingest", file.to_str().unwrap(), "--topic", "snippet.moved"],
    );
    assert!(!success);
    assert!(stderr.contains("Unknown topic"));
}

#[test]
fn test_reingest_starts_next_generation() {
    let (tmp, config) = setup_test_env();
    ingest_created(&tmp, &config);
    let stdout = ingest_created(&tmp, &config);
    // Offsets are committed, so only the new copies are consumed.
    assert!(stdout.contains("runs started: 2"), "{}", stdout);

    let (stdout, _, success) = run_snip(&config, &["runs", "show", "abc-123"]);
    assert!(success);
    assert!(stdout.contains("generation: 2"));
}

#[test]
fn test_cancel_finished_run() {
    let (tmp, config) = setup_test_env();
    ingest_created(&tmp, &config);
    let (stdout, _, success) = run_snip(&config, &["runs", "cancel", "abc-123"]);
    assert!(success);
    assert!(stdout.contains("already completed"));
}

#[test]
fn test_prune_finished_runs() {
    let (tmp, config) = setup_test_env();
    ingest_created(&tmp, &config);

    let (stdout, _, success) = run_snip(&config, &["runs", "prune", "--older-than-hours", "0"]);
    assert!(success);
    assert!(stdout.contains("pruned 2 finished run(s) older than 0h"), "{}", stdout);

    let (stdout, _, _) = run_snip(&config, &["runs", "list"]);
    assert!(stdout.contains("No runs."));
}
