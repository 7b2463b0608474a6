use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn tvault_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("tvault");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[storage]
root = "{}/data"
busy_timeout_ms = 5000

[embedding]
provider = "disabled"

[logging]
level = "warn"
"#,
        root.display()
    );

    let config_path = config_dir.join("vault.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_tvault(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = tvault_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run tvault binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_tenant_store() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_tvault(&config_path, &["init", "--tenant", "u1"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("applied 6 migration(s)"), "stdout: {}", stdout);
    assert!(stdout.contains("0001_initial"));

    let db = tmp.path().join("data/userdbs/u1/u1.sqlite3");
    assert!(db.exists(), "tenant database not created at {:?}", db);
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_tvault(&config_path, &["init", "--tenant", "u1"]);
    assert!(success, "first init failed: {}", stderr);

    let (stdout, stderr, success) = run_tvault(&config_path, &["init", "--tenant", "u1"]);
    assert!(success, "second init failed: {}", stderr);
    assert!(stdout.contains("schema is current"), "stdout: {}", stdout);
}

#[test]
fn test_status_lists_ledger() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_tvault(&config_path, &["status", "--shared"]);
    assert!(success);
    assert!(stdout.contains("not provisioned"), "stdout: {}", stdout);

    run_tvault(&config_path, &["init", "--shared"]);
    let (stdout, _, success) = run_tvault(&config_path, &["status", "--shared"]);
    assert!(success);
    assert!(stdout.contains("applied  0006_documents_window_check"));
    assert!(!stdout.contains("missing"));
}

#[test]
fn test_status_of_unknown_tenant_creates_nothing() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_tvault(&config_path, &["status", "--tenant", "typo"]);
    assert!(success, "status failed: {}", stderr);
    assert!(stdout.contains("not provisioned"), "stdout: {}", stdout);
    assert!(!tmp.path().join("data/userdbs/typo").exists());
}

#[test]
fn test_invalid_tenant_rejected() {
    let (tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_tvault(&config_path, &["init", "--tenant", "../escape"]);
    assert!(!success);
    assert!(stderr.contains("invalid tenant id"), "stderr: {}", stderr);
    assert!(!tmp.path().join("data/escape").exists());
}

#[test]
fn test_ingest_requires_embedding_provider() {
    let (tmp, config_path) = setup_test_env();
    let doc = tmp.path().join("doc.json");
    fs::write(
        &doc,
        r#"{"file_type": "pdf", "table": "kb", "chunks": [{"page_id": 0, "content": "x"}]}"#,
    )
    .unwrap();

    let (_, stderr, success) = run_tvault(
        &config_path,
        &["ingest", "--tenant", "u1", doc.to_str().unwrap()],
    );
    assert!(!success);
    assert!(stderr.contains("disabled"), "stderr: {}", stderr);
}
