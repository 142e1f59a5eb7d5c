use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docket_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docket");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let corpus_dir = root.join("contracts");
    fs::create_dir_all(corpus_dir.join("2019")).unwrap();
    fs::write(
        corpus_dir.join("2019/distribution_services_agreement.htm"),
        "<html><head><style>p { color: red; }</style></head><body>\
         <p>Exclusivity clause governs distribution. The distributor holds exclusive \
         distribution rights for the territory during the initial term.</p>\
         <p>Either party may terminate upon ninety days written notice.</p></body></html>",
    )
    .unwrap();
    fs::write(
        corpus_dir.join("office_lease.txt"),
        "The tenant shall pay base rent monthly in advance for the leased premises. \
         The landlord maintains the roof and structural elements of the building.",
    )
    .unwrap();
    fs::write(
        corpus_dir.join("employment_agreement.txt"),
        "The executive receives an annual base salary and is eligible for a performance \
         bonus. Severance is payable upon termination without cause.",
    )
    .unwrap();
    fs::write(corpus_dir.join("stub.txt"), "Too short to index.").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/docket.sqlite"

[embedding]
provider = "hash"
model = "hash-128"
dims = 128

[retrieval]
default_top_k = 5

[corpus]
root = "{root}/contracts"

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("docket.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docket(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docket_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docket binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// Value of a `  label: N` summary line.
fn summary_count(stdout: &str, label: &str) -> usize {
    stdout
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == label).then(|| value.trim().parse().ok())?
        })
        .unwrap_or_else(|| panic!("no '{}' line in output:\n{}", label, stdout))
}

fn query_json(config_path: &Path, args: &[&str]) -> serde_json::Value {
    let mut full = vec!["query"];
    full.extend_from_slice(args);
    full.push("--json");
    let (stdout, stderr, success) = run_docket(config_path, &full);
    assert!(success, "query failed: {}", stderr);
    serde_json::from_str(&stdout).unwrap()
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docket(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully"));
    assert!(tmp.path().join("data/docket.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_docket(&config_path, &["init"]);
    let (_, stderr, second) = run_docket(&config_path, &["init"]);
    assert!(first);
    assert!(second, "second init failed: {}", stderr);
}

#[test]
fn test_ingest_corpus() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docket(&config_path, &["ingest"]);
    assert!(success, "ingest failed: {}", stderr);
    assert_eq!(summary_count(&stdout, "discovered"), 4);
    assert_eq!(summary_count(&stdout, "inserted"), 3);
    assert_eq!(summary_count(&stdout, "skipped_short"), 1);
}

#[test]
fn test_ingest_idempotent_no_duplicates() {
    let (_tmp, config_path) = setup_test_env();

    run_docket(&config_path, &["ingest"]);
    let (stdout, stderr, success) = run_docket(&config_path, &["ingest"]);
    assert!(success, "second ingest failed: {}", stderr);
    assert_eq!(summary_count(&stdout, "inserted"), 0);
    assert_eq!(summary_count(&stdout, "duplicates"), 3);

    let (stats, _, _) = run_docket(&config_path, &["stats"]);
    assert_eq!(summary_count(&stats, "Records"), 3);
}

#[test]
fn test_ingest_limit() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docket(&config_path, &["ingest", "--limit", "2"]);
    assert!(success, "ingest failed: {}", stderr);
    assert_eq!(summary_count(&stdout, "inserted"), 2);
}

#[test]
fn test_query_ranks_matching_clause_first() {
    let (_tmp, config_path) = setup_test_env();
    run_docket(&config_path, &["ingest"]);

    let response = query_json(&config_path, &["exclusivity clause distribution"]);
    let results = response["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0]["source"], "HISTORICAL");
    assert_eq!(results[0]["metadata"]["doc_type"], "Services");
    assert!(results[0]["score"].as_f64().unwrap() > 0.0);
    assert!(response["warnings"].as_array().unwrap().is_empty());
}

#[test]
fn test_query_deterministic() {
    let (_tmp, config_path) = setup_test_env();
    run_docket(&config_path, &["ingest"]);

    let first = query_json(&config_path, &["termination notice"]);
    let second = query_json(&config_path, &["termination notice"]);
    assert_eq!(first, second);
}

#[test]
fn test_query_filters_by_doc_type() {
    let (_tmp, config_path) = setup_test_env();
    run_docket(&config_path, &["ingest"]);

    let response = query_json(&config_path, &["termination", "--doc-type", "employment"]);
    let results = response["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["metadata"]["doc_type"], "Employment");
}

#[test]
fn test_query_text_output() {
    let (_tmp, config_path) = setup_test_env();
    run_docket(&config_path, &["ingest"]);

    let (stdout, stderr, success) = run_docket(&config_path, &["query", "tenant rent premises"]);
    assert!(success, "query failed: {}", stderr);
    assert!(stdout.starts_with("1. ["));
    assert!(stdout.contains("HISTORICAL / Lease"));
}

#[test]
fn test_query_live_without_source_warns() {
    let (_tmp, config_path) = setup_test_env();
    run_docket(&config_path, &["ingest"]);

    let response = query_json(&config_path, &["exclusivity clause", "--live"]);
    let warnings = response["warnings"].as_array().unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0]
        .as_str()
        .unwrap()
        .starts_with("LIVE_FETCH_UNAVAILABLE"));
    assert!(!response["results"].as_array().unwrap().is_empty());
}

#[test]
fn test_query_empty_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_docket(&config_path, &["init"]);

    let (_, stderr, success) = run_docket(&config_path, &["query", "  "]);
    assert!(!success);
    assert!(stderr.contains("must not be empty"));
}

#[test]
fn test_query_bad_date_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_docket(&config_path, &["query", "rent", "--since", "2020/01/01"]);
    assert!(!success);
    assert!(stderr.contains("YYYY-MM-DD"));
}

#[test]
fn test_get_record() {
    let (_tmp, config_path) = setup_test_env();
    run_docket(&config_path, &["ingest"]);

    let response = query_json(&config_path, &["salary bonus severance"]);
    let id = response["results"][0]["id"].as_str().unwrap().to_string();

    let (stdout, stderr, success) = run_docket(&config_path, &["get", &id]);
    assert!(success, "get failed: {}", stderr);
    assert!(stdout.contains("--- Record ---"));
    assert!(stdout.contains(&id));
    assert!(stdout.contains("employment_agreement.txt"));
    assert!(stdout.contains("annual base salary"));
}

#[test]
fn test_get_missing_record() {
    let (_tmp, config_path) = setup_test_env();
    run_docket(&config_path, &["init"]);

    let (_, stderr, success) = run_docket(&config_path, &["get", "0000000000000000"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_stats_json() {
    let (_tmp, config_path) = setup_test_env();
    run_docket(&config_path, &["ingest"]);

    let (stdout, stderr, success) = run_docket(&config_path, &["stats", "--json"]);
    assert!(success, "stats failed: {}", stderr);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["index"]["model"], "hash-128");
    assert_eq!(stats["index"]["dims"], 128);
    assert_eq!(stats["index"]["historical_records"], 3);
    assert_eq!(stats["index"]["live_records"], 0);
}

#[test]
fn test_changed_model_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    run_docket(&config_path, &["ingest"]);

    let config = fs::read_to_string(&config_path)
        .unwrap()
        .replace("hash-128", "hash-32")
        .replace("dims = 128", "dims = 32");
    fs::write(&config_path, config).unwrap();

    let (_, stderr, success) = run_docket(&config_path, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("index corrupt"));
}

#[test]
fn test_invalid_config_fails() {
    let (_tmp, config_path) = setup_test_env();
    let config = fs::read_to_string(&config_path)
        .unwrap()
        .replace("provider = \"hash\"", "provider = \"word2vec\"");
    fs::write(&config_path, config).unwrap();

    let (_, stderr, success) = run_docket(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Unknown embedding provider"));
}

#[test]
fn test_completions_need_no_config() {
    let (stdout, stderr, success) = run_docket(Path::new("/nonexistent/docket.toml"), &["completions", "bash"]);
    assert!(success, "completions failed: {}", stderr);
    assert!(stdout.contains("docket"));
}
