use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

use docket::app::Docket;
use docket::config::Config;
use docket::embedding::HashProvider;
use docket::error::FetchError;
use docket::live::LiveFetcher;
use docket::models::{FetchCriteria, RawDocument, RecordMetadata, RecordSource};
use docket::server::router;

struct NoLive;

#[async_trait]
impl LiveFetcher for NoLive {
    fn name(&self) -> &str {
        "none"
    }
    async fn fetch(&self, _criteria: &FetchCriteria) -> Result<Vec<RawDocument>, FetchError> {
        Ok(Vec::new())
    }
}

async fn spawn_server(tmp: &TempDir) -> (String, String) {
    let mut config = Config::default();
    config.db.path = tmp.path().join("docket.sqlite");
    config.embedding.provider = "hash".into();
    config.embedding.model = Some("hash-64".into());
    config.embedding.dims = Some(64);

    let docket = Docket::with_components(
        config,
        Arc::new(HashProvider::new("hash-64", 64)),
        Arc::new(NoLive),
    )
    .await
    .unwrap();
    let outcome = docket
        .pipeline()
        .ingest(
            RawDocument {
                source_native_id: "2020/supply.htm".into(),
                text: "Supply agreement with minimum purchase commitments.".into(),
                metadata: RecordMetadata {
                    doc_type: Some("Services".into()),
                    ..Default::default()
                },
            },
            RecordSource::Historical,
        )
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(Arc::new(docket))).await.unwrap();
    });
    (format!("http://{}", addr), outcome.id().to_string())
}

#[tokio::test]
async fn test_health() {
    let tmp = TempDir::new().unwrap();
    let (base, _) = spawn_server(&tmp).await;

    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_query_and_get_record() {
    let tmp = TempDir::new().unwrap();
    let (base, id) = spawn_server(&tmp).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/query", base))
        .json(&json!({ "text": "minimum purchase commitments", "filters": { "doc_type": "services" } }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["results"][0]["id"], id.as_str());
    assert_eq!(body["results"][0]["source"], "HISTORICAL");

    let record: Value = client
        .get(format!("{}/records/{}", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["source_native_id"], "2020/supply.htm");
    assert!(record.get("embedding").is_none());
}

#[tokio::test]
async fn test_error_bodies() {
    let tmp = TempDir::new().unwrap();
    let (base, _) = spawn_server(&tmp).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/query", base))
        .json(&json!({ "text": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .post(format!("{}/query", base))
        .header("content-type", "application/json")
        .body("{\"filters\": {}}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let resp = client
        .get(format!("{}/records/does-not-exist", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_stats() {
    let tmp = TempDir::new().unwrap();
    let (base, _) = spawn_server(&tmp).await;

    let body: Value = reqwest::get(format!("{}/stats", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["index"]["active_records"], 1);
    assert_eq!(body["cache_enabled"], true);
}
