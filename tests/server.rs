//! HTTP surface: NDJSON streaming of upload and ask, and the health check.

mod common;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use common::xlsx;

use workbook_qa::completion::{CompletionBackend, CompletionClient};
use workbook_qa::config::{parse_config, IndexingConfig};
use workbook_qa::error::Result;
use workbook_qa::index::Indexer;
use workbook_qa::orchestrator::{cost_rates, Pipeline};
use workbook_qa::render::NoopRenderer;
use workbook_qa::server::{router, AppState};

/// Answers every stage with a fixed reply keyed on its system prompt.
struct Canned;

#[async_trait]
impl CompletionBackend for Canned {
    async fn send(&self, body: &Value) -> Result<Value> {
        let system = body["messages"][0]["content"].as_str().unwrap_or_default();
        let content = if system.contains("search term extraction bot") {
            json!({ "search": "no_search_term_found" })
        } else if system.contains("SQL bot") {
            json!({ "query": "SELECT COUNT(*) FROM \"Orders\"" })
        } else {
            json!({ "response": "There are 30 orders." })
        };
        Ok(json!({
            "choices": [{ "message": { "content": content.to_string() } }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
        }))
    }
}

fn orders_xlsx() -> Vec<u8> {
    let mut rows = vec![vec!["Order".to_string(), "Qty".to_string()]];
    for r in 2..=31 {
        rows.push(vec![format!("ORD-{}", r), r.to_string()]);
    }
    xlsx(&[("Orders", rows)])
}

async fn spawn_server(root: &Path) -> SocketAddr {
    let cfg = parse_config(&format!(
        "[workspace]\nroot = \"{}\"\n\n[completion]\nurl = \"http://127.0.0.1:9/v1\"\nmodel = \"m\"\n",
        root.display()
    ))
    .unwrap();
    let client = CompletionClient::new(Arc::new(Canned), "m", 0.3);
    let indexing = IndexingConfig {
        renderer: "none".into(),
        // 30 rows is big with this limit
        small_max_rows: 10,
        ..IndexingConfig::default()
    };
    let state = AppState::with_parts(
        root.to_path_buf(),
        cost_rates(&cfg),
        Indexer::new(root, indexing, Arc::new(NoopRenderer)),
        Pipeline::new(client, &cfg),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    addr
}

fn ndjson(body: &str) -> Vec<Value> {
    body.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn multipart(field: &str, filename: &str, bytes: &[u8]) -> (String, Vec<u8>) {
    let boundary = "wbqa-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    (format!("multipart/form-data; boundary={}", boundary), body)
}

async fn upload(addr: SocketAddr, field: &str, filename: &str, bytes: &[u8]) -> Vec<Value> {
    let (content_type, body) = multipart(field, filename, bytes);
    let response = reqwest::Client::new()
        .post(format!("http://{}/upload", addr))
        .header("Content-Type", content_type)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/x-ndjson"
    );
    ndjson(&response.text().await.unwrap())
}

#[tokio::test]
async fn health_reports_version() {
    let tmp = TempDir::new().unwrap();
    let addr = spawn_server(tmp.path()).await;
    let body: Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn upload_then_ask_streams_a_single_terminal_event_each() {
    let tmp = TempDir::new().unwrap();
    let addr = spawn_server(tmp.path()).await;

    let events = upload(addr, "file", "orders.xlsx", &orders_xlsx()).await;
    let last = events.last().unwrap();
    assert_eq!(last["success"], "indexed");
    let cuuid = last["cuuid"].as_str().unwrap().to_string();
    assert!(events[..events.len() - 1].iter().all(|e| e.get("error").is_none()));

    let response = reqwest::Client::new()
        .post(format!("http://{}/ask", addr))
        .json(&json!({ "question": "How many orders are there?", "cuuid": cuuid }))
        .send()
        .await
        .unwrap();
    let events = ndjson(&response.text().await.unwrap());
    let last = events.last().unwrap();
    assert_eq!(last["action"], "answer");
    assert!(last["success"]
        .as_str()
        .unwrap()
        .starts_with("There are 30 orders."));
    assert!(events
        .iter()
        .any(|e| e["action"] == "processing"));
    assert_eq!(
        events
            .iter()
            .filter(|e| e["action"] == "answer" || e.get("error").is_some())
            .count(),
        1
    );
}

#[tokio::test]
async fn upload_without_file_field_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let addr = spawn_server(tmp.path()).await;
    let events = upload(addr, "other", "orders.xlsx", b"x").await;
    assert_eq!(events, vec![json!({ "error": "No file part" })]);

    let events = upload(addr, "file", "", b"x").await;
    assert_eq!(events, vec![json!({ "error": "No selected file" })]);
}

#[tokio::test]
async fn ask_for_unknown_session_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let addr = spawn_server(tmp.path()).await;
    let response = reqwest::Client::new()
        .post(format!("http://{}/ask", addr))
        .json(&json!({ "question": "q", "cuuid": "nope" }))
        .send()
        .await
        .unwrap();
    let events = ndjson(&response.text().await.unwrap());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["error"], "session not found: nope");
}
