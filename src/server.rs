//! HTTP server.
//!
//! Both long-running endpoints stream newline-delimited JSON progress events
//! and finish with exactly one terminal event.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/upload` | Multipart field `file`; streams indexing progress, ends with `{"success":"indexed","cuuid":...}` |
//! | `POST` | `/ask` | JSON `{question, cuuid}`; streams question progress, ends with the answer or `{"error":...}` |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser front ends can
//! call the API directly.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::completion::CompletionClient;
use crate::config::Config;
use crate::index::Indexer;
use crate::orchestrator::{ask_session, cost_rates, Pipeline};
use crate::progress::{ChannelProgress, ProgressEvent, ProgressSink};
use crate::render::renderer_from_config;
use crate::session::CostRates;

/// Largest accepted upload.
const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    root: PathBuf,
    rates: CostRates,
    indexer: Arc<Indexer>,
    pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(config: &Config, client: CompletionClient) -> Self {
        Self {
            root: config.workspace.root.clone(),
            rates: cost_rates(config),
            indexer: Arc::new(Indexer::new(
                config.workspace.root.clone(),
                config.indexing.clone(),
                Arc::from(renderer_from_config(&config.indexing)),
            )),
            pipeline: Arc::new(Pipeline::new(client, config)),
        }
    }

    pub fn with_parts(root: PathBuf, rates: CostRates, indexer: Indexer, pipeline: Pipeline) -> Self {
        Self {
            root,
            rates,
            indexer: Arc::new(indexer),
            pipeline: Arc::new(pipeline),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/upload", post(handle_upload))
        .route("/ask", post(handle_ask))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let client = CompletionClient::from_config(&config.completion)?;
    std::fs::create_dir_all(&config.workspace.root)?;
    let app = router(AppState::new(config, client));

    let bind_addr = config.server.bind.clone();
    info!(bind = %bind_addr, root = %config.workspace.root.display(), "server listening");
    println!("wbqa server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Streams events from `rx` as an NDJSON body until the sender side is dropped.
fn ndjson_response(rx: mpsc::UnboundedReceiver<ProgressEvent>) -> Response {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<_, Infallible>(event.to_line()), rx))
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// A one-event stream, for requests rejected before any work starts.
fn single_event(event: ProgressEvent) -> Response {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(event);
    ndjson_response(rx)
}

// ============ POST /upload ============

async fn handle_upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut upload: Option<(String, Vec<u8>)> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("file") {
                    continue;
                }
                let filename = field.file_name().unwrap_or_default().to_string();
                match field.bytes().await {
                    Ok(bytes) => upload = Some((filename, bytes.to_vec())),
                    Err(e) => return single_event(ProgressEvent::Error(e.to_string())),
                }
                break;
            }
            Ok(None) => break,
            Err(e) => return single_event(ProgressEvent::Error(e.to_string())),
        }
    }

    let (filename, bytes) = match upload {
        Some(u) => u,
        None => return single_event(ProgressEvent::Error("No file part".to_string())),
    };
    if filename.is_empty() {
        return single_event(ProgressEvent::Error("No selected file".to_string()));
    }

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let progress = ChannelProgress::new(tx);
        if let Err(e) = state
            .indexer
            .index_workbook(&filename, &bytes, &progress)
            .await
        {
            warn!(file = %filename, error = %format!("{:#}", e), "upload failed");
        }
    });
    ndjson_response(rx)
}

// ============ POST /ask ============

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub question: String,
    pub cuuid: String,
}

async fn handle_ask(State(state): State<AppState>, Json(req): Json<AskRequest>) -> Response {
    if req.question.trim().is_empty() {
        return single_event(ProgressEvent::Error(
            "question must not be empty".to_string(),
        ));
    }

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let progress = ChannelProgress::new(tx);
        let _ = ask_session(
            &state.pipeline,
            &state.root,
            state.rates,
            &req.cuuid,
            &req.question,
            &progress as &dyn ProgressSink,
        )
        .await;
    });
    ndjson_response(rx)
}

// ============ GET /health ============

/// JSON response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    /// The crate version from `Cargo.toml`.
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
