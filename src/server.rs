//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/query` | Hybrid query, body is a [`QueryRequest`] |
//! | `GET`  | `/records/{id}` | Full record, superseded ones included |
//! | `GET`  | `/stats` | Index and cache statistics |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query text must not be empty" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `INCOMPATIBLE_EMBEDDING` (400),
//! `EMBEDDING_FAILED` (503), `INDEX_UNAVAILABLE` (503), `INDEX_CORRUPT` (500).

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::app::{Docket, DocketStats};
use crate::config::Config;
use crate::error::{IndexError, QueryError};
use crate::models::{DocumentRecord, QueryRequest, QueryResponse};

/// Open the configured index and serve until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let docket = Arc::new(Docket::open(config.clone()).await?);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("docket listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(docket)).await?;

    Ok(())
}

pub fn router(docket: Arc<Docket>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/query", post(handle_query))
        .route("/records/{id}", get(handle_get_record))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(docket)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<IndexError> for AppError {
    fn from(err: IndexError) -> Self {
        let status = match &err {
            IndexError::NotFound(_) => StatusCode::NOT_FOUND,
            IndexError::DimensionMismatch { .. }
            | IndexError::ModelMismatch { .. }
            | IndexError::AlreadySuperseded(_) => StatusCode::BAD_REQUEST,
            IndexError::Poisoned | IndexError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            IndexError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(code = err.code(), error = %err, "index error");
        AppError::new(status, err.code(), err.to_string())
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Index(e) => e.into(),
            QueryError::EmptyQuery => {
                AppError::new(StatusCode::BAD_REQUEST, err.code(), err.to_string())
            }
            QueryError::EmbeddingFailed(_) => {
                tracing::warn!(error = %err, "query embedding failed");
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, err.code(), err.to_string())
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /query ============

async fn handle_query(
    State(docket): State<Arc<Docket>>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let Json(req) =
        body.map_err(|e| AppError::new(StatusCode::BAD_REQUEST, "bad_request", e.body_text()))?;
    Ok(Json(docket.query(&req).await?))
}

// ============ GET /records/{id} ============

async fn handle_get_record(
    State(docket): State<Arc<Docket>>,
    Path(id): Path<String>,
) -> Result<Json<DocumentRecord>, AppError> {
    docket
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "not_found", format!("record not found: {}", id)))
}

// ============ GET /stats ============

async fn handle_stats(State(docket): State<Arc<Docket>>) -> Result<Json<DocketStats>, AppError> {
    Ok(Json(docket.stats().await?))
}
