//! Read-only status server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/stats` | [`PipelineCounts`] as JSON |
//! | `GET`  | `/errors?limit=N` | Terminally failed items, newest first |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "internal", "message": "database is locked" } }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so dashboards can poll
//! the endpoints from a browser.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use channel_digest_core::models::{Item, PipelineCounts};
use channel_digest_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

const DEFAULT_ERROR_LIMIT: usize = 50;
const MAX_ERROR_LIMIT: usize = 1000;

#[derive(Clone)]
struct AppState {
    store: Arc<dyn Store>,
}

/// Build the router over any [`Store`].
pub fn router(store: Arc<dyn Store>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/errors", get(handle_errors))
        .layer(cors)
        .with_state(AppState { store })
}

/// `cdg serve`: bind `[server].bind` and serve until `cancel` fires.
pub async fn run_server(config: &Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let store = SqliteStore::connect(config).await?;
    let pool = store.pool().clone();
    let app = router(Arc::new(store));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "status server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    pool.close().await;
    Ok(())
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

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "status request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal".to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
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

// ============ GET /stats ============

async fn handle_stats(State(state): State<AppState>) -> Result<Json<PipelineCounts>, AppError> {
    Ok(Json(state.store.pipeline_counts().await?))
}

// ============ GET /errors ============

#[derive(Deserialize)]
struct ErrorsQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct ErrorsResponse {
    items: Vec<Item>,
}

async fn handle_errors(
    State(state): State<AppState>,
    Query(query): Query<ErrorsQuery>,
) -> Result<Json<ErrorsResponse>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_ERROR_LIMIT);
    if limit == 0 || limit > MAX_ERROR_LIMIT {
        return Err(bad_request(format!(
            "limit must be between 1 and {}",
            MAX_ERROR_LIMIT
        )));
    }
    let items = state.store.list_failed_items(limit).await?;
    Ok(Json(ErrorsResponse { items }))
}
