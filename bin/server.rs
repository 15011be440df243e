// Parcel Reconciliation - Web Server
// Read-only REST API over the parcel store, for map/table/timeline frontends

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use parcel_reconcile::{
    get_classification_counts, get_document_stats, get_map_points, get_presence_timeline,
    get_records_by_classification, get_records_by_parcel, open_readonly, Classification,
    ReconcileConfig,
};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(ApiResponse {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }
}

fn failure(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
        }),
    )
        .into_response()
}

/// Run a read against the shared connection and wrap the result
fn with_store<T, F>(state: &AppState, what: &str, query: F) -> Response
where
    T: Serialize,
    F: FnOnce(&Connection) -> parcel_reconcile::Result<T>,
{
    let conn = match state.db.lock() {
        Ok(conn) => conn,
        Err(_) => return failure(StatusCode::INTERNAL_SERVER_ERROR, "store lock poisoned".to_string()),
    };

    match query(&conn) {
        Ok(data) => ApiResponse::ok(data),
        Err(e) => {
            error!("Error getting {}: {}", what, e);
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Serialize)]
struct SummaryResponse {
    classifications: Vec<parcel_reconcile::ClassificationCount>,
    documents: Vec<parcel_reconcile::DocumentStat>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok("OK")
}

/// GET /api/parcels/:id - Rows for one parcel identifier
async fn get_parcel(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    with_store(&state, "parcel rows", |conn| get_records_by_parcel(conn, &id))
}

/// GET /api/parcels/:id/timeline - Year-by-year presence
async fn get_timeline(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    with_store(&state, "presence timeline", |conn| get_presence_timeline(conn, &id))
}

/// GET /api/classifications/:label - Rows with one label
async fn get_by_classification(State(state): State<AppState>, Path(label): Path<String>) -> Response {
    let classification: Classification = match label.parse() {
        Ok(classification) => classification,
        Err(e) => return failure(StatusCode::BAD_REQUEST, e.to_string()),
    };

    with_store(&state, "classification rows", |conn| {
        get_records_by_classification(conn, classification)
    })
}

/// GET /api/map - Map-plottable rows
async fn get_map(State(state): State<AppState>) -> Response {
    with_store(&state, "map points", get_map_points)
}

/// GET /api/summary - Counts per label and per document
async fn get_summary(State(state): State<AppState>) -> Response {
    with_store(&state, "summary", |conn| {
        Ok(SummaryResponse {
            classifications: get_classification_counts(conn)?,
            documents: get_document_stats(conn)?,
        })
    })
}

fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/parcels/:id", get(get_parcel))
        .route("/parcels/:id/timeline", get(get_timeline))
        .route("/classifications/:label", get(get_by_classification))
        .route("/map", get(get_map))
        .route("/summary", get(get_summary))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ReconcileConfig::load(None).context("Failed to load configuration")?;
    let db_path = &config.database;

    if !db_path.exists() {
        anyhow::bail!(
            "Database not found at {} (run `parcel-reconcile rebuild` first)",
            db_path.display()
        );
    }

    let conn = open_readonly(db_path).with_context(|| format!("Failed to open {}", db_path.display()))?;
    info!("✓ Store opened read-only: {}", db_path.display());

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
    };
    let app = build_router(state);

    let addr = std::env::var("PARCEL_SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("🚀 Server running on http://{}", addr);
    info!("   API: http://{}/api/map", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
