// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. `/health` requires no authentication;
// every other endpoint requires a valid Bearer token checked via the
// `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::diagnostic::{run_diagnostics, save_report, DiagnosticTask, TestMode, TestSide};

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/orders", get(orders))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/diagnostic/run", post(diagnostic_run))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn full_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn orders(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.router.all_orders())
}

#[derive(Deserialize)]
struct PositionsQuery {
    symbol: String,
}

async fn positions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    axum::extract::Query(query): axum::extract::Query<PositionsQuery>,
) -> impl IntoResponse {
    let report = state.router.net_position(&query.symbol).await;
    Json(report)
}

#[derive(Deserialize)]
struct DiagnosticRunRequest {
    tasks: Vec<DiagnosticTaskRequest>,
}

#[derive(Deserialize)]
struct DiagnosticTaskRequest {
    venue: String,
    symbol: String,
    mode: String,
    side: String,
    size_i: i64,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: f64,
}

fn default_timeout_secs() -> f64 {
    60.0
}

async fn diagnostic_run(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<DiagnosticRunRequest>,
) -> impl IntoResponse {
    let tasks: Vec<DiagnosticTask> = req
        .tasks
        .into_iter()
        .filter_map(|t| {
            let mode = match t.mode.to_lowercase().as_str() {
                "market" => TestMode::Market,
                "limit" => TestMode::Limit,
                other => {
                    warn!(mode = other, "diagnostic request: unknown mode, skipping task");
                    return None;
                }
            };
            let side = match t.side.to_lowercase().as_str() {
                "buy" => TestSide::Buy,
                "sell" => TestSide::Sell,
                other => {
                    warn!(side = other, "diagnostic request: unknown side, skipping task");
                    return None;
                }
            };
            Some(DiagnosticTask {
                venue: t.venue,
                symbol: t.symbol,
                mode,
                side,
                size_i: t.size_i,
                timeout: std::time::Duration::from_secs_f64(t.timeout_secs.max(1.0)),
            })
        })
        .collect();

    info!(task_count = tasks.len(), "diagnostic run requested via API");
    let report = run_diagnostics(&state.router, &tasks).await;

    if let Err(e) = save_report(&report, &state.config.read().diagnostic_report_path) {
        warn!(error = %e, "failed to persist diagnostic report to disk");
    }

    state.record_diagnostic_report(report.clone());
    Json(report)
}
