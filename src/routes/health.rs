use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::error::AppResult;
use crate::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: usize,
    active_timers: usize,
    version: &'static str,
}

/// Build the health check router.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check)).route("/ready", get(readiness_check))
}

/// Liveness probe: always returns 200, reporting in-process state. There
/// are no backing services to go unreachable — everything lives in this
/// process (§6's Non-goals rule out an external datastore by default).
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        sessions: state.manager.store().len(),
        active_timers: state.manager.timers().active_count(),
        version: VERSION,
    })
}

/// Readiness probe: ready as soon as the process is up, since there is no
/// external dependency to warm up.
async fn readiness_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    Ok(Json(HealthResponse {
        status: "ready",
        sessions: state.manager.store().len(),
        active_timers: state.manager.timers().active_count(),
        version: VERSION,
    }))
}
