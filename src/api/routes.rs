//! API route definitions.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use crate::export;
use crate::scheduler::interval_from_secs;
use crate::session::SessionError;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/speed-test/status", get(status))
        .route("/speed-test/latest", get(latest))
        .route("/speed-test/history", get(history).delete(clear_history))
        .route("/speed-test/history.csv", get(history_csv))
        .route("/speed-test/run", post(run))
        .route("/speed-test/cancel", post(cancel))
        .route("/schedule", get(schedule_state))
        .route("/schedule/start", post(schedule_start))
        .route("/schedule/stop", post(schedule_stop))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn error(status: StatusCode, message: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({ "error": { "message": message.to_string() }, "meta": meta() })),
    )
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": { "status": "ok" },
        "meta": meta()
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let run = state.session.status();
    Json(json!({
        "data": {
            "running": state.session.is_running(),
            "message": run.to_string(),
            "detail": run,
        },
        "meta": meta()
    }))
}

async fn latest(State(state): State<AppState>) -> Json<Value> {
    match state.session.latest() {
        Some(result) => Json(json!({ "data": result, "meta": meta() })),
        None => Json(json!({ "data": null, "meta": { "message": "no speed test results yet" } })),
    }
}

async fn history(State(state): State<AppState>) -> Json<Value> {
    let entries = state.session.history();
    Json(json!({
        "data": entries,
        "meta": { "total": entries.len(), "capacity": state.session.history_capacity() }
    }))
}

async fn history_csv(State(state): State<AppState>) -> impl IntoResponse {
    let body = export::to_csv_string(&state.session.history());
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"speedwatch.csv\""),
        ],
        body,
    )
}

async fn clear_history(State(state): State<AppState>) -> StatusCode {
    state.session.clear_history();
    StatusCode::NO_CONTENT
}

async fn run(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.session.start_measurement() {
        Ok(_handle) => (
            StatusCode::ACCEPTED,
            Json(json!({ "data": { "started": true }, "meta": meta() })),
        ),
        Err(e @ SessionError::AlreadyRunning) => error(StatusCode::CONFLICT, e),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn cancel(State(state): State<AppState>) -> Json<Value> {
    let cancelled = state.session.cancel();
    Json(json!({ "data": { "cancelled": cancelled }, "meta": meta() }))
}

async fn schedule_state(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "data": state.session.schedule_state(), "meta": meta() }))
}

#[derive(Debug, Default, Deserialize)]
struct StartSchedule {
    interval_secs: Option<f64>,
}

/// The body is optional; without one the configured interval is used.
async fn schedule_start(
    State(state): State<AppState>,
    body: Option<Json<StartSchedule>>,
) -> (StatusCode, Json<Value>) {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let interval = match body.interval_secs {
        Some(secs) => match interval_from_secs(secs) {
            Ok(d) => d,
            Err(e) => return error(StatusCode::BAD_REQUEST, e),
        },
        None => state.default_interval,
    };

    match state.session.start_schedule(interval) {
        Ok(started) => (
            StatusCode::OK,
            Json(json!({
                "data": { "started": started, "schedule": state.session.schedule_state() },
                "meta": meta()
            })),
        ),
        Err(e) => error(StatusCode::BAD_REQUEST, e),
    }
}

async fn schedule_stop(State(state): State<AppState>) -> Json<Value> {
    state.session.stop_schedule();
    Json(json!({ "data": state.session.schedule_state(), "meta": meta() }))
}
