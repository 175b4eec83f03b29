//! `GET /health` — liveness probe for the ambient operational surface.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let stats = state.calls.stats();
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "calls": stats.values().sum::<usize>() })),
    )
}
