//! `GET /api/client-config` (`spec.md` §6.1).

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn client_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "debug": state.config.is_dev }))
}
