//! `GET /api/turn-config` (`spec.md` §4.4, §6.1).

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// The request host, not static config, names the STUN/TURN URLs so a
/// single binary works behind any hostname (`spec.md` §4.4).
pub async fn turn_config(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let host = request_host(&headers, &state);

    Json(json!({
        "iceServers": [
            { "urls": format!("stun:{host}:{}", state.turn.port) },
            {
                "urls": format!("turn:{host}:{}", state.turn.port),
                "username": &*state.turn.username,
                "credential": &*state.turn.password,
            },
        ],
    }))
}

fn request_host(headers: &HeaderMap, state: &AppState) -> String {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|host| host.split(':').next().unwrap_or(host).to_string())
        .unwrap_or_else(|| state.turn.public_ip.to_string())
}
