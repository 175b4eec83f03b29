//! `/api/calls*` handlers (`spec.md` §6.1).

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::AppResult;
use crate::state::AppState;

/// `POST /api/calls` -> `{call_id, status}`.
pub async fn create_call(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let call = state.calls.create_call(Utc::now());
    Ok(Json(json!({
        "call_id": call.id,
        "status": call.status.as_str(),
    })))
}

/// `GET /api/calls/{call_id}` -> `{call_id, status, participants:{count}}`.
pub async fn get_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> AppResult<Json<crate::call_store::CallDto>> {
    let call = state.calls.get_by_id(&call_id, Utc::now())?;
    Ok(Json(call.to_dto()))
}

/// `POST /api/calls/{call_id}/join` -> `{call_id, peer_id}`.
pub async fn join_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> AppResult<Json<Value>> {
    let (peer_id, call) = state.calls.join(&call_id, Utc::now())?;

    let envelope = crate::signaling::SessionEnvelope::state(&call.to_dto());
    if let Some(json) = envelope.to_json() {
        state.hub.broadcast(&call.id, json);
    }

    Ok(Json(json!({
        "call_id": call.id,
        "peer_id": peer_id,
    })))
}

/// `POST /api/calls/{call_id}/leave` -> `{call_id, status:"ended"}`.
pub async fn leave_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> AppResult<Json<Value>> {
    let call = state.calls.end_call(&call_id, Utc::now())?;

    // An ended call has no live participants regardless of the last-known
    // peer slots (`spec.md` §4.3.1).
    let dto = crate::call_store::CallDto {
        call_id: call.id.clone(),
        status: call.status.as_str(),
        participants: crate::call_store::ParticipantsDto { count: 0 },
    };
    let envelope = crate::signaling::SessionEnvelope::state(&dto);
    if let Some(json) = envelope.to_json() {
        state.hub.broadcast(&call.id, json);
    }
    state.hub.close_call(&call.id);

    Ok(Json(json!({
        "call_id": call.id,
        "status": call.status.as_str(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_store::CallStore;
    use crate::config::Config;
    use crate::signaling::SignalingHub;
    use crate::turn::TurnState;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_state() -> AppState {
        AppState {
            config: Arc::new(Config {
                server_host: "127.0.0.1".into(),
                server_port: 0,
                is_dev: true,
                allowed_origins: vec![],
                turn_port: 3478,
                turn_realm: "test".into(),
                turn_keys_dir: "/tmp".into(),
                call_ttl: Duration::from_secs(1800),
                sweep_period: Duration::from_secs(10800),
                static_dir: "/tmp/meetbridge-test-static-missing".into(),
            }),
            calls: CallStore::new(Duration::from_secs(1800)),
            hub: SignalingHub::new(),
            turn: TurnState {
                username: "u".into(),
                password: "p".into(),
                realm: "test".into(),
                port: 3478,
                public_ip: "127.0.0.1".into(),
            },
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips_status() {
        let state = test_state();
        let Json(created) = create_call(State(state.clone())).await.unwrap();
        let call_id = created["call_id"].as_str().unwrap().to_string();

        let Json(fetched) = get_call(State(state), Path(call_id.clone())).await.unwrap();
        assert_eq!(fetched.call_id, call_id);
        assert_eq!(fetched.status, "waiting");
    }

    #[tokio::test]
    async fn join_then_leave_ends_the_call() {
        let state = test_state();
        let Json(created) = create_call(State(state.clone())).await.unwrap();
        let call_id = created["call_id"].as_str().unwrap().to_string();

        let Json(joined) = join_call(State(state.clone()), Path(call_id.clone()))
            .await
            .unwrap();
        assert!(joined["peer_id"].is_string());

        let Json(left) = leave_call(State(state.clone()), Path(call_id.clone()))
            .await
            .unwrap();
        assert_eq!(left["status"], "ended");

        let result = get_call(State(state), Path(call_id)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn get_unknown_call_returns_not_found_error() {
        let state = test_state();
        let result = get_call(State(state), Path("missing".to_string())).await;
        assert!(result.is_err());
    }
}
