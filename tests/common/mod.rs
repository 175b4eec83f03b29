#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    routing::{get, post},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use meetbridge_server::call_store::CallStore;
use meetbridge_server::config::Config;
use meetbridge_server::handlers;
use meetbridge_server::signaling::SignalingHub;
use meetbridge_server::state::AppState;
use meetbridge_server::turn::TurnState;
use meetbridge_server::websocket;

/// Build the HTTP router wired to fresh, in-memory state. No database, no
/// auth — this crate has neither (`spec.md` Non-goals).
pub fn create_test_app() -> Router {
    let config = Config {
        server_host: "127.0.0.1".into(),
        server_port: 0,
        is_dev: true,
        allowed_origins: vec![],
        turn_port: 3478,
        turn_realm: "test".into(),
        turn_keys_dir: std::env::temp_dir().join("meetbridge-test-keys"),
        call_ttl: Duration::from_secs(1800),
        sweep_period: Duration::from_secs(10_800),
        static_dir: std::env::temp_dir().join("meetbridge-test-static-missing"),
    };

    let state = AppState {
        config: Arc::new(config.clone()),
        calls: CallStore::new(config.call_ttl),
        hub: SignalingHub::new(),
        turn: TurnState {
            username: "meetbridge".into(),
            password: "test-password".into(),
            realm: "test".into(),
            port: config.turn_port,
            public_ip: "127.0.0.1".into(),
        },
    };

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/api/calls", post(handlers::calls::create_call))
        .route("/api/calls/:call_id", get(handlers::calls::get_call))
        .route(
            "/api/calls/:call_id/join",
            post(handlers::calls::join_call),
        )
        .route(
            "/api/calls/:call_id/leave",
            post(handlers::calls::leave_call),
        )
        .route(
            "/api/turn-config",
            get(handlers::turn_config::turn_config),
        )
        .route(
            "/api/client-config",
            get(handlers::client_config::client_config),
        )
        .route("/api/ws", get(websocket::ws_upgrade_handler))
        .with_state(state)
}

pub async fn post_no_body(app: Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::empty())
        .unwrap();
    send(app, req).await
}

pub async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, req).await
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

/// `POST /api/calls` and return the new call's id.
pub async fn create_call(app: Router) -> String {
    let (status, body) = post_no_body(app, "/api/calls").await;
    assert_eq!(status, StatusCode::OK, "setup create_call failed: {body}");
    body["call_id"].as_str().unwrap().to_string()
}
