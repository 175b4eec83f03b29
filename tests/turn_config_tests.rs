mod common;

use axum::http::StatusCode;
use common::{create_test_app, get_json};

#[tokio::test]
async fn turn_config_lists_a_stun_and_a_turn_server() {
    let app = create_test_app();
    let (status, body) = get_json(app, "/api/turn-config").await;

    assert_eq!(status, StatusCode::OK);
    let servers = body["iceServers"].as_array().unwrap();
    assert_eq!(servers.len(), 2);

    let stun_url = servers[0]["urls"].as_str().unwrap();
    assert!(stun_url.starts_with("stun:"));

    let turn_url = servers[1]["urls"].as_str().unwrap();
    assert!(turn_url.starts_with("turn:"));
    assert_eq!(servers[1]["username"], "meetbridge");
    assert!(servers[1]["credential"].is_string());
}

#[tokio::test]
async fn client_config_reports_debug_mode() {
    let app = create_test_app();
    let (status, body) = get_json(app, "/api/client-config").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["debug"], true);
}

#[tokio::test]
async fn health_check_reports_ok() {
    let app = create_test_app();
    let (status, body) = get_json(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
