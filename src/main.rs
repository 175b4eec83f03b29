use axum::{
    extract::ConnectInfo,
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use axum_prometheus::PrometheusMetricLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use meetbridge_server::call_store::CallStore;
use meetbridge_server::config::Config;
use meetbridge_server::handlers;
use meetbridge_server::signaling::SignalingHub;
use meetbridge_server::state::AppState;
use meetbridge_server::turn::{self, TurnState};
use meetbridge_server::websocket;

/// Restricts `/metrics` to loopback connections (`spec.md` — ambient
/// observability surface, carried regardless of the spec's feature
/// Non-goals).
async fn require_loopback(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "meetbridge_server=info,tower_http=info"
            .parse()
            .unwrap()
    });

    if std::env::var("APP_ENV").as_deref() == Ok("production") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("meetbridge server starting");

    let config = Config::from_env().expect("failed to load configuration");
    info!("configuration loaded");

    let turn_state = TurnState::bootstrap(&config)
        .await
        .expect("failed to load or generate TURN credentials");
    info!(port = config.turn_port, "TURN credentials ready");

    let cors = if config.is_dev {
        info!("CORS: permissive (dev mode)");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        if origins.is_empty() {
            tracing::warn!(
                "CORS: no ALLOWED_ORIGINS configured — all cross-origin requests will be denied"
            );
        } else {
            info!(origins = ?config.allowed_origins, "CORS: production mode");
        }
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    };

    let addr = config.server_addr();
    let config = Arc::new(config);

    let app_state = AppState {
        config: config.clone(),
        calls: CallStore::new(config.call_ttl),
        hub: SignalingHub::new(),
        turn: turn_state.clone(),
    };

    tokio::spawn(meetbridge_server::sweeper::run(
        app_state.calls.clone(),
        config.sweep_period,
    ));

    tokio::spawn(async move {
        if let Err(err) = turn::relay::run(turn_state).await {
            tracing::error!(error = %err, "TURN relay exited");
        }
    });

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    // Global limit: 10 req/s per IP, burst 20.
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .finish()
            .expect("invalid global governor configuration"),
    );

    // Call-mutating endpoints get a stricter per-IP limit to bound abuse of
    // call creation/join.
    let calls_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(3)
            .burst_size(10)
            .finish()
            .expect("invalid calls governor configuration"),
    );

    let calls_router = Router::new()
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
        .route_layer(GovernorLayer {
            config: calls_governor_conf,
        });

    let static_dir = config.static_dir.clone();
    let static_service = if static_dir.exists() {
        info!(dir = %static_dir.display(), "serving static frontend bundle");
        Some(
            ServeDir::new(&static_dir)
                .append_index_html_on_directories(true)
                .fallback(ServeFile::new(static_dir.join("index.html"))),
        )
    } else {
        tracing::warn!(dir = %static_dir.display(), "static frontend dir not found, skipping fallback");
        None
    };

    let app = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(
            "/metrics",
            get(move || async move { metric_handle.render() })
                .route_layer(middleware::from_fn(require_loopback)),
        )
        .merge(calls_router)
        .route(
            "/api/turn-config",
            get(handlers::turn_config::turn_config),
        )
        .route(
            "/api/client-config",
            get(handlers::client_config::client_config),
        )
        .route("/api/ws", get(websocket::ws_upgrade_handler))
        .layer(GovernorLayer {
            config: governor_conf,
        })
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(prometheus_layer)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let app = match static_service {
        Some(service) => app.fallback_service(service),
        None => app,
    };

    info!(%addr, "server listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server failed to start");
}
