//! IdBridge API server
//!
//! Entry point: configuration, tracing, device store selection, router
//! assembly with request-id/trace/CORS middleware, graceful shutdown.

use axum::http::{header, HeaderName, Method};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use idbridge_api::config::Config;
use idbridge_api::routes::{self, AppState};
use idbridge_api::services::{AttestationVerifier, PrimusBroker};
use idbridge_api::store::DeviceStore;

/// Request ID header name
const X_REQUEST_ID: &str = "x-request-id";

#[tokio::main]
async fn main() {
    let config = Config::load();

    init_tracing(&config.log_format);
    tracing::info!("Starting IdBridge API server");

    let store = DeviceStore::from_config(&config)
        .await
        .expect("Failed to initialise device store");

    let verifier = AttestationVerifier::pinned(config.nonce_accept_raw_challenge)
        .expect("Failed to load pinned Apple App Attestation root");

    let broker = PrimusBroker::from_config(&config);

    let app_state = AppState {
        store: Arc::new(store),
        verifier: Arc::new(verifier),
        broker: Arc::new(broker),
    };

    let cors = build_cors_layer(&config.cors_origins);
    let x_request_id = HeaderName::from_static(X_REQUEST_ID);

    let app = routes::api_router(app_state).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
            .layer(PropagateRequestIdLayer::new(x_request_id))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(|request: &axum::http::Request<_>| {
                        tracing::info_span!(
                            "http_request",
                            method = %request.method(),
                            uri = %request.uri(),
                        )
                    })
                    .on_response(
                        |response: &axum::http::Response<_>,
                         latency: Duration,
                         _span: &tracing::Span| {
                            tracing::info!(
                                status = %response.status().as_u16(),
                                latency_ms = %latency.as_millis(),
                                "request completed"
                            );
                        },
                    ),
            )
            .layer(cors),
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("Invalid host:port combination");
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Server shutdown complete");
}

/// Initialize tracing subscriber based on format preference.
fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,tower_http=debug"));

    match log_format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_span_events(FmtSpan::CLOSE))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_span_events(FmtSpan::CLOSE))
                .init();
        }
    }
}

/// Build CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(X_REQUEST_ID),
        ]);

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        let allowed: Vec<axum::http::HeaderValue> =
            origins.iter().filter_map(|o| o.parse().ok()).collect();
        layer.allow_origin(allowed)
    }
}

/// Shutdown signal handler for graceful shutdown.
///
/// Listens for SIGINT (Ctrl+C) and SIGTERM signals.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        },
    }

    tracing::info!("Shutdown signal received, draining in-flight requests");
}
