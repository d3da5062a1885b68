//! Route modules and router assembly

use axum::{routing::get, Router};
use std::sync::Arc;
use uuid::Uuid;

use crate::services::{AttestationVerifier, PrimusBroker};
use crate::store::DeviceStore;

pub mod attest;
pub mod health;
pub mod identity;
pub mod primus;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DeviceStore>,
    pub verifier: Arc<AttestationVerifier>,
    pub broker: Arc<PrimusBroker>,
}

/// Creates the API router.
///
/// Routes:
/// - `POST /attest/verify-attestation` - device enrollment
/// - `POST /attest/verify-assertion` - identity binding
/// - `POST /primus/{init,sign,verify}` - credential broker
/// - `GET /identity?address=` - passport-hash lookup
/// - `GET /health` - liveness
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .nest("/attest", attest::router())
        .nest("/primus", primus::router())
        .route("/identity", get(identity::lookup_identity))
        .with_state(state)
        .layer(axum::middleware::from_fn(attach_request_id))
}

/// Middleware: extract the request ID header (or mint one) and expose it
/// as a request extension for handler logging.
async fn attach_request_id(
    mut request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);
    request.extensions_mut().insert(request_id);
    next.run(request).await
}
