//! Credential broker routes
//!
//! Thin JSON façades over the process-wide Primus broker: explicit init,
//! request signing, artifact verification.

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct SignRequest {
    #[serde(default, rename = "templateId")]
    pub template_id: Option<String>,
    #[serde(default, rename = "userAddress")]
    pub user_address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SignResponse {
    pub success: bool,
    #[serde(rename = "signedRequestStr")]
    pub signed_request_str: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    /// The attestation artifact, as a JSON object or pre-serialised string
    #[serde(default)]
    pub attestation: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub success: bool,
    pub verified: bool,
}

#[derive(Debug, Serialize)]
pub struct InitResponse {
    pub success: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/init", post(init_handler))
        .route("/sign", post(sign_handler))
        .route("/verify", post(verify_handler))
}

/// POST /primus/init - eager broker initialisation (no-op when already up)
async fn init_handler(State(state): State<AppState>) -> Result<Json<InitResponse>, ApiError> {
    state.broker.init().await?;
    Ok(Json(InitResponse { success: true }))
}

/// POST /primus/sign - sign a request envelope for a template + user
async fn sign_handler(
    State(state): State<AppState>,
    Json(req): Json<SignRequest>,
) -> Result<Json<SignResponse>, ApiError> {
    let template_id = req
        .template_id
        .ok_or_else(|| ApiError::BadRequest("missing required field: templateId".to_string()))?;
    let user_address = req
        .user_address
        .ok_or_else(|| ApiError::BadRequest("missing required field: userAddress".to_string()))?;

    let signed_request_str = state.broker.sign_request(&template_id, &user_address).await?;
    Ok(Json(SignResponse {
        success: true,
        signed_request_str,
    }))
}

/// POST /primus/verify - verify a client-returned attestation artifact
async fn verify_handler(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let attestation = req
        .attestation
        .ok_or_else(|| ApiError::BadRequest("missing required field: attestation".to_string()))?;

    // Clients send the artifact either verbatim or as a JSON string.
    let artifact_json = match attestation {
        serde_json::Value::String(raw) => raw,
        other => other.to_string(),
    };

    let verified = state.broker.verify_artifact(&artifact_json).await?;
    Ok(Json(VerifyResponse {
        success: true,
        verified,
    }))
}
