//! Attestation routes
//!
//! Device enrollment (`verify-attestation`) and identity binding
//! (`verify-assertion`). Handlers shape-check the JSON body, run the
//! verification pipeline, and persist through the device store; every
//! failure maps to a stable error code with no partial write.

use axum::{extract::State, routing::post, Extension, Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::device::{is_evm_address, is_hex_digest};
use crate::models::{DevicePatch, DeviceRecord};
use crate::routes::AppState;
use crate::services::{verify_assertion, BoundPayload};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct VerifyAttestationRequest {
    /// Base64-encoded CBOR attestation object
    #[serde(default)]
    pub attestation: Option<String>,
    /// Challenge the device attested over, raw UTF-8
    #[serde(default)]
    pub challenge: Option<String>,
    /// Base64-encoded key id (SHA-256 of the attested public key)
    #[serde(default, rename = "keyId")]
    pub key_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyAttestationResponse {
    pub success: bool,
    /// Base64-encoded DER SubjectPublicKeyInfo of the enrolled key
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyAssertionRequest {
    /// Base64-encoded CBOR assertion
    #[serde(default)]
    pub assertion: Option<String>,
    #[serde(default, rename = "keyId")]
    pub key_id: Option<String>,
    /// Hex SHA-256 over the passport data groups
    #[serde(default, rename = "passportHash")]
    pub passport_hash: Option<String>,
    /// EVM address being bound, 0x + 40 hex
    #[serde(default, rename = "evmAddress")]
    pub evm_address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyAssertionResponse {
    pub success: bool,
    /// The stored (lowercased) address
    #[serde(rename = "evmAddress")]
    pub evm_address: String,
    #[serde(rename = "passportHash")]
    pub passport_hash: String,
}

// ============================================================================
// Router Setup
// ============================================================================

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/verify-attestation", post(verify_attestation_handler))
        .route("/verify-assertion", post(verify_assertion_handler))
}

// ============================================================================
// Validation Helpers
// ============================================================================

fn require<T>(field: Option<T>, name: &str) -> Result<T, ApiError> {
    field.ok_or_else(|| ApiError::BadRequest(format!("missing required field: {name}")))
}

fn decode_base64(input: &str, name: &str) -> Result<Vec<u8>, ApiError> {
    STANDARD
        .decode(input)
        .map_err(|_| ApiError::BadRequest(format!("invalid base64 encoding for {name}")))
}

// ============================================================================
// Route Handlers
// ============================================================================

/// POST /attest/verify-attestation - enroll a device key
///
/// Runs the attestation pipeline against the pinned root and persists a
/// fresh device record with counter 0 and no identity bound. Re-submitting
/// the same attestation is idempotent; attesting a different key under the
/// same id overwrites the record.
async fn verify_attestation_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<Uuid>,
    Json(req): Json<VerifyAttestationRequest>,
) -> Result<Json<VerifyAttestationResponse>, ApiError> {
    let attestation_b64 = require(req.attestation, "attestation")?;
    let challenge = require(req.challenge, "challenge")?;
    let key_id_b64 = require(req.key_id, "keyId")?;

    let attestation = decode_base64(&attestation_b64, "attestation")?;
    let expected_credential_id = decode_base64(&key_id_b64, "keyId")?;

    let verified = state.verifier.verify(
        &attestation,
        challenge.as_bytes(),
        &expected_credential_id,
        chrono::Utc::now().timestamp(),
    )?;

    let credential_id = STANDARD.encode(&verified.credential_id);
    let public_key = STANDARD.encode(&verified.public_key_der);
    state
        .store
        .put(DeviceRecord::enrolled(
            credential_id.clone(),
            public_key.clone(),
        ))
        .await?;

    tracing::info!(
        request_id = %request_id,
        credential_id = %credential_id,
        "device enrolled"
    );

    Ok(Json(VerifyAttestationResponse {
        success: true,
        public_key,
    }))
}

/// POST /attest/verify-assertion - bind (passportHash, evmAddress)
///
/// Looks up the enrolled key, verifies the assertion signature over the
/// canonical payload, and commits counter + binding atomically. The store
/// re-checks counter monotonicity inside its critical section, so two
/// racing assertions with the same counter produce exactly one winner.
async fn verify_assertion_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<Uuid>,
    Json(req): Json<VerifyAssertionRequest>,
) -> Result<Json<VerifyAssertionResponse>, ApiError> {
    let assertion_b64 = require(req.assertion, "assertion")?;
    let key_id_b64 = require(req.key_id, "keyId")?;
    let passport_hash = require(req.passport_hash, "passportHash")?;
    let evm_address = require(req.evm_address, "evmAddress")?;

    if !is_evm_address(&evm_address) {
        return Err(ApiError::BadRequest(
            "evmAddress must be 0x + 40 hex chars".to_string(),
        ));
    }
    if !is_hex_digest(&passport_hash) {
        return Err(ApiError::BadRequest(
            "passportHash must be a hex digest".to_string(),
        ));
    }

    let assertion = decode_base64(&assertion_b64, "assertion")?;
    // Re-encoding normalises padding so lookups hit the stored key.
    let credential_id = STANDARD.encode(decode_base64(&key_id_b64, "keyId")?);

    let record = state
        .store
        .get(&credential_id)
        .await?
        .ok_or(ApiError::DeviceUnknown)?;

    let payload = BoundPayload {
        passport_hash: &passport_hash,
        evm_address: &evm_address,
    };
    let counter = verify_assertion(&assertion, &record, &payload)?;

    let stored_address = evm_address.to_lowercase();
    state
        .store
        .update(
            &credential_id,
            DevicePatch {
                counter,
                evm_address: stored_address.clone(),
                passport_hash: passport_hash.clone(),
            },
        )
        .await?;

    tracing::info!(
        request_id = %request_id,
        credential_id = %credential_id,
        counter,
        evm_address = %stored_address,
        "identity bound"
    );

    Ok(Json(VerifyAssertionResponse {
        success: true,
        evm_address: stored_address,
        passport_hash,
    }))
}
