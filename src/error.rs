//! API error handling module
//!
//! Defines error types and their HTTP response conversions. Every failure
//! surfaces one of the stable code strings below; clients branch on the
//! exact string, never on free text.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::services::assertion::AssertError;
use crate::services::attestation::AttestError;
use crate::services::primus::BrokerError;
use crate::store::StoreError;

/// Stable error codes carried in the `error` field of failure responses.
pub mod codes {
    pub const BAD_REQUEST: &str = "ErrBadRequest";
    pub const BAD_FORMAT: &str = "ErrBadFormat";
    pub const CHAIN_TOO_SHORT: &str = "ErrChainTooShort";
    pub const CERT_CHAIN: &str = "ErrCertChain";
    pub const AT_FLAG_UNSET: &str = "ErrAtFlagUnset";
    pub const BAD_POINT_FORMAT: &str = "ErrBadPointFormat";
    pub const CREDENTIAL_ID_MISMATCH: &str = "ErrCredentialIdMismatch";
    pub const NONCE_MISSING: &str = "ErrNonceMissing";
    pub const NONCE_MISMATCH: &str = "ErrNonceMismatch";
    pub const REPLAY: &str = "ErrReplay";
    pub const BAD_SIGNATURE: &str = "ErrBadSignature";
    pub const DEVICE_UNKNOWN: &str = "ErrDeviceUnknown";
    pub const STORE_UNAVAILABLE: &str = "ErrStoreUnavailable";
    pub const BROKER_UNAVAILABLE: &str = "ErrBrokerUnavailable";
    pub const INTERNAL: &str = "ErrInternal";
}

/// API error type with associated HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("attestation rejected")]
    Attestation(AttestError),

    #[error("assertion counter did not advance")]
    Replay,

    #[error("assertion signature invalid")]
    BadSignature,

    #[error("device not enrolled")]
    DeviceUnknown,

    #[error("device store unavailable")]
    StoreUnavailable(#[source] StoreError),

    #[error("credential broker unavailable")]
    BrokerUnavailable(#[source] BrokerError),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Returns the stable error code for this error type.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => codes::BAD_REQUEST,
            ApiError::Attestation(err) => err.code(),
            ApiError::Replay => codes::REPLAY,
            ApiError::BadSignature => codes::BAD_SIGNATURE,
            ApiError::DeviceUnknown => codes::DEVICE_UNKNOWN,
            ApiError::StoreUnavailable(_) => codes::STORE_UNAVAILABLE,
            ApiError::BrokerUnavailable(_) => codes::BROKER_UNAVAILABLE,
            ApiError::Internal(_) => codes::INTERNAL,
        }
    }

    /// Returns the HTTP status code for this error type.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_)
            | ApiError::Attestation(_)
            | ApiError::Replay
            | ApiError::BadSignature => StatusCode::BAD_REQUEST,
            ApiError::DeviceUnknown => StatusCode::NOT_FOUND,
            ApiError::StoreUnavailable(_)
            | ApiError::BrokerUnavailable(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failure response body: `{"success": false, "error": "<code>"}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = ?self, "request failed");
        } else {
            tracing::debug!(code = self.code(), "request rejected");
        }
        let body = ErrorBody {
            success: false,
            error: self.code(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<AttestError> for ApiError {
    fn from(err: AttestError) -> Self {
        ApiError::Attestation(err)
    }
}

impl From<AssertError> for ApiError {
    fn from(err: AssertError) -> Self {
        match err {
            AssertError::Malformed(msg) => ApiError::BadRequest(msg),
            AssertError::Replay => ApiError::Replay,
            AssertError::BadSignature => ApiError::BadSignature,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::DeviceUnknown,
            // The store re-checks counter monotonicity inside its critical
            // section; losing that race is a replay, not an outage.
            StoreError::Stale => ApiError::Replay,
            other => ApiError::StoreUnavailable(other),
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::BadRequest(msg) => ApiError::BadRequest(msg),
            other => ApiError::BrokerUnavailable(other),
        }
    }
}
