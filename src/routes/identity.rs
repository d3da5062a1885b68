//! Identity lookup route
//!
//! Resolves an EVM address to the passport hash bound to it, if any.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::models::device::is_evm_address;
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct IdentityQuery {
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IdentityResponse {
    pub success: bool,
    /// Null when no binding is on file; this endpoint never 404s.
    #[serde(rename = "passportHash")]
    pub passport_hash: Option<String>,
}

/// GET /identity?address=0x… - passport-hash lookup
///
/// Case-insensitive on the address. A missing binding is a successful
/// null, not an error.
pub async fn lookup_identity(
    State(state): State<AppState>,
    Query(query): Query<IdentityQuery>,
) -> Result<Json<IdentityResponse>, ApiError> {
    let address = query
        .address
        .ok_or_else(|| ApiError::BadRequest("missing required query param: address".to_string()))?;
    if !is_evm_address(&address) {
        return Err(ApiError::BadRequest(
            "address must be 0x + 40 hex chars".to_string(),
        ));
    }

    let record = state.store.find_by_address(&address).await?;
    Ok(Json(IdentityResponse {
        success: true,
        passport_hash: record.and_then(|r| r.passport_hash),
    }))
}
