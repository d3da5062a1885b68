//! App Attest assertion verification
//!
//! Per-operation proof that the enrolled hardware key signed the
//! (passportHash, evmAddress) binding: CBOR decode, strict counter
//! advance, canonical payload hashing, ECDSA verification against the
//! stored SPKI.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ciborium::Value;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::DeviceRecord;
use crate::services::attestation::find_bytes_value;

/// Typed assertion rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssertError {
    /// Undecodable CBOR, missing fields, or truncated authenticator data
    #[error("malformed assertion: {0}")]
    Malformed(String),
    /// Counter did not strictly advance past the stored value
    #[error("assertion counter did not advance")]
    Replay,
    /// Signature did not verify under the stored public key
    #[error("assertion signature invalid")]
    BadSignature,
}

/// The two-field payload an assertion binds to the device key.
///
/// Client and server must produce byte-identical serialisations, so the
/// canonical form is fixed: no whitespace, `passportHash` before
/// `evmAddress`, values exactly as the client sent them.
#[derive(Debug, Clone, Copy)]
pub struct BoundPayload<'a> {
    pub passport_hash: &'a str,
    pub evm_address: &'a str,
}

impl BoundPayload<'_> {
    /// The canonical byte serialisation both sides hash.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            "{{\"passportHash\":\"{}\",\"evmAddress\":\"{}\"}}",
            self.passport_hash, self.evm_address
        )
        .into_bytes()
    }
}

/// Decoded assertion envelope.
#[derive(Debug)]
struct AssertionObject {
    authenticator_data: Vec<u8>,
    signature: Vec<u8>,
}

/// Verifies an assertion against the enrolled device record.
///
/// Returns the asserted counter; the caller commits it through the store,
/// whose critical section re-checks monotonicity. The early check here
/// fast-fails obvious replays before any signature work.
pub fn verify_assertion(
    assertion: &[u8],
    record: &DeviceRecord,
    payload: &BoundPayload<'_>,
) -> Result<u32, AssertError> {
    let object = decode_assertion(assertion)?;

    let counter = parse_counter(&object.authenticator_data)?;
    if counter <= record.counter {
        tracing::warn!(
            received_counter = counter,
            stored_counter = record.counter,
            "assertion counter did not advance"
        );
        return Err(AssertError::Replay);
    }

    let client_data_hash = Sha256::digest(payload.canonical_bytes());
    let mut hasher = Sha256::new();
    hasher.update(&object.authenticator_data);
    hasher.update(client_data_hash);
    let message: [u8; 32] = hasher.finalize().into();

    let spki_der = STANDARD
        .decode(&record.public_key_der)
        .map_err(|_| AssertError::BadSignature)?;
    let verifying_key =
        VerifyingKey::from_public_key_der(&spki_der).map_err(|_| AssertError::BadSignature)?;
    let signature =
        Signature::from_der(&object.signature).map_err(|_| AssertError::BadSignature)?;

    verifying_key
        .verify_prehash(&message, &signature)
        .map_err(|_| AssertError::BadSignature)?;

    Ok(counter)
}

/// Decodes the CBOR assertion envelope.
fn decode_assertion(bytes: &[u8]) -> Result<AssertionObject, AssertError> {
    let value: Value = ciborium::from_reader(bytes)
        .map_err(|_| AssertError::Malformed("invalid CBOR assertion".to_string()))?;
    let map = value
        .as_map()
        .ok_or_else(|| AssertError::Malformed("assertion must be a CBOR map".to_string()))?;

    let authenticator_data = find_bytes_value(map, "authenticatorData")
        .ok_or_else(|| AssertError::Malformed("missing authenticatorData".to_string()))?
        .to_vec();
    let signature = find_bytes_value(map, "signature")
        .ok_or_else(|| AssertError::Malformed("missing signature".to_string()))?
        .to_vec();

    Ok(AssertionObject {
        authenticator_data,
        signature,
    })
}

/// Big-endian counter at authenticator-data bytes 33..37.
fn parse_counter(auth_data: &[u8]) -> Result<u32, AssertError> {
    let window: [u8; 4] = auth_data
        .get(33..37)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            AssertError::Malformed(format!(
                "authenticator data too short: {} bytes, expected at least 37",
                auth_data.len()
            ))
        })?;
    Ok(u32::from_be_bytes(window))
}
