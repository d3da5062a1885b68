//! Device record model
//!
//! One row per enrolled hardware key, keyed by the content-addressed
//! credential id.

use serde::{Deserialize, Serialize};

/// An enrolled device: the authoritative record for one App Attest key.
///
/// `credential_id` equals SHA-256 of the key's raw uncompressed EC point
/// (base64 text in transit and at rest); `public_key_der` is the DER
/// SubjectPublicKeyInfo captured at enrollment and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceRecord {
    /// SHA-256 of the uncompressed EC point, base64-encoded. Primary key.
    #[serde(rename = "credentialId")]
    #[sqlx(rename = "key_id")]
    pub credential_id: String,

    /// Base64-encoded DER SubjectPublicKeyInfo (NIST P-256).
    #[serde(rename = "publicKeyDer")]
    pub public_key_der: String,

    /// Assertion counter; strictly increasing, 0 at enrollment.
    #[sqlx(try_from = "i64")]
    pub counter: u32,

    /// Bound EVM address, lowercased `0x` + 40 hex chars.
    #[serde(rename = "evmAddress")]
    pub evm_address: Option<String>,

    /// Client-computed SHA-256 over the passport data groups, hex.
    #[serde(rename = "passportHash")]
    pub passport_hash: Option<String>,
}

impl DeviceRecord {
    /// A freshly enrolled device: counter zero, no identity bound yet.
    pub fn enrolled(credential_id: String, public_key_der: String) -> Self {
        Self {
            credential_id,
            public_key_der,
            counter: 0,
            evm_address: None,
            passport_hash: None,
        }
    }
}

/// Fields replaced atomically by a successful assertion. The public key
/// is deliberately absent: it is immutable after enrollment.
#[derive(Debug, Clone)]
pub struct DevicePatch {
    pub counter: u32,
    pub evm_address: String,
    pub passport_hash: String,
}

/// `0x` + 40 hex chars, any case.
pub fn is_evm_address(value: &str) -> bool {
    value.len() == 42
        && value.starts_with("0x")
        && value[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Non-empty, even-length lowercase-insensitive hex.
pub fn is_hex_digest(value: &str) -> bool {
    !value.is_empty()
        && value.len() % 2 == 0
        && value.bytes().all(|b| b.is_ascii_hexdigit())
}
