//! Third-party credential broker
//!
//! Server-side façade over the Primus zkTLS flow: holds the app secret,
//! signs attestation request envelopes for a template + user, and checks
//! returned attestation artifacts against the expected attestor address.
//! The artifact's internal structure stays opaque; trust reduces to
//! signature recovery, matching the SDK-as-trust-anchor stance.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::config::Config;
use crate::models::device::is_evm_address;

/// Algorithm mode stamped on every signed request.
const ATT_MODE_PROXY_TLS: &str = "proxytls";

/// Broker failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// PRIMUS_APP_SECRET is not configured
    #[error("broker app secret is not configured")]
    MissingSecret,
    /// The configured secret is not a valid secp256k1 scalar
    #[error("broker app secret is not a valid signing key")]
    InvalidSecret,
    /// The operation exceeded the broker deadline
    #[error("broker operation timed out")]
    Timeout,
    /// Caller-supplied input failed shape checks
    #[error("invalid broker request: {0}")]
    BadRequest(String),
    /// Signing failed
    #[error("request signing failed")]
    Signing,
}

/// Attestation request envelope signed for the client.
#[derive(Debug, Serialize, Deserialize)]
pub struct AttRequest {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "attTemplateID")]
    pub att_template_id: String,
    #[serde(rename = "userAddress")]
    pub user_address: String,
    pub timestamp: i64,
    #[serde(rename = "attMode")]
    pub att_mode: AttMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttMode {
    #[serde(rename = "algorithmType")]
    pub algorithm_type: String,
    #[serde(rename = "resultType")]
    pub result_type: String,
}

/// Client-returned attestation artifact, reduced to the fields the
/// verifier needs. Unknown fields pass through untouched.
#[derive(Debug, Deserialize)]
struct Artifact {
    data: String,
    signatures: Vec<String>,
}

/// Initialised signing state, built once per process.
struct BrokerInner {
    signing_key: SigningKey,
    attestor_address: String,
}

/// Process-wide credential broker.
///
/// Construction is cheap; the signing key is derived lazily on first use
/// behind a once-guard, so later accesses are lock-free reads. Every
/// operation runs under a finite deadline; there are no retries.
pub struct PrimusBroker {
    app_id: String,
    app_secret: Option<String>,
    configured_attestor: Option<String>,
    deadline: Duration,
    inner: OnceCell<BrokerInner>,
}

impl PrimusBroker {
    pub fn from_config(config: &Config) -> Self {
        Self {
            app_id: config.primus_app_id.clone(),
            app_secret: config.primus_app_secret.clone(),
            configured_attestor: config.primus_attestor_address.clone(),
            deadline: Duration::from_secs(config.primus_timeout_secs),
            inner: OnceCell::new(),
        }
    }

    /// Explicit initialisation; a no-op after the first success.
    pub async fn init(&self) -> Result<(), BrokerError> {
        self.inner().await.map(|_| ())
    }

    /// Builds and signs a request envelope for `template_id` + `user_address`.
    ///
    /// The app secret signs the envelope but never leaves the process.
    pub async fn sign_request(
        &self,
        template_id: &str,
        user_address: &str,
    ) -> Result<String, BrokerError> {
        if template_id.trim().is_empty() {
            return Err(BrokerError::BadRequest("templateId is required".to_string()));
        }
        if !is_evm_address(user_address) {
            return Err(BrokerError::BadRequest(
                "userAddress must be 0x + 40 hex chars".to_string(),
            ));
        }

        let inner = self.inner().await?;
        let request = AttRequest {
            app_id: self.app_id.clone(),
            att_template_id: template_id.to_string(),
            user_address: user_address.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            att_mode: AttMode {
                algorithm_type: ATT_MODE_PROXY_TLS.to_string(),
                result_type: "plain".to_string(),
            },
        };

        let request_json =
            serde_json::to_string(&request).map_err(|_| BrokerError::Signing)?;
        let digest = eip191_digest(request_json.as_bytes());
        let (signature, recovery_id) = inner
            .signing_key
            .sign_prehash_recoverable(&digest)
            .map_err(|_| BrokerError::Signing)?;

        let signed = serde_json::json!({
            "attRequest": request,
            "appSignature": encode_signature(&signature, recovery_id),
        });
        serde_json::to_string(&signed).map_err(|_| BrokerError::Signing)
    }

    /// Checks a client-returned artifact: recovers the signer of
    /// `signatures[0]` over the artifact data and compares it with the
    /// expected attestor address. Malformed artifacts verify as false.
    pub async fn verify_artifact(&self, artifact_json: &str) -> Result<bool, BrokerError> {
        let inner = self.inner().await?;

        let artifact: Artifact = match serde_json::from_str(artifact_json) {
            Ok(artifact) => artifact,
            Err(_) => return Ok(false),
        };
        let Some(signature_hex) = artifact.signatures.first() else {
            return Ok(false);
        };

        let digest = eip191_digest(artifact.data.as_bytes());
        let Some(signer) = recover_address(&digest, signature_hex) else {
            return Ok(false);
        };

        Ok(signer.eq_ignore_ascii_case(&inner.attestor_address))
    }

    /// Lazily initialised signing state, guarded by the broker deadline.
    async fn inner(&self) -> Result<&BrokerInner, BrokerError> {
        tokio::time::timeout(
            self.deadline,
            self.inner.get_or_try_init(|| async {
                let secret = self
                    .app_secret
                    .as_deref()
                    .ok_or(BrokerError::MissingSecret)?;
                let signing_key = parse_secret(secret)?;
                let attestor_address = match &self.configured_attestor {
                    Some(address) => address.to_lowercase(),
                    // Self-issued setups verify against the app's own key.
                    None => evm_address(&VerifyingKey::from(&signing_key)),
                };
                tracing::info!(attestor = %attestor_address, "credential broker initialised");
                Ok(BrokerInner {
                    signing_key,
                    attestor_address,
                })
            }),
        )
        .await
        .map_err(|_| BrokerError::Timeout)?
    }
}

/// Hex app secret (with or without 0x) as a secp256k1 signing key.
fn parse_secret(secret: &str) -> Result<SigningKey, BrokerError> {
    let stripped = secret.strip_prefix("0x").unwrap_or(secret);
    let bytes = hex::decode(stripped).map_err(|_| BrokerError::InvalidSecret)?;
    SigningKey::from_slice(&bytes).map_err(|_| BrokerError::InvalidSecret)
}

/// EIP-191 personal-message digest.
fn eip191_digest(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// 65-byte r || s || v signature as 0x-hex, v in {27, 28}.
fn encode_signature(signature: &Signature, recovery_id: RecoveryId) -> String {
    let mut bytes = signature.to_bytes().to_vec();
    bytes.push(27 + recovery_id.to_byte());
    format!("0x{}", hex::encode(bytes))
}

/// Recovers the signer address of a 65-byte signature over `digest`.
fn recover_address(digest: &[u8; 32], signature_hex: &str) -> Option<String> {
    let stripped = signature_hex.strip_prefix("0x").unwrap_or(signature_hex);
    let bytes = hex::decode(stripped).ok()?;
    if bytes.len() != 65 {
        return None;
    }
    let signature = Signature::from_slice(&bytes[..64]).ok()?;
    let v = bytes[64];
    let recovery_id = RecoveryId::from_byte(if v >= 27 { v - 27 } else { v })?;
    let key = VerifyingKey::recover_from_prehash(digest, &signature, recovery_id).ok()?;
    Some(evm_address(&key))
}

/// Keccak-256 of the uncompressed point, last 20 bytes, 0x-hex.
fn evm_address(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}
