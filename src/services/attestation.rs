//! App Attest attestation verification
//!
//! One-time device enrollment: decodes the CBOR attestation object,
//! validates the x5c chain against the pinned Apple App Attestation Root
//! CA, binds the challenge through the certificate nonce extension, and
//! derives the content-addressed credential id from the attested key.

use ciborium::Value;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use sha2::{Digest, Sha256, Sha384};
use thiserror::Error;
use x509_parser::oid_registry::{
    OID_EC_P256, OID_NIST_EC_P384, OID_SIG_ECDSA_WITH_SHA256, OID_SIG_ECDSA_WITH_SHA384,
};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

use crate::error::codes;

/// Apple App Attestation Root CA, pinned at compile time.
///
/// Subject: CN=Apple App Attestation Root CA, O=Apple Inc., ST=California
/// Valid: 2020-03-18 to 2045-03-15
const APPLE_APP_ATTEST_ROOT_PEM: &str = "-----BEGIN CERTIFICATE-----
MIICITCCAaegAwIBAgIQC/O+DvHN0uD7jG5yH2IXmDAKBggqhkjOPQQDAzBSMSYw
JAYDVQQDDB1BcHBsZSBBcHAgQXR0ZXN0YXRpb24gUm9vdCBDQTETMBEGA1UECgwK
QXBwbGUgSW5jLjETMBEGA1UECAwKQ2FsaWZvcm5pYTAeFw0yMDAzMTgxODMyNTNa
Fw00NTAzMTUwMDAwMDBaMFIxJjAkBgNVBAMMHUFwcGxlIEFwcCBBdHRlc3RhdGlv
biBSb290IENBMRMwEQYDVQQKDApBcHBsZSBJbmMuMRMwEQYDVQQIDApDYWxpZm9y
bmlhMHYwEAYHKoZIzj0CAQYFK4EEACIDYgAERTHhmLW07ATaFQIEVwTtT4dyctdh
NbJhFs/Ii2FdCgAHGbpphY3+d8qjuDngIN3WVhQUBHAoMeQ/cLiP1sOUtgjqK9au
Yen1mMEvRq9Sk3Jm5X8U62H+xTD3FE9TgS41o0IwQDAPBgNVHRMBAf8EBTADAQH/
MB0GA1UdDgQWBBSskRBTM72+aEH/pwyp5frq5eWKoTAOBgNVHQ8BAf8EBAMCAQYw
CgYIKoZIzj0EAwMDaAAwZQIwQgFGnByvsiVbpTKwSga0kP0e8EeDS4+sQmTvb7vn
53O5+FRXgeLhpJ06ysC5PrOyAjEAp5U4xDgEgllF7En3VcE3iexZZtKeYnpqtijV
oyFraWVIyd/dganmrduC1bmTBGwD
-----END CERTIFICATE-----";

/// DER encoding of the Apple nonce extension OID 1.2.840.113635.100.8.2.
const APPLE_NONCE_OID_DER: [u8; 11] = [
    0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x08, 0x02,
];

/// Recursion cap for the nonce TLV walker. Apple has varied the exact
/// extension structure over time; the walker tolerates any nesting up to
/// this depth and rejects pathological inputs beyond it.
const MAX_TLV_DEPTH: u32 = 10;

/// Uncompressed SEC1 point length for P-256: 0x04 || x || y.
const UNCOMPRESSED_POINT_LEN: usize = 65;

// ============================================================================
// Error Types
// ============================================================================

/// Typed attestation rejections, one per pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AttestError {
    /// Envelope is not a CBOR map with fmt "apple-appattest"
    #[error("attestation envelope is not apple-appattest CBOR")]
    BadFormat,
    /// x5c carries fewer than two certificates
    #[error("certificate chain has fewer than two entries")]
    ChainTooShort,
    /// Chain parsing, validity, or signature verification failed
    #[error("certificate chain did not verify against the pinned root")]
    CertChain,
    /// Bit 6 of the authData flags byte is unset
    #[error("attested-credential-data flag unset")]
    AtFlagUnset,
    /// Leaf key is not an uncompressed P-256 point
    #[error("leaf public key is not an uncompressed EC point")]
    BadPointFormat,
    /// SHA-256 of the attested point does not equal the credential id
    #[error("credential id does not match the attested key")]
    CredentialIdMismatch,
    /// No 32-byte OCTET STRING under the Apple nonce extension OID
    #[error("nonce extension missing from leaf certificate")]
    NonceMissing,
    /// Certificate nonce matches neither accepted challenge binding
    #[error("certificate nonce does not match the challenge")]
    NonceMismatch,
}

impl AttestError {
    /// The stable wire code for this rejection.
    pub fn code(&self) -> &'static str {
        match self {
            AttestError::BadFormat => codes::BAD_FORMAT,
            AttestError::ChainTooShort => codes::CHAIN_TOO_SHORT,
            AttestError::CertChain => codes::CERT_CHAIN,
            AttestError::AtFlagUnset => codes::AT_FLAG_UNSET,
            AttestError::BadPointFormat => codes::BAD_POINT_FORMAT,
            AttestError::CredentialIdMismatch => codes::CREDENTIAL_ID_MISMATCH,
            AttestError::NonceMissing => codes::NONCE_MISSING,
            AttestError::NonceMismatch => codes::NONCE_MISMATCH,
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Decoded attestation envelope (in-flight only, never persisted).
#[derive(Debug)]
pub struct AttestationObject {
    /// Authenticator data bytes
    pub auth_data: Vec<u8>,
    /// Certificate chain, leaf first (DER)
    pub x5c: Vec<Vec<u8>>,
}

/// The attested-credential-data fields of the enrollment authData.
#[derive(Debug)]
struct AttestedCredentialData {
    credential_id: Vec<u8>,
}

/// Successful verification: the material the caller persists.
#[derive(Debug)]
pub struct VerifiedAttestation {
    /// DER SubjectPublicKeyInfo of the attested key
    pub public_key_der: Vec<u8>,
    /// SHA-256 of the uncompressed point (equals the request key id)
    pub credential_id: Vec<u8>,
}

// ============================================================================
// Verifier
// ============================================================================

/// Attestation verifier bound to one trust root.
///
/// Pure CPU work; safe to share across request handlers.
pub struct AttestationVerifier {
    root_der: Vec<u8>,
    accept_raw_challenge_nonce: bool,
}

impl AttestationVerifier {
    /// Verifier trusting the pinned Apple App Attestation Root CA.
    pub fn pinned(accept_raw_challenge_nonce: bool) -> anyhow::Result<Self> {
        let (_, pem) = parse_x509_pem(APPLE_APP_ATTEST_ROOT_PEM.as_bytes())
            .map_err(|e| anyhow::anyhow!("pinned root PEM did not parse: {e}"))?;
        Ok(Self::with_root(pem.contents, accept_raw_challenge_nonce))
    }

    /// Verifier trusting an arbitrary root certificate (DER).
    pub fn with_root(root_der: Vec<u8>, accept_raw_challenge_nonce: bool) -> Self {
        Self {
            root_der,
            accept_raw_challenge_nonce,
        }
    }

    /// Runs the full enrollment pipeline.
    ///
    /// `expected_credential_id` is the decoded key id the client claims;
    /// `now` is the Unix timestamp used for certificate validity checks.
    /// Returns the leaf SPKI and the derived credential id; any failure
    /// aborts with a typed error and no state change.
    pub fn verify(
        &self,
        attestation: &[u8],
        challenge: &[u8],
        expected_credential_id: &[u8],
        now: i64,
    ) -> Result<VerifiedAttestation, AttestError> {
        // Step 1: envelope decode
        let object = decode_attestation(attestation)?;
        tracing::debug!(
            step = "envelope",
            cert_count = object.x5c.len(),
            auth_data_len = object.auth_data.len(),
            "attestation envelope decoded"
        );

        // Step 2: certificate chain to the pinned root
        self.verify_chain(&object.x5c, now)?;
        tracing::debug!(step = "cert_chain", "chain verified against trust root");

        // Step 3: public-key extraction from the leaf SPKI
        let (_, leaf) =
            parse_x509_certificate(&object.x5c[0]).map_err(|_| AttestError::CertChain)?;
        let spki_der = leaf.tbs_certificate.subject_pki.raw.to_vec();
        let point = uncompressed_point(&spki_der)?;

        // Step 4: credential-id derivation and binding
        let attested = parse_attested_credential_data(&object.auth_data)?;
        let derived: [u8; 32] = Sha256::digest(point).into();
        if derived.as_slice() != attested.credential_id.as_slice()
            || derived.as_slice() != expected_credential_id
        {
            return Err(AttestError::CredentialIdMismatch);
        }
        tracing::debug!(step = "credential_id", "attested key bound to credential id");

        // Steps 5 + 6: nonce extraction and challenge binding
        let cert_nonce =
            extract_cert_nonce(&object.x5c[0]).ok_or(AttestError::NonceMissing)?;
        self.check_nonce(&object.auth_data, challenge, &cert_nonce)?;
        tracing::debug!(step = "nonce", "challenge binding verified");

        Ok(VerifiedAttestation {
            public_key_der: spki_der,
            credential_id: derived.to_vec(),
        })
    }

    /// Verifies leaf <- intermediate <- pinned root.
    ///
    /// Certificates beyond the first two are ignored; only the pinned root
    /// anchors trust.
    fn verify_chain(&self, x5c: &[Vec<u8>], now: i64) -> Result<(), AttestError> {
        let (_, leaf) = parse_x509_certificate(&x5c[0]).map_err(|_| AttestError::CertChain)?;
        let (_, intermediate) =
            parse_x509_certificate(&x5c[1]).map_err(|_| AttestError::CertChain)?;
        let (_, root) =
            parse_x509_certificate(&self.root_der).map_err(|_| AttestError::CertChain)?;

        let now_asn1 = ASN1Time::from_timestamp(now).map_err(|_| AttestError::CertChain)?;
        for cert in [&leaf, &intermediate] {
            if !cert.validity().is_valid_at(now_asn1) {
                tracing::warn!(
                    subject = %cert.subject(),
                    "certificate outside its validity window"
                );
                return Err(AttestError::CertChain);
            }
        }

        verify_signed_by(&leaf, &intermediate.tbs_certificate.subject_pki)?;
        verify_signed_by(&intermediate, &root.tbs_certificate.subject_pki)?;
        Ok(())
    }

    /// Compares the certificate nonce against the accepted challenge bindings.
    fn check_nonce(
        &self,
        auth_data: &[u8],
        challenge: &[u8],
        cert_nonce: &[u8; 32],
    ) -> Result<(), AttestError> {
        // Apple's documented form: SHA-256(authData || SHA-256(challenge))
        let client_data_hash = Sha256::digest(challenge);
        let mut hasher = Sha256::new();
        hasher.update(auth_data);
        hasher.update(client_data_hash);
        let expected: [u8; 32] = hasher.finalize().into();
        if &expected == cert_nonce {
            return Ok(());
        }

        // Legacy form for clients that pre-hash the challenge themselves:
        // SHA-256(authData || challenge). Opt-in only.
        if self.accept_raw_challenge_nonce {
            let mut hasher = Sha256::new();
            hasher.update(auth_data);
            hasher.update(challenge);
            let legacy: [u8; 32] = hasher.finalize().into();
            if &legacy == cert_nonce {
                tracing::warn!("attestation accepted via legacy raw-challenge nonce");
                return Ok(());
            }
        }

        Err(AttestError::NonceMismatch)
    }
}

// ============================================================================
// CBOR Envelope Decoding
// ============================================================================

/// Decodes the CBOR attestation envelope and enforces its shape.
pub fn decode_attestation(bytes: &[u8]) -> Result<AttestationObject, AttestError> {
    let value: Value = ciborium::from_reader(bytes).map_err(|_| AttestError::BadFormat)?;
    let map = value.as_map().ok_or(AttestError::BadFormat)?;

    let fmt = find_text_value(map, "fmt").ok_or(AttestError::BadFormat)?;
    if fmt != "apple-appattest" {
        return Err(AttestError::BadFormat);
    }

    let auth_data = find_bytes_value(map, "authData")
        .ok_or(AttestError::BadFormat)?
        .to_vec();

    let att_stmt = find_map_value(map, "attStmt").ok_or(AttestError::BadFormat)?;
    let x5c: Vec<Vec<u8>> = find_array_value(att_stmt, "x5c")
        .ok_or(AttestError::BadFormat)?
        .iter()
        .filter_map(|v| v.as_bytes().map(|b| b.to_vec()))
        .collect();

    if x5c.len() < 2 {
        return Err(AttestError::ChainTooShort);
    }

    Ok(AttestationObject { auth_data, x5c })
}

// ============================================================================
// AuthenticatorData Parsing
// ============================================================================

/// Extracts the credential id from enrollment authData.
///
/// Layout: rpIdHash(32) | flags(1) | counter(4) | AAGUID(16) |
/// credIdLen(2, BE) | credentialId(credIdLen) | COSE key (ignored).
fn parse_attested_credential_data(data: &[u8]) -> Result<AttestedCredentialData, AttestError> {
    if data.len() < 55 {
        return Err(AttestError::BadFormat);
    }

    let flags = data[32];
    // Bit 6: attested credential data present
    if flags & 0x40 == 0 {
        return Err(AttestError::AtFlagUnset);
    }

    let cred_id_len = u16::from_be_bytes([data[53], data[54]]) as usize;
    let credential_id = data
        .get(55..55 + cred_id_len)
        .ok_or(AttestError::BadFormat)?
        .to_vec();

    Ok(AttestedCredentialData { credential_id })
}

/// The last 65 bytes of a P-256 SPKI are the uncompressed point.
fn uncompressed_point(spki_der: &[u8]) -> Result<&[u8], AttestError> {
    if spki_der.len() < UNCOMPRESSED_POINT_LEN {
        return Err(AttestError::BadPointFormat);
    }
    let point = &spki_der[spki_der.len() - UNCOMPRESSED_POINT_LEN..];
    if point[0] != 0x04 {
        return Err(AttestError::BadPointFormat);
    }
    Ok(point)
}

// ============================================================================
// Chain Signature Verification
// ============================================================================

/// Verifies `cert`'s signature under the issuer's SPKI.
///
/// Apple chains mix curves: the root and intermediate keys are P-384 while
/// leaf signatures use ecdsa-with-SHA256, so the curve is taken from the
/// issuer key parameters and the digest from the signature algorithm.
fn verify_signed_by(
    cert: &X509Certificate<'_>,
    issuer_spki: &SubjectPublicKeyInfo<'_>,
) -> Result<(), AttestError> {
    let tbs = cert.tbs_certificate.as_ref();
    let sig_der: &[u8] = &cert.signature_value.data;

    let sig_oid = &cert.signature_algorithm.algorithm;
    let digest: Vec<u8> = if *sig_oid == OID_SIG_ECDSA_WITH_SHA256 {
        Sha256::digest(tbs).to_vec()
    } else if *sig_oid == OID_SIG_ECDSA_WITH_SHA384 {
        Sha384::digest(tbs).to_vec()
    } else {
        return Err(AttestError::CertChain);
    };

    let curve_oid = issuer_spki
        .algorithm
        .parameters
        .as_ref()
        .and_then(|params| params.as_oid().ok())
        .ok_or(AttestError::CertChain)?;
    let issuer_point: &[u8] = &issuer_spki.subject_public_key.data;

    if curve_oid == OID_EC_P256 {
        let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(issuer_point)
            .map_err(|_| AttestError::CertChain)?;
        let signature =
            p256::ecdsa::Signature::from_der(sig_der).map_err(|_| AttestError::CertChain)?;
        key.verify_prehash(&digest, &signature)
            .map_err(|_| AttestError::CertChain)
    } else if curve_oid == OID_NIST_EC_P384 {
        let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(issuer_point)
            .map_err(|_| AttestError::CertChain)?;
        let signature =
            p384::ecdsa::Signature::from_der(sig_der).map_err(|_| AttestError::CertChain)?;
        key.verify_prehash(&digest, &signature)
            .map_err(|_| AttestError::CertChain)
    } else {
        Err(AttestError::CertChain)
    }
}

// ============================================================================
// Nonce Extraction
// ============================================================================

/// Finds the certificate nonce without committing to Apple's exact
/// extension structure: locate the literal OID encoding in the raw DER,
/// then walk TLV after it for the first 32-byte OCTET STRING.
fn extract_cert_nonce(leaf_der: &[u8]) -> Option<[u8; 32]> {
    let at = find_subslice(leaf_der, &APPLE_NONCE_OID_DER)?;
    find_octet32(&leaf_der[at + APPLE_NONCE_OID_DER.len()..], 1)
}

/// Depth-first search for a 32-byte OCTET STRING, descending into every
/// node's value bytes (constructed nodes contain TLVs; extension OCTET
/// STRINGs wrap DER). Malformed TLV ends the current level.
fn find_octet32(data: &[u8], depth: u32) -> Option<[u8; 32]> {
    if depth > MAX_TLV_DEPTH {
        return None;
    }
    let mut rest = data;
    while !rest.is_empty() {
        let (tag, value, tail) = read_tlv(rest)?;
        if tag == 0x04 && value.len() == 32 {
            return value.try_into().ok();
        }
        if let Some(found) = find_octet32(value, depth + 1) {
            return Some(found);
        }
        rest = tail;
    }
    None
}

/// Reads one DER TLV: (tag, value, remainder). Short and long length
/// forms up to four bytes; high tag numbers are not used by these certs.
fn read_tlv(data: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    if data.len() < 2 {
        return None;
    }
    let tag = data[0];
    if tag & 0x1f == 0x1f {
        return None;
    }

    let first = data[1];
    let (len, header) = if first < 0x80 {
        (first as usize, 2)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || data.len() < 2 + n {
            return None;
        }
        let mut len = 0usize;
        for byte in &data[2..2 + n] {
            len = (len << 8) | *byte as usize;
        }
        (len, 2 + n)
    };

    if data.len() < header + len {
        return None;
    }
    Some((tag, &data[header..header + len], &data[header + len..]))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ============================================================================
// CBOR Map Helpers
// ============================================================================

fn find_text_value<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a str> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .and_then(|(_, v)| v.as_text())
}

pub(crate) fn find_bytes_value<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a [u8]> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .and_then(|(_, v)| v.as_bytes())
        .map(|v| v.as_slice())
}

fn find_map_value<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a [(Value, Value)]> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .and_then(|(_, v)| v.as_map())
        .map(|v| v.as_slice())
}

fn find_array_value<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a [Value]> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .and_then(|(_, v)| v.as_array())
        .map(|v| v.as_slice())
}

// ============================================================================
// Unit Tests
// ============================================================================
