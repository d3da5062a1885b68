//! End-to-end attestation and binding scenarios through the HTTP boundary

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use crate::common::{fixtures, TestApp};

const PASSPORT_HASH: &str = "abcd5f8a9c0d1e2f3a4b5c6d7e8f9a0b1c2d3e4f5a6b7c8d9e0f1a2b3c4d5eef";
const EVM_ADDRESS: &str = "0x742d35cc6634c0532925a3b844bc454e4438f44e";

async fn post(app: &TestApp, path: &str, body: Value) -> (u16, Value) {
    let response = app
        .client
        .post(app.url(path))
        .json(&body)
        .send()
        .await
        .expect("request");
    let status = response.status().as_u16();
    let body: Value = response.json().await.expect("json body");
    (status, body)
}

async fn get(app: &TestApp, path: &str) -> (u16, Value) {
    let response = app.client.get(app.url(path)).send().await.expect("request");
    let status = response.status().as_u16();
    let body: Value = response.json().await.expect("json body");
    (status, body)
}

/// Enrolls the fixture device and returns (app, fixture).
async fn enrolled_app() -> (TestApp, fixtures::DeviceFixture) {
    let challenge = "test_server_challenge";
    let fixture = fixtures::enroll_fixture(challenge.as_bytes());
    let app = TestApp::spawn_with_root(fixture.root_der.clone()).await;

    let (status, body) = post(
        &app,
        "/attest/verify-attestation",
        json!({
            "attestation": fixture.attestation_b64,
            "challenge": challenge,
            "keyId": fixture.key_id_b64,
        }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);

    (app, fixture)
}

fn bind_request(fixture: &fixtures::DeviceFixture, counter: u32, address: &str) -> Value {
    let payload = fixtures::canonical_payload(PASSPORT_HASH, address);
    json!({
        "assertion": fixtures::assertion_b64(&fixture.signing_key, counter, &payload),
        "keyId": fixture.key_id_b64,
        "passportHash": PASSPORT_HASH,
        "evmAddress": address,
    })
}

#[tokio::test]
async fn test_happy_enrollment() {
    let challenge = "test_server_challenge";
    let fixture = fixtures::enroll_fixture(challenge.as_bytes());
    let app = TestApp::spawn_with_root(fixture.root_der.clone()).await;

    let request = json!({
        "attestation": fixture.attestation_b64,
        "challenge": challenge,
        "keyId": fixture.key_id_b64,
    });

    let (status, body) = post(&app, "/attest/verify-attestation", request.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(
        body["publicKey"].as_str().expect("publicKey"),
        base64_encode(&fixture.spki_der)
    );

    // Double submit is idempotent: same public key back, still no binding.
    let (status, body) = post(&app, "/attest/verify-attestation", request).await;
    assert_eq!(status, 200);
    assert_eq!(
        body["publicKey"].as_str().expect("publicKey"),
        base64_encode(&fixture.spki_der)
    );
    let (status, body) = get(&app, &format!("/identity?address={EVM_ADDRESS}")).await;
    assert_eq!(status, 200);
    assert_eq!(body["passportHash"], Value::Null);
}

#[tokio::test]
async fn test_enrollment_ignores_extra_chain_certs() {
    let challenge = "test_server_challenge";
    let fixture = fixtures::enroll_fixture_with_extra_cert(challenge.as_bytes());
    let app = TestApp::spawn_with_root(fixture.root_der.clone()).await;

    let (status, body) = post(
        &app,
        "/attest/verify-attestation",
        json!({
            "attestation": fixture.attestation_b64,
            "challenge": challenge,
            "keyId": fixture.key_id_b64,
        }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn test_enrollment_rejects_wrong_challenge() {
    let fixture = fixtures::enroll_fixture(b"test_server_challenge");
    let app = TestApp::spawn_with_root(fixture.root_der.clone()).await;

    let (status, body) = post(
        &app,
        "/attest/verify-attestation",
        json!({
            "attestation": fixture.attestation_b64,
            "challenge": "a_different_challenge",
            "keyId": fixture.key_id_b64,
        }),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "ErrNonceMismatch");
}

#[tokio::test]
async fn test_enrollment_rejects_untrusted_root() {
    let challenge = "test_server_challenge";
    let fixture = fixtures::enroll_fixture(challenge.as_bytes());
    // The server trusts a different root than the one that signed the chain.
    let other = fixtures::enroll_fixture(challenge.as_bytes());
    let app = TestApp::spawn_with_root(other.root_der.clone()).await;

    let (status, body) = post(
        &app,
        "/attest/verify-attestation",
        json!({
            "attestation": fixture.attestation_b64,
            "challenge": challenge,
            "keyId": fixture.key_id_b64,
        }),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "ErrCertChain");
}

#[tokio::test]
async fn test_enrollment_rejects_mismatched_key_id() {
    let challenge = "test_server_challenge";
    let fixture = fixtures::enroll_fixture(challenge.as_bytes());
    let app = TestApp::spawn_with_root(fixture.root_der.clone()).await;

    let (status, body) = post(
        &app,
        "/attest/verify-attestation",
        json!({
            "attestation": fixture.attestation_b64,
            "challenge": challenge,
            // 32 zero bytes: valid shape, wrong identity
            "keyId": base64_encode(&[0u8; 32]),
        }),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "ErrCredentialIdMismatch");
}

#[tokio::test]
async fn test_enrollment_missing_field_is_bad_request() {
    let app = TestApp::spawn().await;
    let (status, body) = post(
        &app,
        "/attest/verify-attestation",
        json!({"challenge": "x", "keyId": "AA=="}),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "ErrBadRequest");
}

#[tokio::test]
async fn test_happy_binding() {
    let (app, fixture) = enrolled_app().await;

    let (status, body) = post(
        &app,
        "/attest/verify-assertion",
        bind_request(&fixture, 1, EVM_ADDRESS),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["evmAddress"], EVM_ADDRESS);
    assert_eq!(body["passportHash"], PASSPORT_HASH);
}

#[tokio::test]
async fn test_replay_rejected() {
    let (app, fixture) = enrolled_app().await;

    let request = bind_request(&fixture, 1, EVM_ADDRESS);
    let (status, _) = post(&app, "/attest/verify-assertion", request.clone()).await;
    assert_eq!(status, 200);

    // The identical assertion again: counter 1 is no longer greater.
    let (status, body) = post(&app, "/attest/verify-assertion", request).await;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "ErrReplay");

    // Stored counter is still 1: the next strictly-greater counter works.
    let (status, _) = post(
        &app,
        "/attest/verify-assertion",
        bind_request(&fixture, 2, EVM_ADDRESS),
    )
    .await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_stale_counter_rejected() {
    let (app, fixture) = enrolled_app().await;

    let (status, _) = post(
        &app,
        "/attest/verify-assertion",
        bind_request(&fixture, 5, EVM_ADDRESS),
    )
    .await;
    assert_eq!(status, 200);

    let (status, body) = post(
        &app,
        "/attest/verify-assertion",
        bind_request(&fixture, 3, EVM_ADDRESS),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "ErrReplay");
}

#[tokio::test]
async fn test_bad_signature_rejected_and_row_unchanged() {
    let (app, fixture) = enrolled_app().await;

    let (status, _) = post(
        &app,
        "/attest/verify-assertion",
        bind_request(&fixture, 1, EVM_ADDRESS),
    )
    .await;
    assert_eq!(status, 200);

    // Fresh counter, one signature byte flipped.
    let mut request = bind_request(&fixture, 2, EVM_ADDRESS);
    let tampered =
        fixtures::tamper_signature(request["assertion"].as_str().expect("assertion"));
    request["assertion"] = Value::String(tampered);

    let (status, body) = post(&app, "/attest/verify-assertion", request).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "ErrBadSignature");

    // The binding from counter 1 is still on file.
    let (status, body) = get(&app, &format!("/identity?address={EVM_ADDRESS}")).await;
    assert_eq!(status, 200);
    assert_eq!(body["passportHash"], PASSPORT_HASH);
}

#[tokio::test]
async fn test_identity_lookup_mixed_case() {
    let (app, fixture) = enrolled_app().await;

    let (status, _) = post(
        &app,
        "/attest/verify-assertion",
        bind_request(&fixture, 1, EVM_ADDRESS),
    )
    .await;
    assert_eq!(status, 200);

    let mixed = "0x742D35Cc6634C0532925a3b844Bc454e4438f44E";
    let (status, body) = get(&app, &format!("/identity?address={mixed}")).await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["passportHash"], PASSPORT_HASH);
}

#[tokio::test]
async fn test_mixed_case_binding_stored_lowercase() {
    let (app, fixture) = enrolled_app().await;

    // The client signs the payload with the address exactly as submitted.
    let mixed = "0x742D35Cc6634C0532925a3b844Bc454e4438f44E";
    let (status, body) = post(
        &app,
        "/attest/verify-assertion",
        bind_request(&fixture, 1, mixed),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["evmAddress"], EVM_ADDRESS);

    let (status, body) = get(&app, &format!("/identity?address={EVM_ADDRESS}")).await;
    assert_eq!(status, 200);
    assert_eq!(body["passportHash"], PASSPORT_HASH);
}

#[tokio::test]
async fn test_unknown_device_is_404() {
    let app = TestApp::spawn().await;
    let fixture = fixtures::enroll_fixture(b"unused");

    let (status, body) = post(
        &app,
        "/attest/verify-assertion",
        bind_request(&fixture, 1, EVM_ADDRESS),
    )
    .await;
    assert_eq!(status, 404);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "ErrDeviceUnknown");
}

#[tokio::test]
async fn test_assertion_shape_checks() {
    let app = TestApp::spawn().await;

    let (status, body) = post(
        &app,
        "/attest/verify-assertion",
        json!({
            "assertion": "AA==",
            "keyId": "AA==",
            "passportHash": PASSPORT_HASH,
            "evmAddress": "0x742d35cc"
        }),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "ErrBadRequest");

    let (status, body) = post(
        &app,
        "/attest/verify-assertion",
        json!({
            "assertion": "AA==",
            "keyId": "AA==",
            "passportHash": "not-hex",
            "evmAddress": EVM_ADDRESS
        }),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "ErrBadRequest");
}

#[tokio::test]
async fn test_identity_lookup_validation_and_null() {
    let app = TestApp::spawn().await;

    // Unknown address: success with null, never a 404.
    let (status, body) = get(&app, &format!("/identity?address={EVM_ADDRESS}")).await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["passportHash"], Value::Null);

    let (status, body) = get(&app, "/identity?address=nonsense").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "ErrBadRequest");

    let (status, body) = get(&app, "/identity").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "ErrBadRequest");
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::spawn().await;
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "file");
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.encode(bytes)
}
