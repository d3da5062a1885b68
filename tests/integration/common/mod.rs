//! Test application setup
//!
//! Spawns the API in-process on an ephemeral port with the file-backed
//! device store rooted in a per-test temp directory, so tests run
//! isolated and in parallel without external services.


use std::sync::Arc;

use idbridge_api::config::Config;
use idbridge_api::routes::{api_router, AppState};
use idbridge_api::services::{AttestationVerifier, PrimusBroker};
use idbridge_api::store::DeviceStore;

pub struct TestApp {
    pub base_url: String,
    pub client: reqwest::Client,
}

impl TestApp {
    /// Spawns an app trusting the given attestation root (DER).
    pub async fn spawn_with_root(root_der: Vec<u8>) -> Self {
        let dir = std::env::temp_dir().join(format!("idbridge-test-{}", uuid::Uuid::new_v4()));
        let config = Config::for_test(&dir);

        let store = DeviceStore::from_config(&config)
            .await
            .expect("file store init");
        let state = AppState {
            store: Arc::new(store),
            verifier: Arc::new(AttestationVerifier::with_root(
                root_der,
                config.nonce_accept_raw_challenge,
            )),
            broker: Arc::new(PrimusBroker::from_config(&config)),
        };

        let app = api_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server");
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
        }
    }

    /// Spawns an app with an empty trust root; enough for every endpoint
    /// except successful enrollment.
    pub async fn spawn() -> Self {
        Self::spawn_with_root(Vec::new()).await
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}
