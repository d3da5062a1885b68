//! Application configuration
//!
//! Loads configuration from environment variables with sensible defaults.

use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL; when unset the file-backed device store
    /// is used instead
    pub postgres_url: Option<String>,

    /// Path of the JSON device-store file (file backend only)
    pub device_store_path: String,

    /// HTTP server host (default: 0.0.0.0)
    pub host: String,

    /// HTTP server port
    pub port: u16,

    /// Maximum database connections in the pool (default: 10)
    pub db_max_connections: u32,

    /// Minimum database connections to keep warm (default: 2)
    pub db_min_connections: u32,

    /// Timeout in seconds to acquire a database connection (default: 30)
    pub db_acquire_timeout_secs: u64,

    /// CORS allowed origins (comma-separated; empty allows any origin)
    pub cors_origins: Vec<String>,

    /// Log format: "json" for structured, "pretty" for human-readable (default: pretty)
    pub log_format: String,

    /// Primus application id
    pub primus_app_id: String,

    /// Primus application secret (hex-encoded secp256k1 scalar).
    /// Broker initialisation fails hard when this is unset.
    pub primus_app_secret: Option<String>,

    /// EVM address expected to have signed attestation artifacts.
    /// Defaults to the address of the app's own signing key when unset.
    pub primus_attestor_address: Option<String>,

    /// Deadline for broker operations in seconds (default: 30)
    pub primus_timeout_secs: u64,

    /// Accept the legacy nonce form SHA-256(authData || challenge) in
    /// addition to Apple's documented SHA-256(authData || SHA-256(challenge)).
    /// Off by default; exists for one known client that pre-hashes the
    /// challenge before attestation.
    pub nonce_accept_raw_challenge: bool,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to sensible defaults for local development if variables are not set.
    pub fn load() -> Self {
        // Load .env file if it exists
        dotenv().ok();

        let cors_origins: Vec<String> = env::var("CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            postgres_url: env::var("POSTGRES_URL").ok().filter(|s| !s.is_empty()),
            device_store_path: env::var("DEVICE_STORE_PATH")
                .unwrap_or_else(|_| "data/devices.json".to_string()),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .expect("PORT must be a number"),
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .expect("DB_MAX_CONNECTIONS must be a number"),
            db_min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .expect("DB_MIN_CONNECTIONS must be a number"),
            db_acquire_timeout_secs: env::var("DB_ACQUIRE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .expect("DB_ACQUIRE_TIMEOUT_SECS must be a number"),
            cors_origins,
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            primus_app_id: env::var("PRIMUS_APP_ID").unwrap_or_default(),
            primus_app_secret: env::var("PRIMUS_APP_SECRET").ok().filter(|s| !s.is_empty()),
            primus_attestor_address: env::var("PRIMUS_ATTESTOR_ADDRESS")
                .ok()
                .filter(|s| !s.is_empty()),
            primus_timeout_secs: env::var("PRIMUS_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .expect("PRIMUS_TIMEOUT_SECS must be a number"),
            nonce_accept_raw_challenge: env::var("NONCE_ACCEPT_RAW_CHALLENGE")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Creates a configuration for tests: file backend rooted in the given
    /// directory, broker keyed with a fixed development secret.
    pub fn for_test(store_dir: &std::path::Path) -> Self {
        Self {
            postgres_url: None,
            device_store_path: store_dir
                .join("devices.json")
                .to_string_lossy()
                .into_owned(),
            host: "127.0.0.1".to_string(),
            port: 0,
            db_max_connections: 5,
            db_min_connections: 1,
            db_acquire_timeout_secs: 10,
            cors_origins: vec![],
            log_format: "pretty".to_string(),
            primus_app_id: "0xtestapp".to_string(),
            primus_app_secret: Some(
                "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318".to_string(),
            ),
            primus_attestor_address: None,
            primus_timeout_secs: 5,
            nonce_accept_raw_challenge: false,
        }
    }
}
