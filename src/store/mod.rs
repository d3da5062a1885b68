//! Device store
//!
//! Two interchangeable backends behind one capability: an embedded JSON
//! file for single-process deployments and a PostgreSQL table. Selected
//! at startup by the presence of `POSTGRES_URL`; one indirect call per
//! request, no further dispatch.

use thiserror::Error;

use crate::config::Config;
use crate::models::{DevicePatch, DeviceRecord};

pub mod file;
pub mod postgres;

pub use file::FileStore;
pub use postgres::PgStore;

/// Store failures. `NotFound` and `Stale` are contract outcomes; the
/// rest are infrastructure faults surfaced as 500s.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("device not found")]
    NotFound,

    /// The patch counter did not strictly advance past the stored value.
    /// Raised inside the backend critical section, so concurrent
    /// assertions with the same counter collapse to one winner.
    #[error("assertion counter did not advance")]
    Stale,

    #[error("store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
}

/// The device store capability: `get`, `put`, `update`, `find_by_address`.
pub enum DeviceStore {
    File(FileStore),
    Postgres(PgStore),
}

impl DeviceStore {
    /// Backend selection: `POSTGRES_URL` set → relational, otherwise the
    /// JSON file at `DEVICE_STORE_PATH`.
    pub async fn from_config(config: &Config) -> Result<Self, StoreError> {
        match &config.postgres_url {
            Some(url) => {
                tracing::info!("device store: postgres backend");
                Ok(DeviceStore::Postgres(PgStore::connect(url, config).await?))
            }
            None => {
                tracing::info!(path = %config.device_store_path, "device store: file backend");
                Ok(DeviceStore::File(FileStore::new(&config.device_store_path)))
            }
        }
    }

    /// Backend label for health reporting.
    pub fn backend_name(&self) -> &'static str {
        match self {
            DeviceStore::File(_) => "file",
            DeviceStore::Postgres(_) => "postgres",
        }
    }

    /// Primary-key lookup.
    pub async fn get(&self, credential_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        match self {
            DeviceStore::File(store) => store.get(credential_id).await,
            DeviceStore::Postgres(store) => store.get(credential_id).await,
        }
    }

    /// Upsert by primary key. Re-enrollment with the same key is
    /// idempotent; a different key for the same id overwrites.
    pub async fn put(&self, record: DeviceRecord) -> Result<(), StoreError> {
        match self {
            DeviceStore::File(store) => store.put(record).await,
            DeviceStore::Postgres(store) => store.put(record).await,
        }
    }

    /// Merges an assertion patch into an existing row. The strictly-greater
    /// counter check runs inside the backend critical section; the public
    /// key is never touched.
    pub async fn update(&self, credential_id: &str, patch: DevicePatch) -> Result<(), StoreError> {
        match self {
            DeviceStore::File(store) => store.update(credential_id, patch).await,
            DeviceStore::Postgres(store) => store.update(credential_id, patch).await,
        }
    }

    /// Case-insensitive secondary lookup; at most one record, arbitrary
    /// on ties.
    pub async fn find_by_address(
        &self,
        evm_address: &str,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        match self {
            DeviceStore::File(store) => store.find_by_address(evm_address).await,
            DeviceStore::Postgres(store) => store.find_by_address(evm_address).await,
        }
    }
}
