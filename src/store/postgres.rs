//! PostgreSQL device store
//!
//! One `devices` table keyed by credential id, created idempotently on
//! first use. Enrollment is a single upsert so concurrent enrollments
//! collapse deterministically; the binding update is one conditional
//! statement whose row-level atomicity enforces the counter advance.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::Config;
use crate::models::{DevicePatch, DeviceRecord};
use crate::store::StoreError;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects a pool and ensures the schema exists.
    pub async fn connect(url: &str, config: &Config) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .min_connections(config.db_min_connections)
            .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_secs))
            .connect(url)
            .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS devices (
                key_id         TEXT PRIMARY KEY,
                public_key_der TEXT NOT NULL,
                counter        BIGINT NOT NULL DEFAULT 0,
                evm_address    TEXT,
                passport_hash  TEXT
            )
            ",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS devices_evm_address_idx ON devices (LOWER(evm_address))",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn get(&self, credential_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let record = sqlx::query_as::<_, DeviceRecord>(
            "SELECT key_id, public_key_der, counter, evm_address, passport_hash
             FROM devices WHERE key_id = $1",
        )
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn put(&self, record: DeviceRecord) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO devices (key_id, public_key_der, counter, evm_address, passport_hash)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key_id) DO UPDATE SET
                public_key_der = EXCLUDED.public_key_der,
                counter        = EXCLUDED.counter,
                evm_address    = EXCLUDED.evm_address,
                passport_hash  = EXCLUDED.passport_hash
            ",
        )
        .bind(&record.credential_id)
        .bind(&record.public_key_der)
        .bind(i64::from(record.counter))
        .bind(&record.evm_address)
        .bind(&record.passport_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update(
        &self,
        credential_id: &str,
        patch: DevicePatch,
    ) -> Result<(), StoreError> {
        // The WHERE clause is the critical section: two concurrent
        // assertions with the same counter cannot both match it.
        let result = sqlx::query(
            r"
            UPDATE devices
            SET counter = $2, evm_address = $3, passport_hash = $4
            WHERE key_id = $1 AND counter < $2
            ",
        )
        .bind(credential_id)
        .bind(i64::from(patch.counter))
        .bind(patch.evm_address.to_lowercase())
        .bind(&patch.passport_hash)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let exists = sqlx::query("SELECT 1 FROM devices WHERE key_id = $1")
            .bind(credential_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Err(StoreError::Stale)
        } else {
            Err(StoreError::NotFound)
        }
    }

    pub async fn find_by_address(
        &self,
        evm_address: &str,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        let record = sqlx::query_as::<_, DeviceRecord>(
            "SELECT key_id, public_key_der, counter, evm_address, passport_hash
             FROM devices WHERE LOWER(evm_address) = LOWER($1) LIMIT 1",
        )
        .bind(evm_address)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}
