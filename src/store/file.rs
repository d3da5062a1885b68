//! File-backed device store
//!
//! A single JSON object `{credentialId: DeviceRecord}` rewritten whole on
//! every mutation: read file, mutate map, write a sibling temp file,
//! rename into place. One mutex serialises all access, which is also what
//! makes the counter check race-free. Single-process only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::models::{DevicePatch, DeviceRecord};
use crate::store::StoreError;

type DeviceMap = BTreeMap<String, DeviceRecord>;

pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub async fn get(&self, credential_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(credential_id))
    }

    pub async fn put(&self, record: DeviceRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut devices = self.load().await?;
        devices.insert(record.credential_id.clone(), record);
        self.persist(&devices).await
    }

    pub async fn update(
        &self,
        credential_id: &str,
        patch: DevicePatch,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut devices = self.load().await?;
        let record = devices.get_mut(credential_id).ok_or(StoreError::NotFound)?;
        if patch.counter <= record.counter {
            return Err(StoreError::Stale);
        }
        record.counter = patch.counter;
        record.evm_address = Some(patch.evm_address.to_lowercase());
        record.passport_hash = Some(patch.passport_hash);
        self.persist(&devices).await
    }

    pub async fn find_by_address(
        &self,
        evm_address: &str,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        let devices = self.load().await?;
        Ok(devices
            .into_values()
            .find(|record| match &record.evm_address {
                Some(bound) => bound.eq_ignore_ascii_case(evm_address),
                None => false,
            }))
    }

    /// Reads the whole map; a missing file is an empty store.
    async fn load(&self) -> Result<DeviceMap, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(DeviceMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Rewrites the whole map through a temp file + rename.
    async fn persist(&self, devices: &DeviceMap) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(devices)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
