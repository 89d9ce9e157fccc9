//! JSON-file-backed implementation of the core storage traits.
//!
//! One file holds all three record families. Writes go through a temp file
//! plus rename so a crash mid-write cannot destroy existing associations.

use async_trait::async_trait;
use log::*;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

use carlink_core::storage::{
    AssociationRecord, HistoryStore, KeyStore, StorageError, TrustedDeviceRecord, UnlockEvent,
};

use crate::AnyResult;

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct FileState {
    #[serde(default)]
    cars: HashMap<Uuid, AssociationRecord>,
    #[serde(default)]
    trusted: HashMap<Uuid, TrustedDeviceRecord>,
    #[serde(default)]
    history: HashMap<Uuid, Vec<UnlockEvent>>,
}

/// File-backed [`KeyStore`] and [`HistoryStore`]
pub struct FileStore {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl FileStore {
    /// Open `path`, creating an empty store if the file does not exist
    pub async fn open(path: impl Into<PathBuf>) -> AnyResult<Self> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                anyhow::anyhow!("Store at {} is not readable: {e}", path.display())
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No store at {}, starting empty", path.display());
                FileState::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(FileStore {
            path,
            state: Mutex::new(state),
        })
    }

    async fn persist(&self, state: &FileState) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let temp = self.path.with_extension("tmp");
        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))
    }
}

#[async_trait]
impl KeyStore for FileStore {
    async fn list(&self) -> Result<Vec<AssociationRecord>, StorageError> {
        Ok(self.state.lock().await.cars.values().cloned().collect())
    }

    async fn get(&self, car_id: Uuid) -> Result<Option<AssociationRecord>, StorageError> {
        Ok(self.state.lock().await.cars.get(&car_id).cloned())
    }

    async fn put(&self, record: AssociationRecord) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.cars.insert(record.car.id, record);
        self.persist(&state).await
    }

    async fn delete(&self, car_id: Uuid) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.cars.remove(&car_id).is_none() {
            return Ok(());
        }
        self.persist(&state).await
    }

    async fn trusted_record(
        &self,
        car_id: Uuid,
    ) -> Result<Option<TrustedDeviceRecord>, StorageError> {
        Ok(self.state.lock().await.trusted.get(&car_id).cloned())
    }

    async fn put_trusted_record(
        &self,
        car_id: Uuid,
        record: TrustedDeviceRecord,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.trusted.insert(car_id, record);
        self.persist(&state).await
    }

    async fn delete_trusted_record(&self, car_id: Uuid) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.trusted.remove(&car_id).is_none() {
            return Ok(());
        }
        self.persist(&state).await
    }
}

#[async_trait]
impl HistoryStore for FileStore {
    async fn append(&self, event: UnlockEvent) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.history.entry(event.car_id).or_default().push(event);
        self.persist(&state).await
    }

    async fn list(&self, car_id: Uuid) -> Result<Vec<UnlockEvent>, StorageError> {
        Ok(self
            .state
            .lock()
            .await
            .history
            .get(&car_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, car_id: Uuid) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.history.remove(&car_id).is_none() {
            return Ok(());
        }
        self.persist(&state).await
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.history.is_empty() {
            return Ok(());
        }
        state.history.clear();
        self.persist(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carlink_core::link::version::MessageSecurityVersion;
    use carlink_core::storage::Car;
    use time::OffsetDateTime;

    fn scratch_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("carlink-store-{tag}-{}.json", Uuid::new_v4()))
    }

    fn record(id: Uuid) -> AssociationRecord {
        AssociationRecord {
            car: Car {
                id,
                name: Some("Estate".to_string()),
            },
            session: vec![1, 2, 3],
            auth_key: Some([7; 32]),
            security_version: MessageSecurityVersion::V2,
        }
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let path = scratch_path("reopen");
        let car_id = Uuid::new_v4();
        {
            let store = FileStore::open(&path).await.unwrap();
            store.put(record(car_id)).await.unwrap();
            store
                .append(UnlockEvent {
                    car_id,
                    occurred_at: OffsetDateTime::now_utc(),
                })
                .await
                .unwrap();
        }

        let store = FileStore::open(&path).await.unwrap();
        let loaded = store.get(car_id).await.unwrap().unwrap();
        assert_eq!(loaded, record(car_id));
        assert_eq!(HistoryStore::list(&store, car_id).await.unwrap().len(), 1);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let path = scratch_path("delete");
        let store = FileStore::open(&path).await.unwrap();
        let car_id = Uuid::new_v4();
        store.put(record(car_id)).await.unwrap();
        store.delete(car_id).await.unwrap();
        store.delete(car_id).await.unwrap();
        assert!(store.get(car_id).await.unwrap().is_none());
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_trusted_records_are_separate_from_cars() {
        let path = scratch_path("trusted");
        let store = FileStore::open(&path).await.unwrap();
        let car_id = Uuid::new_v4();
        store
            .put_trusted_record(car_id, TrustedDeviceRecord::default())
            .await
            .unwrap();
        assert!(store.get(car_id).await.unwrap().is_none());
        assert!(store.trusted_record(car_id).await.unwrap().is_some());
        store.delete_trusted_record(car_id).await.unwrap();
        assert!(store.trusted_record(car_id).await.unwrap().is_none());
        let _ = tokio::fs::remove_file(&path).await;
    }
}
