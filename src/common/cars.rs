//! In-memory index over the associated cars.
//!
//! The manager caches the key store's records so advertisement matching
//! never waits on storage, broadcasts the car list over a watch channel
//! for UI consumption, and owns the dissociation cascade: record, trusted
//! credentials and unlock history go together.

use log::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

use carlink_core::storage::{AssociationRecord, Car, HistoryStore, KeyStore, StorageError};

/// Process-wide registry of associated cars
pub struct AssociatedCarsManager {
    key_store: Arc<dyn KeyStore>,
    history_store: Arc<dyn HistoryStore>,
    records: Mutex<HashMap<Uuid, AssociationRecord>>,
    cars: watch::Sender<Vec<Car>>,
}

impl AssociatedCarsManager {
    /// Build the manager, priming the cache from the key store
    pub async fn new(
        key_store: Arc<dyn KeyStore>,
        history_store: Arc<dyn HistoryStore>,
    ) -> Result<Self, StorageError> {
        let records: HashMap<Uuid, AssociationRecord> = key_store
            .list()
            .await?
            .into_iter()
            .map(|record| (record.car.id, record))
            .collect();
        let (cars, _) = watch::channel(records.values().map(|r| r.car.clone()).collect());
        Ok(AssociatedCarsManager {
            key_store,
            history_store,
            records: Mutex::new(records),
            cars,
        })
    }

    /// Snapshot of the associated cars
    pub fn cars(&self) -> Vec<Car> {
        self.cars.borrow().clone()
    }

    /// Watch the car list for changes
    pub fn watch_cars(&self) -> watch::Receiver<Vec<Car>> {
        self.cars.subscribe()
    }

    /// Snapshot of every association record, for advertisement matching
    pub fn records(&self) -> Vec<AssociationRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    /// Record for one car
    pub fn record(&self, car_id: Uuid) -> Option<AssociationRecord> {
        self.records.lock().unwrap().get(&car_id).cloned()
    }

    /// Whether any car is associated at all
    pub fn any_associated(&self) -> bool {
        !self.records.lock().unwrap().is_empty()
    }

    /// Whether a specific car is associated
    pub fn is_associated(&self, car_id: Uuid) -> bool {
        self.records.lock().unwrap().contains_key(&car_id)
    }

    /// Absorb a just-completed association.
    ///
    /// The state machine has already persisted the record; this refreshes
    /// the cache and, when the id was already known, clears the stale
    /// trusted-device state and unlock history that belonged to the old
    /// association.
    pub async fn note_association(&self, car: &Car) -> Result<(), StorageError> {
        let replaced = self.records.lock().unwrap().contains_key(&car.id);
        if replaced {
            info!("Car {} re-associated, clearing stale state", car.id);
            self.key_store.delete_trusted_record(car.id).await?;
            self.history_store.clear(car.id).await?;
        }
        if let Some(record) = self.key_store.get(car.id).await? {
            self.records.lock().unwrap().insert(car.id, record);
        }
        self.broadcast();
        Ok(())
    }

    /// Give a car a new display name
    pub async fn rename(&self, car_id: Uuid, name: Option<String>) -> Result<(), StorageError> {
        let updated = {
            let mut records = self.records.lock().unwrap();
            match records.get_mut(&car_id) {
                Some(record) => {
                    record.car.name = name;
                    Some(record.clone())
                }
                None => None,
            }
        };
        if let Some(record) = updated {
            self.key_store.put(record).await?;
            self.broadcast();
        }
        Ok(())
    }

    /// Forget a car entirely: association record, trusted-device
    /// credentials and unlock history.
    pub async fn dissociate(&self, car_id: Uuid) -> Result<(), StorageError> {
        info!("Dissociating car {car_id}");
        self.key_store.delete(car_id).await?;
        self.key_store.delete_trusted_record(car_id).await?;
        self.history_store.clear(car_id).await?;
        self.records.lock().unwrap().remove(&car_id);
        self.broadcast();
        Ok(())
    }

    fn broadcast(&self) {
        let cars: Vec<Car> = self
            .records
            .lock()
            .unwrap()
            .values()
            .map(|record| record.car.clone())
            .collect();
        let _ = self.cars.send(cars);
    }
}
