//! Durable state seam and the record types that flow through it.
//!
//! Two stores back the stack: the [`KeyStore`] keeps everything needed to
//! come back to an associated car (session blob, authentication key,
//! trusted-device credentials) and the [`HistoryStore`] keeps the unlock
//! log. Implementations live in the embedding application; the contract is
//! get-by-id, put, delete and list.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::link::version::MessageSecurityVersion;

/// 256-bit key shared with the car for reconnection authentication
pub type AuthKey = [u8; 32];

/// Failures from the durable stores
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// A record could not be encoded or decoded
    #[error("Record serialization failed: {0}")]
    Serialization(String),
    /// The underlying I/O failed
    #[error("Store I/O failed: {0}")]
    Io(String),
}

/// A vehicle this phone knows about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Car {
    /// Immutable identifier the car reported during association
    pub id: Uuid,
    /// User-visible name; renameable
    pub name: Option<String>,
}

/// Everything persisted for one associated car.
///
/// A car is associated exactly as long as one of these exists for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationRecord {
    /// The car itself
    pub car: Car,
    /// Saved session state for resumption on reconnection
    pub session: Vec<u8>,
    /// Reconnection authentication key.
    ///
    /// Security V1 associations never exchange one; such cars are matched
    /// by the legacy per-device UUID instead of the advertisement HMAC.
    pub auth_key: Option<AuthKey>,
    /// Security version the association was established with
    pub security_version: MessageSecurityVersion,
}

/// Escrow token and handle pair authorizing unlocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneCredentials {
    /// Locally generated secret escrowed with the car
    pub escrow_token: Vec<u8>,
    /// Car-issued reference to the escrowed token
    pub handle: Vec<u8>,
}

/// Trusted-device state persisted per car
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrustedDeviceRecord {
    /// Present exactly when the car is enrolled
    pub credentials: Option<PhoneCredentials>,
    /// Whether the phone must be unlocked before sending credentials
    pub device_unlock_required: bool,
    /// A local unenroll happened and the car has not been told yet
    pub pending_disable_sync: bool,
}

/// One successful unlock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockEvent {
    /// Car that was unlocked
    pub car_id: Uuid,
    /// When the car acknowledged the credentials
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

/// Store for association records and trusted-device state
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// All association records
    async fn list(&self) -> Result<Vec<AssociationRecord>, StorageError>;

    /// Record for one car, if associated
    async fn get(&self, car_id: Uuid) -> Result<Option<AssociationRecord>, StorageError>;

    /// Insert or replace a record
    async fn put(&self, record: AssociationRecord) -> Result<(), StorageError>;

    /// Drop a record. Dropping an absent record is not an error.
    async fn delete(&self, car_id: Uuid) -> Result<(), StorageError>;

    /// Trusted-device state for one car
    async fn trusted_record(
        &self,
        car_id: Uuid,
    ) -> Result<Option<TrustedDeviceRecord>, StorageError>;

    /// Insert or replace trusted-device state
    async fn put_trusted_record(
        &self,
        car_id: Uuid,
        record: TrustedDeviceRecord,
    ) -> Result<(), StorageError>;

    /// Drop trusted-device state
    async fn delete_trusted_record(&self, car_id: Uuid) -> Result<(), StorageError>;
}

/// Append-only unlock history, queryable and clearable per car
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one unlock event
    async fn append(&self, event: UnlockEvent) -> Result<(), StorageError>;

    /// Events for one car, oldest first
    async fn list(&self, car_id: Uuid) -> Result<Vec<UnlockEvent>, StorageError>;

    /// Drop all events for one car
    async fn clear(&self, car_id: Uuid) -> Result<(), StorageError>;

    /// Drop the entire history
    async fn clear_all(&self) -> Result<(), StorageError>;
}
