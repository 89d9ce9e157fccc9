//! Trusted-device: enroll this phone with a car so it can unlock the head
//! unit without user interaction.
//!
//! Enrollment escrows a locally generated token with the car and stores
//! the handle the car answers with. On every later secure channel the
//! phone, policy permitting, presents both as [`PhoneCredentials`]; the
//! car's acknowledgement is the unlock. Local unenrollment is synced to
//! the car lazily via a pending `StateSync` flag that survives restarts.

mod messages;

pub use messages::{TrustedDeviceErrorKind, TrustedDeviceMessage};

use async_trait::async_trait;
use log::*;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::{uuid, Uuid};

use carlink_core::link::channel::{MessageParams, SecuredChannel};
use carlink_core::storage::{
    Car, HistoryStore, KeyStore, PhoneCredentials, StorageError, TrustedDeviceRecord, UnlockEvent,
};
use carlink_core::wire::model::OperationType;

use super::Feature;
use crate::config::TrustedDeviceConfig;

/// Recipient UUID of the trusted-device feature
pub const TRUSTED_DEVICE_FEATURE_UUID: Uuid = uuid!("85dff28b-3036-4662-bb22-baa7f898dc47");

const ESCROW_TOKEN_LEN: usize = 16;

/// Lock and passcode state of the phone, supplied by the platform
pub trait DeviceState: Send + Sync {
    /// Whether the user has a passcode configured
    fn is_passcode_set(&self) -> bool;
    /// Whether the phone is currently locked
    fn is_device_locked(&self) -> bool;
}

/// Failures surfaced to the app
#[derive(Debug, Error)]
pub enum TrustedDeviceError {
    /// Policy requires a passcode and none is set
    #[error("No passcode is set on this phone")]
    PasscodeNotSet,
    /// The car requires the phone to be unlocked first
    #[error("The phone is locked")]
    DeviceLocked,
    /// The handle could not be persisted
    #[error("Could not store the unlock handle: {0}")]
    CannotStoreHandle(StorageError),
    /// The car has no stored credentials
    #[error("Car is not enrolled")]
    NotEnrolled,
    /// No live channel to the car
    #[error("Car is not connected")]
    CarNotConnected,
    /// The channel refused the message
    #[error("Could not send: {0}")]
    Channel(carlink_core::Error),
}

/// Notifications for the app's trusted-device UI
#[derive(Debug)]
pub enum TrustedDeviceEvent {
    /// Enrollment finished and credentials are stored
    DidCompleteEnrolling {
        /// The enrolled car
        car_id: Uuid,
    },
    /// The car is no longer enrolled
    DidUnenroll {
        /// The unenrolled car
        car_id: Uuid,
        /// Whether the car initiated it (via state sync)
        initiated_from_car: bool,
    },
    /// Credentials were sent; waiting for the car's acknowledgement
    DidStartUnlocking {
        /// The car being unlocked
        car_id: Uuid,
    },
    /// The car acknowledged the credentials
    DidFinishUnlocking {
        /// The unlocked car
        car_id: Uuid,
    },
    /// Something failed; the connection survives
    Error {
        /// The car involved
        car_id: Uuid,
        /// What went wrong
        error: TrustedDeviceError,
    },
}

/// The trusted-device feature. Clone handles share one state.
#[derive(Clone)]
pub struct TrustedDeviceFeature {
    inner: Arc<Inner>,
}

struct Inner {
    key_store: Arc<dyn KeyStore>,
    history: Arc<dyn HistoryStore>,
    device_state: Arc<dyn DeviceState>,
    passcode_required: bool,
    history_enabled: AtomicBool,
    channels: Mutex<HashMap<Uuid, SecuredChannel>>,
    /// Escrow tokens sent but not yet answered with a handle
    enrolling: Mutex<HashMap<Uuid, Vec<u8>>>,
    /// Cars with credentials on the wire awaiting an acknowledgement
    unlocking: Mutex<HashSet<Uuid>>,
    events: mpsc::Sender<TrustedDeviceEvent>,
}

impl TrustedDeviceFeature {
    /// Build the feature and the stream of its events
    pub fn new(
        key_store: Arc<dyn KeyStore>,
        history: Arc<dyn HistoryStore>,
        device_state: Arc<dyn DeviceState>,
        config: &TrustedDeviceConfig,
    ) -> (Self, mpsc::Receiver<TrustedDeviceEvent>) {
        let (events_tx, events_rx) = mpsc::channel(32);
        (
            TrustedDeviceFeature {
                inner: Arc::new(Inner {
                    key_store,
                    history,
                    device_state,
                    passcode_required: config.passcode_required,
                    history_enabled: AtomicBool::new(config.unlock_history_enabled),
                    channels: Mutex::new(HashMap::new()),
                    enrolling: Mutex::new(HashMap::new()),
                    unlocking: Mutex::new(HashSet::new()),
                    events: events_tx,
                }),
            },
            events_rx,
        )
    }

    /// Begin enrolling a connected car
    pub async fn enroll(&self, car_id: Uuid) -> Result<(), TrustedDeviceError> {
        let channel = self
            .inner
            .channel(car_id)
            .ok_or(TrustedDeviceError::CarNotConnected)?;
        self.inner.begin_enrollment(car_id, &channel).await
    }

    /// Stop trusting a car.
    ///
    /// When the car is connected the sync goes out immediately; otherwise
    /// it is queued and sent on the next secure channel.
    pub async fn unenroll(&self, car_id: Uuid) -> Result<(), TrustedDeviceError> {
        let record = self
            .inner
            .trusted_record(car_id)
            .await
            .map_err(TrustedDeviceError::CannotStoreHandle)?;
        if record.credentials.is_none() && !record.pending_disable_sync {
            return Err(TrustedDeviceError::NotEnrolled);
        }

        let synced = match self.inner.channel(car_id) {
            Some(channel) => self
                .inner
                .send(&channel, &TrustedDeviceMessage::StateSync { enabled: false })
                .await
                .is_ok(),
            None => false,
        };
        let result = if synced {
            self.inner.key_store.delete_trusted_record(car_id).await
        } else {
            // Remember to tell the car next time it connects
            self.inner
                .key_store
                .put_trusted_record(
                    car_id,
                    TrustedDeviceRecord {
                        credentials: None,
                        device_unlock_required: record.device_unlock_required,
                        pending_disable_sync: true,
                    },
                )
                .await
        };
        result.map_err(TrustedDeviceError::CannotStoreHandle)?;
        self.inner
            .emit(TrustedDeviceEvent::DidUnenroll {
                car_id,
                initiated_from_car: false,
            })
            .await;
        Ok(())
    }

    /// Whether a car currently holds usable credentials
    pub async fn is_enrolled(&self, car_id: Uuid) -> bool {
        matches!(
            self.inner.key_store.trusted_record(car_id).await,
            Ok(Some(TrustedDeviceRecord {
                credentials: Some(_),
                ..
            }))
        )
    }

    /// Require the phone to be unlocked before unlocking this car
    pub async fn set_device_unlock_required(
        &self,
        car_id: Uuid,
        required: bool,
    ) -> Result<(), TrustedDeviceError> {
        let mut record = self
            .inner
            .trusted_record(car_id)
            .await
            .map_err(TrustedDeviceError::CannotStoreHandle)?;
        record.device_unlock_required = required;
        self.inner
            .key_store
            .put_trusted_record(car_id, record)
            .await
            .map_err(TrustedDeviceError::CannotStoreHandle)
    }

    /// Turn the unlock history on or off; turning it off wipes it
    pub async fn set_unlock_history_enabled(&self, enabled: bool) -> Result<(), StorageError> {
        let was = self.inner.history_enabled.swap(enabled, Ordering::SeqCst);
        if was && !enabled {
            info!("Unlock history disabled, clearing it");
            self.inner.history.clear_all().await?;
        }
        Ok(())
    }

    /// Unlock events recorded for a car, oldest first
    pub async fn unlock_history(&self, car_id: Uuid) -> Result<Vec<UnlockEvent>, StorageError> {
        self.inner.history.list(car_id).await
    }

    /// Drop the unlock history of one car
    pub async fn clear_unlock_history(&self, car_id: Uuid) -> Result<(), StorageError> {
        self.inner.history.clear(car_id).await
    }
}

impl Inner {
    fn channel(&self, car_id: Uuid) -> Option<SecuredChannel> {
        self.channels.lock().unwrap().get(&car_id).cloned()
    }

    async fn emit(&self, event: TrustedDeviceEvent) {
        let _ = self.events.send(event).await;
    }

    async fn trusted_record(&self, car_id: Uuid) -> Result<TrustedDeviceRecord, StorageError> {
        Ok(self
            .key_store
            .trusted_record(car_id)
            .await?
            .unwrap_or_default())
    }

    async fn send(
        &self,
        channel: &SecuredChannel,
        message: &TrustedDeviceMessage,
    ) -> Result<(), TrustedDeviceError> {
        let payload = message
            .serialize()
            .map_err(|e| TrustedDeviceError::Channel(e.into()))?;
        channel
            .write_encrypted(
                payload,
                MessageParams {
                    recipient: TRUSTED_DEVICE_FEATURE_UUID,
                    operation: OperationType::ClientMessage,
                },
            )
            .await
            .map_err(TrustedDeviceError::Channel)
    }

    fn passcode_check(&self) -> Result<(), TrustedDeviceError> {
        if self.passcode_required && !self.device_state.is_passcode_set() {
            return Err(TrustedDeviceError::PasscodeNotSet);
        }
        Ok(())
    }

    /// Generate and escrow a fresh token
    async fn begin_enrollment(
        &self,
        car_id: Uuid,
        channel: &SecuredChannel,
    ) -> Result<(), TrustedDeviceError> {
        if let Err(e) = self.passcode_check() {
            let _ = self
                .send(
                    channel,
                    &TrustedDeviceMessage::Error(TrustedDeviceErrorKind::DeviceNotSecured),
                )
                .await;
            self.emit(TrustedDeviceEvent::Error {
                car_id,
                error: TrustedDeviceError::PasscodeNotSet,
            })
            .await;
            return Err(e);
        }

        let mut token = vec![0u8; ESCROW_TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut token);
        self.send(channel, &TrustedDeviceMessage::EscrowToken(token.clone()))
            .await?;
        self.enrolling.lock().unwrap().insert(car_id, token);
        debug!("Escrow token sent to car {car_id}");
        Ok(())
    }

    /// The car answered the escrow token with a handle
    async fn finish_enrollment(&self, car_id: Uuid, channel: &SecuredChannel, handle: Vec<u8>) {
        let Some(escrow_token) = self.enrolling.lock().unwrap().remove(&car_id) else {
            warn!("Handle from {car_id} without an enrollment in progress");
            return;
        };
        let previous = match self.trusted_record(car_id).await {
            Ok(record) => record,
            Err(e) => {
                self.emit(TrustedDeviceEvent::Error {
                    car_id,
                    error: TrustedDeviceError::CannotStoreHandle(e),
                })
                .await;
                return;
            }
        };
        let stored = self
            .key_store
            .put_trusted_record(
                car_id,
                TrustedDeviceRecord {
                    credentials: Some(PhoneCredentials {
                        escrow_token,
                        handle,
                    }),
                    device_unlock_required: previous.device_unlock_required,
                    pending_disable_sync: false,
                },
            )
            .await;
        if let Err(e) = stored {
            self.emit(TrustedDeviceEvent::Error {
                car_id,
                error: TrustedDeviceError::CannotStoreHandle(e),
            })
            .await;
            return;
        }
        if self.send(channel, &TrustedDeviceMessage::Ack).await.is_err() {
            warn!("Could not acknowledge the handle from {car_id}");
        }
        self.emit(TrustedDeviceEvent::DidCompleteEnrolling { car_id })
            .await;
    }

    /// Present stored credentials if policy allows it
    async fn try_unlock(&self, car_id: Uuid, channel: &SecuredChannel) {
        let record = match self.trusted_record(car_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Could not load trusted record for {car_id}: {e}");
                return;
            }
        };
        let Some(credentials) = record.credentials else {
            return;
        };

        if let Err(error) = self.passcode_check() {
            self.emit(TrustedDeviceEvent::Error { car_id, error }).await;
            return;
        }
        if record.device_unlock_required && self.device_state.is_device_locked() {
            self.emit(TrustedDeviceEvent::Error {
                car_id,
                error: TrustedDeviceError::DeviceLocked,
            })
            .await;
            return;
        }

        match self
            .send(channel, &TrustedDeviceMessage::UnlockCredentials(credentials))
            .await
        {
            Ok(()) => {
                self.unlocking.lock().unwrap().insert(car_id);
                self.emit(TrustedDeviceEvent::DidStartUnlocking { car_id })
                    .await;
            }
            Err(error) => {
                self.emit(TrustedDeviceEvent::Error { car_id, error }).await;
            }
        }
    }

    /// The car acknowledged our unlock credentials
    async fn finish_unlock(&self, car_id: Uuid) {
        if !self.unlocking.lock().unwrap().remove(&car_id) {
            debug!("Stray acknowledgement from {car_id}");
            return;
        }
        if self.history_enabled.load(Ordering::SeqCst) {
            let event = UnlockEvent {
                car_id,
                occurred_at: OffsetDateTime::now_utc(),
            };
            if let Err(e) = self.history.append(event).await {
                warn!("Could not record the unlock: {e}");
            }
        }
        info!("Car {car_id} unlocked");
        self.emit(TrustedDeviceEvent::DidFinishUnlocking { car_id })
            .await;
    }

    /// The car announced its own enrollment state
    async fn handle_state_sync(&self, car_id: Uuid, enabled: bool) {
        if enabled {
            // StateSync(enabled) from a car we do not trust is ignored
            return;
        }
        match self.key_store.trusted_record(car_id).await {
            Ok(Some(record)) if record.credentials.is_some() => {}
            _ => return,
        }
        if let Err(e) = self.key_store.delete_trusted_record(car_id).await {
            warn!("Could not drop credentials for {car_id}: {e}");
        }
        // No echo back: the car already knows
        self.emit(TrustedDeviceEvent::DidUnenroll {
            car_id,
            initiated_from_car: true,
        })
        .await;
    }

    /// Flush a queued unenrollment sync, then attempt an unlock
    async fn on_channel(&self, car_id: Uuid, channel: &SecuredChannel) {
        let record = match self.trusted_record(car_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Could not load trusted record for {car_id}: {e}");
                return;
            }
        };
        if record.pending_disable_sync {
            if self
                .send(channel, &TrustedDeviceMessage::StateSync { enabled: false })
                .await
                .is_ok()
            {
                debug!("Flushed pending unenrollment to {car_id}");
                if let Err(e) = self.key_store.delete_trusted_record(car_id).await {
                    warn!("Could not clear the pending sync for {car_id}: {e}");
                }
            }
            return;
        }
        self.try_unlock(car_id, channel).await;
    }
}

#[async_trait]
impl Feature for TrustedDeviceFeature {
    fn recipient(&self) -> Uuid {
        TRUSTED_DEVICE_FEATURE_UUID
    }

    async fn on_secure_channel_established(&self, channel: SecuredChannel) {
        let car_id = channel.car().id;
        self.inner
            .channels
            .lock()
            .unwrap()
            .insert(car_id, channel.clone());
        self.inner.on_channel(car_id, &channel).await;
    }

    async fn on_car_disconnected(&self, car_id: Uuid) {
        self.inner.channels.lock().unwrap().remove(&car_id);
        self.inner.unlocking.lock().unwrap().remove(&car_id);
        self.inner.enrolling.lock().unwrap().remove(&car_id);
    }

    async fn on_car_disassociated(&self, car_id: Uuid) {
        self.inner.channels.lock().unwrap().remove(&car_id);
        self.inner.unlocking.lock().unwrap().remove(&car_id);
        self.inner.enrolling.lock().unwrap().remove(&car_id);
        if let Err(e) = self.inner.key_store.delete_trusted_record(car_id).await {
            warn!("Could not drop credentials for {car_id}: {e}");
        }
        if let Err(e) = self.inner.history.clear(car_id).await {
            warn!("Could not clear unlock history for {car_id}: {e}");
        }
    }

    async fn on_message_received(&self, message: Vec<u8>, car: &Car) {
        let parsed = match TrustedDeviceMessage::deserialize(&message) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Unparseable trusted-device message from {}: {e}", car.id);
                return;
            }
        };
        let Some(channel) = self.inner.channel(car.id) else {
            warn!("Trusted-device message from {} without a channel", car.id);
            return;
        };
        match parsed {
            TrustedDeviceMessage::StartEnrollment => {
                let _ = self.inner.begin_enrollment(car.id, &channel).await;
            }
            TrustedDeviceMessage::Handle(handle) => {
                self.inner.finish_enrollment(car.id, &channel, handle).await;
            }
            TrustedDeviceMessage::Ack => {
                self.inner.finish_unlock(car.id).await;
            }
            TrustedDeviceMessage::StateSync { enabled } => {
                self.inner.handle_state_sync(car.id, enabled).await;
            }
            TrustedDeviceMessage::Error(kind) => {
                warn!("Head unit {} reported {kind:?}", car.id);
            }
            TrustedDeviceMessage::EscrowToken(_) | TrustedDeviceMessage::UnlockCredentials(_) => {
                warn!("Unexpected phone-side message from car {}", car.id);
            }
        }
    }
}
