//! Re-authentication of a previously associated car.
//!
//! Discovery-side matching never touches the radio: each reconnection
//! advertisement carries an 11-byte blob of truncated HMAC and salt, and
//! [`match_advertisement`] finds the associated car whose authentication
//! key reproduces the HMAC. Once connected, the phone proves freshness
//! with a random challenge, resumes the saved session, and hands back a
//! secured channel.

use hmac::{Hmac, Mac};
use log::*;
use rand::Rng;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::time::timeout;
use uuid::Uuid;

use super::channel::{ChannelEvent, SecuredChannel};
use super::version::{exchange_versions, MessageSecurityVersion, VersionError};
use super::LinkConfig;
use crate::storage::{AssociationRecord, AuthKey, KeyStore};
use crate::stream::{MessageStream, MessageStreamVersion, StreamMessage};
use crate::transport::{BlePeripheral, TransportError};
use crate::wire::crypto::{SecurityError, SessionCrypto};
use crate::wire::model::{CapabilitiesExchange, OperationType};

type HmacSha256 = Hmac<Sha256>;

/// Exact length of the reconnection advertisement blob
pub const ADVERTISEMENT_BLOB_LEN: usize = 11;
/// Leading bytes of the blob: the truncated HMAC
pub const TRUNCATED_HMAC_LEN: usize = 3;
/// Trailing bytes of the blob: the salt
pub const SALT_LEN: usize = 8;
/// The salt is zero-padded to this length before hashing
const PADDED_SALT_LEN: usize = 16;
/// Length of the freshness challenge the phone sends
pub const CHALLENGE_LEN: usize = 16;

/// Terminal failures of a reconnection attempt
#[derive(Debug, Error)]
pub enum ReconnectionError {
    /// No stored association matches this car
    #[error("Car is not associated")]
    NotAssociated,
    /// The reconnection service could not be discovered
    #[error("Reconnection service not found")]
    ServiceNotFound,
    /// The record exists but has no resumable session
    #[error("No saved session for this car")]
    NoSavedEncryption,
    /// Challenge verification or session resumption failed
    #[error("Could not re-establish encryption: {0}")]
    FailedEncryptionEstablishment(SecurityError),
    /// Versions resolved to nothing both sides speak
    #[error("No mutually supported version")]
    VersionNotSupported,
    /// The peripheral went away mid-flow
    #[error("Peripheral disconnected")]
    Disconnected,
    /// A step did not complete within the step timeout
    #[error("Timed out waiting for the car")]
    TimedOut,
    /// Anything else
    #[error("Reconnection failed: {0}")]
    Unknown(crate::Error),
}

/// HMAC-SHA256 of the zero-padded salt, truncated to the advertised prefix
pub fn truncated_salt_hmac(auth_key: &AuthKey, salt: &[u8]) -> [u8; TRUNCATED_HMAC_LEN] {
    let mut padded = [0u8; PADDED_SALT_LEN];
    let len = salt.len().min(PADDED_SALT_LEN);
    padded[..len].copy_from_slice(&salt[..len]);
    let mut mac = HmacSha256::new_from_slice(auth_key).expect("any key length is valid");
    mac.update(&padded);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; TRUNCATED_HMAC_LEN];
    out.copy_from_slice(&digest[..TRUNCATED_HMAC_LEN]);
    out
}

/// Response the head unit must give to a freshness challenge
pub fn challenge_response(auth_key: &AuthKey, challenge: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(auth_key).expect("any key length is valid");
    mac.update(challenge);
    mac.finalize().into_bytes().into()
}

/// Find the associated car a reconnection advertisement belongs to.
///
/// The blob is `truncatedHMAC[0..3] || salt[0..8]`; a car matches when its
/// stored authentication key reproduces the prefix. Comparison is
/// constant-time. Records without an authentication key (security V1) are
/// skipped.
pub fn match_advertisement<'a>(
    blob: &[u8],
    records: &'a [AssociationRecord],
) -> Option<&'a AssociationRecord> {
    if blob.len() != ADVERTISEMENT_BLOB_LEN {
        debug!(
            "Ignoring advertisement blob of {} bytes (want {ADVERTISEMENT_BLOB_LEN})",
            blob.len()
        );
        return None;
    }
    let (advertised, salt) = blob.split_at(TRUNCATED_HMAC_LEN);
    records.iter().find(|record| {
        record.auth_key.as_ref().is_some_and(|auth_key| {
            let expected = truncated_salt_hmac(auth_key, salt);
            bool::from(expected.ct_eq(advertised))
        })
    })
}

/// Runs reconnection attempts against peripherals advertising a known car
pub struct Reconnector {
    config: LinkConfig,
    key_exchange: Arc<dyn crate::wire::crypto::KeyExchangeFactory>,
    key_store: Arc<dyn KeyStore>,
}

impl Reconnector {
    /// Reconnector over the shared link configuration
    pub fn new(
        config: LinkConfig,
        key_exchange: Arc<dyn crate::wire::crypto::KeyExchangeFactory>,
        key_store: Arc<dyn KeyStore>,
    ) -> Self {
        Reconnector {
            config,
            key_exchange,
            key_store,
        }
    }

    /// Security V2+ reconnection to a car already matched from its
    /// advertisement.
    pub async fn reconnect(
        &self,
        peripheral: Arc<dyn BlePeripheral>,
        record: AssociationRecord,
    ) -> Result<(SecuredChannel, tokio::sync::mpsc::Receiver<ChannelEvent>), ReconnectionError>
    {
        let auth_key = record.auth_key.ok_or(ReconnectionError::NotAssociated)?;
        let (mut stream, resolved) = self
            .open_stream(peripheral, self.config.reconnection_service)
            .await?;

        // Freshness challenge
        let challenge: [u8; CHALLENGE_LEN] = rand::thread_rng().gen();
        send_plain(
            &stream,
            OperationType::EncryptionHandshake,
            challenge.to_vec(),
        )
        .await?;
        let response = self.step(stream.recv()).await?;
        let expected = challenge_response(&auth_key, &challenge);
        if !bool::from(expected.ct_eq(response.payload.as_slice())) {
            return Err(ReconnectionError::FailedEncryptionEstablishment(
                SecurityError::HandshakeMismatch,
            ));
        }

        let crypto = self.resume(&record.session)?;

        if resolved == MessageSecurityVersion::V4 {
            // Channel configuration slot; contents are ignored on both
            // sides today
            let payload = CapabilitiesExchange::default()
                .serialize()
                .map_err(|e| ReconnectionError::Unknown(e.into()))?;
            let ciphertext = crypto
                .encrypt(&payload)
                .map_err(ReconnectionError::FailedEncryptionEstablishment)?;
            stream
                .send(StreamMessage {
                    recipient: Uuid::nil(),
                    operation: OperationType::ClientMessage,
                    payload: ciphertext,
                    is_encrypted: true,
                })
                .await
                .map_err(map_stream_error)?;
            let _ = self.step(stream.recv()).await?;
        }

        self.save_session(&crypto, record.clone()).await;
        info!("Reconnected to car {}", record.car.id);
        Ok(SecuredChannel::establish(record.car, stream, crypto))
    }

    /// Legacy security V1 reconnection: the head unit advertises this
    /// phone's own device UUID as the service, identities travel in the
    /// clear, and the car id selects the stored record.
    pub async fn reconnect_v1(
        &self,
        peripheral: Arc<dyn BlePeripheral>,
    ) -> Result<(SecuredChannel, tokio::sync::mpsc::Receiver<ChannelEvent>), ReconnectionError>
    {
        let (mut stream, _) = self
            .open_stream(peripheral, self.config.device_id)
            .await?;

        send_plain(
            &stream,
            OperationType::ClientMessage,
            self.config.device_id.as_bytes().to_vec(),
        )
        .await?;
        let message = self.step(stream.recv()).await?;
        let car_id = Uuid::from_slice(&message.payload)
            .map_err(|_| ReconnectionError::Unknown(
                crate::ProtocolError::BadRecipient(message.payload.len()).into(),
            ))?;

        let record = self
            .key_store
            .get(car_id)
            .await
            .map_err(|e| ReconnectionError::Unknown(e.into()))?
            .ok_or(ReconnectionError::NotAssociated)?;
        let crypto = self.resume(&record.session)?;
        self.save_session(&crypto, record.clone()).await;
        info!("Reconnected to car {} (legacy)", record.car.id);
        Ok(SecuredChannel::establish(record.car, stream, crypto))
    }

    /// Discover, subscribe and resolve versions; common to both flavors
    async fn open_stream(
        &self,
        peripheral: Arc<dyn BlePeripheral>,
        service: Uuid,
    ) -> Result<(MessageStream, MessageSecurityVersion), ReconnectionError> {
        let characteristics = timeout(
            self.config.step_timeout,
            peripheral.discover_characteristics(service),
        )
        .await
        .map_err(|_| ReconnectionError::TimedOut)?
        .map_err(|_| ReconnectionError::ServiceNotFound)?;
        if !characteristics.contains(&self.config.client_write_characteristic)
            || !characteristics.contains(&self.config.server_write_characteristic)
        {
            return Err(ReconnectionError::ServiceNotFound);
        }

        let notifications = timeout(
            self.config.step_timeout,
            peripheral.subscribe(self.config.server_write_characteristic),
        )
        .await
        .map_err(|_| ReconnectionError::TimedOut)?
        .map_err(|_| ReconnectionError::ServiceNotFound)?;

        let mut stream = MessageStream::new(
            MessageStreamVersion::Passthrough,
            peripheral,
            self.config.client_write_characteristic,
            notifications,
        );
        let resolved = exchange_versions(&mut stream, self.config.step_timeout)
            .await
            .map_err(|e| match e {
                VersionError::VersionNotSupported => ReconnectionError::VersionNotSupported,
                other => ReconnectionError::Unknown(other.into()),
            })?;
        stream.set_version(resolved.stream_version);
        Ok((stream, resolved.security_version))
    }

    fn resume(&self, session: &[u8]) -> Result<SessionCrypto, ReconnectionError> {
        if session.is_empty() {
            return Err(ReconnectionError::NoSavedEncryption);
        }
        let context = self
            .key_exchange
            .resume_session(session)
            .map_err(ReconnectionError::FailedEncryptionEstablishment)?;
        Ok(SessionCrypto::new(context))
    }

    /// Persist the resumed session state. Best effort: a failure here must
    /// not cost us the live connection.
    async fn save_session(&self, crypto: &SessionCrypto, mut record: AssociationRecord) {
        match crypto.save() {
            Ok(session) => {
                record.session = session;
                if let Err(e) = self.key_store.put(record).await {
                    warn!("Could not re-save the session: {e}");
                }
            }
            Err(e) => warn!("Could not serialize the resumed session: {e}"),
        }
    }

    async fn step<T>(
        &self,
        fut: impl std::future::Future<Output = crate::Result<T>>,
    ) -> Result<T, ReconnectionError> {
        match timeout(self.config.step_timeout, fut).await {
            Err(_) => Err(ReconnectionError::TimedOut),
            Ok(result) => result.map_err(map_stream_error),
        }
    }
}

fn map_stream_error(error: crate::Error) -> ReconnectionError {
    match error {
        crate::Error::Transport(TransportError::NotConnected) => ReconnectionError::Disconnected,
        other => ReconnectionError::Unknown(other),
    }
}

async fn send_plain(
    stream: &MessageStream,
    operation: OperationType,
    payload: Vec<u8>,
) -> Result<(), ReconnectionError> {
    stream
        .send(StreamMessage {
            recipient: Uuid::nil(),
            operation,
            payload,
            is_encrypted: false,
        })
        .await
        .map_err(map_stream_error)
}
