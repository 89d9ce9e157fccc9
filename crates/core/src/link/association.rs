//! First-time pairing with a head unit.
//!
//! The flow is fixed by the resolved security version: V1 identifies the
//! phone in the clear before any encryption, V2 and later establish
//! encryption first and send the device id and a fresh authentication key
//! inside it. Every awaited transport step runs under the configured step
//! timeout; the pairing-code confirmation is the one step that waits on a
//! human and is exempt.

use log::*;
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use super::channel::{ChannelEvent, SecuredChannel};
use super::oob::OutOfBandTokenProvider;
use super::version::{exchange_versions, MessageSecurityVersion, VersionError};
use super::LinkConfig;
use crate::storage::{AssociationRecord, AuthKey, Car, KeyStore, StorageError};
use crate::stream::{MessageStream, MessageStreamVersion, StreamMessage};
use crate::transport::{BlePeripheral, TransportError};
use crate::wire::crypto::{
    oob_encrypt_code, HandshakeProgress, KeyExchange, KeyExchangeFactory, PairingCode,
    SecurityError, SessionCrypto,
};
use crate::wire::model::{
    CapabilitiesExchange, OperationType, VerificationCode, VerificationCodeState,
};

/// Confirmation string a security V1 head unit sends once the user accepts
/// the displayed pairing code
pub const PAIRING_CODE_CONFIRMATION: &str = "Pairing code confirmed";

/// Terminal failures of an association attempt
#[derive(Debug, Error)]
pub enum AssociationError {
    /// The association service could not be discovered
    #[error("Could not discover the association service")]
    CannotDiscoverServices,
    /// The service is present but its characteristics are not usable
    #[error("Could not discover the association characteristics")]
    CannotDiscoverCharacteristics,
    /// The version exchange itself failed
    #[error("Version resolution failed: {0}")]
    VersionResolutionFailed(VersionError),
    /// Versions resolved to nothing both sides speak
    #[error("No mutually supported version")]
    VersionNotSupported,
    /// The user or head unit rejected the pairing code
    #[error("Pairing code rejected")]
    PairingCodeRejected,
    /// The key exchange failed
    #[error("Could not establish encryption: {0}")]
    CannotEstablishEncryption(SecurityError),
    /// The association record could not be persisted
    #[error("Could not store the association: {0}")]
    CannotStoreAssociation(StorageError),
    /// The peripheral went away mid-flow
    #[error("Peripheral disconnected")]
    Disconnected,
    /// A step did not complete within the step timeout
    #[error("Timed out waiting for the car")]
    TimedOut,
    /// Anything else
    #[error("Association failed: {0}")]
    Unknown(crate::Error),
}

/// Progress callbacks surfaced while an association runs
#[derive(Debug)]
pub enum AssociationEvent {
    /// The car reported its identifier
    ReceivedCarId(Uuid),
    /// Show this code to the user for comparison with the head unit
    RequiresPairingCodeDisplay(PairingCode),
}

/// Runs association attempts against freshly discovered peripherals
pub struct Associator {
    config: LinkConfig,
    key_exchange: Arc<dyn KeyExchangeFactory>,
    key_store: Arc<dyn KeyStore>,
    oob_provider: Option<Arc<dyn OutOfBandTokenProvider>>,
}

impl Associator {
    /// Associator without out-of-band support
    pub fn new(
        config: LinkConfig,
        key_exchange: Arc<dyn KeyExchangeFactory>,
        key_store: Arc<dyn KeyStore>,
    ) -> Self {
        Associator {
            config,
            key_exchange,
            key_store,
            oob_provider: None,
        }
    }

    /// Attach an out-of-band token source for security V4 associations
    pub fn with_oob_provider(mut self, provider: Arc<dyn OutOfBandTokenProvider>) -> Self {
        self.oob_provider = Some(provider);
        self
    }

    /// Associate with a connected peripheral advertising the association
    /// service.
    ///
    /// Progress (car id, pairing code) is reported through `events`; on
    /// success the persisted record exists and the secured channel is live.
    pub async fn associate(
        &self,
        peripheral: Arc<dyn BlePeripheral>,
        advertised_name: Option<String>,
        events: mpsc::Sender<AssociationEvent>,
    ) -> Result<(SecuredChannel, mpsc::Receiver<ChannelEvent>), AssociationError> {
        let characteristics = timeout(
            self.config.step_timeout,
            peripheral.discover_characteristics(self.config.association_service),
        )
        .await
        .map_err(|_| AssociationError::TimedOut)?
        .map_err(|_| AssociationError::CannotDiscoverServices)?;
        if !characteristics.contains(&self.config.client_write_characteristic)
            || !characteristics.contains(&self.config.server_write_characteristic)
        {
            return Err(AssociationError::CannotDiscoverCharacteristics);
        }

        let notifications = timeout(
            self.config.step_timeout,
            peripheral.subscribe(self.config.server_write_characteristic),
        )
        .await
        .map_err(|_| AssociationError::TimedOut)?
        .map_err(|_| AssociationError::CannotDiscoverCharacteristics)?;

        let mut stream = MessageStream::new(
            MessageStreamVersion::Passthrough,
            peripheral,
            self.config.client_write_characteristic,
            notifications,
        );
        let resolved = exchange_versions(&mut stream, self.config.step_timeout)
            .await
            .map_err(|e| match e {
                VersionError::VersionNotSupported => AssociationError::VersionNotSupported,
                other => AssociationError::VersionResolutionFailed(other),
            })?;
        stream.set_version(resolved.stream_version);
        info!(
            "Associating with security {:?}",
            resolved.security_version
        );

        let (car_id, crypto, auth_key) = match resolved.security_version {
            MessageSecurityVersion::V1 => self.associate_v1(&mut stream, &events).await?,
            version => self.associate_v2_plus(version, &mut stream, &events).await?,
        };

        let car = Car {
            id: car_id,
            name: advertised_name,
        };
        let session = crypto
            .save()
            .map_err(AssociationError::CannotEstablishEncryption)?;
        self.key_store
            .put(AssociationRecord {
                car: car.clone(),
                session,
                auth_key,
                security_version: resolved.security_version,
            })
            .await
            .map_err(AssociationError::CannotStoreAssociation)?;
        info!("Associated with car {}", car.id);

        Ok(SecuredChannel::establish(car, stream, crypto))
    }

    /// Device id in the clear, car id in the clear, then the key exchange
    /// confirmed by the head unit's pairing string.
    async fn associate_v1(
        &self,
        stream: &mut MessageStream,
        events: &mpsc::Sender<AssociationEvent>,
    ) -> Result<(Uuid, SessionCrypto, Option<AuthKey>), AssociationError> {
        send_plain(
            stream,
            OperationType::ClientMessage,
            self.config.device_id.as_bytes().to_vec(),
        )
        .await?;

        let car_id = self.receive_car_id(stream, None, events).await?;

        let (exchange, token) = self.run_key_exchange(stream).await?;
        let code = PairingCode::from_token(&token);
        let _ = events
            .send(AssociationEvent::RequiresPairingCodeDisplay(code))
            .await;

        // The confirmation waits on the user at the head unit; deliberately
        // not under the step timeout
        let confirmation = stream.recv().await.map_err(map_stream_error)?;
        if confirmation.payload != PAIRING_CODE_CONFIRMATION.as_bytes() {
            return Err(AssociationError::PairingCodeRejected);
        }
        let context = exchange
            .notify_verification_accepted()
            .map_err(AssociationError::CannotEstablishEncryption)?;
        Ok((car_id, SessionCrypto::new(context), None))
    }

    /// Encryption first; the car id arrives encrypted and the phone answers
    /// with its device id and a fresh authentication key.
    async fn associate_v2_plus(
        &self,
        version: MessageSecurityVersion,
        stream: &mut MessageStream,
        events: &mpsc::Sender<AssociationEvent>,
    ) -> Result<(Uuid, SessionCrypto, Option<AuthKey>), AssociationError> {
        let (exchange, token) = self.run_key_exchange(stream).await?;

        match version {
            MessageSecurityVersion::V2 | MessageSecurityVersion::V3 => {
                // Self-confirmed: display the code but do not wait
                let code = PairingCode::from_token(&token);
                let _ = events
                    .send(AssociationEvent::RequiresPairingCodeDisplay(code))
                    .await;
            }
            MessageSecurityVersion::V4 => {
                self.confirm_v4(stream, events, &token).await?;
            }
            MessageSecurityVersion::V1 => unreachable!("V1 has its own flow"),
        }

        let context = exchange
            .notify_verification_accepted()
            .map_err(AssociationError::CannotEstablishEncryption)?;
        let crypto = SessionCrypto::new(context);

        if version == MessageSecurityVersion::V3 {
            // Deprecated capabilities slot; both sides send empty and
            // ignore the contents
            let payload = CapabilitiesExchange::default()
                .serialize()
                .map_err(|e| AssociationError::Unknown(e.into()))?;
            send_encrypted(stream, &crypto, OperationType::ClientMessage, payload).await?;
            let reply = self.step(stream.recv()).await?;
            let _ = self.decrypt(&crypto, reply)?;
        }

        let car_id = self.receive_car_id(stream, Some(&crypto), events).await?;

        let auth_key: AuthKey = rand::thread_rng().gen();
        let mut payload = self.config.device_id.as_bytes().to_vec();
        payload.extend_from_slice(&auth_key);
        send_encrypted(stream, &crypto, OperationType::ClientMessage, payload).await?;

        Ok((car_id, crypto, Some(auth_key)))
    }

    /// Security V4 pairing confirmation: out-of-band when a token source
    /// delivers one in time, visual otherwise.
    async fn confirm_v4(
        &self,
        stream: &mut MessageStream,
        events: &mpsc::Sender<AssociationEvent>,
        token: &[u8],
    ) -> Result<(), AssociationError> {
        let oob_token = match &self.oob_provider {
            Some(provider) => timeout(self.config.step_timeout, provider.request_token())
                .await
                .unwrap_or(None),
            None => None,
        };
        let code = PairingCode::from_token(token);

        match oob_token {
            Some(oob_token) => {
                let encrypted = oob_encrypt_code(&oob_token, code.as_str().as_bytes())
                    .map_err(AssociationError::CannotEstablishEncryption)?;
                let message = VerificationCode {
                    state: VerificationCodeState::OobVerification,
                    payload: encrypted,
                };
                send_plain(
                    stream,
                    OperationType::EncryptionHandshake,
                    message
                        .serialize()
                        .map_err(|e| AssociationError::Unknown(e.into()))?,
                )
                .await?;
                // The head unit confirms on its own; a machine step, so the
                // step timeout applies
                let reply = self.step(stream.recv()).await?;
                expect_visual_confirmation(&reply.payload)
            }
            None => {
                let message = VerificationCode {
                    state: VerificationCodeState::VisualVerification,
                    payload: Vec::new(),
                };
                send_plain(
                    stream,
                    OperationType::EncryptionHandshake,
                    message
                        .serialize()
                        .map_err(|e| AssociationError::Unknown(e.into()))?,
                )
                .await?;
                let _ = events
                    .send(AssociationEvent::RequiresPairingCodeDisplay(code))
                    .await;
                // Waits on the user; exempt from the step timeout
                let reply = stream.recv().await.map_err(map_stream_error)?;
                expect_visual_confirmation(&reply.payload)
            }
        }
    }

    /// Drive the key exchange until it only awaits verification
    async fn run_key_exchange(
        &self,
        stream: &mut MessageStream,
    ) -> Result<(Box<dyn KeyExchange>, Vec<u8>), AssociationError> {
        let mut exchange = self.key_exchange.begin_exchange();
        let first = exchange
            .initial_message()
            .map_err(AssociationError::CannotEstablishEncryption)?;
        send_plain(stream, OperationType::EncryptionHandshake, first).await?;

        loop {
            let message = self.step(stream.recv()).await?;
            match exchange
                .handle_message(&message.payload)
                .map_err(AssociationError::CannotEstablishEncryption)?
            {
                HandshakeProgress::Continue(reply) => {
                    send_plain(stream, OperationType::EncryptionHandshake, reply).await?;
                }
                HandshakeProgress::AwaitingVerification { token, reply } => {
                    if let Some(reply) = reply {
                        send_plain(stream, OperationType::EncryptionHandshake, reply).await?;
                    }
                    return Ok((exchange, token));
                }
            }
        }
    }

    /// Wait for the 16-byte car id, decrypting when a session exists
    async fn receive_car_id(
        &self,
        stream: &mut MessageStream,
        crypto: Option<&SessionCrypto>,
        events: &mpsc::Sender<AssociationEvent>,
    ) -> Result<Uuid, AssociationError> {
        let message = self.step(stream.recv()).await?;
        let payload = match crypto {
            Some(crypto) => self.decrypt(crypto, message)?,
            None => message.payload,
        };
        let car_id = Uuid::from_slice(&payload).map_err(|_| {
            AssociationError::Unknown(
                crate::ProtocolError::BadRecipient(payload.len()).into(),
            )
        })?;
        let _ = events.send(AssociationEvent::ReceivedCarId(car_id)).await;
        Ok(car_id)
    }

    fn decrypt(
        &self,
        crypto: &SessionCrypto,
        message: StreamMessage,
    ) -> Result<Vec<u8>, AssociationError> {
        if message.is_encrypted {
            crypto
                .decrypt(&message.payload)
                .map_err(AssociationError::CannotEstablishEncryption)
        } else {
            Ok(message.payload)
        }
    }

    /// Run one awaited step under the configured timeout
    async fn step<T>(
        &self,
        fut: impl std::future::Future<Output = crate::Result<T>>,
    ) -> Result<T, AssociationError> {
        match timeout(self.config.step_timeout, fut).await {
            Err(_) => Err(AssociationError::TimedOut),
            Ok(result) => result.map_err(map_stream_error),
        }
    }
}

fn expect_visual_confirmation(payload: &[u8]) -> Result<(), AssociationError> {
    match VerificationCode::deserialize(payload) {
        Ok(VerificationCode {
            state: VerificationCodeState::VisualConfirmation,
            ..
        }) => Ok(()),
        _ => Err(AssociationError::PairingCodeRejected),
    }
}

fn map_stream_error(error: crate::Error) -> AssociationError {
    match error {
        crate::Error::Transport(TransportError::NotConnected) => AssociationError::Disconnected,
        other => AssociationError::Unknown(other),
    }
}

async fn send_plain(
    stream: &MessageStream,
    operation: OperationType,
    payload: Vec<u8>,
) -> Result<(), AssociationError> {
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

async fn send_encrypted(
    stream: &MessageStream,
    crypto: &SessionCrypto,
    operation: OperationType,
    payload: Vec<u8>,
) -> Result<(), AssociationError> {
    let ciphertext = crypto
        .encrypt(&payload)
        .map_err(AssociationError::CannotEstablishEncryption)?;
    stream
        .send(StreamMessage {
            recipient: Uuid::nil(),
            operation,
            payload: ciphertext,
            is_encrypted: true,
        })
        .await
        .map_err(map_stream_error)
}
