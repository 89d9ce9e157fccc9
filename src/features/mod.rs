//! Features riding on established secure channels.
//!
//! A feature is addressed by its fixed recipient UUID; the
//! [`FeatureHost`] wires every registered feature's observers onto each
//! channel as it comes up and pumps traffic into the feature callbacks.
//! Features hold the host only weakly (the host owns the features, not the
//! other way around).

pub mod system;
pub mod trusted;

use async_trait::async_trait;
use log::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use carlink_core::link::channel::{QueryResponse, ReceivedQuery, SecuredChannel};
use carlink_core::storage::Car;

use crate::config::CompanionConfig;
use system::SystemFeature;

/// One feature multiplexed on the secured channel
#[async_trait]
pub trait Feature: Send + Sync {
    /// Fixed UUID this feature is addressed by
    fn recipient(&self) -> Uuid;

    /// A known car connected (before any channel exists)
    async fn on_car_connected(&self, _car: &Car) {}

    /// The peripheral for this car went away
    async fn on_car_disconnected(&self, _car_id: Uuid) {}

    /// A secure channel to the car is live; the feature may keep the
    /// handle for outbound traffic
    async fn on_secure_channel_established(&self, _channel: SecuredChannel) {}

    /// The car was dissociated; drop everything stored for it
    async fn on_car_disassociated(&self, _car_id: Uuid) {}

    /// A client message addressed to this feature arrived
    async fn on_message_received(&self, _message: Vec<u8>, _car: &Car) {}

    /// A query addressed to this feature arrived
    async fn on_query_received(&self, _query: ReceivedQuery, _car: &Car, responder: QueryResponder) {
        // Unhandled queries answer unsuccessfully rather than dangle
        let _ = responder.respond(false, Vec::new()).await;
    }
}

/// One-shot reply handle for an incoming query
pub struct QueryResponder {
    channel: SecuredChannel,
    query_id: i32,
    recipient: Uuid,
}

impl QueryResponder {
    /// Send the response correlated to the originating query
    pub async fn respond(
        self,
        is_successful: bool,
        response: Vec<u8>,
    ) -> carlink_core::Result<()> {
        self.channel
            .send_query_response(
                QueryResponse {
                    id: self.query_id,
                    is_successful,
                    response,
                },
                self.recipient,
            )
            .await
    }
}

/// Registry of features and the channels they ride on
pub struct FeatureHost {
    features: Mutex<Vec<Arc<dyn Feature>>>,
    channels: Mutex<HashMap<Uuid, SecuredChannel>>,
}

impl FeatureHost {
    /// Host with the built-in system feature registered
    pub fn new(config: &CompanionConfig) -> Arc<Self> {
        let host = Arc::new(FeatureHost {
            features: Mutex::new(Vec::new()),
            channels: Mutex::new(HashMap::new()),
        });
        let system = SystemFeature::new(Arc::downgrade(&host), config);
        host.register(Arc::new(system));
        host
    }

    /// Add a feature. Must happen before its car's channel comes up; a
    /// feature registered later misses already-established channels.
    pub fn register(&self, feature: Arc<dyn Feature>) {
        let mut features = self.features.lock().unwrap();
        if features
            .iter()
            .any(|existing| existing.recipient() == feature.recipient())
        {
            warn!(
                "A feature for {} is already registered, ignoring",
                feature.recipient()
            );
            return;
        }
        features.push(feature);
    }

    /// Whether a feature claims this recipient UUID
    pub fn is_feature_registered(&self, recipient: Uuid) -> bool {
        self.features
            .lock()
            .unwrap()
            .iter()
            .any(|feature| feature.recipient() == recipient)
    }

    /// Channel to a connected car, if any
    pub fn channel_for(&self, car_id: Uuid) -> Option<SecuredChannel> {
        self.channels.lock().unwrap().get(&car_id).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Feature>> {
        self.features.lock().unwrap().clone()
    }

    pub(crate) async fn car_connected(&self, car: &Car) {
        for feature in self.snapshot() {
            feature.on_car_connected(car).await;
        }
    }

    pub(crate) async fn car_disconnected(&self, car_id: Uuid) {
        self.channels.lock().unwrap().remove(&car_id);
        for feature in self.snapshot() {
            feature.on_car_disconnected(car_id).await;
        }
    }

    pub(crate) async fn car_disassociated(&self, car_id: Uuid) {
        self.channels.lock().unwrap().remove(&car_id);
        for feature in self.snapshot() {
            feature.on_car_disassociated(car_id).await;
        }
    }

    /// Wire every feature onto a freshly established channel
    pub(crate) async fn channel_established(&self, channel: SecuredChannel) {
        let car = channel.car().clone();
        info!("Channel up for car {}, wiring features", car.id);
        self.channels.lock().unwrap().insert(car.id, channel.clone());

        for feature in self.snapshot() {
            let recipient = feature.recipient();
            // Hand the feature its channel before observing: anything the
            // car sends in the gap lands in the missed-message buffer and
            // is replayed when the observers register below
            feature.on_secure_channel_established(channel.clone()).await;
            match channel.observe_messages(recipient).await {
                Ok(mut observer) => {
                    let feature = feature.clone();
                    let car = car.clone();
                    tokio::task::spawn(async move {
                        while let Some(message) = observer.recv().await {
                            feature.on_message_received(message, &car).await;
                        }
                    });
                }
                Err(e) => warn!("Could not observe messages for {recipient}: {e}"),
            }
            match channel.observe_queries(recipient).await {
                Ok(mut observer) => {
                    let feature = feature.clone();
                    let car = car.clone();
                    let channel = channel.clone();
                    tokio::task::spawn(async move {
                        while let Some(query) = observer.recv().await {
                            let responder = QueryResponder {
                                channel: channel.clone(),
                                query_id: query.id,
                                recipient: query.sender,
                            };
                            feature.on_query_received(query, &car, responder).await;
                        }
                    });
                }
                Err(e) => warn!("Could not observe queries for {recipient}: {e}"),
            }
        }

        // The phone asks for its role once the channel is configured
        let role_channel = channel.clone();
        tokio::task::spawn(async move {
            match system::query_user_role(&role_channel).await {
                Ok(Some(role)) => debug!("Head unit reports user role {role:?}"),
                Ok(None) => debug!("Head unit did not report a user role"),
                Err(e) => debug!("User role query failed: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::system::{
        FeatureSupportResponse, SystemQuery, SystemQueryType, SYSTEM_FEATURE_UUID,
    };
    use super::trusted::{
        DeviceState, TrustedDeviceEvent, TrustedDeviceFeature, TrustedDeviceMessage,
        TRUSTED_DEVICE_FEATURE_UUID,
    };
    use super::*;
    use crate::config::CompanionConfig;
    use carlink_core::link::channel::ChannelEvent;
    use carlink_core::mock::{
        MemoryHistoryStore, MemoryKeyStore, MockPeripheral, MockRemote, MockSessionContext,
    };
    use carlink_core::storage::{HistoryStore, KeyStore, PhoneCredentials, TrustedDeviceRecord};
    use carlink_core::stream::{MessageStream, MessageStreamVersion};
    use carlink_core::wire::crypto::SessionCrypto;
    use carlink_core::wire::model::{DeviceMessage, OperationType, Packet, WireQuery, WireQueryResponse};
    use carlink_core::wire::ser::{gen_field_i32, to_vec};
    use assert_matches::assert_matches;
    use env_logger::Env;
    use tokio::sync::mpsc;

    fn init() {
        let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .is_test(true)
            .try_init();
    }

    const WRITE_CHAR: Uuid = uuid::uuid!("5e2a68a5-27be-43f9-8d1e-4546976fabd7");
    const CAR_UI: Uuid = uuid::uuid!("00000000-0000-0000-0000-0000000000ca");
    const KEY: &[u8] = b"feature-test-key";

    /// Head-unit side of an established channel
    struct FakeCar {
        remote: MockRemote,
        crypto: MockSessionContext,
    }

    impl FakeCar {
        async fn send(&self, operation: OperationType, recipient: Uuid, plaintext: &[u8]) {
            let envelope = DeviceMessage {
                recipient,
                is_encrypted: true,
                operation,
                payload: self.crypto.apply(plaintext),
                original_size: 0,
            };
            let packet = Packet {
                message_id: 50,
                packet_number: 1,
                total_packets: 1,
                payload: envelope.serialize().unwrap(),
            };
            self.remote
                .notify(WRITE_CHAR, packet.serialize().unwrap())
                .await;
        }

        async fn send_trusted(&self, message: TrustedDeviceMessage) {
            self.send(
                OperationType::ClientMessage,
                TRUSTED_DEVICE_FEATURE_UUID,
                &message.serialize().unwrap(),
            )
            .await;
        }

        async fn recv(&mut self) -> (OperationType, Uuid, Vec<u8>) {
            let (_, value) = self.remote.next_write().await.expect("phone hung up");
            let packet = Packet::deserialize(&value).unwrap();
            assert_eq!(packet.total_packets, 1, "test traffic must fit one packet");
            let envelope = DeviceMessage::deserialize(&packet.payload).unwrap();
            (
                envelope.operation,
                envelope.recipient,
                self.crypto.apply(&envelope.payload),
            )
        }

        /// Next client message, ignoring the phone's own queries
        async fn recv_trusted(&mut self) -> TrustedDeviceMessage {
            loop {
                let (operation, recipient, plaintext) = self.recv().await;
                if operation == OperationType::ClientMessage {
                    assert_eq!(recipient, TRUSTED_DEVICE_FEATURE_UUID);
                    return TrustedDeviceMessage::deserialize(&plaintext).unwrap();
                }
            }
        }

        async fn recv_query_response(&mut self) -> WireQueryResponse {
            loop {
                let (operation, recipient, plaintext) = self.recv().await;
                if operation == OperationType::QueryResponse {
                    assert_eq!(recipient, CAR_UI);
                    return WireQueryResponse::deserialize(&plaintext).unwrap();
                }
            }
        }
    }

    async fn establish(
        host: &Arc<FeatureHost>,
        car_id: Uuid,
    ) -> (SecuredChannel, mpsc::Receiver<ChannelEvent>, FakeCar) {
        let (peripheral, remote) = MockPeripheral::connected(185);
        let notifications = remote.subscription(WRITE_CHAR);
        let stream = MessageStream::new(
            MessageStreamVersion::V2 { compression: false },
            peripheral,
            WRITE_CHAR,
            notifications,
        );
        let crypto = SessionCrypto::new(Box::new(MockSessionContext::new(KEY.to_vec())));
        let car = Car {
            id: car_id,
            name: Some("Garage".to_string()),
        };
        let (channel, events) = SecuredChannel::establish(car, stream, crypto);
        host.channel_established(channel.clone()).await;
        (
            channel,
            events,
            FakeCar {
                remote,
                crypto: MockSessionContext::new(KEY.to_vec()),
            },
        )
    }

    struct FakeDeviceState {
        passcode_set: bool,
        locked: bool,
    }

    impl DeviceState for FakeDeviceState {
        fn is_passcode_set(&self) -> bool {
            self.passcode_set
        }
        fn is_device_locked(&self) -> bool {
            self.locked
        }
    }

    fn config() -> CompanionConfig {
        CompanionConfig {
            device_name: "Phone".to_string(),
            app_name: Some("Companion".to_string()),
            ..CompanionConfig::default()
        }
    }

    fn trusted_setup() -> (
        Arc<FeatureHost>,
        TrustedDeviceFeature,
        mpsc::Receiver<TrustedDeviceEvent>,
        Arc<MemoryKeyStore>,
        Arc<MemoryHistoryStore>,
    ) {
        let key_store = Arc::new(MemoryKeyStore::default());
        let history = Arc::new(MemoryHistoryStore::default());
        let config = config();
        let (feature, events) = TrustedDeviceFeature::new(
            key_store.clone(),
            history.clone(),
            Arc::new(FakeDeviceState {
                passcode_set: true,
                locked: false,
            }),
            &config.trusted_device,
        );
        let host = FeatureHost::new(&config);
        host.register(Arc::new(feature.clone()));
        (host, feature, events, key_store, history)
    }

    #[tokio::test]
    async fn test_system_answers_device_name_query() {
        init();
        let host = FeatureHost::new(&config());
        let car_id = Uuid::new_v4();
        let (_channel, _events, mut car) = establish(&host, car_id).await;

        let query = WireQuery {
            id: 9,
            sender: CAR_UI,
            request: SystemQuery::of(SystemQueryType::DeviceName).serialize().unwrap(),
            parameters: Vec::new(),
        };
        car.send(
            OperationType::Query,
            SYSTEM_FEATURE_UUID,
            &query.serialize().unwrap(),
        )
        .await;

        let response = car.recv_query_response().await;
        assert_eq!(response.id, 9);
        assert!(response.is_successful);
        assert_eq!(response.response, b"Phone");
    }

    #[tokio::test]
    async fn test_system_feature_support_query() {
        init();
        let (host, _feature, _events, _key_store, _history) = trusted_setup();
        let car_id = Uuid::new_v4();
        let (_channel, _channel_events, mut car) = establish(&host, car_id).await;

        let unknown = Uuid::new_v4();
        let request = SystemQuery {
            query_type: 3,
            payloads: vec![
                TRUSTED_DEVICE_FEATURE_UUID.to_string().into_bytes(),
                b"not a uuid".to_vec(),
                unknown.to_string().into_bytes(),
            ],
        };
        car.send(
            OperationType::Query,
            SYSTEM_FEATURE_UUID,
            &WireQuery {
                id: 1,
                sender: CAR_UI,
                request: request.serialize().unwrap(),
                parameters: Vec::new(),
            }
            .serialize()
            .unwrap(),
        )
        .await;

        let response = car.recv_query_response().await;
        assert!(response.is_successful);
        let parsed = FeatureSupportResponse::deserialize(&response.response).unwrap();
        // The malformed UUID is silently omitted
        assert_eq!(parsed.statuses.len(), 2);
        assert_eq!(
            parsed.statuses[0].feature_id,
            TRUSTED_DEVICE_FEATURE_UUID.to_string()
        );
        assert!(parsed.statuses[0].supported);
        assert_eq!(parsed.statuses[1].feature_id, unknown.to_string());
        assert!(!parsed.statuses[1].supported);
    }

    #[tokio::test]
    async fn test_user_role_is_queried_on_establishment() {
        init();
        let host = FeatureHost::new(&config());
        let (_channel, _events, mut car) = establish(&host, Uuid::new_v4()).await;

        let (operation, recipient, plaintext) = car.recv().await;
        assert_eq!(operation, OperationType::Query);
        assert_eq!(recipient, SYSTEM_FEATURE_UUID);
        let wire = WireQuery::deserialize(&plaintext).unwrap();
        let query = SystemQuery::deserialize(&wire.request).unwrap();
        assert_eq!(query.query_type, 4);

        // Answer driver; the phone just logs it, so no panic is the test
        let role = to_vec(gen_field_i32(1, 1), "role").unwrap();
        car.send(
            OperationType::QueryResponse,
            wire.sender,
            &WireQueryResponse {
                id: wire.id,
                is_successful: true,
                response: role,
            }
            .serialize()
            .unwrap(),
        )
        .await;
    }

    #[tokio::test]
    async fn test_enrollment_then_unlock() {
        init();
        let (host, _feature, mut events, key_store, history) = trusted_setup();
        let car_id = Uuid::new_v4();

        // First connection: the car starts enrollment
        let (_channel, _channel_events, mut car) = establish(&host, car_id).await;
        car.send_trusted(TrustedDeviceMessage::StartEnrollment).await;

        let token = match car.recv_trusted().await {
            TrustedDeviceMessage::EscrowToken(token) => token,
            other => panic!("expected an escrow token, got {other:?}"),
        };
        assert_eq!(token.len(), 16);

        let handle = vec![0xAB, 0xCD, 0xEF];
        car.send_trusted(TrustedDeviceMessage::Handle(handle.clone()))
            .await;
        assert_matches!(car.recv_trusted().await, TrustedDeviceMessage::Ack);
        assert_matches!(
            events.recv().await,
            Some(TrustedDeviceEvent::DidCompleteEnrolling { car_id: id }) if id == car_id
        );

        let record = key_store.trusted_record(car_id).await.unwrap().unwrap();
        assert_eq!(
            record.credentials,
            Some(PhoneCredentials {
                escrow_token: token.clone(),
                handle: handle.clone(),
            })
        );

        // Next connection: credentials go out unprompted
        host.car_disconnected(car_id).await;
        let (_channel2, _channel_events2, mut car2) = establish(&host, car_id).await;

        let credentials = match car2.recv_trusted().await {
            TrustedDeviceMessage::UnlockCredentials(credentials) => credentials,
            other => panic!("expected credentials, got {other:?}"),
        };
        assert_eq!(credentials.escrow_token, token);
        assert_eq!(credentials.handle, handle);
        assert_matches!(
            events.recv().await,
            Some(TrustedDeviceEvent::DidStartUnlocking { .. })
        );

        car2.send_trusted(TrustedDeviceMessage::Ack).await;
        assert_matches!(
            events.recv().await,
            Some(TrustedDeviceEvent::DidFinishUnlocking { car_id: id }) if id == car_id
        );
        assert_eq!(history.list(car_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_state_sync_from_car_unenrolls_silently() {
        init();
        let (host, feature, mut events, key_store, _history) = trusted_setup();
        let car_id = Uuid::new_v4();
        key_store
            .put_trusted_record(
                car_id,
                TrustedDeviceRecord {
                    credentials: Some(PhoneCredentials {
                        escrow_token: vec![1],
                        handle: vec![2],
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (_channel, _channel_events, mut car) = establish(&host, car_id).await;
        // The phone will try to unlock on establishment; swallow that
        assert_matches!(
            car.recv_trusted().await,
            TrustedDeviceMessage::UnlockCredentials(_)
        );
        assert_matches!(
            events.recv().await,
            Some(TrustedDeviceEvent::DidStartUnlocking { .. })
        );

        car.send_trusted(TrustedDeviceMessage::StateSync { enabled: false })
            .await;
        assert_matches!(
            events.recv().await,
            Some(TrustedDeviceEvent::DidUnenroll {
                initiated_from_car: true,
                ..
            })
        );
        assert!(!feature.is_enrolled(car_id).await);

        // Ignored from an unenrolled car, and never echoed back
        car.send_trusted(TrustedDeviceMessage::StateSync { enabled: true })
            .await;
        tokio::task::yield_now().await;
        assert!(!feature.is_enrolled(car_id).await);
    }

    #[tokio::test]
    async fn test_unenroll_offline_queues_a_sync() {
        init();
        let (host, feature, mut events, key_store, _history) = trusted_setup();
        let car_id = Uuid::new_v4();
        key_store
            .put_trusted_record(
                car_id,
                TrustedDeviceRecord {
                    credentials: Some(PhoneCredentials {
                        escrow_token: vec![1],
                        handle: vec![2],
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // No channel: the unenrollment must queue
        feature.unenroll(car_id).await.unwrap();
        assert_matches!(
            events.recv().await,
            Some(TrustedDeviceEvent::DidUnenroll {
                initiated_from_car: false,
                ..
            })
        );
        let record = key_store.trusted_record(car_id).await.unwrap().unwrap();
        assert!(record.pending_disable_sync);
        assert!(record.credentials.is_none());

        // On the next channel the sync flushes and the record clears
        let (_channel, _channel_events, mut car) = establish(&host, car_id).await;
        assert_matches!(
            car.recv_trusted().await,
            TrustedDeviceMessage::StateSync { enabled: false }
        );
        // Flushing happens before the host finishes wiring, so the record
        // is gone by the time establish returned
        assert!(key_store.trusted_record(car_id).await.unwrap().is_none());
    }
}
