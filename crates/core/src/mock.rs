//! Test doubles for the seams of the stack.
//!
//! Everything here is deterministic and channel-backed: a mock peripheral
//! whose far side is driven through [`MockRemote`], a mock central with a
//! scripted scan feed, a toy key exchange standing in for UKey2, and
//! in-memory stores. Enabled for this crate's tests and, through the
//! `mock` cargo feature, for downstream crates' tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::storage::{
    AssociationRecord, HistoryStore, KeyStore, StorageError, TrustedDeviceRecord, UnlockEvent,
};
use crate::transport::{
    AdapterState, BleCentral, BlePeripheral, Discovery, PeripheralState, TransportError,
};
use crate::wire::crypto::{
    HandshakeProgress, KeyExchange, KeyExchangeFactory, SecurityError, SessionContext,
};
use crate::wire::model::{DeviceMessage, Packet, VersionExchange};

const MOCK_SESSION_PREFIX: &[u8] = b"mock-session:";

/// First message of the mock key exchange
pub const MOCK_PHONE_HELLO: &[u8] = b"phone-hello";
/// Prefix of the car's reply; the session key follows it
pub const MOCK_CAR_HELLO_PREFIX: &[u8] = b"car-hello:";
/// Final phone handshake message
pub const MOCK_PHONE_FINISH: &[u8] = b"phone-finish";

type Notifiers = Arc<Mutex<HashMap<Uuid, mpsc::Sender<Vec<u8>>>>>;

/// Channel-backed [`BlePeripheral`]
pub struct MockPeripheral {
    id: Uuid,
    name: Option<String>,
    mtu: usize,
    connected: Arc<AtomicBool>,
    state: watch::Sender<PeripheralState>,
    services: Mutex<HashMap<Uuid, Vec<Uuid>>>,
    reads: Mutex<HashMap<Uuid, Vec<u8>>>,
    writes: mpsc::Sender<(Uuid, Vec<u8>)>,
    notifiers: Notifiers,
}

/// The far (head-unit) side of a [`MockPeripheral`]
pub struct MockRemote {
    writes: mpsc::Receiver<(Uuid, Vec<u8>)>,
    notifiers: Notifiers,
    state: watch::Sender<PeripheralState>,
    connected: Arc<AtomicBool>,
}

impl MockPeripheral {
    /// Fresh disconnected peripheral with the given identity
    pub fn new(id: Uuid, name: Option<String>, mtu: usize) -> (Arc<Self>, MockRemote) {
        Self::build(id, name, mtu, PeripheralState::Disconnected)
    }

    /// Fresh already-connected peripheral, for tests below the orchestrator
    pub fn connected(mtu: usize) -> (Arc<Self>, MockRemote) {
        Self::build(
            Uuid::new_v4(),
            Some("Mock".to_string()),
            mtu,
            PeripheralState::Connected,
        )
    }

    fn build(
        id: Uuid,
        name: Option<String>,
        mtu: usize,
        state: PeripheralState,
    ) -> (Arc<Self>, MockRemote) {
        let (state_tx, _) = watch::channel(state);
        let (write_tx, write_rx) = mpsc::channel(256);
        let notifiers: Notifiers = Default::default();
        let connected = Arc::new(AtomicBool::new(state == PeripheralState::Connected));
        let peripheral = Arc::new(MockPeripheral {
            id,
            name,
            mtu,
            connected: connected.clone(),
            state: state_tx.clone(),
            services: Default::default(),
            reads: Default::default(),
            writes: write_tx,
            notifiers: notifiers.clone(),
        });
        let remote = MockRemote {
            writes: write_rx,
            notifiers,
            state: state_tx,
            connected,
        };
        (peripheral, remote)
    }

    /// Declare a service and its characteristics
    pub fn add_service(&self, service: Uuid, characteristics: Vec<Uuid>) {
        self.services
            .lock()
            .unwrap()
            .insert(service, characteristics);
    }

    /// Set the canned value a read of `characteristic` returns
    pub fn set_read_value(&self, characteristic: Uuid, value: Vec<u8>) {
        self.reads.lock().unwrap().insert(characteristic, value);
    }

    /// Mark the peripheral connected, as the central would after connecting
    pub fn set_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.state.send(PeripheralState::Connected);
    }
}

#[async_trait]
impl BlePeripheral for MockPeripheral {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn max_write_len(&self) -> usize {
        self.mtu
    }

    fn state(&self) -> watch::Receiver<PeripheralState> {
        self.state.subscribe()
    }

    async fn discover_characteristics(&self, service: Uuid) -> Result<Vec<Uuid>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.services
            .lock()
            .unwrap()
            .get(&service)
            .cloned()
            .ok_or(TransportError::ServiceNotFound(service))
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let (tx, rx) = mpsc::channel(64);
        self.notifiers.lock().unwrap().insert(characteristic, tx);
        Ok(rx)
    }

    async fn write_value(
        &self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.writes
            .send((characteristic, value.to_vec()))
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    async fn read_value(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.reads
            .lock()
            .unwrap()
            .get(&characteristic)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(characteristic))
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.state.send(PeripheralState::Disconnected);
        self.notifiers.lock().unwrap().clear();
    }
}

impl MockRemote {
    /// Open a notification stream for `characteristic` without going
    /// through [`BlePeripheral::subscribe`], for tests that build streams
    /// directly.
    pub fn subscription(&self, characteristic: Uuid) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(64);
        self.notifiers.lock().unwrap().insert(characteristic, tx);
        rx
    }

    /// Next value the phone wrote, in order
    pub async fn next_write(&mut self) -> Option<(Uuid, Vec<u8>)> {
        self.writes.recv().await
    }

    /// Next already-buffered write, if any
    pub fn try_next_write(&mut self) -> Result<(Uuid, Vec<u8>), mpsc::error::TryRecvError> {
        self.writes.try_recv()
    }

    /// Deliver a notification to whoever subscribed to `characteristic`
    pub async fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        let sender = self
            .notifiers
            .lock()
            .unwrap()
            .get(&characteristic)
            .cloned()
            .expect("no subscriber on characteristic");
        sender.send(value).await.expect("subscriber went away");
    }

    /// Drop the link from the car side
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.state.send(PeripheralState::Disconnected);
        self.notifiers.lock().unwrap().clear();
    }
}

/// Drives the head-unit side of a framed connection in state-machine
/// tests: reads the phone's packets off a [`MockRemote`], answers with
/// single-packet framed messages, and scripts the version exchange.
pub struct MockHeadUnit {
    /// The underlying remote, for raw access
    pub remote: MockRemote,
    notify_characteristic: Uuid,
    next_message_id: i32,
}

impl MockHeadUnit {
    /// Wrap `remote`, notifying on `notify_characteristic` (the
    /// characteristic the phone subscribes to)
    pub fn new(remote: MockRemote, notify_characteristic: Uuid) -> Self {
        MockHeadUnit {
            remote,
            notify_characteristic,
            next_message_id: 0,
        }
    }

    /// Next raw write value from the phone
    pub async fn next_raw(&mut self) -> Vec<u8> {
        self.remote.next_write().await.expect("phone hung up").1
    }

    /// Deliver a raw notification value
    pub async fn notify_raw(&self, value: Vec<u8>) {
        self.remote.notify(self.notify_characteristic, value).await;
    }

    /// Reassemble the phone's next framed message
    pub async fn recv_message(&mut self) -> DeviceMessage {
        let first = Packet::deserialize(&self.next_raw().await).expect("not a packet");
        let total = first.total_packets;
        let mut bytes = first.payload;
        for _ in 1..total {
            let next = Packet::deserialize(&self.next_raw().await).expect("not a packet");
            bytes.extend_from_slice(&next.payload);
        }
        DeviceMessage::deserialize(&bytes).expect("not a device message")
    }

    /// Send one framed message to the phone
    pub async fn send_message(&mut self, message: DeviceMessage) {
        let bytes = message.serialize().expect("serialize message");
        let packet = Packet {
            message_id: self.next_message_id,
            packet_number: 1,
            total_packets: 1,
            payload: bytes,
        };
        self.next_message_id += 1;
        self.notify_raw(packet.serialize().expect("serialize packet")).await;
    }

    /// Answer the phone's version exchange with the given maxima
    pub async fn exchange_versions(&mut self, max_messaging: i32, max_security: i32) {
        let request = self.next_raw().await;
        VersionExchange::deserialize(&request).expect("not a version exchange");
        let reply = VersionExchange {
            min_messaging_version: 2,
            max_messaging_version: max_messaging,
            min_security_version: 1,
            max_security_version: max_security,
        };
        self.notify_raw(reply.serialize().unwrap()).await;
    }
}

/// Scripted [`BleCentral`]
pub struct MockCentral {
    adapter: watch::Sender<AdapterState>,
    scan: Mutex<Option<ActiveScan>>,
    peripherals: Mutex<HashMap<Uuid, Arc<MockPeripheral>>>,
}

struct ActiveScan {
    services: Vec<Uuid>,
    feed: mpsc::Sender<Discovery>,
}

impl MockCentral {
    /// Powered-on central with no known peripherals
    pub fn new() -> Arc<Self> {
        let (adapter, _) = watch::channel(AdapterState::PoweredOn);
        Arc::new(MockCentral {
            adapter,
            scan: Default::default(),
            peripherals: Default::default(),
        })
    }

    /// Flip the adapter power state
    pub fn set_adapter_state(&self, state: AdapterState) {
        let _ = self.adapter.send(state);
    }

    /// Make `peripheral` connectable through this central
    pub fn register(&self, peripheral: Arc<MockPeripheral>) {
        self.peripherals
            .lock()
            .unwrap()
            .insert(peripheral.id(), peripheral);
    }

    /// Service filter of the active scan, if one is running
    pub fn scan_filter(&self) -> Option<Vec<Uuid>> {
        self.scan
            .lock()
            .unwrap()
            .as_ref()
            .map(|scan| scan.services.clone())
    }

    /// Push a discovery into the active scan. Returns false when no scan is
    /// running or the scanner went away.
    pub async fn advertise(&self, discovery: Discovery) -> bool {
        let feed = match self.scan.lock().unwrap().as_ref() {
            Some(scan) => scan.feed.clone(),
            None => return false,
        };
        feed.send(discovery).await.is_ok()
    }
}

#[async_trait]
impl BleCentral for MockCentral {
    fn adapter_state(&self) -> watch::Receiver<AdapterState> {
        self.adapter.subscribe()
    }

    async fn scan(&self, services: &[Uuid]) -> Result<mpsc::Receiver<Discovery>, TransportError> {
        if *self.adapter.borrow() != AdapterState::PoweredOn {
            return Err(TransportError::PoweredOff);
        }
        let (tx, rx) = mpsc::channel(16);
        *self.scan.lock().unwrap() = Some(ActiveScan {
            services: services.to_vec(),
            feed: tx,
        });
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.scan.lock().unwrap().take();
        Ok(())
    }

    async fn connect(&self, peripheral: &Arc<dyn BlePeripheral>) -> Result<(), TransportError> {
        let known = self
            .peripherals
            .lock()
            .unwrap()
            .get(&peripheral.id())
            .cloned();
        match known {
            Some(mock) => {
                mock.set_connected();
                Ok(())
            }
            None => Err(TransportError::ConnectFailed(format!(
                "unknown peripheral {}",
                peripheral.id()
            ))),
        }
    }
}

/// Symmetric toy cipher: XOR against the cycled session key.
///
/// Deterministic and self-inverse, which is all the protocol tests need.
pub struct MockSessionContext {
    key: Vec<u8>,
}

impl MockSessionContext {
    /// Context over a fixed key
    pub fn new(key: Vec<u8>) -> Self {
        MockSessionContext { key }
    }

    /// The raw cipher transform, for driving the head-unit side in tests.
    /// XOR is self-inverse so this both encrypts and decrypts.
    pub fn apply(&self, data: &[u8]) -> Vec<u8> {
        self.key
            .iter()
            .cycle()
            .zip(data)
            .map(|(key, byte)| byte ^ key)
            .collect()
    }
}

impl SessionContext for MockSessionContext {
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if self.key.is_empty() {
            return Err(SecurityError::CryptoFailure("empty session key".into()));
        }
        Ok(self.apply(plaintext))
    }

    fn decode(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if self.key.is_empty() {
            return Err(SecurityError::CryptoFailure("empty session key".into()));
        }
        Ok(self.apply(ciphertext))
    }

    fn save(&self) -> Result<Vec<u8>, SecurityError> {
        let mut saved = MOCK_SESSION_PREFIX.to_vec();
        saved.extend_from_slice(&self.key);
        Ok(saved)
    }
}

#[derive(Default)]
enum MockExchangeState {
    #[default]
    Fresh,
    Started,
    Verifying {
        key: Vec<u8>,
    },
}

/// Toy [`KeyExchange`] with a fixed three-message script.
///
/// Phone sends [`MOCK_PHONE_HELLO`]; the car replies with
/// [`MOCK_CAR_HELLO_PREFIX`] followed by the session key; the phone answers
/// [`MOCK_PHONE_FINISH`] and the key doubles as the verification token.
#[derive(Default)]
pub struct MockKeyExchange {
    state: MockExchangeState,
}

impl KeyExchange for MockKeyExchange {
    fn initial_message(&mut self) -> Result<Vec<u8>, SecurityError> {
        self.state = MockExchangeState::Started;
        Ok(MOCK_PHONE_HELLO.to_vec())
    }

    fn handle_message(&mut self, message: &[u8]) -> Result<HandshakeProgress, SecurityError> {
        match self.state {
            MockExchangeState::Started => {
                let key = message
                    .strip_prefix(MOCK_CAR_HELLO_PREFIX)
                    .ok_or_else(|| SecurityError::KeyExchange("unexpected car hello".into()))?
                    .to_vec();
                if key.is_empty() {
                    return Err(SecurityError::KeyExchange("car sent no key".into()));
                }
                self.state = MockExchangeState::Verifying { key: key.clone() };
                Ok(HandshakeProgress::AwaitingVerification {
                    token: key,
                    reply: Some(MOCK_PHONE_FINISH.to_vec()),
                })
            }
            _ => Err(SecurityError::KeyExchange("message out of order".into())),
        }
    }

    fn notify_verification_accepted(
        self: Box<Self>,
    ) -> Result<Box<dyn SessionContext>, SecurityError> {
        match self.state {
            MockExchangeState::Verifying { key } => Ok(Box::new(MockSessionContext::new(key))),
            _ => Err(SecurityError::KeyExchange(
                "verification before exchange completed".into(),
            )),
        }
    }
}

/// Factory for [`MockKeyExchange`] and resumption of its saved sessions
#[derive(Default)]
pub struct MockKeyExchangeFactory;

impl KeyExchangeFactory for MockKeyExchangeFactory {
    fn begin_exchange(&self) -> Box<dyn KeyExchange> {
        Box::<MockKeyExchange>::default()
    }

    fn resume_session(&self, saved: &[u8]) -> Result<Box<dyn SessionContext>, SecurityError> {
        let key = saved
            .strip_prefix(MOCK_SESSION_PREFIX)
            .ok_or_else(|| SecurityError::CryptoFailure("not a mock session blob".into()))?;
        if key.is_empty() {
            return Err(SecurityError::CryptoFailure("empty session key".into()));
        }
        Ok(Box::new(MockSessionContext::new(key.to_vec())))
    }
}

/// In-memory [`KeyStore`]
#[derive(Default)]
pub struct MemoryKeyStore {
    records: Mutex<HashMap<Uuid, AssociationRecord>>,
    trusted: Mutex<HashMap<Uuid, TrustedDeviceRecord>>,
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn list(&self) -> Result<Vec<AssociationRecord>, StorageError> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    async fn get(&self, car_id: Uuid) -> Result<Option<AssociationRecord>, StorageError> {
        Ok(self.records.lock().unwrap().get(&car_id).cloned())
    }

    async fn put(&self, record: AssociationRecord) -> Result<(), StorageError> {
        self.records.lock().unwrap().insert(record.car.id, record);
        Ok(())
    }

    async fn delete(&self, car_id: Uuid) -> Result<(), StorageError> {
        self.records.lock().unwrap().remove(&car_id);
        Ok(())
    }

    async fn trusted_record(
        &self,
        car_id: Uuid,
    ) -> Result<Option<TrustedDeviceRecord>, StorageError> {
        Ok(self.trusted.lock().unwrap().get(&car_id).cloned())
    }

    async fn put_trusted_record(
        &self,
        car_id: Uuid,
        record: TrustedDeviceRecord,
    ) -> Result<(), StorageError> {
        self.trusted.lock().unwrap().insert(car_id, record);
        Ok(())
    }

    async fn delete_trusted_record(&self, car_id: Uuid) -> Result<(), StorageError> {
        self.trusted.lock().unwrap().remove(&car_id);
        Ok(())
    }
}

/// In-memory [`HistoryStore`]
#[derive(Default)]
pub struct MemoryHistoryStore {
    events: Mutex<Vec<UnlockEvent>>,
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, event: UnlockEvent) -> Result<(), StorageError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn list(&self, car_id: Uuid) -> Result<Vec<UnlockEvent>, StorageError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.car_id == car_id)
            .cloned()
            .collect())
    }

    async fn clear(&self, car_id: Uuid) -> Result<(), StorageError> {
        self.events.lock().unwrap().retain(|e| e.car_id != car_id);
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        self.events.lock().unwrap().clear();
        Ok(())
    }
}
