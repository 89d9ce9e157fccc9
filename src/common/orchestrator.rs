//! Turns advertisements into connections.
//!
//! One task owns all orchestration state and is driven by four inputs:
//! commands from the app, adapter power transitions, the active scan's
//! discoveries, and progress reports from per-connection tasks. Scanning is
//! modal: either hunting cars to associate (on request) or listening for
//! the reconnection advertisements of already associated cars; the mode
//! requested last wins.

use log::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use carlink_core::link::association::{AssociationError, AssociationEvent, Associator};
use carlink_core::link::channel::{ChannelEvent, SecuredChannel};
use carlink_core::link::oob::CoalescingTokenProvider;
use carlink_core::link::reconnection::{
    match_advertisement, ReconnectionError, Reconnector, ADVERTISEMENT_BLOB_LEN,
};
use carlink_core::storage::{AssociationRecord, Car, KeyStore, StorageError};
use carlink_core::transport::{
    AdapterState, Advertisement, BleCentral, BlePeripheral, Discovery, PeripheralState,
};
use carlink_core::wire::crypto::KeyExchangeFactory;

use super::AssociatedCarsManager;
use crate::config::CompanionConfig;
use crate::features::FeatureHost;

/// Everything the app can observe about connection lifecycle
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A car open for association was discovered
    DidDiscover {
        /// Peripheral to pass to [`ConnectionOrchestrator::associate`]
        peripheral_id: Uuid,
        /// Name decoded from the advertisement
        advertised_name: Option<String>,
    },
    /// The car reported its identifier during association
    ReceivedCarId(Uuid),
    /// Show this pairing code to the user
    RequiresPairingCodeDisplay(String),
    /// Association finished and the record is persisted
    DidCompleteAssociation {
        /// The newly associated car
        car: Car,
    },
    /// A secure channel is live (association or reconnection)
    DidEstablishSecureChannel {
        /// The car on the other end
        car: Car,
    },
    /// A peripheral went away
    DidDisconnect {
        /// The peripheral that disconnected
        peripheral_id: Uuid,
        /// The car it belonged to, when known
        car_id: Option<Uuid>,
    },
    /// An association attempt failed
    AssociationFailed(AssociationError),
    /// A reconnection attempt failed
    ReconnectionFailed(ReconnectionError),
}

enum Command {
    ScanForCarsToAssociate,
    StopAssociationScan,
    Associate { peripheral_id: Uuid },
    Dissociate {
        car_id: Uuid,
        done: oneshot::Sender<Result<(), StorageError>>,
    },
}

enum Internal {
    Progress(AssociationEvent),
    Associated { peripheral_id: Uuid, car: Car },
    Reconnected { peripheral_id: Uuid, car: Car },
    AssociationFailed { error: AssociationError },
    ReconnectionFailed { error: ReconnectionError },
    ConnectionClosed {
        peripheral_id: Uuid,
        car_id: Option<Uuid>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanMode {
    Association,
    Reconnection,
}

enum ReconnectionKind {
    /// Record already matched from advertisement service data
    Matched(Box<AssociationRecord>),
    /// Blob must be read from the advertisement characteristic
    ReadCharacteristic,
    /// Legacy per-device UUID flow
    V1,
}

struct ActiveConnection {
    peripheral: Arc<dyn BlePeripheral>,
    car_id: Option<Uuid>,
    has_channel: bool,
    cancel: CancellationToken,
}

/// Handle to the orchestration task.
///
/// Dropping the last handle shuts the task and its connections down.
#[derive(Clone)]
pub struct ConnectionOrchestrator {
    commander: mpsc::Sender<Command>,
    oob_provider: Arc<CoalescingTokenProvider>,
    shutdown: Option<Arc<CancellationToken>>,
}

impl ConnectionOrchestrator {
    /// Start orchestrating over `central`.
    ///
    /// The returned receiver delivers [`ConnectionEvent`]s for the app's
    /// UI layer.
    pub fn new(
        central: Arc<dyn BleCentral>,
        cars: Arc<AssociatedCarsManager>,
        key_store: Arc<dyn KeyStore>,
        key_exchange: Arc<dyn KeyExchangeFactory>,
        host: Arc<FeatureHost>,
        config: &CompanionConfig,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let oob_provider = Arc::new(CoalescingTokenProvider::new());

        let link_config = config.link_config();
        let associator = Arc::new(
            Associator::new(link_config.clone(), key_exchange.clone(), key_store.clone())
                .with_oob_provider(oob_provider.clone()),
        );
        let reconnector = Arc::new(Reconnector::new(
            link_config,
            key_exchange,
            key_store,
        ));

        let task = OrchestratorTask {
            central: central.clone(),
            cars,
            host,
            associator,
            reconnector,
            config: config.clone(),
            adapter: central.adapter_state(),
            commands: command_rx,
            events: event_tx,
            internal_tx,
            internal_rx,
            scan: None,
            scanning: None,
            mode: ScanMode::Reconnection,
            discovered: HashMap::new(),
            active: HashMap::new(),
            cancel: cancel.clone(),
        };
        tokio::task::spawn(task.run());

        (
            ConnectionOrchestrator {
                commander: command_tx,
                oob_provider,
                shutdown: Some(Arc::new(cancel)),
            },
            event_rx,
        )
    }

    /// Switch scanning to cars open for association
    pub async fn scan_for_cars_to_associate(&self) {
        let _ = self.commander.send(Command::ScanForCarsToAssociate).await;
    }

    /// Leave association mode and resume reconnection scanning
    pub async fn stop_association_scan(&self) {
        let _ = self.commander.send(Command::StopAssociationScan).await;
    }

    /// Associate with a peripheral surfaced by
    /// [`ConnectionEvent::DidDiscover`]
    pub async fn associate(&self, peripheral_id: Uuid) {
        let _ = self
            .commander
            .send(Command::Associate { peripheral_id })
            .await;
    }

    /// Forget a car, dropping any live connection to it
    pub async fn dissociate(&self, car_id: Uuid) -> Result<(), StorageError> {
        let (done_tx, done_rx) = oneshot::channel();
        let _ = self
            .commander
            .send(Command::Dissociate {
                car_id,
                done: done_tx,
            })
            .await;
        done_rx
            .await
            .unwrap_or_else(|_| Err(StorageError::Unavailable("orchestrator gone".into())))
    }

    /// Provider that association V4 pulls out-of-band tokens from.
    ///
    /// Register token sources here (for example the association-URL
    /// intake).
    pub fn oob_provider(&self) -> Arc<CoalescingTokenProvider> {
        self.oob_provider.clone()
    }
}

impl Drop for ConnectionOrchestrator {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            if let Ok(cancel) = Arc::try_unwrap(shutdown) {
                trace!("Last orchestrator handle dropped");
                cancel.cancel();
            }
        }
    }
}

struct OrchestratorTask {
    central: Arc<dyn BleCentral>,
    cars: Arc<AssociatedCarsManager>,
    host: Arc<FeatureHost>,
    associator: Arc<Associator>,
    reconnector: Arc<Reconnector>,
    config: CompanionConfig,
    adapter: tokio::sync::watch::Receiver<AdapterState>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ConnectionEvent>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    scan: Option<mpsc::Receiver<Discovery>>,
    scanning: Option<ScanMode>,
    mode: ScanMode,
    discovered: HashMap<Uuid, Discovery>,
    active: HashMap<Uuid, ActiveConnection>,
    cancel: CancellationToken,
}

enum Action {
    Shutdown,
    Command(Command),
    Internal(Internal),
    AdapterChanged,
    Discovery(Option<Discovery>),
}

impl OrchestratorTask {
    async fn run(mut self) {
        self.ensure_scanning().await;
        loop {
            let action = tokio::select! {
                _ = self.cancel.cancelled() => Action::Shutdown,
                command = self.commands.recv() => match command {
                    Some(command) => Action::Command(command),
                    None => Action::Shutdown,
                },
                internal = self.internal_rx.recv() => {
                    Action::Internal(internal.expect("task holds a sender"))
                }
                changed = self.adapter.changed() => match changed {
                    Ok(()) => Action::AdapterChanged,
                    Err(_) => Action::Shutdown,
                },
                discovery = recv_discovery(&mut self.scan) => Action::Discovery(discovery),
            };
            match action {
                Action::Shutdown => break,
                Action::Command(command) => self.handle_command(command).await,
                Action::Internal(internal) => self.handle_internal(internal).await,
                Action::AdapterChanged => {
                    let state = *self.adapter.borrow();
                    debug!("Adapter state is now {state:?}");
                    self.scanning = None;
                    self.scan = None;
                    self.ensure_scanning().await;
                }
                Action::Discovery(Some(discovery)) => self.handle_discovery(discovery).await,
                Action::Discovery(None) => {
                    // Scan feed ended underneath us; restart if still wanted
                    self.scan = None;
                    self.scanning = None;
                    self.ensure_scanning().await;
                }
            }
        }
        for (_, connection) in self.active.drain() {
            connection.cancel.cancel();
        }
        let _ = self.central.stop_scan().await;
        trace!("Orchestrator finished");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ScanForCarsToAssociate => {
                self.mode = ScanMode::Association;
                self.scanning = None;
                self.scan = None;
                self.ensure_scanning().await;
            }
            Command::StopAssociationScan => {
                self.mode = ScanMode::Reconnection;
                self.discovered.clear();
                self.scanning = None;
                self.scan = None;
                self.ensure_scanning().await;
            }
            Command::Associate { peripheral_id } => match self.discovered.remove(&peripheral_id)
            {
                Some(discovery) => self.start_association(discovery).await,
                None => warn!("Asked to associate with unknown peripheral {peripheral_id}"),
            },
            Command::Dissociate { car_id, done } => {
                if let Some(connection) = self
                    .active
                    .values()
                    .find(|connection| connection.car_id == Some(car_id))
                {
                    connection.cancel.cancel();
                }
                let result = self.cars.dissociate(car_id).await;
                self.host.car_disassociated(car_id).await;
                let _ = done.send(result);
                self.ensure_scanning().await;
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Progress(AssociationEvent::ReceivedCarId(car_id)) => {
                let _ = self.events.send(ConnectionEvent::ReceivedCarId(car_id)).await;
            }
            Internal::Progress(AssociationEvent::RequiresPairingCodeDisplay(code)) => {
                let _ = self
                    .events
                    .send(ConnectionEvent::RequiresPairingCodeDisplay(
                        code.as_str().to_string(),
                    ))
                    .await;
            }
            Internal::Associated { peripheral_id, car } => {
                if let Some(connection) = self.active.get_mut(&peripheral_id) {
                    connection.car_id = Some(car.id);
                    connection.has_channel = true;
                }
                let _ = self
                    .events
                    .send(ConnectionEvent::DidCompleteAssociation { car: car.clone() })
                    .await;
                let _ = self
                    .events
                    .send(ConnectionEvent::DidEstablishSecureChannel { car })
                    .await;
            }
            Internal::Reconnected { peripheral_id, car } => {
                if let Some(connection) = self.active.get_mut(&peripheral_id) {
                    connection.car_id = Some(car.id);
                    connection.has_channel = true;
                }
                let _ = self
                    .events
                    .send(ConnectionEvent::DidEstablishSecureChannel { car })
                    .await;
            }
            Internal::AssociationFailed { error } => {
                let _ = self
                    .events
                    .send(ConnectionEvent::AssociationFailed(error))
                    .await;
            }
            Internal::ReconnectionFailed { error } => {
                let _ = self
                    .events
                    .send(ConnectionEvent::ReconnectionFailed(error))
                    .await;
            }
            Internal::ConnectionClosed {
                peripheral_id,
                car_id,
            } => {
                self.active.remove(&peripheral_id);
                if let Some(car_id) = car_id {
                    self.host.car_disconnected(car_id).await;
                }
                let _ = self
                    .events
                    .send(ConnectionEvent::DidDisconnect {
                        peripheral_id,
                        car_id,
                    })
                    .await;
                self.ensure_scanning().await;
            }
        }
    }

    async fn ensure_scanning(&mut self) {
        if *self.adapter.borrow() != AdapterState::PoweredOn {
            self.scan = None;
            self.scanning = None;
            return;
        }
        let services = match self.mode {
            ScanMode::Association => vec![self.config.association_service_uuid],
            ScanMode::Reconnection => {
                if !self.cars.any_associated() {
                    if self.scanning.take().is_some() {
                        let _ = self.central.stop_scan().await;
                        self.scan = None;
                    }
                    return;
                }
                // The fixed V2+ service plus our own id, which legacy V1
                // head units advertise
                vec![self.config.reconnection_service_uuid, self.config.device_id]
            }
        };
        if self.scanning == Some(self.mode) && self.scan.is_some() {
            return;
        }
        match self.central.scan(&services).await {
            Ok(receiver) => {
                debug!("Scanning in {:?} mode", self.mode);
                self.scan = Some(receiver);
                self.scanning = Some(self.mode);
            }
            Err(e) => {
                warn!("Could not start scanning: {e}");
                self.scan = None;
                self.scanning = None;
            }
        }
    }

    async fn handle_discovery(&mut self, discovery: Discovery) {
        let peripheral_id = discovery.peripheral.id();
        match self.mode {
            ScanMode::Association => {
                let advertised_name = self.advertised_name(&discovery.advertisement);
                trace!("Discovered associable car {peripheral_id} ({advertised_name:?})");
                self.discovered.insert(peripheral_id, discovery);
                let _ = self
                    .events
                    .send(ConnectionEvent::DidDiscover {
                        peripheral_id,
                        advertised_name,
                    })
                    .await;
            }
            ScanMode::Reconnection => {
                if let Some(connection) = self.active.get(&peripheral_id) {
                    if connection.has_channel {
                        // A car advertising while we hold a channel means
                        // our connection is stale; drop it and rediscover
                        warn!("Car {peripheral_id} is advertising over a live channel");
                        connection.peripheral.disconnect().await;
                    }
                    return;
                }
                self.start_reconnection(discovery).await;
            }
        }
    }

    fn advertised_name(&self, advertisement: &Advertisement) -> Option<String> {
        decode_advertised_name(
            advertisement,
            self.config.advertisement_data_uuid,
            &self.config.name_prefix,
        )
    }

    async fn start_association(&mut self, discovery: Discovery) {
        let peripheral = discovery.peripheral;
        let peripheral_id = peripheral.id();
        let advertised_name = self.advertised_name(&discovery.advertisement);
        let cancel = self.cancel.child_token();
        self.active.insert(
            peripheral_id,
            ActiveConnection {
                peripheral: peripheral.clone(),
                car_id: None,
                has_channel: false,
                cancel: cancel.clone(),
            },
        );
        tokio::task::spawn(run_association(
            self.central.clone(),
            peripheral,
            advertised_name,
            self.associator.clone(),
            self.cars.clone(),
            self.host.clone(),
            self.internal_tx.clone(),
            cancel,
        ));
    }

    async fn start_reconnection(&mut self, discovery: Discovery) {
        let advertisement = discovery.advertisement;
        let peripheral = discovery.peripheral;
        let peripheral_id = peripheral.id();

        let kind = if advertisement.service_uuids.contains(&self.config.device_id) {
            ReconnectionKind::V1
        } else if advertisement
            .service_uuids
            .contains(&self.config.reconnection_service_uuid)
        {
            match advertisement
                .service_data
                .get(&self.config.advertisement_data_uuid)
            {
                Some(blob) => {
                    match match_advertisement(blob, &self.cars.records()) {
                        Some(record) => ReconnectionKind::Matched(Box::new(record.clone())),
                        // Somebody else's car
                        None => return,
                    }
                }
                None => ReconnectionKind::ReadCharacteristic,
            }
        } else {
            return;
        };

        let cancel = self.cancel.child_token();
        self.active.insert(
            peripheral_id,
            ActiveConnection {
                peripheral: peripheral.clone(),
                car_id: match &kind {
                    ReconnectionKind::Matched(record) => Some(record.car.id),
                    _ => None,
                },
                has_channel: false,
                cancel: cancel.clone(),
            },
        );
        tokio::task::spawn(run_reconnection(
            self.central.clone(),
            peripheral,
            kind,
            self.reconnector.clone(),
            self.cars.clone(),
            self.host.clone(),
            self.config.advertisement_characteristic,
            self.internal_tx.clone(),
            cancel,
        ));
    }
}

/// Decode a display name per the advertised-name rules: an 8-byte blob is
/// UTF-8 without the prefix, anything else is uppercase hex behind it.
fn decode_advertised_name(
    advertisement: &Advertisement,
    data_uuid: Uuid,
    prefix: &str,
) -> Option<String> {
    let Some(blob) = advertisement.service_data.get(&data_uuid) else {
        return advertisement.local_name.clone();
    };
    if blob.len() == 8 {
        if let Ok(name) = std::str::from_utf8(blob) {
            return Some(name.to_string());
        }
    }
    let hex: String = blob.iter().map(|byte| format!("{byte:02X}")).collect();
    Some(format!("{prefix}{hex}"))
}

async fn recv_discovery(scan: &mut Option<mpsc::Receiver<Discovery>>) -> Option<Discovery> {
    match scan.as_mut() {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_association(
    central: Arc<dyn BleCentral>,
    peripheral: Arc<dyn BlePeripheral>,
    advertised_name: Option<String>,
    associator: Arc<Associator>,
    cars: Arc<AssociatedCarsManager>,
    host: Arc<FeatureHost>,
    internal: mpsc::Sender<Internal>,
    cancel: CancellationToken,
) {
    let peripheral_id = peripheral.id();
    if let Err(e) = central.connect(&peripheral).await {
        warn!("Could not connect for association: {e}");
        let _ = internal
            .send(Internal::AssociationFailed {
                error: AssociationError::Unknown(e.into()),
            })
            .await;
        let _ = internal
            .send(Internal::ConnectionClosed {
                peripheral_id,
                car_id: None,
            })
            .await;
        return;
    }

    // Pump the state machine's progress reports out as they happen
    let (progress_tx, mut progress_rx) = mpsc::channel(8);
    let progress_pump = {
        let internal = internal.clone();
        tokio::task::spawn(async move {
            while let Some(event) = progress_rx.recv().await {
                let _ = internal.send(Internal::Progress(event)).await;
            }
        })
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(AssociationError::Disconnected),
        outcome = associator.associate(peripheral.clone(), advertised_name, progress_tx) => outcome,
    };
    progress_pump.abort();

    let car_id = match outcome {
        Ok((channel, channel_events)) => {
            let car = channel.car().clone();
            if let Err(e) = cars.note_association(&car).await {
                warn!("Could not refresh the car registry: {e}");
            }
            host.channel_established(channel.clone()).await;
            let _ = internal
                .send(Internal::Associated {
                    peripheral_id,
                    car: car.clone(),
                })
                .await;
            monitor_channel(&*peripheral, channel, channel_events, &cancel).await;
            Some(car.id)
        }
        Err(error) => {
            warn!("Association with {peripheral_id} failed: {error}");
            let _ = internal.send(Internal::AssociationFailed { error }).await;
            peripheral.disconnect().await;
            None
        }
    };
    let _ = internal
        .send(Internal::ConnectionClosed {
            peripheral_id,
            car_id,
        })
        .await;
}

#[allow(clippy::too_many_arguments)]
async fn run_reconnection(
    central: Arc<dyn BleCentral>,
    peripheral: Arc<dyn BlePeripheral>,
    kind: ReconnectionKind,
    reconnector: Arc<Reconnector>,
    cars: Arc<AssociatedCarsManager>,
    host: Arc<FeatureHost>,
    advertisement_characteristic: Uuid,
    internal: mpsc::Sender<Internal>,
    cancel: CancellationToken,
) {
    let peripheral_id = peripheral.id();
    if let Err(e) = central.connect(&peripheral).await {
        debug!("Could not connect for reconnection: {e}");
        let _ = internal
            .send(Internal::ConnectionClosed {
                peripheral_id,
                car_id: None,
            })
            .await;
        return;
    }

    // Resolve which car this is, reading the advertisement characteristic
    // when the advertisement itself had no room for the blob
    let record = match kind {
        ReconnectionKind::Matched(record) => Some(Some(*record)),
        ReconnectionKind::V1 => Some(None),
        ReconnectionKind::ReadCharacteristic => {
            match peripheral.read_value(advertisement_characteristic).await {
                Ok(blob) if blob.len() == ADVERTISEMENT_BLOB_LEN => {
                    match_advertisement(&blob, &cars.records())
                        .cloned()
                        .map(Some)
                }
                Ok(blob) => {
                    debug!("Advertisement characteristic held {} bytes", blob.len());
                    None
                }
                Err(e) => {
                    debug!("Could not read the advertisement characteristic: {e}");
                    None
                }
            }
        }
    };
    let record = match record {
        Some(record) => record,
        None => {
            // Not one of ours
            peripheral.disconnect().await;
            let _ = internal
                .send(Internal::ConnectionClosed {
                    peripheral_id,
                    car_id: None,
                })
                .await;
            return;
        }
    };

    if let Some(record) = &record {
        host.car_connected(&record.car).await;
    }

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(ReconnectionError::Disconnected),
        outcome = async {
            match record {
                Some(record) => reconnector.reconnect(peripheral.clone(), record).await,
                None => reconnector.reconnect_v1(peripheral.clone()).await,
            }
        } => outcome,
    };

    let car_id = match outcome {
        Ok((channel, channel_events)) => {
            let car = channel.car().clone();
            host.channel_established(channel.clone()).await;
            let _ = internal
                .send(Internal::Reconnected {
                    peripheral_id,
                    car: car.clone(),
                })
                .await;
            monitor_channel(&*peripheral, channel, channel_events, &cancel).await;
            Some(car.id)
        }
        Err(error) => {
            debug!("Reconnection with {peripheral_id} failed: {error}");
            let _ = internal.send(Internal::ReconnectionFailed { error }).await;
            peripheral.disconnect().await;
            None
        }
    };
    let _ = internal
        .send(Internal::ConnectionClosed {
            peripheral_id,
            car_id,
        })
        .await;
}

/// Sit on an established channel until it dies, honoring cancellation and
/// the channel's own fatal faults.
async fn monitor_channel(
    peripheral: &dyn BlePeripheral,
    _channel: SecuredChannel,
    mut channel_events: mpsc::Receiver<ChannelEvent>,
    cancel: &CancellationToken,
) {
    let mut state = peripheral.state();
    if *state.borrow_and_update() == PeripheralState::Disconnected {
        return;
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                peripheral.disconnect().await;
                break;
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == PeripheralState::Disconnected {
                    break;
                }
            }
            event = channel_events.recv() => match event {
                Some(ChannelEvent::UnrecoverableError(e)) => {
                    warn!("Channel failed, disconnecting: {e}");
                    peripheral.disconnect().await;
                    break;
                }
                Some(ChannelEvent::DisconnectRequested) => {
                    // Features observe this themselves; the head unit will
                    // drop the link when it is ready
                    debug!("Head unit requested disconnect");
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use carlink_core::link::reconnection::truncated_salt_hmac;
    use carlink_core::link::version::MessageSecurityVersion;
    use carlink_core::mock::{
        MemoryHistoryStore, MemoryKeyStore, MockCentral, MockHeadUnit, MockKeyExchangeFactory,
        MockPeripheral, MockSessionContext, MOCK_CAR_HELLO_PREFIX, MOCK_PHONE_FINISH,
        MOCK_PHONE_HELLO,
    };
    use carlink_core::wire::model::DeviceMessage;
    use carlink_core::wire::model::OperationType;
    use env_logger::Env;
    use std::collections::HashMap;
    use tokio::time::{timeout, Duration};

    fn init() {
        let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .is_test(true)
            .try_init();
    }

    const SESSION_KEY: &[u8] = b"orchestrated-key";

    /// Push a discovery, retrying until the scan is actually running
    async fn advertise(
        central: &Arc<MockCentral>,
        peripheral: &Arc<MockPeripheral>,
        advertisement: &Advertisement,
    ) {
        for _ in 0..100 {
            let discovery = Discovery {
                peripheral: peripheral.clone(),
                advertisement: advertisement.clone(),
            };
            if central.advertise(discovery).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("scan never started");
    }

    fn advertisement(data_uuid: Uuid, blob: Option<Vec<u8>>, services: Vec<Uuid>) -> Advertisement {
        let mut service_data = HashMap::new();
        if let Some(blob) = blob {
            service_data.insert(data_uuid, blob);
        }
        Advertisement {
            local_name: Some("HeadUnit".to_string()),
            service_uuids: services,
            service_data,
        }
    }

    #[test]
    fn test_advertised_name_rules() {
        init();
        let data_uuid = Uuid::new_v4();

        // Exactly eight bytes of UTF-8: taken verbatim, no prefix
        let adv = advertisement(data_uuid, Some(b"My Crown".to_vec()), vec![]);
        assert_eq!(
            decode_advertised_name(&adv, data_uuid, "Vehicle "),
            Some("My Crown".to_string())
        );

        // Any other length: uppercase hex behind the prefix
        let adv = advertisement(data_uuid, Some(vec![0xDE, 0xAD, 0x01]), vec![]);
        assert_eq!(
            decode_advertised_name(&adv, data_uuid, "Vehicle "),
            Some("Vehicle DEAD01".to_string())
        );

        // No blob: fall back to the GAP local name
        let adv = advertisement(data_uuid, None, vec![]);
        assert_eq!(
            decode_advertised_name(&adv, data_uuid, "Vehicle "),
            Some("HeadUnit".to_string())
        );
    }

    struct Fixture {
        central: Arc<MockCentral>,
        cars: Arc<AssociatedCarsManager>,
        key_store: Arc<MemoryKeyStore>,
        orchestrator: ConnectionOrchestrator,
        events: mpsc::Receiver<ConnectionEvent>,
        config: CompanionConfig,
    }

    async fn fixture() -> Fixture {
        let central = MockCentral::new();
        let key_store = Arc::new(MemoryKeyStore::default());
        let history = Arc::new(MemoryHistoryStore::default());
        let cars = Arc::new(
            AssociatedCarsManager::new(key_store.clone(), history)
                .await
                .unwrap(),
        );
        let config = CompanionConfig::default();
        let host = crate::features::FeatureHost::new(&config);
        let (orchestrator, events) = ConnectionOrchestrator::new(
            central.clone(),
            cars.clone(),
            key_store.clone(),
            Arc::new(MockKeyExchangeFactory),
            host,
            &config,
        );
        Fixture {
            central,
            cars,
            key_store,
            orchestrator,
            events,
            config,
        }
    }

    #[tokio::test]
    async fn test_association_flow_end_to_end() {
        init();
        let mut fx = fixture().await;
        fx.orchestrator.scan_for_cars_to_associate().await;

        // Build a car advertising the association service
        let (peripheral, remote) =
            MockPeripheral::new(Uuid::new_v4(), Some("HeadUnit".to_string()), 185);
        peripheral.add_service(
            fx.config.association_service_uuid,
            vec![
                fx.config.client_write_characteristic,
                fx.config.server_write_characteristic,
            ],
        );
        fx.central.register(peripheral.clone());
        let mut head_unit = MockHeadUnit::new(remote, fx.config.server_write_characteristic);

        let adv = advertisement(
            fx.config.advertisement_data_uuid,
            Some(b"My Crown".to_vec()),
            vec![fx.config.association_service_uuid],
        );
        advertise(&fx.central, &peripheral, &adv).await;

        let peripheral_id = match fx.events.recv().await {
            Some(ConnectionEvent::DidDiscover {
                peripheral_id,
                advertised_name,
            }) => {
                assert_eq!(advertised_name.as_deref(), Some("My Crown"));
                peripheral_id
            }
            other => panic!("expected a discovery, got {other:?}"),
        };

        // Drive the head-unit side of a V2 association
        let car_id_bytes = [0x42u8; 16];
        let driver = tokio::spawn(async move {
            head_unit.exchange_versions(2, 2).await;
            let hello = head_unit.recv_message().await;
            assert_eq!(hello.payload, MOCK_PHONE_HELLO);
            let mut reply = MOCK_CAR_HELLO_PREFIX.to_vec();
            reply.extend_from_slice(SESSION_KEY);
            head_unit
                .send_message(DeviceMessage::plain(
                    Uuid::nil(),
                    OperationType::EncryptionHandshake,
                    reply,
                ))
                .await;
            let finish = head_unit.recv_message().await;
            assert_eq!(finish.payload, MOCK_PHONE_FINISH);
            let cipher = MockSessionContext::new(SESSION_KEY.to_vec());
            head_unit
                .send_message(DeviceMessage::encrypted(
                    Uuid::nil(),
                    OperationType::ClientMessage,
                    cipher.apply(&car_id_bytes),
                ))
                .await;
            // device id + auth key
            let _keys = head_unit.recv_message().await;
            head_unit
        });

        fx.orchestrator.associate(peripheral_id).await;

        let mut saw_pairing_code = false;
        let car = loop {
            match timeout(Duration::from_secs(5), fx.events.recv())
                .await
                .expect("association stalled")
            {
                Some(ConnectionEvent::RequiresPairingCodeDisplay(code)) => {
                    assert_eq!(code.len(), 6);
                    saw_pairing_code = true;
                }
                Some(ConnectionEvent::ReceivedCarId(id)) => {
                    assert_eq!(id, Uuid::from_bytes(car_id_bytes));
                }
                Some(ConnectionEvent::DidCompleteAssociation { car }) => break car,
                other => panic!("unexpected event {other:?}"),
            }
        };
        assert!(saw_pairing_code);
        assert_eq!(car.id, Uuid::from_bytes(car_id_bytes));
        assert_matches!(
            fx.events.recv().await,
            Some(ConnectionEvent::DidEstablishSecureChannel { .. })
        );

        let _head_unit = driver.await.unwrap();
        assert!(fx.cars.is_associated(car.id));
        let record = fx.key_store.get(car.id).await.unwrap().unwrap();
        assert_eq!(record.security_version, MessageSecurityVersion::V2);
    }

    #[tokio::test]
    async fn test_reconnection_scan_matches_and_ignores() {
        init();
        let fx = fixture().await;

        // Seed one association so reconnection scanning runs
        let auth_key = [0x11u8; 32];
        let car_id = Uuid::new_v4();
        fx.key_store
            .put(carlink_core::storage::AssociationRecord {
                car: Car {
                    id: car_id,
                    name: None,
                },
                session: b"mock-session:reconnect".to_vec(),
                auth_key: Some(auth_key),
                security_version: MessageSecurityVersion::V2,
            })
            .await
            .unwrap();
        fx.cars
            .note_association(&Car {
                id: car_id,
                name: None,
            })
            .await
            .unwrap();
        // Nudge scanning now that a car exists
        fx.orchestrator.stop_association_scan().await;
        for _ in 0..100 {
            if fx.central.scan_filter().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            fx.central.scan_filter(),
            Some(vec![
                fx.config.reconnection_service_uuid,
                fx.config.device_id
            ])
        );

        let salt = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut good_blob = truncated_salt_hmac(&auth_key, &salt).to_vec();
        good_blob.extend_from_slice(&salt);
        let mut bad_blob = truncated_salt_hmac(&[0x22; 32], &salt).to_vec();
        bad_blob.extend_from_slice(&salt);

        // A blob under the wrong key is ignored outright
        let (stranger, _stranger_remote) = MockPeripheral::new(Uuid::new_v4(), None, 185);
        fx.central.register(stranger.clone());
        let stranger_adv = advertisement(
            fx.config.advertisement_data_uuid,
            Some(bad_blob),
            vec![fx.config.reconnection_service_uuid],
        );
        advertise(&fx.central, &stranger, &stranger_adv).await;

        // The matching car reconnects
        let (peripheral, remote) = MockPeripheral::new(Uuid::new_v4(), None, 185);
        peripheral.add_service(
            fx.config.reconnection_service_uuid,
            vec![
                fx.config.client_write_characteristic,
                fx.config.server_write_characteristic,
            ],
        );
        fx.central.register(peripheral.clone());
        let mut head_unit = MockHeadUnit::new(remote, fx.config.server_write_characteristic);

        let driver = tokio::spawn(async move {
            head_unit.exchange_versions(2, 2).await;
            let challenge = head_unit.recv_message().await;
            let response =
                carlink_core::link::reconnection::challenge_response(&auth_key, &challenge.payload);
            head_unit
                .send_message(DeviceMessage::plain(
                    Uuid::nil(),
                    OperationType::EncryptionHandshake,
                    response.to_vec(),
                ))
                .await;
        });

        let good_adv = advertisement(
            fx.config.advertisement_data_uuid,
            Some(good_blob),
            vec![fx.config.reconnection_service_uuid],
        );
        advertise(&fx.central, &peripheral, &good_adv).await;

        let mut events = fx.events;
        loop {
            match timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("reconnection stalled")
            {
                Some(ConnectionEvent::DidEstablishSecureChannel { car }) => {
                    assert_eq!(car.id, car_id);
                    break;
                }
                Some(ConnectionEvent::ReconnectionFailed(e)) => {
                    panic!("reconnection failed: {e}")
                }
                // The ignored stranger may produce nothing at all
                Some(other) => debug!("ignoring {other:?}"),
                None => panic!("orchestrator went away"),
            }
        }
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_dissociate_clears_everything() {
        init();
        let fx = fixture().await;
        let car_id = Uuid::new_v4();
        fx.key_store
            .put(carlink_core::storage::AssociationRecord {
                car: Car {
                    id: car_id,
                    name: None,
                },
                session: Vec::new(),
                auth_key: None,
                security_version: MessageSecurityVersion::V1,
            })
            .await
            .unwrap();
        fx.cars
            .note_association(&Car {
                id: car_id,
                name: None,
            })
            .await
            .unwrap();
        fx.key_store
            .put_trusted_record(car_id, Default::default())
            .await
            .unwrap();

        fx.orchestrator.dissociate(car_id).await.unwrap();
        assert!(!fx.cars.is_associated(car_id));
        assert!(fx.key_store.get(car_id).await.unwrap().is_none());
        assert!(fx
            .key_store
            .trusted_record(car_id)
            .await
            .unwrap()
            .is_none());
    }
}
