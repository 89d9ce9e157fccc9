//! Seam to the platform BLE driver.
//!
//! The stack never talks to radio hardware; the embedding application hands
//! it a [`BleCentral`] for scanning and a [`BlePeripheral`] per discovered
//! head unit. Notifications arrive as plain byte buffers over an `mpsc`
//! receiver and writes resolve once the transport is ready for the next
//! write, which is what the framing layer's pacing relies on.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Failures reported by the BLE driver
#[derive(Debug, Error)]
pub enum TransportError {
    /// The adapter is not powered on
    #[error("Bluetooth adapter is powered off")]
    PoweredOff,
    /// The peripheral dropped the connection or was never connected
    #[error("Peripheral is not connected")]
    NotConnected,
    /// The requested GATT service is absent
    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),
    /// The requested characteristic is absent
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    /// Subscribing to notifications failed
    #[error("Could not subscribe to {0}")]
    SubscribeFailed(Uuid),
    /// A characteristic write was rejected
    #[error("Write failed: {0}")]
    WriteFailed(String),
    /// A characteristic read was rejected
    #[error("Read failed: {0}")]
    ReadFailed(String),
    /// Scanning could not be started
    #[error("Scan failed: {0}")]
    ScanFailed(String),
    /// A connection attempt failed outright
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
}

/// Power state of the local adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// State not yet known
    Unknown,
    /// Radio unavailable; scans and connects will fail
    PoweredOff,
    /// Radio ready
    PoweredOn,
}

/// Connection state of one peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralState {
    /// Not currently connected
    Disconnected,
    /// Connection established, GATT available
    Connected,
}

/// Contents of one advertisement report
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    /// Local name the peripheral advertised, if any
    pub local_name: Option<String>,
    /// Service UUIDs in the advertisement
    pub service_uuids: Vec<Uuid>,
    /// Service data keyed by data UUID
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

/// One discovered peripheral with the advertisement that surfaced it
pub struct Discovery {
    /// Handle to the peripheral; not yet connected
    pub peripheral: Arc<dyn BlePeripheral>,
    /// The advertisement report
    pub advertisement: Advertisement,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("peripheral", &self.peripheral.id())
            .field("advertisement", &self.advertisement)
            .finish()
    }
}

/// A remote GATT peripheral (the head unit)
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// Stable identifier of this peripheral on this device
    fn id(&self) -> Uuid;

    /// GAP name, if known
    fn name(&self) -> Option<String>;

    /// Largest value accepted by a single characteristic write
    fn max_write_len(&self) -> usize;

    /// Watch for connect and disconnect transitions
    fn state(&self) -> watch::Receiver<PeripheralState>;

    /// Discover `service` and return the UUIDs of its characteristics
    async fn discover_characteristics(&self, service: Uuid) -> Result<Vec<Uuid>, TransportError>;

    /// Subscribe to notifications on `characteristic`.
    ///
    /// The receiver yields each notification value and closes when the
    /// peripheral disconnects.
    async fn subscribe(
        &self,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    /// Write `value` to `characteristic`.
    ///
    /// Resolves once the transport is ready to accept the next write; the
    /// framing layer paces consecutive packet writes on this.
    async fn write_value(&self, characteristic: Uuid, value: &[u8])
        -> Result<(), TransportError>;

    /// Read the current value of `characteristic`
    async fn read_value(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError>;

    /// Tear the connection down. Idempotent.
    async fn disconnect(&self);
}

/// The local adapter: scanning and connecting
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Watch the adapter power state
    fn adapter_state(&self) -> watch::Receiver<AdapterState>;

    /// Scan for peripherals advertising any of `services`.
    ///
    /// Starting a scan replaces any previous scan. The receiver closes when
    /// the scan is stopped or replaced.
    async fn scan(&self, services: &[Uuid]) -> Result<mpsc::Receiver<Discovery>, TransportError>;

    /// Stop an in-progress scan, if any
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Connect to a previously discovered peripheral
    async fn connect(&self, peripheral: &Arc<dyn BlePeripheral>) -> Result<(), TransportError>;
}
