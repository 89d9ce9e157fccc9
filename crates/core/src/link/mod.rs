//! Per-connection protocol: version resolution, association, reconnection
//! and the secured channel they both hand back.
//!
//! Each state machine borrows a connected peripheral, runs its exchange
//! over a [`MessageStream`](crate::stream::MessageStream) and either fails
//! with its own error enum or produces a
//! [`SecuredChannel`](channel::SecuredChannel) for the feature layer.

pub mod association;
pub mod channel;
pub mod oob;
pub mod reconnection;
pub mod version;

use std::time::Duration;
use uuid::{uuid, Uuid};

/// Default association service UUID
pub const DEFAULT_ASSOCIATION_SERVICE: Uuid = uuid!("5e2a68a4-27be-43f9-8d1e-4546976fabd7");
/// Default fixed reconnection service UUID (security V2+)
pub const DEFAULT_RECONNECTION_SERVICE: Uuid = uuid!("000000e0-0000-1000-8000-00805f9b34fb");
/// Default data UUID keying the reconnection advertisement blob
pub const DEFAULT_ADVERTISEMENT_DATA_UUID: Uuid = uuid!("00000020-0000-1000-8000-00805f9b34fb");
/// Default characteristic the phone writes to
pub const DEFAULT_CLIENT_WRITE_CHARACTERISTIC: Uuid =
    uuid!("5e2a68a5-27be-43f9-8d1e-4546976fabd7");
/// Default characteristic the head unit writes to (phone subscribes)
pub const DEFAULT_SERVER_WRITE_CHARACTERISTIC: Uuid =
    uuid!("5e2a68a6-27be-43f9-8d1e-4546976fabd7");
/// Default characteristic carrying the advertisement blob when the
/// advertisement itself has no room for service data
pub const DEFAULT_ADVERTISEMENT_CHARACTERISTIC: Uuid =
    uuid!("00000030-0000-1000-8000-00805f9b34fb");

/// Default per-step timeout of the state machines
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(15);

/// Identity and wiring shared by both state machines
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Service advertised by cars open for association
    pub association_service: Uuid,
    /// Fixed service advertised by associated cars (V2+)
    pub reconnection_service: Uuid,
    /// Data UUID the 11-byte reconnection blob is keyed under
    pub advertisement_data_uuid: Uuid,
    /// Characteristic the phone writes to
    pub client_write_characteristic: Uuid,
    /// Characteristic the phone subscribes to
    pub server_write_characteristic: Uuid,
    /// Characteristic the reconnection blob can be read from
    pub advertisement_characteristic: Uuid,
    /// This phone's stable 128-bit identifier
    pub device_id: Uuid,
    /// Budget for each awaited protocol step.
    ///
    /// Pairing-code confirmation waits on a human and is exempt.
    pub step_timeout: Duration,
}

impl LinkConfig {
    /// Defaults for everything but the device identity
    pub fn new(device_id: Uuid) -> Self {
        LinkConfig {
            association_service: DEFAULT_ASSOCIATION_SERVICE,
            reconnection_service: DEFAULT_RECONNECTION_SERVICE,
            advertisement_data_uuid: DEFAULT_ADVERTISEMENT_DATA_UUID,
            client_write_characteristic: DEFAULT_CLIENT_WRITE_CHARACTERISTIC,
            server_write_characteristic: DEFAULT_SERVER_WRITE_CHARACTERISTIC,
            advertisement_characteristic: DEFAULT_ADVERTISEMENT_CHARACTERISTIC,
            device_id,
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}
