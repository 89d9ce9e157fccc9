//! Core protocol services for a companion link between a mobile device and a
//! vehicle head unit.
//!
//! The crate is layered the way the bytes travel:
//!
//! - [`wire`] holds the wire model plus its serializers, parsers, the varint
//!   and compression codec, and the session-crypto seam.
//! - [`stream`] turns BLE characteristic writes and notifications into whole
//!   messages (packetizing, reassembly, optional compression).
//! - [`link`] drives a connected peripheral through version resolution,
//!   association or reconnection, and exposes the secured channel that
//!   multiplexes feature traffic.
//! - [`transport`] and [`storage`] are the seams to the BLE driver and the
//!   durable stores, which are supplied by the embedding application.
//!
//! The BLE driver itself, the UKey2 key exchange and the platform keychain
//! are deliberately not implemented here; they are injected through the
//! traits in [`transport`], [`wire::crypto`] and [`storage`].

pub mod link;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod storage;
pub mod stream;
pub mod transport;
pub mod wire;

use thiserror::Error;

pub use link::association::AssociationError;
pub use link::reconnection::ReconnectionError;
pub use link::version::VersionError;
pub use storage::StorageError;
pub use stream::FramingError;
pub use transport::TransportError;
pub use wire::codec::CodecError;
pub use wire::crypto::SecurityError;
pub use wire::ProtocolError;

/// Umbrella error for the protocol core.
///
/// Each layer has its own error enum; this collects them so call sites that
/// span layers (the state machines, the secured channel) can use one `?`.
#[derive(Debug, Error)]
pub enum Error {
    /// The BLE driver reported a failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    /// The framing layer hit an unrecoverable condition
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),
    /// A peer message could not be understood
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Version negotiation failed
    #[error("Version error: {0}")]
    Version(#[from] VersionError),
    /// Key exchange, session crypto or pairing confirmation failed
    #[error("Security error: {0}")]
    Security(#[from] SecurityError),
    /// A durable store reported a failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    /// The secured channel is no longer usable
    #[error("Channel is no longer valid")]
    InvalidChannel,
    /// A second observer was registered for the same recipient
    #[error("An observer is already registered for this recipient")]
    ObserverAlreadyRegistered,
    /// The awaited step did not finish in time
    #[error("Timed out")]
    Timeout,
    /// The operation was cancelled from outside
    #[error("Cancelled")]
    Cancelled,
    /// Catch-all for failures with no better classification
    #[error("{0}")]
    Other(&'static str),
}

/// Crate-wide result type
pub type Result<T, E = Error> = std::result::Result<T, E>;
