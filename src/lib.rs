//! Companion link between a mobile device and vehicle head units.
//!
//! `carlink_core` owns the wire protocol, the framing layer and the
//! per-connection state machines; this crate is the application side that
//! glues them to a device: configuration, file-backed storage, the
//! orchestrator that turns advertisements into connections, and the
//! features riding on established secure channels (system queries and the
//! trusted-device unlock protocol).
//!
//! The BLE driver, the UKey2 key exchange and the OS keychain/lock state
//! are injected through the traits in [`carlink_core::transport`],
//! [`carlink_core::wire::crypto`] and [`carlink_core::storage`] plus
//! [`features::trusted::DeviceState`].

pub mod common;
pub mod config;
pub mod features;
pub mod storage;

pub use carlink_core::link::association::{AssociationError, AssociationEvent};
pub use carlink_core::link::channel::{Query, QueryResponse, SecuredChannel};
pub use carlink_core::link::reconnection::ReconnectionError;
pub use carlink_core::storage::{Car, UnlockEvent};
pub use common::orchestrator::{ConnectionEvent, ConnectionOrchestrator};
pub use config::CompanionConfig;

/// Result type for app-side plumbing
pub type AnyResult<T = ()> = anyhow::Result<T>;
