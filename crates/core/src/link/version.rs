//! The once-per-connection version handshake.
//!
//! Runs over the passthrough stream before anything is framed: the phone
//! states its supported ranges, the head unit answers with its own, and
//! both sides resolve the same pair of messaging and security versions or
//! the connection is discarded.

use log::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use uuid::Uuid;

use crate::stream::{MessageStream, MessageStreamVersion, StreamMessage};
use crate::wire::model::{OperationType, VersionExchange};

/// Oldest messaging version this stack still speaks
pub const MIN_MESSAGING_VERSION: i32 = 2;
/// Newest messaging version this stack speaks
pub const MAX_MESSAGING_VERSION: i32 = 3;
/// Oldest security version this stack still speaks
pub const MIN_SECURITY_VERSION: i32 = 1;
/// Newest security version this stack speaks
pub const MAX_SECURITY_VERSION: i32 = 4;

/// Security flavor the connection resolved to.
///
/// The version decides the order of the device-id and encryption steps and
/// which post-handshake exchanges happen; see the association and
/// reconnection modules.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum MessageSecurityVersion {
    /// Device id in the clear before the key exchange
    V1,
    /// Encryption first, self-confirmed pairing code
    V2,
    /// V2 plus a (deprecated, empty) capabilities exchange
    V3,
    /// V3 plus the verification-code state exchange and OOB support
    V4,
}

impl MessageSecurityVersion {
    /// Map a negotiated security number
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(MessageSecurityVersion::V1),
            2 => Some(MessageSecurityVersion::V2),
            3 => Some(MessageSecurityVersion::V3),
            4 => Some(MessageSecurityVersion::V4),
            _ => None,
        }
    }
}

/// Failures of the version handshake. All of them end the connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VersionError {
    /// Our own exchange message could not be built
    #[error("Could not build the version exchange")]
    FailedToCreateProto,
    /// The exchange could not be written
    #[error("Could not write the version exchange")]
    FailedToWrite,
    /// The reply could not be read
    #[error("Could not read the version exchange reply")]
    FailedToRead,
    /// The peer answered with an empty value
    #[error("Peer sent an empty version exchange")]
    EmptyResponse,
    /// The reply was not a version exchange
    #[error("Could not parse the version exchange reply")]
    FailedToParseResponse,
    /// The ranges do not overlap on a version we can speak
    #[error("No mutually supported version")]
    VersionNotSupported,
    /// The peer never answered
    #[error("Timed out waiting for the version exchange reply")]
    TimedOut,
}

/// Result of a successful exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedVersion {
    /// Framing to switch the stream to
    pub stream_version: MessageStreamVersion,
    /// Security flavor for the rest of the connection
    pub security_version: MessageSecurityVersion,
}

/// Report and return the requested failure.
///
/// Callers pass the error kind they mean; nothing here collapses failures
/// into timeouts.
fn fail(error: VersionError) -> VersionError {
    warn!("Version exchange failed: {error}");
    error
}

/// Run the exchange on a stream still in passthrough mode.
///
/// On success the caller switches the stream to the resolved framing.
pub async fn exchange_versions(
    stream: &mut MessageStream,
    step_timeout: Duration,
) -> Result<ResolvedVersion, VersionError> {
    let ours = VersionExchange {
        min_messaging_version: MIN_MESSAGING_VERSION,
        max_messaging_version: MAX_MESSAGING_VERSION,
        min_security_version: MIN_SECURITY_VERSION,
        max_security_version: MAX_SECURITY_VERSION,
    };
    let payload = ours
        .serialize()
        .map_err(|_| fail(VersionError::FailedToCreateProto))?;
    stream
        .send(StreamMessage {
            recipient: Uuid::nil(),
            operation: OperationType::ClientMessage,
            payload,
            is_encrypted: false,
        })
        .await
        .map_err(|_| fail(VersionError::FailedToWrite))?;

    let reply = timeout(step_timeout, stream.recv())
        .await
        .map_err(|_| fail(VersionError::TimedOut))?
        .map_err(|_| fail(VersionError::FailedToRead))?;
    if reply.payload.is_empty() {
        return Err(fail(VersionError::EmptyResponse));
    }
    let theirs = VersionExchange::deserialize(&reply.payload)
        .map_err(|_| fail(VersionError::FailedToParseResponse))?;

    let resolved = resolve(ours, theirs)?;
    debug!(
        "Resolved stream {:?}, security {:?}",
        resolved.stream_version, resolved.security_version
    );
    Ok(resolved)
}

fn resolve(
    ours: VersionExchange,
    theirs: VersionExchange,
) -> Result<ResolvedVersion, VersionError> {
    let security = ours
        .max_security_version
        .min(theirs.max_security_version);
    if security < theirs.min_security_version || security < ours.min_security_version {
        return Err(fail(VersionError::VersionNotSupported));
    }
    let security_version = MessageSecurityVersion::from_i32(security)
        .ok_or_else(|| fail(VersionError::VersionNotSupported))?;

    let messaging = ours
        .max_messaging_version
        .min(theirs.max_messaging_version);
    if messaging < ours.min_messaging_version.max(theirs.min_messaging_version) {
        return Err(fail(VersionError::VersionNotSupported));
    }
    let stream_version = match messaging {
        3 => MessageStreamVersion::V2 { compression: true },
        2 => MessageStreamVersion::V2 { compression: false },
        _ => return Err(fail(VersionError::VersionNotSupported)),
    };

    Ok(ResolvedVersion {
        stream_version,
        security_version,
    })
}
