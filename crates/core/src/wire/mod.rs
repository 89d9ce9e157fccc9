//! Wire model of the companion protocol and its codecs.
//!
//! Every message exchanged with the head unit is a hand-coded protobuf:
//! [`model`] declares the structs, [`ser`] writes them with cookie-factory
//! generators and [`de`] parses them with nom. [`codec`] carries the varint
//! math both sides share plus the payload compression, and [`crypto`] is the
//! seam to the externally supplied key exchange.

pub mod codec;
pub mod crypto;
pub mod de;
pub mod model;
pub mod ser;

use thiserror::Error;

/// A peer message that parsed as bytes but not as protocol
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A protobuf payload could not be decoded
    #[error("Could not parse {0}")]
    Parse(&'static str),
    /// A message could not be encoded
    #[error("Could not serialize {0}")]
    Serialize(&'static str),
    /// A recipient field was not a 16-byte UUID
    #[error("Recipient must be 16 bytes, got {0}")]
    BadRecipient(usize),
    /// An operation tag outside the known set
    #[error("Unknown operation type {0}")]
    UnknownOperation(i32),
    /// A known message arrived at a point in the exchange where it is invalid
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(&'static str),
}
