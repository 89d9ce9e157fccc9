//! Message structs for everything that crosses the BLE link.
//!
//! Field numbers are part of the wire contract with the head unit and are
//! recorded next to each struct; [`super::ser`] and [`super::de`] must agree
//! with them exactly.

use super::ProtocolError;
use uuid::Uuid;

/// Tag carried by [`DeviceMessage::operation`].
///
/// `Disconnect` is only ever received; the mobile side never transmits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// Key-exchange traffic, exchanged before the channel is secured
    EncryptionHandshake,
    /// Application payload addressed to a feature
    ClientMessage,
    /// A query expecting exactly one response
    Query,
    /// The response to an earlier query
    QueryResponse,
    /// Head-unit request to drop the connection
    Disconnect,
}

impl OperationType {
    /// Wire tag of this operation
    pub fn tag(self) -> i32 {
        match self {
            OperationType::EncryptionHandshake => 1,
            OperationType::ClientMessage => 2,
            OperationType::Query => 3,
            OperationType::QueryResponse => 4,
            OperationType::Disconnect => 5,
        }
    }

    /// Inverse of [`tag`](Self::tag)
    pub fn from_tag(tag: i32) -> Result<Self, ProtocolError> {
        match tag {
            1 => Ok(OperationType::EncryptionHandshake),
            2 => Ok(OperationType::ClientMessage),
            3 => Ok(OperationType::Query),
            4 => Ok(OperationType::QueryResponse),
            5 => Ok(OperationType::Disconnect),
            other => Err(ProtocolError::UnknownOperation(other)),
        }
    }
}

/// One BLE write of a framed stream.
///
/// Fields: `1` message_id (int32), `2` packet_number (uint32),
/// `3` total_packets (uint32), `4` payload (bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Ties the packet to its message; monotonic per direction
    pub message_id: i32,
    /// 1-based position within the message
    pub packet_number: u32,
    /// Number of packets the message was split into
    pub total_packets: u32,
    /// This packet's slice of the serialized [`DeviceMessage`]
    pub payload: Vec<u8>,
}

/// The reassembled unit the framing layer produces and consumes.
///
/// Fields: `1` recipient (16 bytes), `2` is_payload_encrypted (bool),
/// `3` operation (enum), `4` payload (bytes), `5` original_size (uint32,
/// zero when the payload is not compressed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMessage {
    /// Feature the payload is addressed to
    pub recipient: Uuid,
    /// Whether `payload` is ciphertext under the session keys
    pub is_encrypted: bool,
    /// What the payload is
    pub operation: OperationType,
    /// Application bytes, possibly compressed
    pub payload: Vec<u8>,
    /// Plaintext length before compression; zero means uncompressed
    pub original_size: u32,
}

/// First message of every connection, sent unframed in both directions.
///
/// Fields `1`-`4`, all int32: min/max messaging version then min/max
/// security version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionExchange {
    /// Oldest messaging version the sender still speaks
    pub min_messaging_version: i32,
    /// Newest messaging version the sender speaks
    pub max_messaging_version: i32,
    /// Oldest security version the sender still speaks
    pub min_security_version: i32,
    /// Newest security version the sender speaks
    pub max_security_version: i32,
}

/// Query as it travels on the wire.
///
/// Fields: `1` id (int32), `2` sender (16 bytes), `3` request (bytes),
/// `4` parameters (bytes). The sender UUID tells the responder where to
/// address the [`QueryResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireQuery {
    /// Channel-allocated correlation id
    pub id: i32,
    /// Recipient UUID the response should be sent to
    pub sender: Uuid,
    /// Feature-defined request bytes
    pub request: Vec<u8>,
    /// Optional feature-defined request detail
    pub parameters: Vec<u8>,
}

/// Response correlated to a [`WireQuery`] by id.
///
/// Fields: `1` id (int32), `2` is_successful (bool), `3` response (bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireQueryResponse {
    /// Correlation id from the query
    pub id: i32,
    /// Whether the responder could satisfy the query
    pub is_successful: bool,
    /// Feature-defined response bytes
    pub response: Vec<u8>,
}

/// How the pairing code will be confirmed on a security V4 association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationCodeState {
    /// Confirmation via an out-of-band token, no user interaction
    OobVerification,
    /// Phone will display the code for the user to compare
    VisualVerification,
    /// Head unit reports the user confirmed the displayed code
    VisualConfirmation,
}

impl VerificationCodeState {
    /// Wire tag of this state
    pub fn tag(self) -> i32 {
        match self {
            VerificationCodeState::OobVerification => 1,
            VerificationCodeState::VisualVerification => 2,
            VerificationCodeState::VisualConfirmation => 3,
        }
    }

    /// Inverse of [`tag`](Self::tag)
    pub fn from_tag(tag: i32) -> Result<Self, ProtocolError> {
        match tag {
            1 => Ok(VerificationCodeState::OobVerification),
            2 => Ok(VerificationCodeState::VisualVerification),
            3 => Ok(VerificationCodeState::VisualConfirmation),
            _ => Err(ProtocolError::Parse("VerificationCode state")),
        }
    }
}

/// Security V4 pairing-confirmation message.
///
/// Fields: `1` state (enum), `2` payload (bytes; the encrypted code for
/// [`VerificationCodeState::OobVerification`], empty otherwise).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationCode {
    /// Which confirmation flow is in effect
    pub state: VerificationCodeState,
    /// Encrypted verification code for the out-of-band flow
    pub payload: Vec<u8>,
}

/// Capability declaration exchanged on security V3+ where required.
///
/// Field: `1` repeated uint32 capabilities. Both sides currently send it
/// empty; the slot exists for interoperability.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapabilitiesExchange {
    /// Declared capability tags, currently always empty
    pub capabilities: Vec<u32>,
}

/// Key material delivered through an out-of-band channel.
///
/// Fields: `1` encryption_key (bytes), `2` ihu_iv (bytes),
/// `3` mobile_iv (bytes).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutOfBandAssociationToken {
    /// Symmetric key both sides derive the confirmation cipher from
    pub encryption_key: Vec<u8>,
    /// IV for traffic generated by the head unit
    pub ihu_iv: Vec<u8>,
    /// IV for traffic generated by the phone
    pub mobile_iv: Vec<u8>,
}

/// Payload of an out-of-band association URL.
///
/// Fields: `1` token (message), `2` device_identifier (bytes).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutOfBandAssociationData {
    /// The token, absent when the URL carried none
    pub token: Option<OutOfBandAssociationToken>,
    /// Identifies which head unit minted the URL
    pub device_identifier: Vec<u8>,
}

impl DeviceMessage {
    /// Plain (unencrypted, uncompressed) message constructor
    pub fn plain(recipient: Uuid, operation: OperationType, payload: Vec<u8>) -> Self {
        DeviceMessage {
            recipient,
            is_encrypted: false,
            operation,
            payload,
            original_size: 0,
        }
    }

    /// Message whose payload is ciphertext under the session keys
    pub fn encrypted(recipient: Uuid, operation: OperationType, payload: Vec<u8>) -> Self {
        DeviceMessage {
            recipient,
            is_encrypted: true,
            operation,
            payload,
            original_size: 0,
        }
    }
}
