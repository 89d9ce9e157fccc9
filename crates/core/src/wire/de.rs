//! nom parsers for the wire messages.
//!
//! Parsing is tolerant the way protobuf requires: unknown fields are
//! skipped, missing fields fall back to their defaults, and field order is
//! not significant. The primitives are public for the feature protocols.

use super::codec::{decode_first_varint, VarintDecode};
use super::model::*;
use super::ProtocolError;
use nom::bytes::complete::take;
use nom::error::{ErrorKind, ParseError, VerboseError};
use nom::number::complete::{le_u32, le_u64};
use uuid::Uuid;

type IResult<I, O, E = VerboseError<I>> = Result<(I, O), nom::Err<E>>;

/// A single decoded protobuf field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    /// Wire type 0
    Varint(u64),
    /// Wire type 2
    Bytes(&'a [u8]),
    /// Wire type 5, kept only so unknown fields can be skipped
    Fixed32(u32),
    /// Wire type 1, kept only so unknown fields can be skipped
    Fixed64(u64),
}

impl<'a> FieldValue<'a> {
    /// The value as an int32, truncating the way protobuf does
    pub fn as_i32(&self) -> i32 {
        match self {
            FieldValue::Varint(v) => *v as i32,
            FieldValue::Fixed32(v) => *v as i32,
            FieldValue::Fixed64(v) => *v as i32,
            FieldValue::Bytes(_) => 0,
        }
    }

    /// The value as an unsigned 32-bit integer
    pub fn as_u32(&self) -> u32 {
        match self {
            FieldValue::Varint(v) => *v as u32,
            FieldValue::Fixed32(v) => *v,
            FieldValue::Fixed64(v) => *v as u32,
            FieldValue::Bytes(_) => 0,
        }
    }

    /// The value as a bool
    pub fn as_bool(&self) -> bool {
        self.as_u32() != 0
    }

    /// The value as raw bytes; empty for scalar wire types
    pub fn as_bytes(&self) -> &'a [u8] {
        match self {
            FieldValue::Bytes(b) => b,
            _ => &[],
        }
    }
}

/// Parse one varint off the front of `input`
pub fn varint(input: &[u8]) -> IResult<&[u8], u64> {
    match decode_first_varint(input) {
        VarintDecode::Value { value, read } => Ok((&input[read..], value)),
        VarintDecode::Incomplete => Err(nom::Err::Error(VerboseError::from_error_kind(
            input,
            ErrorKind::Eof,
        ))),
        VarintDecode::Malformed => Err(nom::Err::Error(VerboseError::from_error_kind(
            input,
            ErrorKind::TooLarge,
        ))),
    }
}

/// Parse one `(field number, value)` pair
pub fn field(input: &[u8]) -> IResult<&[u8], (u32, FieldValue)> {
    let (input, key) = varint(input)?;
    let number = (key >> 3) as u32;
    match key & 0x7 {
        0 => {
            let (input, value) = varint(input)?;
            Ok((input, (number, FieldValue::Varint(value))))
        }
        1 => {
            let (input, value) = le_u64(input)?;
            Ok((input, (number, FieldValue::Fixed64(value))))
        }
        2 => {
            let (input, len) = varint(input)?;
            let (input, bytes) = take(len)(input)?;
            Ok((input, (number, FieldValue::Bytes(bytes))))
        }
        5 => {
            let (input, value) = le_u32(input)?;
            Ok((input, (number, FieldValue::Fixed32(value))))
        }
        _ => Err(nom::Err::Error(VerboseError::from_error_kind(
            input,
            ErrorKind::Tag,
        ))),
    }
}

/// Walk every field of a message, handing each to `visit`.
///
/// `visit` ignores field numbers it does not know, which gives the skip
/// behavior protobuf requires.
pub fn each_field<'a>(
    what: &'static str,
    mut input: &'a [u8],
    mut visit: impl FnMut(u32, FieldValue<'a>) -> Result<(), ProtocolError>,
) -> Result<(), ProtocolError> {
    while !input.is_empty() {
        let (rest, (number, value)) = field(input).map_err(|_| ProtocolError::Parse(what))?;
        visit(number, value)?;
        input = rest;
    }
    Ok(())
}

fn uuid_field(what: &'static str, value: FieldValue) -> Result<Uuid, ProtocolError> {
    let bytes = value.as_bytes();
    if bytes.len() != 16 {
        return Err(ProtocolError::BadRecipient(bytes.len()));
    }
    Uuid::from_slice(bytes).map_err(|_| ProtocolError::Parse(what))
}

impl Packet {
    /// Parse the contents of one BLE write
    pub fn deserialize(buf: &[u8]) -> Result<Packet, ProtocolError> {
        let mut packet = Packet {
            message_id: 0,
            packet_number: 0,
            total_packets: 0,
            payload: Vec::new(),
        };
        each_field("Packet", buf, |number, value| {
            match number {
                1 => packet.message_id = value.as_i32(),
                2 => packet.packet_number = value.as_u32(),
                3 => packet.total_packets = value.as_u32(),
                4 => packet.payload = value.as_bytes().to_vec(),
                _ => {}
            }
            Ok(())
        })?;
        Ok(packet)
    }
}

impl DeviceMessage {
    /// Parse a reassembled message envelope
    pub fn deserialize(buf: &[u8]) -> Result<DeviceMessage, ProtocolError> {
        let mut recipient = None;
        let mut is_encrypted = false;
        let mut operation = None;
        let mut payload = Vec::new();
        let mut original_size = 0u32;
        each_field("DeviceMessage", buf, |number, value| {
            match number {
                1 => recipient = Some(uuid_field("DeviceMessage", value)?),
                2 => is_encrypted = value.as_bool(),
                3 => operation = Some(OperationType::from_tag(value.as_i32())?),
                4 => payload = value.as_bytes().to_vec(),
                5 => original_size = value.as_u32(),
                _ => {}
            }
            Ok(())
        })?;
        Ok(DeviceMessage {
            recipient: recipient.ok_or(ProtocolError::Parse("DeviceMessage recipient"))?,
            is_encrypted,
            operation: operation.ok_or(ProtocolError::Parse("DeviceMessage operation"))?,
            payload,
            original_size,
        })
    }
}

impl VersionExchange {
    /// Parse the peer's version handshake
    pub fn deserialize(buf: &[u8]) -> Result<VersionExchange, ProtocolError> {
        let mut exchange = VersionExchange::default();
        each_field("VersionExchange", buf, |number, value| {
            match number {
                1 => exchange.min_messaging_version = value.as_i32(),
                2 => exchange.max_messaging_version = value.as_i32(),
                3 => exchange.min_security_version = value.as_i32(),
                4 => exchange.max_security_version = value.as_i32(),
                _ => {}
            }
            Ok(())
        })?;
        Ok(exchange)
    }
}

impl WireQuery {
    /// Parse an incoming query
    pub fn deserialize(buf: &[u8]) -> Result<WireQuery, ProtocolError> {
        let mut id = 0;
        let mut sender = None;
        let mut request = Vec::new();
        let mut parameters = Vec::new();
        each_field("Query", buf, |number, value| {
            match number {
                1 => id = value.as_i32(),
                2 => sender = Some(uuid_field("Query sender", value)?),
                3 => request = value.as_bytes().to_vec(),
                4 => parameters = value.as_bytes().to_vec(),
                _ => {}
            }
            Ok(())
        })?;
        Ok(WireQuery {
            id,
            sender: sender.ok_or(ProtocolError::Parse("Query sender"))?,
            request,
            parameters,
        })
    }
}

impl WireQueryResponse {
    /// Parse an incoming query response
    pub fn deserialize(buf: &[u8]) -> Result<WireQueryResponse, ProtocolError> {
        let mut response = WireQueryResponse {
            id: 0,
            is_successful: false,
            response: Vec::new(),
        };
        each_field("QueryResponse", buf, |number, value| {
            match number {
                1 => response.id = value.as_i32(),
                2 => response.is_successful = value.as_bool(),
                3 => response.response = value.as_bytes().to_vec(),
                _ => {}
            }
            Ok(())
        })?;
        Ok(response)
    }
}

impl VerificationCode {
    /// Parse a pairing-confirmation message
    pub fn deserialize(buf: &[u8]) -> Result<VerificationCode, ProtocolError> {
        let mut state = None;
        let mut payload = Vec::new();
        each_field("VerificationCode", buf, |number, value| {
            match number {
                1 => state = Some(VerificationCodeState::from_tag(value.as_i32())?),
                2 => payload = value.as_bytes().to_vec(),
                _ => {}
            }
            Ok(())
        })?;
        Ok(VerificationCode {
            state: state.ok_or(ProtocolError::Parse("VerificationCode state"))?,
            payload,
        })
    }
}

impl CapabilitiesExchange {
    /// Parse a capability declaration
    pub fn deserialize(buf: &[u8]) -> Result<CapabilitiesExchange, ProtocolError> {
        let mut exchange = CapabilitiesExchange::default();
        each_field("CapabilitiesExchange", buf, |number, value| {
            if number == 1 {
                exchange.capabilities.push(value.as_u32());
            }
            Ok(())
        })?;
        Ok(exchange)
    }
}

impl OutOfBandAssociationToken {
    /// Parse the token message
    pub fn deserialize(buf: &[u8]) -> Result<OutOfBandAssociationToken, ProtocolError> {
        let mut token = OutOfBandAssociationToken::default();
        each_field("OutOfBandAssociationToken", buf, |number, value| {
            match number {
                1 => token.encryption_key = value.as_bytes().to_vec(),
                2 => token.ihu_iv = value.as_bytes().to_vec(),
                3 => token.mobile_iv = value.as_bytes().to_vec(),
                _ => {}
            }
            Ok(())
        })?;
        Ok(token)
    }
}

impl OutOfBandAssociationData {
    /// Parse the payload carried by an out-of-band association URL
    pub fn deserialize(buf: &[u8]) -> Result<OutOfBandAssociationData, ProtocolError> {
        let mut data = OutOfBandAssociationData::default();
        each_field("OutOfBandAssociationData", buf, |number, value| {
            match number {
                1 => data.token = Some(OutOfBandAssociationToken::deserialize(value.as_bytes())?),
                2 => data.device_identifier = value.as_bytes().to_vec(),
                _ => {}
            }
            Ok(())
        })?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_packet_roundtrip() {
        let packet = Packet {
            message_id: 77,
            packet_number: 3,
            total_packets: 9,
            payload: vec![1, 2, 3, 4],
        };
        let bytes = packet.serialize().unwrap();
        assert_eq!(Packet::deserialize(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_device_message_roundtrip() {
        let msg = DeviceMessage {
            recipient: uuid::uuid!("5e2a68a4-27be-43f9-8d1e-4546976fabd7"),
            is_encrypted: true,
            operation: OperationType::Query,
            payload: vec![0xAA; 40],
            original_size: 120,
        };
        let bytes = msg.serialize().unwrap();
        assert_eq!(DeviceMessage::deserialize(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_device_message_requires_recipient() {
        let bytes = VersionExchange::default().serialize().unwrap();
        // Field 1 of a version exchange is a varint, not a 16-byte recipient
        assert_matches!(
            DeviceMessage::deserialize(&bytes),
            Err(ProtocolError::BadRecipient(0))
        );
        assert_matches!(
            DeviceMessage::deserialize(&[]),
            Err(ProtocolError::Parse("DeviceMessage recipient"))
        );
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let mut bytes = Packet {
            message_id: 5,
            packet_number: 1,
            total_packets: 1,
            payload: vec![9],
        }
        .serialize()
        .unwrap();
        // Append field 15, wire type 0, value 1: unknown but well-formed
        bytes.extend_from_slice(&[0x78, 0x01]);
        let packet = Packet::deserialize(&bytes).unwrap();
        assert_eq!(packet.message_id, 5);
        assert_eq!(packet.payload, vec![9]);
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let bytes = WireQuery {
            id: 12,
            sender: uuid::Uuid::nil(),
            request: vec![0xAA, 0xBB],
            parameters: Vec::new(),
        }
        .serialize()
        .unwrap();
        assert_matches!(
            WireQuery::deserialize(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::Parse("Query"))
        );
    }

    #[test]
    fn test_oob_data_roundtrip() {
        let data = OutOfBandAssociationData {
            token: Some(OutOfBandAssociationToken {
                encryption_key: vec![0x11; 16],
                ihu_iv: vec![0x22; 16],
                mobile_iv: vec![0x33; 16],
            }),
            device_identifier: vec![0x44; 8],
        };
        let bytes = data.serialize().unwrap();
        assert_eq!(OutOfBandAssociationData::deserialize(&bytes).unwrap(), data);
    }
}
