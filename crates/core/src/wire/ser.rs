//! cookie-factory generators for the wire messages.
//!
//! The building blocks (`gen_varint`, `gen_field_*`) are public so feature
//! protocols layered on the secured channel can encode their own messages
//! with the same primitives.

use super::codec::{put_varint, varint_len_i32, varint_len_u64};
use super::model::*;
use super::ProtocolError;
use cookie_factory::combinator::slice;
use cookie_factory::gen_simple;
use cookie_factory::multi::all;
use cookie_factory::sequence::tuple;
use cookie_factory::{GenError, SerializeFn};
use std::io::Write;

const WIRE_VARINT: u64 = 0;
const WIRE_LEN: u64 = 2;

/// Base-128 varint of `value`
pub fn gen_varint<W: Write>(value: u64) -> impl SerializeFn<W> {
    move |out| {
        let mut buf = [0u8; 10];
        let len = put_varint(value, &mut buf);
        let result = slice(&buf[..len])(out);
        result
    }
}

fn gen_key<W: Write>(field: u32, wire_type: u64) -> impl SerializeFn<W> {
    gen_varint((u64::from(field) << 3) | wire_type)
}

/// `field` as a varint-typed protobuf field
pub fn gen_field_varint<W: Write>(field: u32, value: u64) -> impl SerializeFn<W> {
    tuple((gen_key(field, WIRE_VARINT), gen_varint(value)))
}

/// `field` as an int32 field; negative values sign-extend to 64 bits
pub fn gen_field_i32<W: Write>(field: u32, value: i32) -> impl SerializeFn<W> {
    gen_field_varint(field, value as i64 as u64)
}

/// `field` as a bool field. Emitted only when true, per proto3 defaults.
pub fn gen_field_bool<W: Write>(field: u32, value: bool) -> impl SerializeFn<W> {
    move |out| {
        if value {
            gen_field_varint(field, 1)(out)
        } else {
            Ok(out)
        }
    }
}

/// `field` as a length-delimited field. Emitted only when non-empty.
pub fn gen_field_bytes<'a, W: Write + 'a>(field: u32, data: &'a [u8]) -> impl SerializeFn<W> + 'a {
    move |out| {
        if data.is_empty() {
            return Ok(out);
        }
        tuple((
            gen_key(field, WIRE_LEN),
            gen_varint(data.len() as u64),
            slice(data),
        ))(out)
    }
}

/// Run a serializer into a fresh buffer
pub fn to_vec<F>(serializer: F, what: &'static str) -> Result<Vec<u8>, ProtocolError>
where
    F: SerializeFn<Vec<u8>>,
{
    gen_simple(serializer, Vec::new()).map_err(|_: GenError| ProtocolError::Serialize(what))
}

/// Exact serialized size of a [`Packet`] with `payload_len` payload bytes.
///
/// The splitter uses this to fit packets to the MTU before any bytes exist.
/// Counting note: every field key here is a single byte, and the id fields
/// are always written even when zero so the math and the writer agree.
pub fn packet_overhead(
    message_id: i32,
    packet_number: u32,
    total_packets: u32,
    payload_len: usize,
) -> usize {
    let mut size = 1 + varint_len_i32(message_id);
    size += 1 + varint_len_u64(u64::from(packet_number));
    size += 1 + varint_len_u64(u64::from(total_packets));
    if payload_len > 0 {
        size += 1 + varint_len_u64(payload_len as u64);
    }
    size
}

impl Packet {
    /// Serialize for one BLE write
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        to_vec(
            tuple((
                gen_field_i32(1, self.message_id),
                gen_field_varint(2, u64::from(self.packet_number)),
                gen_field_varint(3, u64::from(self.total_packets)),
                gen_field_bytes(4, &self.payload),
            )),
            "Packet",
        )
    }

    /// Total bytes [`serialize`](Self::serialize) will produce
    pub fn serialized_len(&self) -> usize {
        packet_overhead(
            self.message_id,
            self.packet_number,
            self.total_packets,
            self.payload.len(),
        ) + self.payload.len()
    }
}

impl DeviceMessage {
    /// Serialize the message envelope
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        to_vec(
            tuple((
                gen_field_bytes(1, self.recipient.as_bytes()),
                gen_field_bool(2, self.is_encrypted),
                gen_field_i32(3, self.operation.tag()),
                gen_field_bytes(4, &self.payload),
                move |out| {
                    if self.original_size > 0 {
                        gen_field_varint(5, u64::from(self.original_size))(out)
                    } else {
                        Ok(out)
                    }
                },
            )),
            "DeviceMessage",
        )
    }
}

impl VersionExchange {
    /// Serialize the unframed version handshake
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        to_vec(
            tuple((
                gen_field_i32(1, self.min_messaging_version),
                gen_field_i32(2, self.max_messaging_version),
                gen_field_i32(3, self.min_security_version),
                gen_field_i32(4, self.max_security_version),
            )),
            "VersionExchange",
        )
    }
}

impl WireQuery {
    /// Serialize for transmission with the query operation type
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        to_vec(
            tuple((
                gen_field_i32(1, self.id),
                gen_field_bytes(2, self.sender.as_bytes()),
                gen_field_bytes(3, &self.request),
                gen_field_bytes(4, &self.parameters),
            )),
            "Query",
        )
    }
}

impl WireQueryResponse {
    /// Serialize for transmission with the query-response operation type
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        to_vec(
            tuple((
                gen_field_i32(1, self.id),
                gen_field_bool(2, self.is_successful),
                gen_field_bytes(3, &self.response),
            )),
            "QueryResponse",
        )
    }
}

impl VerificationCode {
    /// Serialize the pairing-confirmation message
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        to_vec(
            tuple((
                gen_field_i32(1, self.state.tag()),
                gen_field_bytes(2, &self.payload),
            )),
            "VerificationCode",
        )
    }
}

impl CapabilitiesExchange {
    /// Serialize the capability declaration
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        to_vec(
            all(self
                .capabilities
                .iter()
                .map(|cap| gen_field_varint(1, u64::from(*cap)))),
            "CapabilitiesExchange",
        )
    }
}

impl OutOfBandAssociationToken {
    /// Serialize the token message
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        to_vec(
            tuple((
                gen_field_bytes(1, &self.encryption_key),
                gen_field_bytes(2, &self.ihu_iv),
                gen_field_bytes(3, &self.mobile_iv),
            )),
            "OutOfBandAssociationToken",
        )
    }
}

impl OutOfBandAssociationData {
    /// Serialize the URL payload
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        let token = match &self.token {
            Some(token) => token.serialize()?,
            None => Vec::new(),
        };
        to_vec(
            tuple((
                gen_field_bytes(1, &token),
                gen_field_bytes(2, &self.device_identifier),
            )),
            "OutOfBandAssociationData",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_packet_serialized_len_matches() {
        let packet = Packet {
            message_id: 300,
            packet_number: 1,
            total_packets: 200,
            payload: vec![0xAB; 57],
        };
        assert_eq!(packet.serialize().unwrap().len(), packet.serialized_len());

        let empty = Packet {
            message_id: 0,
            packet_number: 1,
            total_packets: 1,
            payload: Vec::new(),
        };
        assert_eq!(empty.serialize().unwrap().len(), empty.serialized_len());
    }

    #[test]
    fn test_known_packet_bytes() {
        let packet = Packet {
            message_id: 1,
            packet_number: 1,
            total_packets: 2,
            payload: vec![0xCA, 0xFE],
        };
        assert_eq!(
            packet.serialize().unwrap(),
            vec![0x08, 0x01, 0x10, 0x01, 0x18, 0x02, 0x22, 0x02, 0xCA, 0xFE]
        );
    }

    #[test]
    fn test_device_message_omits_defaults() {
        let msg = DeviceMessage::plain(
            Uuid::nil(),
            OperationType::ClientMessage,
            Vec::new(),
        );
        let bytes = msg.serialize().unwrap();
        // recipient (18) + operation (2); no encrypted flag, payload or size
        assert_eq!(bytes.len(), 20);
    }
}
