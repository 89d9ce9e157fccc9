//! Packetizing and reassembly for the framed stream.
//!
//! A message is one serialized [`DeviceMessage`] split across as many
//! [`Packet`]s as the MTU requires. Packet headers are varint-encoded, so
//! the split is computed iteratively: growing the packet count can grow the
//! header, which can shrink the per-packet capacity, which can grow the
//! packet count again. The loop converges as soon as the varint width of
//! the total stops changing.

use super::FramingError;
use crate::wire::model::Packet;
use crate::wire::ser::packet_overhead;

/// Split `bytes` into MTU-sized packets for `message_id`.
pub(crate) fn split_message(
    bytes: Vec<u8>,
    message_id: i32,
    mtu: usize,
) -> Result<Vec<Packet>, FramingError> {
    if bytes.is_empty() {
        return Ok(vec![Packet {
            message_id,
            packet_number: 1,
            total_packets: 1,
            payload: Vec::new(),
        }]);
    }

    let mut total: u32 = 1;
    for _ in 0..10 {
        let capacity = payload_capacity(message_id, total, mtu)?;
        let next_total = bytes.len().div_ceil(capacity) as u32;
        if next_total == total {
            break;
        }
        total = next_total;
    }

    let capacity = payload_capacity(message_id, total, mtu)?;
    let packets: Vec<Packet> = bytes
        .chunks(capacity)
        .enumerate()
        .map(|(index, chunk)| Packet {
            message_id,
            packet_number: index as u32 + 1,
            total_packets: total,
            payload: chunk.to_vec(),
        })
        .collect();
    debug_assert_eq!(packets.len() as u32, total);
    Ok(packets)
}

/// Payload bytes that fit one packet once the header is accounted for.
///
/// The payload length field is sized for a full-MTU payload, which
/// overestimates by at most a byte on the final packet.
fn payload_capacity(message_id: i32, total: u32, mtu: usize) -> Result<usize, FramingError> {
    let overhead = packet_overhead(message_id, total, total, mtu);
    if overhead >= mtu {
        return Err(FramingError::MtuTooSmall { mtu });
    }
    Ok(mtu - overhead)
}

/// Collects packets back into a message.
///
/// Only one message may be in flight per direction; a packet from a second
/// message before the first completes is fatal for the stream.
#[derive(Debug, Default)]
pub(crate) struct Reassembler {
    pending: Option<PendingMessage>,
}

#[derive(Debug)]
struct PendingMessage {
    message_id: i32,
    total: u32,
    slots: Vec<Option<Vec<u8>>>,
    filled: u32,
}

impl Reassembler {
    /// Accept one packet; yields the full message bytes on completion.
    pub(crate) fn accept(&mut self, packet: Packet) -> Result<Option<Vec<u8>>, FramingError> {
        if packet.packet_number == 0 || packet.packet_number > packet.total_packets {
            return Err(FramingError::PacketOutOfRange {
                number: packet.packet_number,
                total: packet.total_packets,
            });
        }

        let pending = match &mut self.pending {
            Some(pending) if pending.message_id != packet.message_id => {
                return Err(FramingError::Interleaved {
                    current: pending.message_id,
                    new: packet.message_id,
                });
            }
            Some(pending) => {
                if pending.total != packet.total_packets {
                    return Err(FramingError::TotalMismatch {
                        message_id: packet.message_id,
                    });
                }
                pending
            }
            None => self.pending.insert(PendingMessage {
                message_id: packet.message_id,
                total: packet.total_packets,
                slots: vec![None; packet.total_packets as usize],
                filled: 0,
            }),
        };

        let slot = &mut pending.slots[packet.packet_number as usize - 1];
        if slot.is_none() {
            pending.filled += 1;
        }
        // A duplicate overwrites; the payload is identical by construction
        *slot = Some(packet.payload);

        if pending.filled < pending.total {
            return Ok(None);
        }
        let done = self.pending.take().expect("pending just filled");
        let mut message = Vec::new();
        for slot in done.slots {
            message.extend_from_slice(&slot.expect("all slots filled"));
        }
        Ok(Some(message))
    }

    /// Whether a message is partially reassembled
    #[allow(unused)] // Used in tests
    pub(crate) fn in_progress(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn reassemble_all(packets: Vec<Packet>) -> Vec<u8> {
        let mut reassembler = Reassembler::default();
        let mut out = None;
        for packet in packets {
            out = reassembler.accept(packet).unwrap();
        }
        out.expect("message did not complete")
    }

    #[test]
    fn test_small_message_is_one_packet() {
        let packets = split_message(vec![0xAB; 20], 7, 185).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_number, 1);
        assert_eq!(packets[0].total_packets, 1);
        assert_eq!(packets[0].payload, vec![0xAB; 20]);
    }

    #[test]
    fn test_packets_fit_the_mtu() {
        let mtu = 185;
        let payload: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();
        let packets = split_message(payload.clone(), 42, mtu).unwrap();
        for packet in &packets {
            assert!(packet.serialized_len() <= mtu);
            assert!(packet.packet_number >= 1 && packet.packet_number <= packet.total_packets);
        }
        let total = packets[0].total_packets;
        assert_eq!(packets.len() as u32, total);
        let numbers: Vec<u32> = packets.iter().map(|p| p.packet_number).collect();
        assert_eq!(numbers, (1..=total).collect::<Vec<u32>>());
        assert_eq!(reassemble_all(packets), payload);
    }

    #[test]
    fn test_split_count_matches_capacity_math() {
        let mtu = 185;
        let payload = vec![0x5A; 10 * 1024];
        let packets = split_message(payload, 0, mtu).unwrap();
        // Header for message id 0, a one-byte total and a two-byte payload
        // length field is 9 bytes, so each packet carries 176 bytes
        let capacity = mtu - 9;
        assert_eq!(packets.len(), (10 * 1024usize).div_ceil(capacity));
    }

    #[test]
    fn test_mtu_too_small() {
        assert_matches!(
            split_message(vec![1, 2, 3], 1, 8),
            Err(FramingError::MtuTooSmall { mtu: 8 })
        );
    }

    #[test]
    fn test_out_of_order_arrival_reassembles_by_number() {
        let payload: Vec<u8> = (0..=255).cycle().take(1000).collect();
        let mut packets = split_message(payload.clone(), 3, 100).unwrap();
        packets.reverse();
        assert_eq!(reassemble_all(packets), payload);
    }

    #[test]
    fn test_interleaved_message_is_fatal() {
        let mut reassembler = Reassembler::default();
        let first = split_message(vec![1; 500], 10, 100).unwrap();
        reassembler.accept(first[0].clone()).unwrap();
        let second = split_message(vec![2; 500], 11, 100).unwrap();
        assert_matches!(
            reassembler.accept(second[0].clone()),
            Err(FramingError::Interleaved {
                current: 10,
                new: 11
            })
        );
    }

    #[test]
    fn test_packet_number_out_of_range_is_fatal() {
        let mut reassembler = Reassembler::default();
        let packet = Packet {
            message_id: 1,
            packet_number: 3,
            total_packets: 2,
            payload: vec![0],
        };
        assert_matches!(
            reassembler.accept(packet),
            Err(FramingError::PacketOutOfRange {
                number: 3,
                total: 2
            })
        );
        let zero = Packet {
            message_id: 1,
            packet_number: 0,
            total_packets: 2,
            payload: vec![0],
        };
        assert_matches!(
            reassembler.accept(zero),
            Err(FramingError::PacketOutOfRange { number: 0, total: 2 })
        );
    }
}
