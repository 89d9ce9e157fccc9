//! Message framing over BLE characteristic writes and notifications.
//!
//! A [`MessageStream`] owns two tasks: a writer that drains a FIFO of
//! outgoing messages, packetizing each one and pacing consecutive writes on
//! the transport's readiness, and a reader that reassembles notification
//! values back into whole messages. Both tasks follow the stream version,
//! which starts as [`MessageStreamVersion::Passthrough`] for the version
//! exchange and is switched once negotiation resolves.
//!
//! The switch is only sound while the protocol is in lockstep: the peer
//! must not have framed traffic in flight when [`MessageStream::set_version`]
//! is called, which the state machines guarantee by never writing ahead of
//! the exchange.

pub mod passthrough;
mod v2;

use log::*;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::transport::{BlePeripheral, TransportError};
use crate::wire::codec::{self, CodecError};
use crate::wire::model::{DeviceMessage, OperationType, Packet};
use crate::Result;

/// Unrecoverable conditions in the framing layer
#[derive(Debug, Error)]
pub enum FramingError {
    /// A packet number fell outside its own advertised total
    #[error("Packet number {number} outside 1..={total}")]
    PacketOutOfRange {
        /// Offending packet number
        number: u32,
        /// Total the packet advertised
        total: u32,
    },
    /// A second message started before the current one completed
    #[error("Message {new} began before message {current} completed")]
    Interleaved {
        /// Message being reassembled
        current: i32,
        /// Message id of the intruding packet
        new: i32,
    },
    /// Packets of one message disagreed about the total
    #[error("Packet total changed mid-message {message_id}")]
    TotalMismatch {
        /// Message the packets belonged to
        message_id: i32,
    },
    /// The MTU cannot even fit a packet header
    #[error("MTU of {mtu} bytes cannot fit a packet")]
    MtuTooSmall {
        /// The offending MTU
        mtu: usize,
    },
    /// Compression or decompression failed
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Which framing is active on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStreamVersion {
    /// No framing; used only for the version exchange
    Passthrough,
    /// Packetized stream, optionally compressing payloads
    V2 {
        /// Whether both sides agreed to compression
        compression: bool,
    },
}

/// One whole message as the layers above the stream see it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Feature the payload is addressed to
    pub recipient: Uuid,
    /// What the payload is
    pub operation: OperationType,
    /// Application bytes; plaintext or ciphertext per `is_encrypted`
    pub payload: Vec<u8>,
    /// Whether `payload` is ciphertext under the session keys
    pub is_encrypted: bool,
}

/// Allocator for per-message ids.
///
/// Yields the current value then increments, wrapping to zero past
/// `i32::MAX`. One lives inside each stream's writer; callers are already
/// serialized by the write FIFO.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    next: i32,
}

impl MessageIdGenerator {
    /// Fresh generator starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// The next message id
    pub fn next(&mut self) -> i32 {
        let id = self.next;
        self.next = if self.next == i32::MAX {
            0
        } else {
            self.next + 1
        };
        id
    }
}

struct WriteRequest {
    message: StreamMessage,
    done: oneshot::Sender<Result<()>>,
}

/// Framed (or passthrough) messaging over one peripheral.
///
/// Dropping the stream stops both tasks; undelivered sends resolve with a
/// transport error.
pub struct MessageStream {
    requests: mpsc::Sender<WriteRequest>,
    incoming: mpsc::Receiver<Result<StreamMessage>>,
    version: watch::Sender<MessageStreamVersion>,
    cancel: CancellationToken,
}

impl MessageStream {
    /// Build a stream over `peripheral`, writing to `write_characteristic`
    /// and reading the values arriving on `notifications`.
    pub fn new(
        version: MessageStreamVersion,
        peripheral: Arc<dyn BlePeripheral>,
        write_characteristic: Uuid,
        notifications: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        let (version_tx, version_rx) = watch::channel(version);
        let (request_tx, request_rx) = mpsc::channel(16);
        let (incoming_tx, incoming_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();

        tokio::task::spawn(run_writer(
            peripheral,
            write_characteristic,
            version_rx.clone(),
            request_rx,
            cancel.clone(),
        ));
        tokio::task::spawn(run_reader(
            version_rx,
            notifications,
            incoming_tx,
            cancel.clone(),
        ));

        MessageStream {
            requests: request_tx,
            incoming: incoming_rx,
            version: version_tx,
            cancel,
        }
    }

    /// Switch framing once the version exchange has resolved
    pub fn set_version(&self, version: MessageStreamVersion) {
        let _ = self.version.send(version);
    }

    /// Queue `message` and resolve once it is fully written.
    ///
    /// Messages go out strictly in submission order.
    pub async fn send(&self, message: StreamMessage) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.requests
            .send(WriteRequest {
                message,
                done: done_tx,
            })
            .await
            .map_err(|_| crate::Error::Transport(TransportError::NotConnected))?;
        done_rx
            .await
            .unwrap_or(Err(crate::Error::Transport(TransportError::NotConnected)))
    }

    /// Next complete inbound message.
    ///
    /// Framing and protocol failures surface here exactly once; afterwards
    /// the stream is dead and every call reports the transport as gone.
    pub async fn recv(&mut self) -> Result<StreamMessage> {
        self.incoming
            .recv()
            .await
            .unwrap_or(Err(crate::Error::Transport(TransportError::NotConnected)))
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("version", &*self.version.borrow())
            .finish_non_exhaustive()
    }
}

async fn run_writer(
    peripheral: Arc<dyn BlePeripheral>,
    characteristic: Uuid,
    version: watch::Receiver<MessageStreamVersion>,
    mut requests: mpsc::Receiver<WriteRequest>,
    cancel: CancellationToken,
) {
    let mut ids = MessageIdGenerator::new();
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let current = *version.borrow();
        let result = write_message(
            &*peripheral,
            characteristic,
            current,
            &mut ids,
            request.message,
        )
        .await;
        let _ = request.done.send(result);
    }
    trace!("Stream writer finished");
}

async fn write_message(
    peripheral: &dyn BlePeripheral,
    characteristic: Uuid,
    version: MessageStreamVersion,
    ids: &mut MessageIdGenerator,
    message: StreamMessage,
) -> Result<()> {
    let compression = match version {
        MessageStreamVersion::Passthrough => {
            let value = passthrough::encode(&message);
            return peripheral
                .write_value(characteristic, &value)
                .await
                .map_err(crate::Error::from);
        }
        MessageStreamVersion::V2 { compression } => compression,
    };

    let mut payload = message.payload;
    let mut original_size = 0u32;
    if compression {
        match codec::compress_annotated(&payload) {
            Ok(compressed) => {
                original_size = payload.len() as u32;
                payload = compressed;
            }
            // Not worth compressing; send as-is
            Err(CodecError::TooSmall(_)) | Err(CodecError::NotSmaller { .. }) => {}
            Err(e) => {
                debug!("Compressor rejected payload, sending uncompressed: {e:?}");
            }
        }
    }

    let envelope = DeviceMessage {
        recipient: message.recipient,
        is_encrypted: message.is_encrypted,
        operation: message.operation,
        payload,
        original_size,
    };
    let bytes = envelope.serialize().map_err(crate::Error::from)?;
    let packets = v2::split_message(bytes, ids.next(), peripheral.max_write_len())
        .map_err(crate::Error::from)?;
    let total = packets.len();
    for packet in packets {
        let value = packet.serialize().map_err(crate::Error::from)?;
        peripheral
            .write_value(characteristic, &value)
            .await
            .map_err(crate::Error::from)?;
    }
    trace!("Wrote message as {total} packet(s)");
    Ok(())
}

async fn run_reader(
    version: watch::Receiver<MessageStreamVersion>,
    mut notifications: mpsc::Receiver<Vec<u8>>,
    incoming: mpsc::Sender<Result<StreamMessage>>,
    cancel: CancellationToken,
) {
    let mut reassembler = v2::Reassembler::default();
    loop {
        let value = tokio::select! {
            _ = cancel.cancelled() => break,
            value = notifications.recv() => match value {
                Some(value) => value,
                None => break,
            },
        };
        let current = *version.borrow();
        match read_value(current, &mut reassembler, value) {
            Ok(None) => {}
            Ok(Some(message)) => {
                if incoming.send(Ok(message)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                // Fatal for the stream; report once and stop reading
                error!("Message stream is unrecoverable: {e:?}");
                let _ = incoming.send(Err(e)).await;
                return;
            }
        }
    }
    trace!("Stream reader finished");
}

fn read_value(
    version: MessageStreamVersion,
    reassembler: &mut v2::Reassembler,
    value: Vec<u8>,
) -> Result<Option<StreamMessage>> {
    if let MessageStreamVersion::Passthrough = version {
        return Ok(Some(passthrough::decode(value)));
    }

    let packet = Packet::deserialize(&value)?;
    let Some(bytes) = reassembler.accept(packet)? else {
        return Ok(None);
    };
    let envelope = DeviceMessage::deserialize(&bytes)?;
    let payload = if envelope.original_size > 0 {
        codec::decompress_annotated(&envelope.payload, envelope.original_size as usize)
            .map_err(FramingError::from)?
    } else {
        envelope.payload
    };
    Ok(Some(StreamMessage {
        recipient: envelope.recipient,
        operation: envelope.operation,
        payload,
        is_encrypted: envelope.is_encrypted,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPeripheral;
    use assert_matches::assert_matches;
    use env_logger::Env;

    fn init() {
        let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .is_test(true)
            .try_init();
    }

    const WRITE_CHAR: Uuid = uuid::uuid!("5e2a68a5-27be-43f9-8d1e-4546976fabd7");

    #[test]
    fn test_message_id_generator_wraps() {
        let mut ids = MessageIdGenerator::new();
        assert_eq!(ids.next(), 0);
        assert_eq!(ids.next(), 1);
        ids.next = i32::MAX;
        assert_eq!(ids.next(), i32::MAX);
        assert_eq!(ids.next(), 0);
    }

    fn message(payload: Vec<u8>) -> StreamMessage {
        StreamMessage {
            recipient: uuid::uuid!("00000000-0000-0000-0000-000000000aaa"),
            operation: OperationType::ClientMessage,
            payload,
            is_encrypted: false,
        }
    }

    #[tokio::test]
    async fn test_passthrough_write_is_verbatim() {
        init();
        let (peripheral, mut remote) = MockPeripheral::connected(185);
        let notifications = remote.subscription(WRITE_CHAR);
        let stream = MessageStream::new(
            MessageStreamVersion::Passthrough,
            peripheral,
            WRITE_CHAR,
            notifications,
        );
        stream.send(message(vec![1, 2, 3])).await.unwrap();
        let (characteristic, value) = remote.next_write().await.unwrap();
        assert_eq!(characteristic, WRITE_CHAR);
        assert_eq!(value, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_passthrough_read_uses_default_recipient() {
        init();
        let (peripheral, mut remote) = MockPeripheral::connected(185);
        let notifications = remote.subscription(WRITE_CHAR);
        let mut stream = MessageStream::new(
            MessageStreamVersion::Passthrough,
            peripheral,
            WRITE_CHAR,
            notifications,
        );
        remote.notify(WRITE_CHAR, vec![0xAA, 0xBB]).await;
        let received = stream.recv().await.unwrap();
        assert_eq!(received.recipient, passthrough::DEFAULT_RECIPIENT);
        assert_eq!(received.operation, OperationType::ClientMessage);
        assert_eq!(received.payload, vec![0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn test_v2_ten_kilobytes_over_small_mtu() {
        init();
        let mtu = 185;
        let (peripheral, mut remote) = MockPeripheral::connected(mtu);
        let notifications = remote.subscription(WRITE_CHAR);
        let stream = MessageStream::new(
            MessageStreamVersion::V2 { compression: false },
            peripheral,
            WRITE_CHAR,
            notifications,
        );

        // Incompressible payload so the count is exact
        let payload: Vec<u8> = (0..10 * 1024u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let sent = message(payload.clone());
        stream.send(sent.clone()).await.unwrap();

        // Replay every write into a second stream and check reassembly
        let (far_peripheral, mut far_remote) = MockPeripheral::connected(mtu);
        let far_notifications = far_remote.subscription(WRITE_CHAR);
        let mut far_stream = MessageStream::new(
            MessageStreamVersion::V2 { compression: false },
            far_peripheral,
            WRITE_CHAR,
            far_notifications,
        );

        let mut writes = 0usize;
        let mut expected_total = None;
        while let Ok((_, value)) = remote.try_next_write() {
            let packet = Packet::deserialize(&value).unwrap();
            assert!(value.len() <= mtu);
            assert_eq!(packet.message_id, 0);
            assert_eq!(packet.packet_number as usize, writes + 1);
            expected_total.get_or_insert(packet.total_packets);
            assert_eq!(Some(packet.total_packets), expected_total);
            writes += 1;
            far_remote.notify(WRITE_CHAR, value).await;
        }
        // 9 byte header -> 176 payload bytes per packet
        assert_eq!(writes, (10 * 1024usize).div_ceil(mtu - 9));
        assert_eq!(Some(writes as u32), expected_total);

        let received = far_stream.recv().await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_v2_compression_roundtrip() {
        init();
        let (peripheral, mut remote) = MockPeripheral::connected(185);
        let notifications = remote.subscription(WRITE_CHAR);
        let stream = MessageStream::new(
            MessageStreamVersion::V2 { compression: true },
            peripheral,
            WRITE_CHAR,
            notifications,
        );

        let payload = b"all work and no play makes jack a dull boy ".repeat(40);
        stream.send(message(payload.to_vec())).await.unwrap();

        let (far_peripheral, mut far_remote) = MockPeripheral::connected(185);
        let far_notifications = far_remote.subscription(WRITE_CHAR);
        let mut far_stream = MessageStream::new(
            MessageStreamVersion::V2 { compression: true },
            far_peripheral,
            WRITE_CHAR,
            far_notifications,
        );

        let mut writes = 0usize;
        while let Ok((_, value)) = remote.try_next_write() {
            writes += 1;
            far_remote.notify(WRITE_CHAR, value).await;
        }
        // The repeated payload must compress below a tenth of its size
        assert!(writes <= 2, "expected compression, saw {writes} packets");
        assert_eq!(far_stream.recv().await.unwrap().payload, payload);
    }

    #[tokio::test]
    async fn test_interleaved_messages_kill_the_stream() {
        init();
        let (peripheral, mut remote) = MockPeripheral::connected(185);
        let notifications = remote.subscription(WRITE_CHAR);
        let mut stream = MessageStream::new(
            MessageStreamVersion::V2 { compression: false },
            peripheral,
            WRITE_CHAR,
            notifications,
        );

        let first = Packet {
            message_id: 1,
            packet_number: 1,
            total_packets: 2,
            payload: vec![0xAA; 10],
        };
        let intruder = Packet {
            message_id: 2,
            packet_number: 1,
            total_packets: 2,
            payload: vec![0xBB; 10],
        };
        remote.notify(WRITE_CHAR, first.serialize().unwrap()).await;
        remote
            .notify(WRITE_CHAR, intruder.serialize().unwrap())
            .await;

        assert_matches!(
            stream.recv().await,
            Err(crate::Error::Framing(FramingError::Interleaved { current: 1, new: 2 }))
        );
        // The stream is dead afterwards
        assert_matches!(
            stream.recv().await,
            Err(crate::Error::Transport(TransportError::NotConnected))
        );
    }

    #[tokio::test]
    async fn test_version_switch_after_exchange() {
        init();
        let (peripheral, mut remote) = MockPeripheral::connected(185);
        let notifications = remote.subscription(WRITE_CHAR);
        let mut stream = MessageStream::new(
            MessageStreamVersion::Passthrough,
            peripheral,
            WRITE_CHAR,
            notifications,
        );

        stream.set_version(MessageStreamVersion::V2 { compression: false });
        stream.send(message(vec![0x42; 8])).await.unwrap();
        let (_, value) = remote.next_write().await.unwrap();
        let packet = Packet::deserialize(&value).unwrap();
        assert_eq!(packet.total_packets, 1);

        // And the reader now reassembles packets too
        remote.notify(WRITE_CHAR, value).await;
        let received = stream.recv().await.unwrap();
        assert_eq!(received.payload, vec![0x42; 8]);
    }
}
