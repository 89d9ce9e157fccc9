//! The unframed stream used before versions are negotiated.
//!
//! One message is one BLE write, verbatim. Inbound values are handed up
//! addressed to the default recipient since nothing on the wire says
//! otherwise.

use super::StreamMessage;
use crate::wire::model::OperationType;
use uuid::Uuid;

/// Recipient stamped onto passthrough deliveries
pub const DEFAULT_RECIPIENT: Uuid = Uuid::nil();

pub(crate) fn encode(message: &StreamMessage) -> Vec<u8> {
    message.payload.clone()
}

pub(crate) fn decode(value: Vec<u8>) -> StreamMessage {
    StreamMessage {
        recipient: DEFAULT_RECIPIENT,
        operation: OperationType::ClientMessage,
        payload: value,
        is_encrypted: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_uses_defaults() {
        let message = decode(vec![1, 2, 3]);
        assert_eq!(message.recipient, DEFAULT_RECIPIENT);
        assert_eq!(message.operation, OperationType::ClientMessage);
        assert_eq!(message.payload, vec![1, 2, 3]);
        assert!(!message.is_encrypted);
    }

    #[test]
    fn test_encode_is_verbatim() {
        let message = StreamMessage {
            recipient: Uuid::nil(),
            operation: OperationType::ClientMessage,
            payload: vec![9, 8, 7],
            is_encrypted: false,
        };
        assert_eq!(encode(&message), vec![9, 8, 7]);
    }
}
