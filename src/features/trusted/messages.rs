//! Wire messages of the trusted-device protocol.
//!
//! Every message is `{ kind: enum = 1, payload: bytes = 2 }`; the payload
//! encoding depends on the kind and is handled here so the feature logic
//! never touches field numbers.

use carlink_core::storage::PhoneCredentials;
use carlink_core::wire::de::each_field;
use carlink_core::wire::ser::{gen_field_bool, gen_field_bytes, gen_field_i32, to_vec};
use carlink_core::wire::ProtocolError;
use cookie_factory::sequence::tuple;

/// Reasons the phone refuses an enrollment or unlock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustedDeviceErrorKind {
    /// The phone has no passcode set while policy requires one
    DeviceNotSecured,
    /// Anything else; the raw tag is preserved
    Other(i32),
}

impl TrustedDeviceErrorKind {
    fn tag(self) -> i32 {
        match self {
            TrustedDeviceErrorKind::DeviceNotSecured => 1,
            TrustedDeviceErrorKind::Other(tag) => tag,
        }
    }

    fn from_tag(tag: i32) -> Self {
        match tag {
            1 => TrustedDeviceErrorKind::DeviceNotSecured,
            other => TrustedDeviceErrorKind::Other(other),
        }
    }
}

/// One trusted-device protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustedDeviceMessage {
    /// Head unit (or user) kicks off enrollment
    StartEnrollment,
    /// Phone-generated escrow token
    EscrowToken(Vec<u8>),
    /// Car-issued handle to the escrowed token
    Handle(Vec<u8>),
    /// Generic acknowledgement
    Ack,
    /// Credentials authorizing an unlock
    UnlockCredentials(PhoneCredentials),
    /// The phone refuses to proceed
    Error(TrustedDeviceErrorKind),
    /// Either side declares whether enrollment is active
    StateSync {
        /// False announces an unenrollment
        enabled: bool,
    },
}

impl TrustedDeviceMessage {
    fn kind_tag(&self) -> i32 {
        match self {
            TrustedDeviceMessage::StartEnrollment => 1,
            TrustedDeviceMessage::EscrowToken(_) => 2,
            TrustedDeviceMessage::Handle(_) => 3,
            TrustedDeviceMessage::Ack => 4,
            TrustedDeviceMessage::UnlockCredentials(_) => 5,
            TrustedDeviceMessage::Error(_) => 6,
            TrustedDeviceMessage::StateSync { .. } => 7,
        }
    }

    /// Serialize for transmission on the secured channel
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self {
            TrustedDeviceMessage::StartEnrollment | TrustedDeviceMessage::Ack => Vec::new(),
            TrustedDeviceMessage::EscrowToken(token) => token.clone(),
            TrustedDeviceMessage::Handle(handle) => handle.clone(),
            TrustedDeviceMessage::UnlockCredentials(credentials) => to_vec(
                tuple((
                    gen_field_bytes(1, &credentials.escrow_token),
                    gen_field_bytes(2, &credentials.handle),
                )),
                "PhoneCredentials",
            )?,
            TrustedDeviceMessage::Error(kind) => {
                to_vec(gen_field_i32(1, kind.tag()), "TrustedDeviceError")?
            }
            TrustedDeviceMessage::StateSync { enabled } => {
                to_vec(gen_field_bool(1, *enabled), "TrustedDeviceState")?
            }
        };
        to_vec(
            tuple((
                gen_field_i32(1, self.kind_tag()),
                gen_field_bytes(2, &payload),
            )),
            "TrustedDeviceMessage",
        )
    }

    /// Parse a message received on the secured channel
    pub fn deserialize(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut kind = 0;
        let mut payload: &[u8] = &[];
        each_field("TrustedDeviceMessage", buf, |number, value| {
            match number {
                1 => kind = value.as_i32(),
                2 => payload = value.as_bytes(),
                _ => {}
            }
            Ok(())
        })?;
        match kind {
            1 => Ok(TrustedDeviceMessage::StartEnrollment),
            2 => Ok(TrustedDeviceMessage::EscrowToken(payload.to_vec())),
            3 => Ok(TrustedDeviceMessage::Handle(payload.to_vec())),
            4 => Ok(TrustedDeviceMessage::Ack),
            5 => {
                let mut credentials = PhoneCredentials {
                    escrow_token: Vec::new(),
                    handle: Vec::new(),
                };
                each_field("PhoneCredentials", payload, |number, value| {
                    match number {
                        1 => credentials.escrow_token = value.as_bytes().to_vec(),
                        2 => credentials.handle = value.as_bytes().to_vec(),
                        _ => {}
                    }
                    Ok(())
                })?;
                Ok(TrustedDeviceMessage::UnlockCredentials(credentials))
            }
            6 => {
                let mut tag = 0;
                each_field("TrustedDeviceError", payload, |number, value| {
                    if number == 1 {
                        tag = value.as_i32();
                    }
                    Ok(())
                })?;
                Ok(TrustedDeviceMessage::Error(
                    TrustedDeviceErrorKind::from_tag(tag),
                ))
            }
            7 => {
                let mut enabled = false;
                each_field("TrustedDeviceState", payload, |number, value| {
                    if number == 1 {
                        enabled = value.as_bool();
                    }
                    Ok(())
                })?;
                Ok(TrustedDeviceMessage::StateSync { enabled })
            }
            _ => Err(ProtocolError::Parse("TrustedDeviceMessage kind")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrips() {
        let messages = [
            TrustedDeviceMessage::StartEnrollment,
            TrustedDeviceMessage::EscrowToken(vec![0xAA; 16]),
            TrustedDeviceMessage::Handle(vec![0xBB; 8]),
            TrustedDeviceMessage::Ack,
            TrustedDeviceMessage::UnlockCredentials(PhoneCredentials {
                escrow_token: vec![1, 2, 3],
                handle: vec![4, 5],
            }),
            TrustedDeviceMessage::Error(TrustedDeviceErrorKind::DeviceNotSecured),
            TrustedDeviceMessage::StateSync { enabled: false },
            TrustedDeviceMessage::StateSync { enabled: true },
        ];
        for message in messages {
            let bytes = message.serialize().unwrap();
            assert_eq!(TrustedDeviceMessage::deserialize(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let bytes = to_vec(gen_field_i32(1, 42), "test").unwrap();
        assert!(TrustedDeviceMessage::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_unknown_error_tag_is_preserved() {
        let bytes = TrustedDeviceMessage::Error(TrustedDeviceErrorKind::Other(9))
            .serialize()
            .unwrap();
        assert_eq!(
            TrustedDeviceMessage::deserialize(&bytes).unwrap(),
            TrustedDeviceMessage::Error(TrustedDeviceErrorKind::Other(9))
        );
    }
}
