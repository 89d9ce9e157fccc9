//! Session crypto seam and pairing-code helpers.
//!
//! The actual key exchange (UKey2) lives outside this crate; the state
//! machines drive it through [`KeyExchange`] and end up with a
//! [`SessionContext`] that [`SessionCrypto`] adapts onto the framed stream.
//! The out-of-band confirmation cipher at the bottom is the one piece of
//! symmetric crypto this crate owns.

use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use aes::Aes128;
use cfb_mode::{Decryptor, Encryptor};
use thiserror::Error;

use super::model::OutOfBandAssociationToken;

type Aes128CfbEnc = Encryptor<Aes128>;
type Aes128CfbDec = Decryptor<Aes128>;

const OOB_KEY_LEN: usize = 16;
const OOB_IV_LEN: usize = 16;

/// Security failures across key exchange, session crypto and pairing
#[derive(Debug, Error)]
pub enum SecurityError {
    /// The session context rejected an encode or decode
    #[error("Crypto failure: {0}")]
    CryptoFailure(String),
    /// The key exchange reported a failure or an out-of-order message
    #[error("Key exchange failed: {0}")]
    KeyExchange(String),
    /// The peer's reconnection HMAC did not match the stored key
    #[error("Reconnection handshake mismatch")]
    HandshakeMismatch,
    /// The user or the head unit rejected the pairing code
    #[error("Pairing code rejected")]
    PairingCodeRejected,
    /// The established session could not be serialized for storage
    #[error("Could not save the session: {0}")]
    SaveSession(String),
    /// The out-of-band token is missing material or has the wrong shape
    #[error("Out-of-band token is invalid")]
    InvalidOobToken,
}

/// An established, resumable secure session.
///
/// Produced by a completed [`KeyExchange`] or by resuming saved state via
/// [`KeyExchangeFactory::resume_session`].
pub trait SessionContext: Send + Sync {
    /// Encrypt and authenticate `plaintext`
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError>;
    /// Verify and decrypt `ciphertext`
    fn decode(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SecurityError>;
    /// Serialize for storage so the session can be resumed later
    fn save(&self) -> Result<Vec<u8>, SecurityError>;
}

/// What the key exchange needs next
pub enum HandshakeProgress {
    /// Send this message and keep feeding peer replies in
    Continue(Vec<u8>),
    /// The exchange is cryptographically done pending verification.
    ///
    /// `reply` (when present) must still be sent to the peer; `token` is the
    /// material the pairing code is derived from.
    AwaitingVerification {
        /// Verification token shared with the peer
        token: Vec<u8>,
        /// Final handshake message to transmit, if any
        reply: Option<Vec<u8>>,
    },
}

/// One in-flight key exchange, phone side as initiator
pub trait KeyExchange: Send {
    /// The first message to transmit
    fn initial_message(&mut self) -> Result<Vec<u8>, SecurityError>;
    /// Feed in a peer handshake message
    fn handle_message(&mut self, message: &[u8]) -> Result<HandshakeProgress, SecurityError>;
    /// Assert the pairing code was accepted and finish the exchange
    fn notify_verification_accepted(self: Box<Self>)
        -> Result<Box<dyn SessionContext>, SecurityError>;
}

/// Supplies fresh key exchanges and resumes stored sessions
pub trait KeyExchangeFactory: Send + Sync {
    /// Begin a fresh exchange for an association
    fn begin_exchange(&self) -> Box<dyn KeyExchange>;
    /// Rebuild a session from bytes produced by [`SessionContext::save`]
    fn resume_session(&self, saved: &[u8]) -> Result<Box<dyn SessionContext>, SecurityError>;
}

/// Adapter that carries a [`SessionContext`] over the framed stream
pub struct SessionCrypto {
    context: Box<dyn SessionContext>,
}

impl SessionCrypto {
    /// Wrap an established session
    pub fn new(context: Box<dyn SessionContext>) -> Self {
        SessionCrypto { context }
    }

    /// Encrypt an outgoing payload
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        self.context
            .encode(plaintext)
            .map_err(|e| SecurityError::CryptoFailure(e.to_string()))
    }

    /// Decrypt an incoming payload
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        self.context
            .decode(ciphertext)
            .map_err(|e| SecurityError::CryptoFailure(e.to_string()))
    }

    /// Serialize the session for the association record
    pub fn save(&self) -> Result<Vec<u8>, SecurityError> {
        self.context
            .save()
            .map_err(|e| SecurityError::SaveSession(e.to_string()))
    }
}

impl std::fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCrypto").finish_non_exhaustive()
    }
}

/// Six-digit code the user compares between phone and head unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCode(String);

impl PairingCode {
    /// Derive the displayable code from a verification token.
    ///
    /// Both sides take the first four token bytes as a big-endian integer
    /// modulo one million, zero padded to six digits.
    pub fn from_token(token: &[u8]) -> Self {
        let mut prefix = [0u8; 4];
        for (slot, byte) in prefix.iter_mut().zip(token.iter()) {
            *slot = *byte;
        }
        let value = u32::from_be_bytes(prefix) % 1_000_000;
        PairingCode(format!("{value:06}"))
    }

    /// The code as the user sees it
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PairingCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn oob_cipher_parts(token: &OutOfBandAssociationToken) -> Result<(), SecurityError> {
    if token.encryption_key.len() != OOB_KEY_LEN
        || token.ihu_iv.len() != OOB_IV_LEN
        || token.mobile_iv.len() != OOB_IV_LEN
    {
        return Err(SecurityError::InvalidOobToken);
    }
    Ok(())
}

/// Encrypt the verification code for transmission under an OOB token.
///
/// Phone-originated traffic uses the token's mobile IV.
pub fn oob_encrypt_code(
    token: &OutOfBandAssociationToken,
    code: &[u8],
) -> Result<Vec<u8>, SecurityError> {
    oob_cipher_parts(token)?;
    let enc = Aes128CfbEnc::new(
        token.encryption_key.as_slice().into(),
        token.mobile_iv.as_slice().into(),
    );
    let mut buf = code.to_vec();
    enc.encrypt(&mut buf);
    Ok(buf)
}

/// Decrypt a head-unit confirmation encrypted under an OOB token
pub fn oob_decrypt_code(
    token: &OutOfBandAssociationToken,
    data: &[u8],
) -> Result<Vec<u8>, SecurityError> {
    oob_cipher_parts(token)?;
    let dec = Aes128CfbDec::new(
        token.encryption_key.as_slice().into(),
        token.ihu_iv.as_slice().into(),
    );
    let mut buf = data.to_vec();
    dec.decrypt(&mut buf);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn token() -> OutOfBandAssociationToken {
        OutOfBandAssociationToken {
            encryption_key: vec![0x42; 16],
            ihu_iv: vec![0x01; 16],
            mobile_iv: vec![0x02; 16],
        }
    }

    #[test]
    fn test_pairing_code_is_six_digits() {
        let code = PairingCode::from_token(&[0xFF, 0xFF, 0xFF, 0xFF, 0xAA]);
        assert_eq!(code.as_str().len(), 6);
        // 0xFFFFFFFF % 1_000_000 = 967295
        assert_eq!(code.as_str(), "967295");
        // Short tokens zero-pad rather than panic
        assert_eq!(PairingCode::from_token(&[0x00]).as_str(), "000000");
    }

    #[test]
    fn test_oob_cipher_is_directional() {
        let code = b"123456";
        let sent = oob_encrypt_code(&token(), code).unwrap();
        assert_ne!(sent, code);
        // The receive direction uses the other IV, so it must not decrypt
        // phone-originated traffic back to the plaintext
        assert_ne!(oob_decrypt_code(&token(), &sent).unwrap(), code);
    }

    #[test]
    fn test_oob_cipher_rejects_short_key() {
        let mut bad = token();
        bad.encryption_key.truncate(8);
        assert_matches!(
            oob_encrypt_code(&bad, b"123456"),
            Err(SecurityError::InvalidOobToken)
        );
    }
}
