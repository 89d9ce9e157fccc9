//! Varint math and payload compression.
//!
//! The packet splitter needs to know how big a header will be before it is
//! written, so the varint helpers here work on sizes as well as values. The
//! compression side is raw deflate wrapped in the fixed RFC 1950 annotation
//! the head unit expects: a `0x78 0x5E` prefix and a big-endian Adler-32 of
//! the plaintext as the trailer.

use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use std::io::Write;
use thiserror::Error;

/// Fixed RFC 1950 stream header carried in front of annotated payloads
pub const ZLIB_HEADER: [u8; 2] = [0x78, 0x5E];
/// Annotation overhead: two header bytes plus the four byte Adler-32 trailer
pub const ZLIB_ANNOTATION_LEN: usize = 6;

/// Largest number of bytes a single varint may occupy
const MAX_VARINT_LEN: usize = 10;

const ADLER_MOD: u32 = 65_521;

/// Failures raised by the varint and compression helpers
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payloads of one byte or less are never compressed
    #[error("Payload of {0} bytes is too small to compress")]
    TooSmall(usize),
    /// Compression is only worth transmitting when it actually shrinks
    #[error("Compressing {original} bytes produced {compressed} bytes")]
    NotSmaller {
        /// Input length
        original: usize,
        /// Length the compressor produced
        compressed: usize,
    },
    /// The advertised original size of a compressed payload is unusable
    #[error("Invalid original size {0}")]
    BadOriginalSize(usize),
    /// The payload inflated to a different size than its header claimed
    #[error("Decompressed to {got} bytes but the header claimed {expected}")]
    SizeMismatch {
        /// Bytes the decompressor produced
        got: usize,
        /// Bytes the message header promised
        expected: usize,
    },
    /// An annotated payload did not start with the zlib header bytes
    #[error("Payload is missing the zlib annotation")]
    MissingAnnotation,
    /// The deflate stream itself was rejected
    #[error("Deflate failure: {0}")]
    Deflate(String),
    /// A varint ran past the ten byte limit
    #[error("Varint is longer than {MAX_VARINT_LEN} bytes")]
    VarintTooLong,
}

/// Outcome of [`decode_first_varint`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintDecode {
    /// A full varint was present at the start of the buffer
    Value {
        /// Decoded value
        value: u64,
        /// Number of bytes the varint occupied
        read: usize,
    },
    /// The buffer ended before a terminating byte was seen
    Incomplete,
    /// More than ten continuation bytes were consumed
    Malformed,
}

/// Number of bytes `value` occupies as a base-128 varint
pub fn varint_len_u64(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Varint size of a signed 32-bit value.
///
/// Negative values sign-extend to 64 bits on the wire and always occupy the
/// full ten bytes.
pub fn varint_len_i32(value: i32) -> usize {
    varint_len_u64(value as i64 as u64)
}

/// Varint size of a signed 64-bit value
pub fn varint_len_i64(value: i64) -> usize {
    varint_len_u64(value as u64)
}

/// Encode `value` into `buf`, returning the number of bytes written.
///
/// `buf` must have room for [`MAX_VARINT_LEN`] bytes in the worst case;
/// callers size it with [`varint_len_u64`].
pub(crate) fn put_varint(mut value: u64, buf: &mut [u8]) -> usize {
    let mut i = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            buf[i] = byte | 0x80;
        } else {
            buf[i] = byte;
            return i + 1;
        }
        i += 1;
    }
}

/// Decode the varint at the start of `buf` without consuming past it.
///
/// Stops at the first byte with a clear continuation bit. Reports
/// [`VarintDecode::Incomplete`] when the buffer runs out first and
/// [`VarintDecode::Malformed`] once ten bytes have been consumed without a
/// terminator.
pub fn decode_first_varint(buf: &[u8]) -> VarintDecode {
    let mut value = 0u64;
    for (i, byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return VarintDecode::Malformed;
        }
        value |= u64::from(byte & 0x7f) << (7 * i as u32);
        if byte & 0x80 == 0 {
            return VarintDecode::Value {
                value,
                read: i + 1,
            };
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        VarintDecode::Malformed
    } else {
        VarintDecode::Incomplete
    }
}

/// Adler-32 of `data`, as defined by RFC 1950
pub fn adler32(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    // 5552 is the largest run that cannot overflow u32 before the modulo
    for chunk in data.chunks(5552) {
        for byte in chunk {
            a += u32::from(*byte);
            b += a;
        }
        a %= ADLER_MOD;
        b %= ADLER_MOD;
    }
    (b << 16) | a
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| CodecError::Deflate(e.to_string()))
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = DeflateDecoder::new(Vec::new());
    decoder
        .write_all(data)
        .and_then(|_| decoder.finish())
        .map_err(|e| CodecError::Deflate(e.to_string()))
}

/// Deflate `data`, failing unless the result is strictly smaller.
///
/// One-byte and empty payloads are rejected outright; they can never shrink.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.len() <= 1 {
        return Err(CodecError::TooSmall(data.len()));
    }
    let compressed = deflate(data)?;
    if compressed.len() >= data.len() {
        return Err(CodecError::NotSmaller {
            original: data.len(),
            compressed: compressed.len(),
        });
    }
    Ok(compressed)
}

/// Inverse of [`compress`]. `original_size` must match the inflated length.
pub fn decompress(data: &[u8], original_size: usize) -> Result<Vec<u8>, CodecError> {
    if original_size == 0 {
        return Err(CodecError::BadOriginalSize(original_size));
    }
    let inflated = inflate(data)?;
    if inflated.len() != original_size {
        return Err(CodecError::SizeMismatch {
            got: inflated.len(),
            expected: original_size,
        });
    }
    Ok(inflated)
}

/// [`compress`], wrapped in the fixed zlib header and Adler-32 trailer.
///
/// The trailer is the checksum of the *plaintext*, written big-endian so the
/// high half carries sum B and the low half sum A.
pub fn compress_annotated(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.len() <= 1 {
        return Err(CodecError::TooSmall(data.len()));
    }
    let deflated = deflate(data)?;
    let total = deflated.len() + ZLIB_ANNOTATION_LEN;
    if total >= data.len() {
        return Err(CodecError::NotSmaller {
            original: data.len(),
            compressed: total,
        });
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&ZLIB_HEADER);
    out.extend_from_slice(&deflated);
    out.extend_from_slice(&adler32(data).to_be_bytes());
    Ok(out)
}

/// Strip the zlib annotation and inflate, verifying the advertised size
pub fn decompress_annotated(data: &[u8], original_size: usize) -> Result<Vec<u8>, CodecError> {
    if original_size == 0 {
        return Err(CodecError::BadOriginalSize(original_size));
    }
    if data.len() < ZLIB_ANNOTATION_LEN + 1 || data[..2] != ZLIB_HEADER {
        return Err(CodecError::MissingAnnotation);
    }
    let body = &data[2..data.len() - 4];
    let inflated = inflate(body)?;
    if inflated.len() != original_size {
        return Err(CodecError::SizeMismatch {
            got: inflated.len(),
            expected: original_size,
        });
    }
    Ok(inflated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_varint_lens() {
        assert_eq!(varint_len_u64(0), 1);
        assert_eq!(varint_len_u64(127), 1);
        assert_eq!(varint_len_u64(128), 2);
        assert_eq!(varint_len_u64(16_383), 2);
        assert_eq!(varint_len_u64(16_384), 3);
        assert_eq!(varint_len_u64(u64::MAX), 10);
        assert_eq!(varint_len_i32(i32::MAX), 5);
        // Negative int32 sign-extends to the full ten bytes on the wire
        assert_eq!(varint_len_i32(-1), 10);
        assert_eq!(varint_len_i64(-1), 10);
        assert_eq!(varint_len_i64(i64::MAX), 9);
    }

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = [0u8; 10];
            let written = put_varint(value, &mut buf);
            assert_eq!(written, varint_len_u64(value));
            assert_matches!(
                decode_first_varint(&buf[..written]),
                VarintDecode::Value { value: v, read } if v == value && read == written
            );
        }
    }

    #[test]
    fn test_varint_stops_at_first_terminator() {
        // 300 = 0xAC 0x02, trailing garbage must not be consumed
        let buf = [0xAC, 0x02, 0xFF, 0x01];
        assert_matches!(
            decode_first_varint(&buf),
            VarintDecode::Value { value: 300, read: 2 }
        );
    }

    #[test]
    fn test_varint_incomplete_and_malformed() {
        assert_matches!(decode_first_varint(&[]), VarintDecode::Incomplete);
        assert_matches!(decode_first_varint(&[0x80, 0x80]), VarintDecode::Incomplete);
        assert_matches!(decode_first_varint(&[0x80; 10]), VarintDecode::Malformed);
        assert_matches!(decode_first_varint(&[0x80; 11]), VarintDecode::Malformed);
    }

    #[test]
    fn test_adler32_known_value() {
        // "Wikipedia" from the RFC 1950 worked example
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
        assert_eq!(adler32(b""), 1);
    }

    #[test]
    fn test_compress_roundtrip() {
        let payload = b"the quick brown fox jumps over the lazy dog ".repeat(8);
        let compressed = compress(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        assert_eq!(decompress(&compressed, payload.len()).unwrap(), payload);
    }

    #[test]
    fn test_compress_rejects_tiny_and_incompressible() {
        assert_matches!(compress(b""), Err(CodecError::TooSmall(0)));
        assert_matches!(compress(b"x"), Err(CodecError::TooSmall(1)));
        // High-entropy data does not shrink
        let noise: Vec<u8> = (0..64).map(|i| (i * 89 + 41) as u8).collect();
        assert_matches!(compress(&noise), Err(CodecError::NotSmaller { .. }));
    }

    #[test]
    fn test_decompress_validates_size() {
        let payload = b"abcabcabcabcabcabcabcabc".repeat(4);
        let compressed = compress(&payload).unwrap();
        assert_matches!(decompress(&compressed, 0), Err(CodecError::BadOriginalSize(0)));
        assert_matches!(
            decompress(&compressed, payload.len() + 1),
            Err(CodecError::SizeMismatch { .. })
        );
    }

    #[test]
    fn test_annotated_layout() {
        let payload = b"annotated annotated annotated annotated".repeat(4);
        let annotated = compress_annotated(&payload).unwrap();
        assert_eq!(annotated[..2], ZLIB_HEADER);
        let trailer = &annotated[annotated.len() - 4..];
        assert_eq!(trailer, adler32(&payload).to_be_bytes());
        assert_eq!(
            decompress_annotated(&annotated, payload.len()).unwrap(),
            payload
        );
    }

    #[test]
    fn test_annotated_rejects_missing_header() {
        let payload = b"annotated annotated annotated annotated".repeat(4);
        let mut annotated = compress_annotated(&payload).unwrap();
        annotated[0] = 0x00;
        assert_matches!(
            decompress_annotated(&annotated, payload.len()),
            Err(CodecError::MissingAnnotation)
        );
    }
}
