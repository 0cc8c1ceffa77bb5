//! LBN wire envelope — the fixed frame header for all LBN traffic.
//!
//! Every message exchanged with the Location-Based Network node is one
//! frame: a 10-byte envelope header followed by a CBOR body. The header
//! IS the protocol — every field and size here is compatibility-critical
//! and must not change.
//!
//! The header is #[repr(C, packed)] with zerocopy derives so it can be
//! cast directly from untrusted network bytes. Multi-byte fields are raw
//! big-endian byte arrays (network byte order), which also sidesteps
//! unaligned-access pitfalls of packed structs.

use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Frame magic, first four bytes of every frame.
pub const WIRE_MAGIC: [u8; 4] = *b"LBN1";

/// Wire format version. Currently 0x01.
pub const WIRE_VERSION: u8 = 0x01;

/// Envelope header length in bytes.
pub const HEADER_LEN: usize = 10;

/// Maximum CBOR body length. Frames claiming more are a protocol violation.
pub const MAX_BODY_LEN: u32 = 1024 * 1024;

/// Errors in framing or message encoding. Any of these terminates the
/// session with a distinguished `ProtocolViolation` response.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported wire version {0:#04x}")]
    BadVersion(u8),
    #[error("frame body of {0} bytes exceeds the {MAX_BODY_LEN}-byte limit")]
    BodyTooLarge(u32),
    #[error("header truncated: {0} of {HEADER_LEN} bytes")]
    HeaderTruncated(usize),
    #[error("message encode failed: {0}")]
    Encode(String),
    #[error("message decode failed: {0}")]
    Decode(String),
}

/// The fixed envelope preceding every CBOR message body.
///
/// Wire size: 10 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct EnvelopeHeader {
    /// Always [`WIRE_MAGIC`].
    pub magic: [u8; 4],

    /// Always [`WIRE_VERSION`]. A receiver seeing any other value
    /// rejects the frame.
    pub version: u8,

    /// Reserved, zero on write, ignored on read.
    pub reserved: u8,

    /// Length of the CBOR body in bytes, big-endian.
    pub body_len: [u8; 4],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(EnvelopeHeader, [u8; 10]);

impl EnvelopeHeader {
    /// Build a header for a body of the given length.
    pub fn for_body_len(len: usize) -> Result<Self, ProtocolError> {
        let len = u32::try_from(len).map_err(|_| ProtocolError::BodyTooLarge(u32::MAX))?;
        if len > MAX_BODY_LEN {
            return Err(ProtocolError::BodyTooLarge(len));
        }
        Ok(Self {
            magic: WIRE_MAGIC,
            version: WIRE_VERSION,
            reserved: 0,
            body_len: len.to_be_bytes(),
        })
    }

    /// Parse and validate a header from exactly [`HEADER_LEN`] bytes.
    ///
    /// Returns the body length the frame claims. Magic, version, and the
    /// length bound are all checked here; `reserved` is not.
    pub fn parse(bytes: &[u8]) -> Result<usize, ProtocolError> {
        let header = Self::read_from(bytes)
            .ok_or(ProtocolError::HeaderTruncated(bytes.len()))?;
        if header.magic != WIRE_MAGIC {
            return Err(ProtocolError::BadMagic(header.magic));
        }
        if header.version != WIRE_VERSION {
            return Err(ProtocolError::BadVersion(header.version));
        }
        let body_len = u32::from_be_bytes(header.body_len);
        if body_len > MAX_BODY_LEN {
            return Err(ProtocolError::BodyTooLarge(body_len));
        }
        Ok(body_len as usize)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
