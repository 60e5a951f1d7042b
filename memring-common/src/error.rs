//! # Codec Errors
//!
//! Errors raised while framing or parsing binary protocol messages. Every
//! variant here is fatal for the connection that produced it: the caller must
//! destroy the socket instead of retrying on it.

use thiserror::Error;

use crate::opcode::Opcode;

/// Result alias for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Framing and parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// First header byte was not the expected magic.
    #[error("bad magic byte 0x{found:02x} (expected 0x{expected:02x})")]
    BadMagic { expected: u8, found: u8 },

    /// Header declares a body shorter than its extras and key.
    #[error("body length {body} shorter than extras {extras} + key {key}")]
    BodyTooShort { body: u32, extras: u8, key: u16 },

    /// Not enough bytes to decode the structure.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Key exceeds the protocol limit.
    #[error("key length {0} exceeds maximum")]
    KeyTooLong(usize),

    /// Body does not fit in the 32-bit length field.
    #[error("body length {0} exceeds protocol limit")]
    BodyTooLong(usize),

    /// Response header declares a body above the reader's limit.
    #[error("response body length {body} exceeds limit {limit}")]
    ResponseTooLarge { body: u32, limit: usize },

    /// Response answered a different request.
    #[error("opaque mismatch: sent {sent}, received {received}")]
    OpaqueMismatch { sent: u32, received: u32 },

    /// Response opcode differs from the request opcode.
    #[error("opcode mismatch: sent {sent}, received 0x{received:02x}")]
    OpcodeMismatch { sent: Opcode, received: u8 },

    /// Opcode byte is not part of the protocol.
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    /// Extras of a successful response have an unexpected size.
    #[error("unexpected extras length {found} for {opcode} (expected {expected})")]
    BadExtras {
        opcode: Opcode,
        expected: usize,
        found: usize,
    },
}
