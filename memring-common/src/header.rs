//! # Frame Headers
//!
//! Purpose: Encode and decode the fixed 24-byte header that starts every
//! binary protocol message.
//!
//! ## Design Principles
//!
//! 1. **Byte-Exact Layout**: Offsets and widths match the server implementation.
//! 2. **Big-Endian Integers**: All multi-byte fields use network byte order.
//! 3. **Validate Early**: Magic and length sanity are checked before any body read.
//!
//! ## Memory Layout
//!
//! ```text
//! Request header (24 bytes):
//! +-------+--------+---------+--------+----------+---------+
//! | magic | opcode | key len | ext len| datatype | vbucket |
//! | 1B    | 1B     | 2B      | 1B     | 1B       | 2B      |
//! +-------+--------+---------+--------+----------+---------+
//! | total body len:4B | opaque:4B | cas:8B                 |
//! +-------------------+-----------+------------------------+
//!
//! Response header (24 bytes): identical, with `status:2B` in place of vbucket.
//! ```

use bytes::{BufMut, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::opcode::Opcode;

/// Magic byte of every request.
pub const REQUEST_MAGIC: u8 = 0x80;

/// Magic byte of every response.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 24;

/// Request header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: Opcode,
    pub key_len: u16,
    pub extras_len: u8,
    pub vbucket: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    /// Writes the header into `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(HEADER_LEN);
        out.put_u8(REQUEST_MAGIC);
        out.put_u8(self.opcode.as_u8());
        out.put_u16(self.key_len);
        out.put_u8(self.extras_len);
        out.put_u8(0);
        out.put_u16(self.vbucket);
        out.put_u32(self.body_len);
        out.put_u32(self.opaque);
        out.put_u64(self.cas);
    }

    /// Parses a request header. Used by test servers and diagnostics.
    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        let raw = RawHeader::parse(buf, REQUEST_MAGIC)?;
        let opcode = Opcode::from_u8(raw.opcode).ok_or(ProtocolError::UnknownOpcode(raw.opcode))?;
        Ok(RequestHeader {
            opcode,
            key_len: raw.key_len,
            extras_len: raw.extras_len,
            vbucket: raw.status_or_vbucket,
            body_len: raw.body_len,
            opaque: raw.opaque,
            cas: raw.cas,
        })
    }
}

/// Response header fields.
///
/// The opcode is kept as a raw byte so an unknown opcode from a newer server
/// surfaces as a mismatch rather than a decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    /// Parses a response header, validating magic and length consistency.
    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        let raw = RawHeader::parse(buf, RESPONSE_MAGIC)?;
        Ok(ResponseHeader {
            opcode: raw.opcode,
            key_len: raw.key_len,
            extras_len: raw.extras_len,
            status: raw.status_or_vbucket,
            body_len: raw.body_len,
            opaque: raw.opaque,
            cas: raw.cas,
        })
    }

    /// Writes the header into `out`. Used by test servers.
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(HEADER_LEN);
        out.put_u8(RESPONSE_MAGIC);
        out.put_u8(self.opcode);
        out.put_u16(self.key_len);
        out.put_u8(self.extras_len);
        out.put_u8(0);
        out.put_u16(self.status);
        out.put_u32(self.body_len);
        out.put_u32(self.opaque);
        out.put_u64(self.cas);
    }

    /// Fails when the declared body is longer than `max_body`.
    pub fn check_body(&self, max_body: usize) -> ProtocolResult<()> {
        if self.body_len as usize > max_body {
            return Err(ProtocolError::ResponseTooLarge {
                body: self.body_len,
                limit: max_body,
            });
        }
        Ok(())
    }

    /// Length of the value part of the body.
    #[inline]
    pub fn value_len(&self) -> usize {
        self.body_len as usize - self.extras_len as usize - self.key_len as usize
    }
}

struct RawHeader {
    opcode: u8,
    key_len: u16,
    extras_len: u8,
    status_or_vbucket: u16,
    body_len: u32,
    opaque: u32,
    cas: u64,
}

impl RawHeader {
    fn parse(buf: &[u8], magic: u8) -> ProtocolResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }
        if buf[0] != magic {
            return Err(ProtocolError::BadMagic {
                expected: magic,
                found: buf[0],
            });
        }

        let raw = RawHeader {
            opcode: buf[1],
            key_len: u16::from_be_bytes([buf[2], buf[3]]),
            extras_len: buf[4],
            status_or_vbucket: u16::from_be_bytes([buf[6], buf[7]]),
            body_len: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        };

        if (raw.body_len as u64) < raw.extras_len as u64 + raw.key_len as u64 {
            return Err(ProtocolError::BodyTooShort {
                body: raw.body_len,
                extras: raw.extras_len,
                key: raw.key_len,
            });
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_layout() {
        let header = RequestHeader {
            opcode: Opcode::Set,
            key_len: 3,
            extras_len: 8,
            vbucket: 0x0102,
            body_len: 16,
            opaque: 0xdead_beef,
            cas: 0x0102_0304_0506_0708,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(
            &buf[..],
            &[
                0x80, 0x01, 0x00, 0x03, 0x08, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00, 0x10, 0xde,
                0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
            ]
        );
        assert_eq!(RequestHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_response_header_decode() {
        let header = ResponseHeader {
            opcode: Opcode::Get.as_u8(),
            key_len: 0,
            extras_len: 4,
            status: 1,
            body_len: 9,
            opaque: 7,
            cas: 42,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let decoded = ResponseHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.value_len(), 5);
    }

    #[test]
    fn test_response_rejects_request_magic() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = REQUEST_MAGIC;
        assert_eq!(
            ResponseHeader::decode(&buf),
            Err(ProtocolError::BadMagic {
                expected: RESPONSE_MAGIC,
                found: REQUEST_MAGIC
            })
        );
    }

    #[test]
    fn test_response_rejects_inconsistent_lengths() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = RESPONSE_MAGIC;
        buf[3] = 10; // key length 10
        buf[11] = 4; // body length 4
        assert!(matches!(
            ResponseHeader::decode(&buf),
            Err(ProtocolError::BodyTooShort { .. })
        ));
    }

    #[test]
    fn test_truncated_header() {
        assert_eq!(
            ResponseHeader::decode(&[RESPONSE_MAGIC; 10]),
            Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                available: 10
            })
        );
    }
}
