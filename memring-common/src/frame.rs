//! # Request and Response Frames
//!
//! Purpose: Pair the fixed header with its extras, key and value sections and
//! provide incremental decoding over a growing buffer.
//!
//! ## Usage Notes
//!
//! - `RequestFrame::encode` validates key length and body size before writing
//!   anything, so a failed encode leaves the output buffer untouched.
//! - `ResponseFrame::decode` follows the `Ok(None)` = "need more bytes"
//!   convention so stream readers can call it after every read.
//! - Body sections are `Bytes` slices of one allocation (no per-field copies).

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::header::{RequestHeader, ResponseHeader, HEADER_LEN};
use crate::opcode::Opcode;
use crate::status::Status;

/// Maximum key length accepted by servers.
pub const MAX_KEY_LENGTH: usize = 250;

/// One request message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub opcode: Opcode,
    pub vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl RequestFrame {
    /// Builds a frame with no extras, key or value.
    pub fn new(opcode: Opcode, opaque: u32) -> Self {
        RequestFrame {
            opcode,
            vbucket: 0,
            opaque,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_vbucket(mut self, vbucket: u16) -> Self {
        self.vbucket = vbucket;
        self
    }

    /// Total body length (extras + key + value).
    pub fn body_len(&self) -> usize {
        self.extras.len() + self.key.len() + self.value.len()
    }

    /// Validates and appends the encoded frame to `out`.
    pub fn encode(&self, out: &mut BytesMut) -> ProtocolResult<()> {
        let header = self.header()?;
        out.reserve(HEADER_LEN + self.body_len());
        header.encode(out);
        out.extend_from_slice(&self.extras);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
        Ok(())
    }

    fn header(&self) -> ProtocolResult<RequestHeader> {
        if self.key.len() > MAX_KEY_LENGTH {
            return Err(ProtocolError::KeyTooLong(self.key.len()));
        }
        let body_len = self.body_len();
        if body_len > u32::MAX as usize || self.extras.len() > u8::MAX as usize {
            return Err(ProtocolError::BodyTooLong(body_len));
        }
        Ok(RequestHeader {
            opcode: self.opcode,
            key_len: self.key.len() as u16,
            extras_len: self.extras.len() as u8,
            vbucket: self.vbucket,
            body_len: body_len as u32,
            opaque: self.opaque,
            cas: self.cas,
        })
    }

    /// Decodes one request from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a full frame.
    pub fn decode(buf: &mut BytesMut) -> ProtocolResult<Option<Self>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = RequestHeader::decode(&buf[..HEADER_LEN])?;
        let total = HEADER_LEN + header.body_len as usize;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let mut body = buf.split_to(header.body_len as usize).freeze();
        let extras = body.split_to(header.extras_len as usize);
        let key = body.split_to(header.key_len as usize);
        Ok(Some(RequestFrame {
            opcode: header.opcode,
            vbucket: header.vbucket,
            opaque: header.opaque,
            cas: header.cas,
            extras,
            key,
            value: body,
        }))
    }
}

/// One response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub header: ResponseHeader,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl ResponseFrame {
    /// Splits a body read for `header` into its sections.
    pub fn from_parts(header: ResponseHeader, mut body: Bytes) -> ProtocolResult<Self> {
        if body.len() != header.body_len as usize {
            return Err(ProtocolError::Truncated {
                needed: header.body_len as usize,
                available: body.len(),
            });
        }
        let extras = body.split_to(header.extras_len as usize);
        let key = body.split_to(header.key_len as usize);
        Ok(ResponseFrame {
            header,
            extras,
            key,
            value: body,
        })
    }

    /// Decodes one response from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a full frame.
    pub fn decode(buf: &mut BytesMut) -> ProtocolResult<Option<Self>> {
        Self::decode_bounded(buf, u32::MAX as usize)
    }

    /// Like `decode`, but rejects a header announcing more than `max_body`
    /// body bytes before any of the body is buffered.
    pub fn decode_bounded(buf: &mut BytesMut, max_body: usize) -> ProtocolResult<Option<Self>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = ResponseHeader::decode(&buf[..HEADER_LEN])?;
        header.check_body(max_body)?;
        let total = HEADER_LEN + header.body_len as usize;
        if buf.len() < total {
            return Ok(None);
        }
        buf.advance(HEADER_LEN);
        let body = buf.split_to(header.body_len as usize).freeze();
        Self::from_parts(header, body).map(Some)
    }

    /// Builds a response answering `request`. Used by test servers.
    pub fn reply(request: &RequestFrame, status: u16) -> Self {
        ResponseFrame {
            header: ResponseHeader {
                opcode: request.opcode.as_u8(),
                key_len: 0,
                extras_len: 0,
                status,
                body_len: 0,
                opaque: request.opaque,
                cas: 0,
            },
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.header.cas = cas;
        self
    }

    pub fn with_body(mut self, extras: Bytes, key: Bytes, value: Bytes) -> Self {
        self.header.extras_len = extras.len() as u8;
        self.header.key_len = key.len() as u16;
        self.header.body_len = (extras.len() + key.len() + value.len()) as u32;
        self.extras = extras;
        self.key = key;
        self.value = value;
        self
    }

    /// Appends the encoded response to `out`. Used by test servers.
    pub fn encode(&self, out: &mut BytesMut) {
        self.header.encode(out);
        out.extend_from_slice(&self.extras);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
    }

    #[inline]
    pub fn status(&self) -> Status {
        Status::from_wire(self.header.status)
    }

    #[inline]
    pub fn opaque(&self) -> u32 {
        self.header.opaque
    }

    #[inline]
    pub fn cas(&self) -> u64 {
        self.header.cas
    }

    /// Value interpreted as UTF-8 text (server error messages, versions).
    pub fn value_text(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }

    /// Checks that this response answers `request`.
    pub fn ensure_answers(&self, request: &RequestFrame) -> ProtocolResult<()> {
        if self.header.opaque != request.opaque {
            return Err(ProtocolError::OpaqueMismatch {
                sent: request.opaque,
                received: self.header.opaque,
            });
        }
        if self.header.opcode != request.opcode.as_u8() {
            return Err(ProtocolError::OpcodeMismatch {
                sent: request.opcode,
                received: self.header.opcode,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_sections_in_order() {
        let frame = RequestFrame::new(Opcode::Set, 9)
            .with_extras(vec![0, 0, 0, 1, 0, 0, 0, 0])
            .with_key(&b"k"[..])
            .with_value(&b"val"[..])
            .with_cas(5);
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();

        assert_eq!(buf.len(), HEADER_LEN + 12);
        assert_eq!(&buf[8..12], &12u32.to_be_bytes());
        assert_eq!(&buf[HEADER_LEN..HEADER_LEN + 8], &[0, 0, 0, 1, 0, 0, 0, 0]);
        assert_eq!(&buf[HEADER_LEN + 8..], b"kval");

        let decoded = RequestFrame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_long_key_without_writing() {
        let frame = RequestFrame::new(Opcode::Get, 1).with_key(vec![b'a'; MAX_KEY_LENGTH + 1]);
        let mut buf = BytesMut::new();
        assert_eq!(
            frame.encode(&mut buf),
            Err(ProtocolError::KeyTooLong(MAX_KEY_LENGTH + 1))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn incremental_response_decode() {
        let request = RequestFrame::new(Opcode::Get, 77).with_key(&b"alpha"[..]);
        let response = ResponseFrame::reply(&request, 0).with_cas(3).with_body(
            Bytes::from_static(&[0, 0, 0, 2]),
            Bytes::new(),
            Bytes::from_static(b"hello"),
        );
        let mut wire = BytesMut::new();
        response.encode(&mut wire);

        let mut partial = BytesMut::from(&wire[..HEADER_LEN + 2]);
        assert_eq!(ResponseFrame::decode(&mut partial).unwrap(), None);

        let decoded = ResponseFrame::decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.status(), Status::NoError);
        assert_eq!(decoded.cas(), 3);
        assert_eq!(&decoded.extras[..], &[0, 0, 0, 2]);
        assert_eq!(&decoded.value[..], b"hello");
        assert!(decoded.ensure_answers(&request).is_ok());
    }

    #[test]
    fn bounded_decode_rejects_oversized_body_early() {
        let request = RequestFrame::new(Opcode::Get, 9);
        let response = ResponseFrame::reply(&request, 0).with_body(
            Bytes::new(),
            Bytes::new(),
            Bytes::from(vec![b'x'; 64]),
        );
        let mut wire = BytesMut::new();
        response.encode(&mut wire);

        let mut header_only = BytesMut::from(&wire[..HEADER_LEN]);
        assert_eq!(
            ResponseFrame::decode_bounded(&mut header_only, 32),
            Err(ProtocolError::ResponseTooLarge { body: 64, limit: 32 })
        );
        assert!(ResponseFrame::decode_bounded(&mut wire, 64).unwrap().is_some());
    }

    #[test]
    fn detects_foreign_response() {
        let request = RequestFrame::new(Opcode::Get, 1);
        let other = RequestFrame::new(Opcode::Get, 2);
        let response = ResponseFrame::reply(&other, 0);
        assert_eq!(
            response.ensure_answers(&request),
            Err(ProtocolError::OpaqueMismatch {
                sent: 1,
                received: 2
            })
        );
    }
}
