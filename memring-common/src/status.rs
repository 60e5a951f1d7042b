//! # Response Status
//!
//! Server statuses keep their wire value; local outcomes (no I/O attempted,
//! transport failure, ...) use negative codes so they can never be confused
//! with anything a server sent.

use std::fmt;

/// Status code indicating success in responses.
pub const STATUS_OK: u16 = 0;

/// Outcome of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    NoError,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    NonNumeric,
    VBucketNotMine,
    AuthError,
    AuthContinue,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    /// Server status without a named variant.
    Other(u16),

    /// No I/O was attempted: no live node or the connection was already dead.
    NotAttempted,
    /// Socket failed while sending or receiving.
    Transport,
    /// Response violated the framing rules.
    Protocol,
    /// Waited too long for a pooled connection.
    PoolTimeout,
    /// Request could not be built (invalid key, oversized body, ...).
    InvalidRequest,
    /// Value could not be converted to or from its stored form.
    Transcode,
}

impl Status {
    /// Maps a wire status to its variant.
    pub const fn from_wire(code: u16) -> Self {
        match code {
            0x00 => Status::NoError,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x03 => Status::ValueTooLarge,
            0x04 => Status::InvalidArguments,
            0x05 => Status::ItemNotStored,
            0x06 => Status::NonNumeric,
            0x07 => Status::VBucketNotMine,
            0x20 => Status::AuthError,
            0x21 => Status::AuthContinue,
            0x81 => Status::UnknownCommand,
            0x82 => Status::OutOfMemory,
            0x83 => Status::NotSupported,
            0x84 => Status::InternalError,
            0x85 => Status::Busy,
            0x86 => Status::TemporaryFailure,
            other => Status::Other(other),
        }
    }

    /// Signed status code: wire value for server statuses, negative for local ones.
    pub const fn code(self) -> i32 {
        match self {
            Status::NoError => 0x00,
            Status::KeyNotFound => 0x01,
            Status::KeyExists => 0x02,
            Status::ValueTooLarge => 0x03,
            Status::InvalidArguments => 0x04,
            Status::ItemNotStored => 0x05,
            Status::NonNumeric => 0x06,
            Status::VBucketNotMine => 0x07,
            Status::AuthError => 0x20,
            Status::AuthContinue => 0x21,
            Status::UnknownCommand => 0x81,
            Status::OutOfMemory => 0x82,
            Status::NotSupported => 0x83,
            Status::InternalError => 0x84,
            Status::Busy => 0x85,
            Status::TemporaryFailure => 0x86,
            Status::Other(code) => code as i32,
            Status::NotAttempted => -1,
            Status::Transport => -2,
            Status::Protocol => -3,
            Status::PoolTimeout => -4,
            Status::InvalidRequest => -5,
            Status::Transcode => -6,
        }
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, Status::NoError)
    }

    /// True for outcomes produced by this client rather than a server.
    #[inline]
    pub const fn is_local(self) -> bool {
        self.code() < 0
    }

    /// True when the server reported a CAS conflict or an existing key.
    #[inline]
    pub const fn is_conflict(self) -> bool {
        matches!(self, Status::KeyExists)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::NoError => "no error",
            Status::KeyNotFound => "key not found",
            Status::KeyExists => "key exists",
            Status::ValueTooLarge => "value too large",
            Status::InvalidArguments => "invalid arguments",
            Status::ItemNotStored => "item not stored",
            Status::NonNumeric => "non-numeric value",
            Status::VBucketNotMine => "vbucket belongs to another server",
            Status::AuthError => "authentication error",
            Status::AuthContinue => "authentication continue",
            Status::UnknownCommand => "unknown command",
            Status::OutOfMemory => "out of memory",
            Status::NotSupported => "not supported",
            Status::InternalError => "internal error",
            Status::Busy => "busy",
            Status::TemporaryFailure => "temporary failure",
            Status::Other(code) => return write!(f, "status 0x{:04x}", code),
            Status::NotAttempted => "not attempted",
            Status::Transport => "transport failure",
            Status::Protocol => "protocol violation",
            Status::PoolTimeout => "connection pool timeout",
            Status::InvalidRequest => "invalid request",
            Status::Transcode => "transcoding failed",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_roundtrip() {
        for code in [0u16, 1, 2, 3, 4, 5, 6, 7, 0x20, 0x21, 0x81, 0x82, 0x83, 0x84, 0x85, 0x86] {
            assert_eq!(Status::from_wire(code).code(), code as i32);
        }
        assert_eq!(Status::from_wire(0x99), Status::Other(0x99));
    }

    #[test]
    fn local_statuses_are_negative_and_distinct() {
        let local = [
            Status::NotAttempted,
            Status::Transport,
            Status::Protocol,
            Status::PoolTimeout,
            Status::InvalidRequest,
            Status::Transcode,
        ];
        for (idx, status) in local.iter().enumerate() {
            assert!(status.is_local());
            assert!(!status.is_success());
            for other in &local[idx + 1..] {
                assert_ne!(status.code(), other.code());
            }
        }
        assert!(!Status::KeyNotFound.is_local());
    }

    #[test]
    fn cas_conflict_differs_from_miss() {
        assert!(Status::KeyExists.is_conflict());
        assert_ne!(Status::KeyExists.code(), Status::KeyNotFound.code());
        assert!(Status::KeyExists.code() > 0);
    }
}
