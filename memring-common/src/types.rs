//! # Value Types
//!
//! Small value types shared by the codec and the client: CAS tokens,
//! expiration times, stored items and the store/mutate/concat modes.
//!
//! ## Expiration Encoding
//!
//! The server interprets the 32-bit expiration field as:
//!
//! ```text
//! 0                      never expires
//! 1 ..= 2_592_000        seconds from now (up to 30 days)
//! > 2_592_000            absolute unix timestamp in seconds
//! ```
//!
//! `Expiration::to_wire` picks the right form so callers never need to.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// Largest relative expiration the server accepts (30 days).
pub const MAX_RELATIVE_EXPIRATION: u32 = 60 * 60 * 24 * 30;

/// Check-and-set token returned with every stored item.
///
/// The server bumps the token on every mutation, so an unchanged token proves
/// the item was not modified in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cas(pub u64);

impl Cas {
    /// Unconditional operation.
    pub const NONE: Cas = Cas(0);

    #[inline]
    pub const fn new(v: u64) -> Self {
        Cas(v)
    }

    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Item lifetime requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    #[default]
    Never,
    /// Relative lifetime.
    In(Duration),
    /// Absolute deadline.
    At(SystemTime),
}

impl Expiration {
    /// Encodes the expiration for the 32-bit wire field.
    pub fn to_wire(&self) -> u32 {
        self.to_wire_at(SystemTime::now())
    }

    /// Same as `to_wire` with an explicit clock (for tests).
    pub fn to_wire_at(&self, now: SystemTime) -> u32 {
        match *self {
            Expiration::Never => 0,
            Expiration::In(duration) => {
                if duration.is_zero() {
                    return 0;
                }
                // Sub-second lifetimes round up so they never mean "forever".
                let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
                if secs <= MAX_RELATIVE_EXPIRATION as u64 {
                    secs as u32
                } else {
                    unix_seconds(now + duration)
                }
            }
            Expiration::At(deadline) => {
                let secs = unix_seconds(deadline);
                // A deadline in the past must still expire the item immediately.
                secs.max(MAX_RELATIVE_EXPIRATION + 1)
            }
        }
    }
}

fn unix_seconds(at: SystemTime) -> u32 {
    let secs = at
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    secs.min(u32::MAX as u64) as u32
}

/// Raw stored item: user flags plus payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheItem {
    pub flags: u32,
    pub data: Bytes,
}

impl CacheItem {
    pub fn new(flags: u32, data: impl Into<Bytes>) -> Self {
        CacheItem {
            flags,
            data: data.into(),
        }
    }
}

/// Store command variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreMode {
    /// Store only when the key does not exist.
    Add,
    /// Store unconditionally (or CAS-guarded).
    Set,
    /// Store only when the key exists.
    Replace,
}

/// Counter command variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationMode {
    Increment,
    Decrement,
}

/// Concatenation command variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConcatMode {
    Append,
    Prepend,
}
