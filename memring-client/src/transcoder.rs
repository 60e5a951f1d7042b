//! # Transcoders
//!
//! Convert typed values to stored items and back. The 32-bit item flags tell
//! a reader how the payload was written.

use std::fmt::Debug;

use bytes::Bytes;
use memring_common::CacheItem;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::TranscodeError;

/// Flags marking a JSON payload.
pub const FLAG_JSON: u32 = 0x0100;

/// Flags marking raw bytes (also what counters and foreign writers use).
pub const FLAG_RAW: u32 = 0;

pub trait Transcoder: Send + Sync + Debug {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<CacheItem, TranscodeError>;

    fn deserialize<T: DeserializeOwned>(&self, item: &CacheItem) -> Result<T, TranscodeError>;
}

/// JSON through `serde_json`.
///
/// Raw items (flags 0) are read as text: first as a JSON literal, so counters
/// written by increment decode as numbers, then as a plain string.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTranscoder;

impl Transcoder for JsonTranscoder {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<CacheItem, TranscodeError> {
        let data = serde_json::to_vec(value)?;
        Ok(CacheItem::new(FLAG_JSON, Bytes::from(data)))
    }

    fn deserialize<T: DeserializeOwned>(&self, item: &CacheItem) -> Result<T, TranscodeError> {
        match item.flags {
            FLAG_JSON => Ok(serde_json::from_slice(&item.data)?),
            FLAG_RAW => {
                let text = std::str::from_utf8(&item.data)?;
                serde_json::from_str(text.trim_end()).or_else(|_| {
                    serde_json::from_value(serde_json::Value::String(text.to_string()))
                        .map_err(TranscodeError::from)
                })
            }
            other => Err(TranscodeError::UnsupportedFlags(other)),
        }
    }
}
