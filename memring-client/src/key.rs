//! # Key Transformers
//!
//! Turn caller keys into wire keys before routing. The transformed key is
//! what gets hashed and sent, so a transformer must be deterministic.

use std::fmt::Debug;

use bytes::Bytes;
use memring_common::MAX_KEY_LENGTH;

use crate::error::KeyError;

pub trait KeyTransformer: Send + Sync + Debug {
    /// Wire key for `key`, or a reason the key cannot be sent.
    fn transform(&self, key: &str) -> Result<Bytes, KeyError>;
}

/// Passes keys through after checking the protocol limits: at most 250 bytes,
/// no whitespace or control characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyTransformer;

impl KeyTransformer for DefaultKeyTransformer {
    fn transform(&self, key: &str) -> Result<Bytes, KeyError> {
        check_key(key.as_bytes())?;
        Ok(Bytes::copy_from_slice(key.as_bytes()))
    }
}

/// Prepends a fixed namespace, then applies the default checks.
#[derive(Debug, Clone)]
pub struct PrefixKeyTransformer {
    prefix: String,
}

impl PrefixKeyTransformer {
    pub fn new(prefix: impl Into<String>) -> Self {
        PrefixKeyTransformer {
            prefix: prefix.into(),
        }
    }
}

impl KeyTransformer for PrefixKeyTransformer {
    fn transform(&self, key: &str) -> Result<Bytes, KeyError> {
        let mut full = Vec::with_capacity(self.prefix.len() + key.len());
        full.extend_from_slice(self.prefix.as_bytes());
        full.extend_from_slice(key.as_bytes());
        check_key(&full)?;
        Ok(Bytes::from(full))
    }
}

fn check_key(key: &[u8]) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(KeyError::TooLong {
            len: key.len(),
            limit: MAX_KEY_LENGTH,
        });
    }
    if key.iter().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(KeyError::InvalidCharacter);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rejects_invalid_keys() {
        let t = DefaultKeyTransformer;
        assert_eq!(&t.transform("user:1").unwrap()[..], b"user:1");
        assert_eq!(t.transform(""), Err(KeyError::Empty));
        assert_eq!(t.transform("has space"), Err(KeyError::InvalidCharacter));
        assert_eq!(t.transform("tab\there"), Err(KeyError::InvalidCharacter));
        assert_eq!(
            t.transform(&"k".repeat(251)),
            Err(KeyError::TooLong { len: 251, limit: 250 })
        );
        assert!(t.transform(&"k".repeat(250)).is_ok());
    }

    #[test]
    fn prefix_counts_toward_the_limit() {
        let t = PrefixKeyTransformer::new("app:");
        assert_eq!(&t.transform("x").unwrap()[..], b"app:x");
        assert!(matches!(
            t.transform(&"k".repeat(247)),
            Err(KeyError::TooLong { len: 251, .. })
        ));
    }
}
