// auth.rs - SASL authentication providers
//
// A provider names its mechanism and produces the client messages; the socket
// layer owns the exchange (SaslAuth, then SaslStep while the server answers
// AuthContinue).

use std::fmt::Debug;

use bytes::{BufMut, Bytes, BytesMut};

pub trait SaslAuthenticator: Send + Sync + Debug {
    /// Mechanism name sent as the key of SaslAuth/SaslStep.
    fn mechanism(&self) -> &str;

    /// Payload of the first SaslAuth request.
    fn initial_response(&self) -> Bytes;

    /// Payload answering a server challenge.
    fn step(&self, _challenge: &[u8]) -> Result<Bytes, String> {
        Err(format!("{} does not take a continuation", self.mechanism()))
    }
}

/// SASL PLAIN (RFC 4616): `zone NUL user NUL password`.
#[derive(Clone)]
pub struct PlainAuthenticator {
    message: Bytes,
}

impl PlainAuthenticator {
    pub fn new(zone: &str, username: &str, password: &str) -> Self {
        let mut message = BytesMut::with_capacity(zone.len() + username.len() + password.len() + 2);
        message.put_slice(zone.as_bytes());
        message.put_u8(0);
        message.put_slice(username.as_bytes());
        message.put_u8(0);
        message.put_slice(password.as_bytes());
        PlainAuthenticator {
            message: message.freeze(),
        }
    }
}

impl Debug for PlainAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PlainAuthenticator")
    }
}

impl SaslAuthenticator for PlainAuthenticator {
    fn mechanism(&self) -> &str {
        "PLAIN"
    }

    fn initial_response(&self) -> Bytes {
        self.message.clone()
    }
}
