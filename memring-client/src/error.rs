//! # Client Errors
//!
//! Transport-level failures. Cache semantics (misses, CAS conflicts, dead
//! nodes during a call) never appear here; they travel inside
//! `OperationResult`. These types describe why a socket, a pool or a
//! configuration could not be used.

use std::io;

use memring_common::{ProtocolError, Status};
use thiserror::Error;

/// Failure of one pooled socket. Always fatal for that socket.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("endpoint {0} did not resolve to any address")]
    Unresolved(String),
}

impl ConnectionError {
    /// Local status reported to callers for this failure.
    pub fn status(&self) -> Status {
        match self {
            ConnectionError::Protocol(_) => Status::Protocol,
            _ => Status::Transport,
        }
    }
}

/// Failure to obtain a connection from a node pool.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Pool is marked dead; no I/O was attempted.
    #[error("node {0} is unavailable")]
    Unavailable(String),

    /// Every connection stayed busy for the whole wait.
    #[error("timed out after {0:?} waiting for a pooled connection")]
    Timeout(std::time::Duration),

    /// Creating a new connection failed; the pool is now dead.
    #[error("failed to open connection: {0}")]
    Connect(#[source] ConnectionError),

    /// Pool was shut down.
    #[error("pool is shut down")]
    Shutdown,
}

impl AcquireError {
    pub fn status(&self) -> Status {
        match self {
            AcquireError::Unavailable(_) | AcquireError::Shutdown => Status::NotAttempted,
            AcquireError::Timeout(_) => Status::PoolTimeout,
            AcquireError::Connect(err) => err.status(),
        }
    }
}

/// Failure reported by `Node::execute`.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),

    /// Connecting or the exchange failed. `node_failed` tells whether the
    /// failure policy marked the node dead as a result.
    #[error("{source}")]
    Failed {
        #[source]
        source: ConnectionError,
        node_failed: bool,
    },
}

impl NodeError {
    pub fn status(&self) -> Status {
        match self {
            NodeError::Acquire(err) => err.status(),
            NodeError::Failed { source, .. } => source.status(),
        }
    }

    /// True when this error took the node out of service.
    pub fn node_failed(&self) -> bool {
        match self {
            NodeError::Failed { node_failed, .. } => *node_failed,
            NodeError::Acquire(_) => false,
        }
    }
}

/// Key rejected before routing. Reported as `InvalidRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,

    #[error("key is {len} bytes, limit is {limit}")]
    TooLong { len: usize, limit: usize },

    #[error("key contains whitespace or control characters")]
    InvalidCharacter,

    /// Refused by a custom transformer.
    #[error("key rejected: {0}")]
    Rejected(String),
}

impl KeyError {
    pub fn status(&self) -> Status {
        Status::InvalidRequest
    }
}

/// Value could not be converted to or from its stored form. Reported as
/// `Transcode`.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("raw item is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("unsupported item flags {0:#x}")]
    UnsupportedFlags(u32),

    /// Raised by a custom transcoder.
    #[error("{0}")]
    Custom(String),
}

impl TranscodeError {
    pub fn status(&self) -> Status {
        Status::Transcode
    }
}

/// Invalid settings. The only errors raised synchronously to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("server list is empty")]
    NoServers,

    #[error("invalid endpoint {0:?}: expected host:port")]
    InvalidEndpoint(String),

    #[error("min pool size {min} exceeds max pool size {max}")]
    PoolBounds { min: usize, max: usize },

    #[error("max pool size must be at least 1")]
    ZeroPoolSize,

    #[error("ring mutations must be at least 1")]
    ZeroMutations,

    #[error("vbucket locator requires a vbucket map")]
    MissingVBucketMap,

    #[error("invalid vbucket map: {0}")]
    InvalidVBucketMap(String),

    #[error("server pool is shut down")]
    ShutDown,
}
