//! # memring Client
//!
//! Purpose: A distributed cache client for the binary memcached protocol.
//! Keys are spread over a set of servers by consistent hashing (or a vbucket
//! map), every server gets its own bounded socket pool, and dead servers are
//! routed around until a background sweep brings them back.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections per node; a lease guard
//!    returns or destroys the socket when dropped.
//! 2. **Copy-On-Write Routing**: The key router is an immutable snapshot,
//!    republished atomically whenever membership changes.
//! 3. **Results Over Panics**: Cache outcomes are values; only bad
//!    configuration is an error.

mod async_conn;
mod auth;
mod client;
mod config;
mod error;
mod failure;
mod hash;
mod key;
mod locator;
mod node;
mod observer;
mod pool;
mod registry;
mod resurrect;
mod ring;
mod server_pool;
mod socket;
mod transcoder;
mod vbucket;

pub use async_conn::{AsyncConnection, AsyncNodePool, AsyncPooledConnection};
pub use auth::{PlainAuthenticator, SaslAuthenticator};
pub use client::{CacheClient, ClientBuilder, NodeResults};
pub use config::{
    parse_endpoint, AuthConfig, ClientConfig, FailurePolicyConfig, HashAlgorithm, LocatorKind,
    SocketPoolConfig, DEFAULT_MAX_ITEM_SIZE, DEFAULT_MUTATIONS,
};
pub use error::{
    AcquireError, ConfigError, ConnectionError, KeyError, NodeError, TranscodeError,
};
pub use failure::{
    FailImmediately, FailurePolicy, FailurePolicyFactory, ImmediateFailureFactory,
    ThrottlingFailureFactory, ThrottlingPolicy,
};
pub use hash::{fnv1a_32, ketama_hash, ketama_points, vbucket_hash};
pub use key::{DefaultKeyTransformer, KeyTransformer, PrefixKeyTransformer};
pub use locator::{ConsistentHashLocator, NodeLocator, SingleNodeLocator, Target, VBucketLocator};
pub use node::Node;
pub use observer::{
    ClientMetrics, LatencyHistogram, LatencySnapshot, MetricsSnapshot, NoopObserver,
    OperationObserver, DEFAULT_LATENCY_BUCKETS_US,
};
pub use pool::{NodePool, PoolStats, PooledConnection};
pub use registry::NodeRegistry;
pub use ring::HashRing;
pub use server_pool::{ClusterTopology, NodeBatch, ServerPool};
pub use socket::PooledSocket;
pub use transcoder::{JsonTranscoder, Transcoder, FLAG_JSON, FLAG_RAW};
pub use vbucket::{VBucketEntry, VBucketMap};

pub use memring_common::{
    CacheItem, Cas, ConcatMode, Expiration, MutationMode, OperationResult, Status, StoreMode,
};
