//! # Cache Client
//!
//! Purpose: The public face of the library. Typed get/store/mutate calls that
//! route through the server pool and never fail on cache semantics: misses,
//! conflicts and unreachable nodes come back as `OperationResult` values.
//!
//! ## Design Principles
//! 1. **Results, Not Errors**: Only configuration problems are `Err`; every
//!    operation returns an `OperationResult`.
//! 2. **Pluggable Edges**: Keys go through a `KeyTransformer`, values through
//!    a `Transcoder`, outcomes to an `OperationObserver`.
//! 3. **Parallel Fan-Out**: Multi-key and broadcast calls issue one batch per
//!    node concurrently and merge what comes back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hashbrown::HashMap;
use memring_common::{
    CacheItem, Cas, ConcatMode, Expiration, MutationMode, Operation, OperationResult, Reply,
    Status, StoreMode, NO_AUTO_CREATE,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::ConfigError;
use crate::key::{DefaultKeyTransformer, KeyTransformer};
use crate::node::Node;
use crate::observer::{NoopObserver, OperationObserver};
use crate::registry::NodeRegistry;
use crate::server_pool::ServerPool;
use crate::transcoder::{JsonTranscoder, Transcoder};

/// Per-node results of a broadcast command, keyed by endpoint.
pub type NodeResults<T> = HashMap<String, OperationResult<T>>;

/// Builder for clients with non-default collaborators.
pub struct ClientBuilder<X: Transcoder = JsonTranscoder> {
    config: ClientConfig,
    transcoder: X,
    keys: Arc<dyn KeyTransformer>,
    observer: Arc<dyn OperationObserver>,
    registry: Option<Arc<NodeRegistry>>,
}

impl ClientBuilder<JsonTranscoder> {
    pub fn new(config: ClientConfig) -> Self {
        ClientBuilder {
            config,
            transcoder: JsonTranscoder,
            keys: Arc::new(DefaultKeyTransformer),
            observer: Arc::new(NoopObserver),
            registry: None,
        }
    }
}

impl<X: Transcoder> ClientBuilder<X> {
    pub fn transcoder<Y: Transcoder>(self, transcoder: Y) -> ClientBuilder<Y> {
        ClientBuilder {
            config: self.config,
            transcoder,
            keys: self.keys,
            observer: self.observer,
            registry: self.registry,
        }
    }

    pub fn key_transformer(mut self, keys: Arc<dyn KeyTransformer>) -> Self {
        self.keys = keys;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn OperationObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Shares nodes with other clients built on the same registry.
    pub fn registry(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validates the config and connects.
    pub fn build(self) -> Result<CacheClient<X>, ConfigError> {
        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(NodeRegistry::new(
                self.config.failure_policy.factory(),
                self.config.authenticator(),
            )),
        };
        let pool = ServerPool::with_registry(&self.config, registry, Arc::clone(&self.observer))?;
        Ok(CacheClient {
            pool,
            transcoder: self.transcoder,
            keys: self.keys,
            observer: self.observer,
        })
    }
}

pub struct CacheClient<X: Transcoder = JsonTranscoder> {
    pool: Arc<ServerPool>,
    transcoder: X,
    keys: Arc<dyn KeyTransformer>,
    observer: Arc<dyn OperationObserver>,
}

impl<X: Transcoder> std::fmt::Debug for CacheClient<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("pool", &self.pool)
            .field("transcoder", &self.transcoder)
            .finish()
    }
}

impl CacheClient<JsonTranscoder> {
    /// Client with default collaborators.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        ClientBuilder::new(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder<JsonTranscoder> {
        ClientBuilder::new(config)
    }
}

impl<X: Transcoder> CacheClient<X> {
    pub fn server_pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Fetches and decodes a value. The result carries the item's CAS.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> OperationResult<T> {
        let item = self.get_item(key);
        self.decode_item(item)
    }

    /// Fetches the raw stored item.
    pub fn get_item(&self, key: &str) -> OperationResult<CacheItem> {
        self.keyed("get", key, |key| Operation::Get { key })
            .and_then_reply(into_item)
    }

    /// Value and CAS on a hit; `None` on a miss or any failure.
    pub fn try_get<T: DeserializeOwned>(&self, key: &str) -> Option<(T, Cas)> {
        let result = self.get::<T>(key);
        let cas = result.cas;
        result.into_value().map(|value| (value, cas))
    }

    /// Value on a hit; `None` on a miss, an unreachable node or a decode error.
    pub fn get_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).into_value()
    }

    /// Fetches a value and resets its expiration in one round trip.
    pub fn get_and_touch<T: DeserializeOwned>(
        &self,
        key: &str,
        expiration: Expiration,
    ) -> OperationResult<T> {
        let item = self
            .keyed("get_and_touch", key, |key| Operation::GetAndTouch {
                key,
                expiration: expiration.to_wire(),
            })
            .and_then_reply(into_item);
        self.decode_item(item)
    }

    /// Fetches many keys, decoding each hit. Undecodable items are skipped.
    pub fn multi_get<T: DeserializeOwned>(&self, keys: &[&str]) -> HashMap<String, T> {
        self.multi_get_items(keys)
            .into_iter()
            .filter_map(|(key, (item, _))| match self.transcoder.deserialize(&item) {
                Ok(value) => Some((key, value)),
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping undecodable item");
                    None
                }
            })
            .collect()
    }

    /// Fetches many keys as raw items with their CAS values.
    ///
    /// Keys are grouped per node and each group is sent as one pipelined
    /// batch; batches run concurrently. A failing node only loses its own
    /// keys. Misses are simply absent.
    pub fn multi_get_items(&self, keys: &[&str]) -> HashMap<String, (CacheItem, Cas)> {
        let started = Instant::now();
        self.observer.on_start("multi_get");

        let mut wire_keys: HashMap<Bytes, String> = HashMap::with_capacity(keys.len());
        let mut ordered: Vec<Bytes> = Vec::with_capacity(keys.len());
        for key in keys {
            match self.keys.transform(key) {
                Ok(wire) => {
                    if wire_keys.insert(wire.clone(), key.to_string()).is_none() {
                        ordered.push(wire);
                    }
                }
                Err(reason) => debug!(key = %key, reason = %reason, "skipping invalid key"),
            }
        }

        let (batches, unroutable) = self.pool.group_by_node(&ordered);
        if !unroutable.is_empty() {
            debug!(count = unroutable.len(), "keys without a live node");
        }

        let pool = &self.pool;
        let results = pool.fan_out(batches, |batch| {
            let operation = Operation::MultiGet { keys: batch.keys };
            let mut vbuckets = batch.vbuckets.into_iter();
            // The batch asks for one vbucket per key, in key order.
            let result =
                pool.execute_on(&batch.node, &operation, |_| vbuckets.next().unwrap_or(0));
            if let Some(message) = &result.message {
                warn!(endpoint = %batch.node.endpoint(), reason = %message, "partial multi-get");
            }
            result
        });

        let mut merged = HashMap::with_capacity(keys.len());
        let mut status = if unroutable.is_empty() {
            Status::NoError
        } else {
            Status::NotAttempted
        };
        for result in results {
            if !result.success || result.message.is_some() {
                status = if result.success { Status::Transport } else { result.status };
            }
            if let Some(Reply::Items(items)) = result.value {
                for (wire, hit) in items {
                    if let Some(key) = wire_keys.get(&wire) {
                        merged.insert(key.clone(), hit);
                    }
                }
            }
        }
        self.observer
            .on_finish("multi_get", status, started.elapsed());
        merged
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Stores a value. A non-zero `cas` makes the write conditional.
    pub fn store<T: Serialize + ?Sized>(
        &self,
        mode: StoreMode,
        key: &str,
        value: &T,
        expiration: Expiration,
    ) -> OperationResult<()> {
        self.cas(mode, key, value, expiration, Cas::NONE)
    }

    /// Conditional store: fails with `KeyExists` when `cas` is stale.
    pub fn cas<T: Serialize + ?Sized>(
        &self,
        mode: StoreMode,
        key: &str,
        value: &T,
        expiration: Expiration,
        cas: Cas,
    ) -> OperationResult<()> {
        match self.transcoder.serialize(value) {
            Ok(item) => self.store_item(mode, key, item, expiration, cas),
            Err(err) => OperationResult::fail(err.status(), Some(err.to_string())),
        }
    }

    /// Stores a raw item.
    pub fn store_item(
        &self,
        mode: StoreMode,
        key: &str,
        item: CacheItem,
        expiration: Expiration,
        cas: Cas,
    ) -> OperationResult<()> {
        self.keyed("store", key, |key| Operation::Store {
            mode,
            key,
            item,
            expiration: expiration.to_wire(),
            cas,
        })
        .discard()
    }

    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        expiration: Expiration,
    ) -> OperationResult<()> {
        self.store(StoreMode::Set, key, value, expiration)
    }

    /// Stores only if the key is absent.
    pub fn add<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        expiration: Expiration,
    ) -> OperationResult<()> {
        self.store(StoreMode::Add, key, value, expiration)
    }

    /// Stores only if the key exists.
    pub fn replace<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        expiration: Expiration,
    ) -> OperationResult<()> {
        self.store(StoreMode::Replace, key, value, expiration)
    }

    /// Adjusts a counter.
    ///
    /// `initial` seeds a missing counter; `None` makes a missing counter a
    /// `KeyNotFound` failure instead.
    pub fn mutate(
        &self,
        mode: MutationMode,
        key: &str,
        delta: u64,
        initial: Option<u64>,
        expiration: Expiration,
        cas: Cas,
    ) -> OperationResult<u64> {
        let (initial, expiration) = match initial {
            Some(initial) => (initial, expiration.to_wire()),
            None => (0, NO_AUTO_CREATE),
        };
        self.keyed("mutate", key, |key| Operation::Mutate {
            mode,
            key,
            delta,
            initial,
            expiration,
            cas,
        })
        .and_then_reply(|reply| match reply {
            Reply::Counter(value) => Some(value),
            _ => None,
        })
    }

    pub fn increment(&self, key: &str, delta: u64, initial: u64) -> OperationResult<u64> {
        self.mutate(
            MutationMode::Increment,
            key,
            delta,
            Some(initial),
            Expiration::Never,
            Cas::NONE,
        )
    }

    /// Decrements; the server clamps at zero.
    pub fn decrement(&self, key: &str, delta: u64, initial: u64) -> OperationResult<u64> {
        self.mutate(
            MutationMode::Decrement,
            key,
            delta,
            Some(initial),
            Expiration::Never,
            Cas::NONE,
        )
    }

    pub fn append(&self, key: &str, data: &[u8], cas: Cas) -> OperationResult<()> {
        self.concat(ConcatMode::Append, key, data, cas)
    }

    pub fn prepend(&self, key: &str, data: &[u8], cas: Cas) -> OperationResult<()> {
        self.concat(ConcatMode::Prepend, key, data, cas)
    }

    fn concat(&self, mode: ConcatMode, key: &str, data: &[u8], cas: Cas) -> OperationResult<()> {
        let data = Bytes::copy_from_slice(data);
        self.keyed("concat", key, |key| Operation::Concat {
            mode,
            key,
            data,
            cas,
        })
        .discard()
    }

    pub fn delete(&self, key: &str) -> OperationResult<()> {
        self.delete_cas(key, Cas::NONE)
    }

    /// Deletes only if the item still has `cas`.
    pub fn delete_cas(&self, key: &str, cas: Cas) -> OperationResult<()> {
        self.keyed("delete", key, |key| Operation::Delete { key, cas })
            .discard()
    }

    pub fn touch(&self, key: &str, expiration: Expiration) -> OperationResult<()> {
        self.keyed("touch", key, |key| Operation::Touch {
            key,
            expiration: expiration.to_wire(),
        })
        .discard()
    }

    // -----------------------------------------------------------------------
    // Broadcast
    // -----------------------------------------------------------------------

    /// Invalidates every item on every live node after `delay`.
    pub fn flush_all(&self, delay: Duration) -> NodeResults<()> {
        let operation = Operation::Flush {
            delay: delay.as_secs().min(u32::MAX as u64) as u32,
        };
        self.broadcast(&operation)
            .into_iter()
            .map(|(endpoint, result)| (endpoint, result.discard()))
            .collect()
    }

    /// Stats from every live node, optionally for one stats group.
    pub fn stats(&self, group: Option<&str>) -> NodeResults<Vec<(String, String)>> {
        let operation = Operation::Stats {
            group: group.map(|g| Bytes::copy_from_slice(g.as_bytes())),
        };
        self.broadcast(&operation)
            .into_iter()
            .map(|(endpoint, result)| {
                let result = result.and_then_reply(|reply| match reply {
                    Reply::Stats(stats) => Some(stats),
                    _ => None,
                });
                (endpoint, result)
            })
            .collect()
    }

    /// Server version of every live node.
    pub fn versions(&self) -> NodeResults<String> {
        self.broadcast(&Operation::Version)
            .into_iter()
            .map(|(endpoint, result)| {
                let result = result.and_then_reply(|reply| match reply {
                    Reply::Version(version) => Some(version),
                    _ => None,
                });
                (endpoint, result)
            })
            .collect()
    }

    /// Stops background work and closes every connection. Idempotent.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn keyed<F>(&self, name: &'static str, key: &str, build: F) -> OperationResult<Reply>
    where
        F: FnOnce(Bytes) -> Operation,
    {
        let started = Instant::now();
        self.observer.on_start(name);
        let result = match self.keys.transform(key) {
            Ok(wire) => self.pool.execute(&build(wire)),
            Err(err) => OperationResult::fail(err.status(), Some(err.to_string())),
        };
        self.observer.on_finish(name, result.status, started.elapsed());
        result
    }

    fn broadcast(&self, operation: &Operation) -> Vec<(String, OperationResult<Reply>)> {
        let started = Instant::now();
        let name = operation.name();
        self.observer.on_start(name);

        let nodes: Vec<Arc<Node>> = self.pool.working_nodes();
        let endpoints: Vec<String> = nodes.iter().map(|node| node.endpoint().to_string()).collect();
        let pool = &self.pool;
        let results: Vec<(String, OperationResult<Reply>)> = endpoints
            .into_iter()
            .zip(pool.fan_out(nodes, |node| pool.execute_on(&node, operation, |_| 0)))
            .collect();

        let status = results
            .iter()
            .map(|(_, result)| result.status)
            .find(|status| !status.is_success())
            .unwrap_or(if results.is_empty() {
                Status::NotAttempted
            } else {
                Status::NoError
            });
        self.observer.on_finish(name, status, started.elapsed());
        results
    }

    fn decode_item<T: DeserializeOwned>(&self, item: OperationResult<CacheItem>) -> OperationResult<T> {
        let cas = item.cas;
        let Some(raw) = item.value else {
            return OperationResult {
                success: item.success,
                status: item.status,
                cas,
                value: None,
                message: item.message,
            };
        };
        match self.transcoder.deserialize(&raw) {
            Ok(value) => OperationResult::ok(value, cas),
            Err(err) => OperationResult::fail(err.status(), Some(err.to_string())),
        }
    }
}

fn into_item(reply: Reply) -> Option<CacheItem> {
    match reply {
        Reply::Item(item) => Some(item),
        _ => None,
    }
}

/// Narrows a generic reply to the payload an operation expects.
trait ReplyExt {
    fn and_then_reply<U>(self, f: impl FnOnce(Reply) -> Option<U>) -> OperationResult<U>;
}

impl ReplyExt for OperationResult<Reply> {
    fn and_then_reply<U>(self, f: impl FnOnce(Reply) -> Option<U>) -> OperationResult<U> {
        let OperationResult {
            success,
            status,
            cas,
            value,
            message,
        } = self;
        match value.map(f) {
            Some(None) => OperationResult::fail(
                Status::Protocol,
                Some("response payload does not match the operation".to_string()),
            ),
            Some(value) => OperationResult {
                success,
                status,
                cas,
                value,
                message,
            },
            None => OperationResult {
                success,
                status,
                cas,
                value: None,
                message,
            },
        }
    }
}

impl<X: Transcoder> Drop for CacheClient<X> {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}
