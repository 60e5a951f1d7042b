//! # Server Pool
//!
//! Purpose: Tie nodes, routing and health together. Every keyed operation
//! goes through `locate`, every node failure through `node_fail`, and dead
//! nodes come back through the resurrection sweep.
//!
//! ## Design Principles
//! 1. **RCU Routing**: The current locator is published through an
//!    `ArcSwap`. Readers never lock; a rebuild snapshots the membership,
//!    builds a new locator without holding it and swaps the result in.
//! 2. **Single Timer**: One background thread, armed on the first failure
//!    and re-armed while any node stays dead.
//! 3. **Failures Stay Local**: A failing node only affects the keys it owns;
//!    fan-out runs one batch per node on scoped threads.
//!
//! ## Concurrency
//! - `membership` guards the node list and failed set; it is held briefly.
//! - `rebuild_lock` serialises locator rebuilds, `topology_lock` topology
//!   changes and shutdown, `sweep_lock` resurrection sweeps.
//! - Node alive flags are atomics inside each node's pool.
//!
//! ## Shared Nodes
//! Nodes come from a `NodeRegistry` that counts the pools using each one. A
//! pool releases its nodes when they leave its topology or when it shuts
//! down; a node is only shut down once no pool uses it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use memring_common::{Exchange, Operation, OperationResult, Reply, Status};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{parse_endpoint, ClientConfig, LocatorKind, SocketPoolConfig};
use crate::error::ConfigError;
use crate::locator::{NodeLocator, Target};
use crate::node::Node;
use crate::observer::{NoopObserver, OperationObserver};
use crate::registry::NodeRegistry;
use crate::resurrect::ResurrectionTimer;
use crate::vbucket::VBucketMap;

/// Externally pushed cluster membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    pub servers: Vec<String>,
    /// Replaces the vbucket map when routing through vbuckets.
    pub vbucket_map: Option<VBucketMap>,
}

/// Keys routed to one node, in caller order.
#[derive(Debug, Clone)]
pub struct NodeBatch {
    pub node: Arc<Node>,
    pub keys: Vec<Bytes>,
    /// Vbucket per key, parallel to `keys`.
    pub vbuckets: Vec<u16>,
}

struct Membership {
    kind: LocatorKind,
    nodes: Vec<Arc<Node>>,
    failed: HashSet<String>,
}

pub struct ServerPool {
    socket_pool: SocketPoolConfig,
    registry: Arc<NodeRegistry>,
    membership: Mutex<Membership>,
    locator: ArcSwap<Box<dyn NodeLocator>>,
    // Configured node count; bounds reroute attempts in `locate`.
    node_count: AtomicUsize,
    timer: ResurrectionTimer,
    rebuild_lock: Mutex<()>,
    topology_lock: Mutex<()>,
    sweep_lock: Mutex<()>,
    observer: Arc<dyn OperationObserver>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ServerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPool")
            .field("nodes", &self.nodes())
            .field("timer", &self.timer)
            .finish()
    }
}

impl ServerPool {
    /// Builds a pool with its own registry and no observer.
    pub fn new(config: &ClientConfig) -> Result<Arc<Self>, ConfigError> {
        let registry = Arc::new(NodeRegistry::new(
            config.failure_policy.factory(),
            config.authenticator(),
        ));
        Self::with_registry(config, registry, Arc::new(NoopObserver))
    }

    /// Builds a pool drawing nodes from `registry`.
    ///
    /// New nodes are warmed up here; a node that cannot connect starts dead
    /// and the resurrection timer is armed for it.
    pub fn with_registry(
        config: &ClientConfig,
        registry: Arc<NodeRegistry>,
        observer: Arc<dyn OperationObserver>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let nodes = acquire_nodes(&registry, &config.servers, &config.socket_pool, &[]);
        let locator = config.locator.build(&nodes);
        let node_count = nodes.len();

        let pool = Arc::new_cyclic(|weak: &Weak<ServerPool>| {
            let weak = weak.clone();
            let timer = ResurrectionTimer::start(move || {
                weak.upgrade().and_then(|pool| pool.resurrect_sweep())
            });
            ServerPool {
                socket_pool: config.socket_pool.clone(),
                registry,
                membership: Mutex::new(Membership {
                    kind: config.locator.clone(),
                    nodes,
                    failed: HashSet::new(),
                }),
                locator: ArcSwap::from_pointee(locator),
                node_count: AtomicUsize::new(node_count),
                timer,
                rebuild_lock: Mutex::new(()),
                topology_lock: Mutex::new(()),
                sweep_lock: Mutex::new(()),
                observer,
                shut_down: AtomicBool::new(false),
            }
        });
        pool.note_dead_nodes();
        debug!(nodes = pool.nodes().len(), "server pool ready");
        Ok(pool)
    }

    /// Every configured node, dead or alive.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.membership.lock().nodes.clone()
    }

    /// Alive nodes of the published locator.
    pub fn working_nodes(&self) -> Vec<Arc<Node>> {
        self.locator.load().working_nodes()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Owner of `key`.
    ///
    /// A dead owner triggers a rebuild without it and a retry, at most once
    /// per configured node.
    pub fn locate(&self, key: &[u8]) -> Option<Target> {
        let attempts = self.node_count.load(Ordering::Acquire).max(1);
        for _ in 0..attempts {
            let target = self.locator.load().locate(key)?;
            if target.node.is_alive() {
                return Some(target);
            }
            self.node_fail(&target.node);
        }
        None
    }

    /// Routes a dead node out and arms the resurrection timer.
    pub fn node_fail(&self, node: &Arc<Node>) {
        if self.is_shut_down() {
            return;
        }
        let newly_failed = self
            .membership
            .lock()
            .failed
            .insert(node.endpoint().to_string());
        if newly_failed {
            warn!(endpoint = %node.endpoint(), "removing node from routing");
            self.observer.on_node_failed(node.endpoint());
        }
        self.rebuild();
        if self.timer.arm(self.socket_pool.dead_timeout) {
            debug!(delay = ?self.socket_pool.dead_timeout, "resurrection timer armed");
        }
    }

    /// Pings every dead node and rebuilds once if any came back.
    ///
    /// Nodes that were shut down are skipped. Returns the delay before the
    /// next sweep while nodes stay dead.
    pub fn resurrect_sweep(&self) -> Option<Duration> {
        let _sweep = self.sweep_lock.lock();
        if self.is_shut_down() {
            return None;
        }
        let dead: Vec<Arc<Node>> = self
            .nodes()
            .into_iter()
            .filter(|node| !node.is_alive() && !node.is_shut_down())
            .collect();
        if dead.is_empty() {
            return None;
        }

        let mut revived = Vec::new();
        let mut still_dead = 0usize;
        for node in dead {
            if node.ping() {
                revived.push(node);
            } else {
                still_dead += 1;
            }
        }

        if !revived.is_empty() {
            {
                let mut membership = self.membership.lock();
                for node in &revived {
                    membership.failed.remove(node.endpoint());
                }
            }
            for node in &revived {
                info!(endpoint = %node.endpoint(), "node resurrected");
                self.observer.on_node_revived(node.endpoint());
            }
            self.rebuild();
        }

        if still_dead > 0 {
            debug!(still_dead, "nodes remain dead");
            Some(self.socket_pool.dead_timeout)
        } else {
            None
        }
    }

    /// Groups keys by owning node in one pass, keeping caller order per node.
    ///
    /// Keys no node can take are returned separately.
    pub fn group_by_node(&self, keys: &[Bytes]) -> (Vec<NodeBatch>, Vec<Bytes>) {
        let mut batches: Vec<NodeBatch> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut unroutable = Vec::new();

        for key in keys {
            let Some(target) = self.locate(key) else {
                unroutable.push(key.clone());
                continue;
            };
            let slot = *index
                .entry(target.node.endpoint().to_string())
                .or_insert_with(|| {
                    batches.push(NodeBatch {
                        node: Arc::clone(&target.node),
                        keys: Vec::new(),
                        vbuckets: Vec::new(),
                    });
                    batches.len() - 1
                });
            batches[slot].keys.push(key.clone());
            batches[slot].vbuckets.push(target.vbucket);
        }
        (batches, unroutable)
    }

    /// Applies a pushed topology.
    ///
    /// Nodes for endpoints that stay are reused with their pools. Removed
    /// nodes are released to the registry and shut down once no other pool
    /// uses them. The router is rebuilt as for a static change.
    pub fn apply_topology(&self, topology: ClusterTopology) -> Result<(), ConfigError> {
        let _topology = self.topology_lock.lock();
        if self.is_shut_down() {
            return Err(ConfigError::ShutDown);
        }
        if topology.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        for server in &topology.servers {
            parse_endpoint(server)?;
        }
        let kind = {
            let membership = self.membership.lock();
            match (&membership.kind, topology.vbucket_map) {
                (_, Some(map)) => {
                    map.validate(&topology.servers)?;
                    LocatorKind::VBucket { map }
                }
                (LocatorKind::VBucket { .. }, None) => return Err(ConfigError::MissingVBucketMap),
                (kind, None) => kind.clone(),
            }
        };

        // Warm-up happens outside the membership lock.
        let current = self.nodes();
        let nodes = acquire_nodes(&self.registry, &topology.servers, &self.socket_pool, &current);

        let removed: Vec<Arc<Node>> = {
            let mut membership = self.membership.lock();
            let keep: HashSet<&str> = topology.servers.iter().map(String::as_str).collect();
            let removed = membership
                .nodes
                .iter()
                .filter(|node| !keep.contains(node.endpoint()))
                .cloned()
                .collect::<Vec<_>>();
            membership.failed.retain(|endpoint| keep.contains(endpoint.as_str()));
            membership.kind = kind;
            self.node_count.store(nodes.len(), Ordering::Release);
            membership.nodes = nodes;
            removed
        };

        self.rebuild();
        for node in &removed {
            info!(endpoint = %node.endpoint(), "node left topology");
            self.release_node(node);
        }
        self.note_dead_nodes();
        Ok(())
    }

    /// Runs one keyed operation against the key's owner.
    pub fn execute(&self, operation: &Operation) -> OperationResult<Reply> {
        let Some(key) = operation.key() else {
            return OperationResult::fail(
                Status::InvalidRequest,
                Some(format!("{} needs a node, not a key", operation.name())),
            );
        };
        match self.locate(key) {
            Some(target) => self.execute_on(&target.node, operation, |_| target.vbucket),
            None => OperationResult::not_attempted("no live node for key"),
        }
    }

    /// Runs `operation` on `node`, reporting node failures.
    pub fn execute_on<F>(&self, node: &Arc<Node>, operation: &Operation, vbucket: F) -> OperationResult<Reply>
    where
        F: FnMut(&Bytes) -> u16,
    {
        let mut exchange = match Exchange::new(operation, vbucket) {
            Ok(exchange) => exchange,
            Err(err) => return OperationResult::fail(Status::InvalidRequest, Some(err.to_string())),
        };

        match node.execute(|socket| socket.run(&mut exchange)) {
            Ok(()) => exchange.finish().unwrap_or_else(|err| {
                error!(
                    endpoint = %node.endpoint(),
                    operation = operation.name(),
                    error = %err,
                    "malformed response"
                );
                OperationResult::fail(Status::Protocol, Some(err.to_string()))
            }),
            Err(err) => {
                if err.node_failed() {
                    self.node_fail(node);
                }
                exchange.abort(err.status(), err.to_string())
            }
        }
    }

    /// Runs `work` once per node on scoped threads and collects the results
    /// in node order.
    ///
    /// Every item yields exactly one result: a worker that panics is
    /// reported as an `InternalError` failure in its slot.
    pub fn fan_out<I, T, F>(&self, items: Vec<I>, work: F) -> Vec<OperationResult<T>>
    where
        I: Send,
        T: Send,
        F: Fn(I) -> OperationResult<T> + Sync,
    {
        if items.len() <= 1 {
            return items
                .into_iter()
                .map(|item| {
                    panic::catch_unwind(AssertUnwindSafe(|| work(item)))
                        .unwrap_or_else(|_| worker_panicked())
                })
                .collect();
        }
        let work = &work;
        thread::scope(|scope| {
            let handles: Vec<_> = items
                .into_iter()
                .map(|item| scope.spawn(move || work(item)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|_| worker_panicked()))
                .collect()
        })
    }

    /// Stops the timer and releases every node. Idempotent.
    ///
    /// Nodes still used by other pools on a shared registry keep running;
    /// the last pool to release a node shuts it down.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.timer.stop();
        let _topology = self.topology_lock.lock();
        for node in self.nodes() {
            self.release_node(&node);
        }
        debug!("server pool shut down");
    }

    fn release_node(&self, node: &Arc<Node>) {
        match self.registry.release(node.endpoint(), &self.socket_pool) {
            Some(last) => last.shutdown(),
            None => debug!(endpoint = %node.endpoint(), "node kept for other pools"),
        }
    }

    fn rebuild(&self) {
        let _rebuild = self.rebuild_lock.lock();
        let (kind, nodes) = {
            let membership = self.membership.lock();
            (membership.kind.clone(), membership.nodes.clone())
        };
        self.locator.store(Arc::new(kind.build(&nodes)));
    }

    fn note_dead_nodes(&self) {
        let dead: Vec<Arc<Node>> = self
            .nodes()
            .into_iter()
            .filter(|node| !node.is_alive())
            .collect();
        for node in &dead {
            self.node_fail(node);
        }
    }
}

impl Drop for ServerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_panicked<T>() -> OperationResult<T> {
    error!("fan-out worker panicked");
    OperationResult::fail(Status::InternalError, Some("worker panicked".to_string()))
}

/// Nodes for `servers` in order, one per endpoint.
///
/// Nodes already in `current` are reused as they are; every other endpoint
/// is acquired from the registry, and warmed up if it was just created.
fn acquire_nodes(
    registry: &NodeRegistry,
    servers: &[String],
    config: &SocketPoolConfig,
    current: &[Arc<Node>],
) -> Vec<Arc<Node>> {
    let mut nodes: Vec<Arc<Node>> = Vec::with_capacity(servers.len());
    for server in servers {
        if nodes.iter().any(|node| node.endpoint() == server) {
            continue;
        }
        if let Some(node) = current.iter().find(|node| node.endpoint() == server) {
            nodes.push(Arc::clone(node));
            continue;
        }
        let (node, created) = registry.acquire(server, config);
        if created {
            if let Err(err) = node.warm_up() {
                warn!(endpoint = %server, error = %err, "node unreachable at startup");
            }
        }
        nodes.push(node);
    }
    nodes
}
