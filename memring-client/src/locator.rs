//! # Node Locators
//!
//! Purpose: Pick the node (and vbucket) that owns a key.
//!
//! ## Design Principles
//! 1. **Immutable Snapshots**: A locator is built over a node list and never
//!    changes. Membership changes build a new locator that the server pool
//!    publishes in one atomic swap.
//! 2. **Alive at Build Time**: Hashing locators are built over the nodes that
//!    were alive when built. The vbucket locator keeps every node and checks
//!    liveness per lookup, falling back to replicas.

use std::fmt::Debug;
use std::sync::Arc;

use crate::config::{HashAlgorithm, LocatorKind};
use crate::node::Node;
use crate::ring::HashRing;
use crate::vbucket::VBucketMap;

/// Where to send a key.
#[derive(Debug, Clone)]
pub struct Target {
    pub node: Arc<Node>,
    /// Written into the request header; 0 outside vbucket routing.
    pub vbucket: u16,
}

pub trait NodeLocator: Send + Sync + Debug {
    /// Owner of `key`, or `None` when no node can take it.
    fn locate(&self, key: &[u8]) -> Option<Target>;

    /// Nodes this locator was built over.
    fn nodes(&self) -> &[Arc<Node>];

    /// Subset of `nodes` currently alive.
    fn working_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes()
            .iter()
            .filter(|node| node.is_alive())
            .cloned()
            .collect()
    }
}

impl LocatorKind {
    /// Builds a locator for this strategy over `nodes`.
    pub fn build(&self, nodes: &[Arc<Node>]) -> Box<dyn NodeLocator> {
        let alive = || -> Vec<Arc<Node>> {
            nodes.iter().filter(|node| node.is_alive()).cloned().collect()
        };
        match self {
            LocatorKind::Consistent {
                algorithm,
                mutations,
            } => Box::new(ConsistentHashLocator::new(alive(), *algorithm, *mutations)),
            LocatorKind::Single => Box::new(SingleNodeLocator::new(alive())),
            LocatorKind::VBucket { map } => {
                Box::new(VBucketLocator::new(nodes.to_vec(), map.clone()))
            }
        }
    }
}

/// Consistent hashing over a ring of node points.
#[derive(Debug)]
pub struct ConsistentHashLocator {
    nodes: Vec<Arc<Node>>,
    ring: HashRing,
}

impl ConsistentHashLocator {
    pub fn new(nodes: Vec<Arc<Node>>, algorithm: HashAlgorithm, mutations: usize) -> Self {
        let endpoints: Vec<&str> = nodes.iter().map(|node| node.endpoint()).collect();
        let ring = HashRing::build(&endpoints, algorithm, mutations);
        ConsistentHashLocator { nodes, ring }
    }
}

impl NodeLocator for ConsistentHashLocator {
    fn locate(&self, key: &[u8]) -> Option<Target> {
        let owner = self.ring.lookup(key)?;
        Some(Target {
            node: Arc::clone(&self.nodes[owner]),
            vbucket: 0,
        })
    }

    fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }
}

/// Sends everything to the first node, no hashing.
#[derive(Debug)]
pub struct SingleNodeLocator {
    nodes: Vec<Arc<Node>>,
}

impl SingleNodeLocator {
    pub fn new(mut nodes: Vec<Arc<Node>>) -> Self {
        nodes.truncate(1);
        SingleNodeLocator { nodes }
    }
}

impl NodeLocator for SingleNodeLocator {
    fn locate(&self, _key: &[u8]) -> Option<Target> {
        self.nodes.first().map(|node| Target {
            node: Arc::clone(node),
            vbucket: 0,
        })
    }

    fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }
}

/// Routes through a vbucket map: master if alive, else the first live replica.
#[derive(Debug)]
pub struct VBucketLocator {
    nodes: Vec<Arc<Node>>,
    map: VBucketMap,
    // Map server index -> index into `nodes`.
    server_nodes: Vec<Option<usize>>,
}

impl VBucketLocator {
    pub fn new(nodes: Vec<Arc<Node>>, map: VBucketMap) -> Self {
        let server_nodes = map
            .servers
            .iter()
            .map(|server| nodes.iter().position(|node| node.endpoint() == server))
            .collect();
        VBucketLocator {
            nodes,
            map,
            server_nodes,
        }
    }

    pub fn map(&self) -> &VBucketMap {
        &self.map
    }
}

impl NodeLocator for VBucketLocator {
    fn locate(&self, key: &[u8]) -> Option<Target> {
        let vbucket = self.map.bucket_of(key);
        let entry = self.map.entry(vbucket)?;
        std::iter::once(&entry.master)
            .chain(entry.replicas.iter())
            .filter_map(|&server| self.server_nodes.get(server).copied().flatten())
            .map(|index| &self.nodes[index])
            .find(|node| node.is_alive())
            .map(|node| Target {
                node: Arc::clone(node),
                vbucket,
            })
    }

    fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }
}
