// registry.rs - Explicit node cache
//
// Nodes are keyed by endpoint and pool settings so that a topology change
// reuses the live node (and its warm pool) for every endpoint that stayed.
// A registry is an ordinary value owned by whoever builds server pools; there
// is no process-wide instance.
//
// Every pool holding a node counts as one user. A node leaves the registry
// when its last user releases it; only then may it be shut down.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::auth::SaslAuthenticator;
use crate::config::SocketPoolConfig;
use crate::failure::FailurePolicyFactory;
use crate::node::Node;

type NodeKey = (String, SocketPoolConfig);

#[derive(Debug)]
struct Entry {
    node: Arc<Node>,
    users: usize,
}

#[derive(Debug)]
pub struct NodeRegistry {
    policies: Arc<dyn FailurePolicyFactory>,
    authenticator: Option<Arc<dyn SaslAuthenticator>>,
    nodes: Mutex<HashMap<NodeKey, Entry>>,
}

impl NodeRegistry {
    pub fn new(
        policies: Arc<dyn FailurePolicyFactory>,
        authenticator: Option<Arc<dyn SaslAuthenticator>>,
    ) -> Self {
        NodeRegistry {
            policies,
            authenticator,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the registered node, creating it on first use, and counts the
    /// caller as one more user. Pair every call with `release`.
    ///
    /// The flag is true when the node was just created (and needs warming).
    pub fn acquire(&self, endpoint: &str, config: &SocketPoolConfig) -> (Arc<Node>, bool) {
        let mut nodes = self.nodes.lock();
        let key = (endpoint.to_string(), config.clone());
        if let Some(entry) = nodes.get_mut(&key) {
            entry.users += 1;
            return (Arc::clone(&entry.node), false);
        }
        let node = Arc::new(Node::new(
            endpoint,
            config.clone(),
            self.policies.as_ref(),
            self.authenticator.clone(),
        ));
        nodes.insert(
            key,
            Entry {
                node: Arc::clone(&node),
                users: 1,
            },
        );
        (node, true)
    }

    /// Drops one user of a node.
    ///
    /// Returns the node once its last user is gone; the caller then owns its
    /// shutdown. Returns `None` while other users remain or when the node is
    /// not registered.
    pub fn release(&self, endpoint: &str, config: &SocketPoolConfig) -> Option<Arc<Node>> {
        let mut nodes = self.nodes.lock();
        let key = (endpoint.to_string(), config.clone());
        let entry = nodes.get_mut(&key)?;
        entry.users -= 1;
        if entry.users > 0 {
            return None;
        }
        nodes.remove(&key).map(|entry| entry.node)
    }

    /// Pools currently holding the node.
    pub fn users(&self, endpoint: &str, config: &SocketPoolConfig) -> usize {
        self.nodes
            .lock()
            .get(&(endpoint.to_string(), config.clone()))
            .map_or(0, |entry| entry.users)
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Removes and returns every node.
    pub fn drain(&self) -> Vec<Arc<Node>> {
        self.nodes.lock().drain().map(|(_, entry)| entry.node).collect()
    }

    /// Drains the registry and shuts every node down.
    pub fn shutdown(&self) {
        for node in self.drain() {
            node.shutdown();
        }
    }
}
