//! # Node
//!
//! Purpose: One cache server as seen by the client: its endpoint, its current
//! connection pool and its failure policy.
//!
//! ## Design Principles
//! 1. **Swappable Pool**: The pool sits behind an `ArcSwap`. A revived node
//!    gets a brand-new pool; leases on the old one finish against it.
//! 2. **Policy at the Edge**: Transport failures go through the failure
//!    policy before the pool is marked dead.
//! 3. **No Eager I/O**: Construction opens nothing; `warm_up` and `ping` do.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::auth::SaslAuthenticator;
use crate::config::SocketPoolConfig;
use crate::error::{AcquireError, ConnectionError, NodeError};
use crate::failure::{FailurePolicy, FailurePolicyFactory};
use crate::pool::{NodePool, PoolStats};
use crate::socket::PooledSocket;

pub struct Node {
    endpoint: String,
    config: SocketPoolConfig,
    authenticator: Option<Arc<dyn SaslAuthenticator>>,
    pool: ArcSwap<NodePool>,
    policy: Mutex<Box<dyn FailurePolicy>>,
    // Serialises pings so only one replacement pool is built at a time.
    ping_lock: Mutex<()>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("endpoint", &self.endpoint)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Node {
    pub fn new(
        endpoint: &str,
        config: SocketPoolConfig,
        policies: &dyn FailurePolicyFactory,
        authenticator: Option<Arc<dyn SaslAuthenticator>>,
    ) -> Self {
        let pool = NodePool::new(endpoint, config.clone(), authenticator.clone());
        Node {
            endpoint: endpoint.to_string(),
            config,
            authenticator,
            pool: ArcSwap::from_pointee(pool),
            policy: Mutex::new(policies.create(endpoint)),
            ping_lock: Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &SocketPoolConfig {
        &self.config
    }

    pub fn is_alive(&self) -> bool {
        self.pool.load().is_alive()
    }

    pub fn dead_since(&self) -> Option<Instant> {
        self.pool.load().dead_since()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.load().stats()
    }

    /// Opens `min_pool_size` connections. A failure marks the node dead.
    pub fn warm_up(&self) -> Result<(), ConnectionError> {
        self.pool.load().warm_up(self.config.min_pool_size)
    }

    /// Takes the node out of service regardless of policy.
    pub fn mark_dead(&self) -> bool {
        self.pool.load().mark_dead()
    }

    /// Leases a socket and runs `work` on it.
    ///
    /// A failed `work` destroys the socket and is reported to the failure
    /// policy, which may take the whole node out of service.
    pub fn execute<T, F>(&self, work: F) -> Result<T, NodeError>
    where
        F: FnOnce(&mut PooledSocket) -> Result<T, ConnectionError>,
    {
        let pool = self.pool.load_full();
        let mut conn = match pool.acquire() {
            Ok(conn) => conn,
            Err(AcquireError::Connect(source)) => {
                let node_failed = self.record_failure(&pool);
                return Err(NodeError::Failed {
                    source,
                    node_failed,
                });
            }
            Err(err) => return Err(err.into()),
        };

        match work(&mut *conn) {
            Ok(value) => Ok(value),
            Err(source) => {
                conn.mark_dead();
                drop(conn);
                let node_failed = self.record_failure(&pool);
                debug!(
                    endpoint = %self.endpoint,
                    error = %source,
                    node_failed,
                    "exchange failed"
                );
                Err(NodeError::Failed {
                    source,
                    node_failed,
                })
            }
        }
    }

    fn record_failure(&self, pool: &NodePool) -> bool {
        if !pool.is_alive() {
            return true;
        }
        let fail = self.policy.lock().should_fail();
        if fail {
            pool.mark_dead();
        }
        fail
    }

    /// Tries to bring a dead node back. Returns true if the node is alive.
    ///
    /// Nothing is attempted until `dead_timeout` has passed since the node
    /// was marked dead. A successful probe swaps in a new warmed-up pool and
    /// shuts the dead one down. A node that was shut down stays down.
    pub fn ping(&self) -> bool {
        let _guard = self.ping_lock.lock();
        let current = self.pool.load_full();
        if current.is_shut_down() {
            return false;
        }
        if current.is_alive() {
            return true;
        }
        match current.dead_since() {
            Some(since) if since.elapsed() < self.config.dead_timeout => return false,
            _ => {}
        }

        let fresh = NodePool::new(&self.endpoint, self.config.clone(), self.authenticator.clone());
        match fresh.warm_up(self.config.min_pool_size.max(1)) {
            Ok(()) => {
                let old = self.pool.swap(Arc::new(fresh));
                old.shutdown();
                self.policy.lock().reset();
                info!(endpoint = %self.endpoint, "node is back in service");
                true
            }
            Err(err) => {
                fresh.shutdown();
                current.refresh_dead_time();
                debug!(endpoint = %self.endpoint, error = %err, "ping failed");
                false
            }
        }
    }

    /// Shuts down the current pool. Idempotent and final: `ping` will not
    /// revive the node afterwards.
    pub fn shutdown(&self) {
        let _guard = self.ping_lock.lock();
        self.pool.load().shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.pool.load().is_shut_down()
    }
}
