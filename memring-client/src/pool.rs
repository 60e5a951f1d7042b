//! # Node Connection Pool
//!
//! Purpose: Reuse TCP connections to one node and track whether that node is
//! reachable at all.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: A bounded set of reusable sockets; new ones are
//!    opened lazily up to `max_pool_size`.
//! 2. **Minimal Locking**: The mutex guards only the idle list and the open
//!    count. Connecting, authenticating and draining happen outside it.
//! 3. **Blocking Acquire**: When every socket is leased, callers wait on a
//!    condvar for at most `connection_timeout`.
//! 4. **Scoped Lease**: `PooledConnection` returns its socket on drop; a
//!    socket flagged dead is destroyed instead.
//!
//! ## Health
//! The pool carries the node's alive flag. `mark_dead` flips it once, stamps
//! the time and closes idle sockets; a dead pool refuses leases without I/O.
//! Dead pools are never repaired; the node swaps in a new one.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::auth::SaslAuthenticator;
use crate::config::SocketPoolConfig;
use crate::error::{AcquireError, ConnectionError};
use crate::socket::PooledSocket;

struct PoolState {
    idle: VecDeque<PooledSocket>,
    /// Idle plus leased sockets.
    total: usize,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub total: usize,
    pub alive: bool,
}

pub struct NodePool {
    endpoint: String,
    config: SocketPoolConfig,
    authenticator: Option<Arc<dyn SaslAuthenticator>>,
    state: Mutex<PoolState>,
    available: Condvar,
    alive: AtomicBool,
    shut_down: AtomicBool,
    dead_at: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePool")
            .field("endpoint", &self.endpoint)
            .field("stats", &self.stats())
            .finish()
    }
}

impl NodePool {
    /// Creates an empty, alive pool. No connection is opened yet.
    pub fn new(
        endpoint: &str,
        config: SocketPoolConfig,
        authenticator: Option<Arc<dyn SaslAuthenticator>>,
    ) -> Self {
        NodePool {
            endpoint: endpoint.to_string(),
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(config.max_pool_size),
                total: 0,
            }),
            config,
            authenticator,
            available: Condvar::new(),
            alive: AtomicBool::new(true),
            shut_down: AtomicBool::new(false),
            dead_at: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &SocketPoolConfig {
        &self.config
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// When the pool was marked dead, if it is dead.
    pub fn dead_since(&self) -> Option<Instant> {
        *self.dead_at.lock()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            total: state.total,
            alive: self.is_alive(),
        }
    }

    /// Opens `count` connections (capped at the max size) and parks them idle.
    ///
    /// Stops at the first failure and marks the pool dead.
    pub fn warm_up(&self, count: usize) -> Result<(), ConnectionError> {
        let count = count.min(self.config.max_pool_size);
        for _ in 0..count {
            if !self.try_reserve() {
                break;
            }
            match self.open() {
                Ok(socket) => self.release(socket),
                Err(err) => {
                    self.release_slot();
                    self.mark_dead();
                    return Err(err);
                }
            }
        }
        debug!(endpoint = %self.endpoint, count, "pool warmed up");
        Ok(())
    }

    /// Leases a connection.
    ///
    /// Returns a reset idle socket, or opens a new one while under the max
    /// size, or waits for a release until `connection_timeout` passes.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledConnection, AcquireError> {
        let deadline = Instant::now() + self.config.connection_timeout;
        let mut state = self.state.lock();
        loop {
            if self.shut_down.load(Ordering::Acquire) {
                return Err(AcquireError::Shutdown);
            }
            if !self.is_alive() {
                return Err(AcquireError::Unavailable(self.endpoint.clone()));
            }

            if let Some(mut socket) = state.idle.pop_front() {
                drop(state);
                return match socket.reset() {
                    Ok(()) => Ok(PooledConnection::new(Arc::clone(self), socket)),
                    Err(err) => {
                        self.release_slot();
                        Err(AcquireError::Connect(err))
                    }
                };
            }

            if state.total < self.config.max_pool_size {
                state.total += 1;
                drop(state);
                return match self.open() {
                    Ok(socket) => Ok(PooledConnection::new(Arc::clone(self), socket)),
                    Err(err) => {
                        self.release_slot();
                        Err(AcquireError::Connect(err))
                    }
                };
            }

            if self.available.wait_until(&mut state, deadline).timed_out() {
                return Err(AcquireError::Timeout(self.config.connection_timeout));
            }
        }
    }

    /// Flips the pool to dead. Returns true only for the call that flipped it.
    pub fn mark_dead(&self) -> bool {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return false;
        }
        *self.dead_at.lock() = Some(Instant::now());
        self.close_idle();
        warn!(endpoint = %self.endpoint, "node marked dead");
        true
    }

    /// Restarts the dead timer after a failed ping.
    pub fn refresh_dead_time(&self) {
        if !self.is_alive() {
            *self.dead_at.lock() = Some(Instant::now());
        }
    }

    /// Closes idle sockets and refuses further leases. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.alive.store(false, Ordering::Release);
        self.close_idle();
        debug!(endpoint = %self.endpoint, "pool shut down");
    }

    fn close_idle(&self) {
        let mut state = self.state.lock();
        let closed = state.idle.len();
        state.idle.clear();
        state.total -= closed;
        drop(state);
        self.available.notify_all();
    }

    fn open(&self) -> Result<PooledSocket, ConnectionError> {
        let mut socket = PooledSocket::connect(&self.endpoint, &self.config)?;
        if let Some(auth) = &self.authenticator {
            socket.authenticate(auth.as_ref())?;
        }
        Ok(socket)
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.state.lock();
        if state.total >= self.config.max_pool_size {
            return false;
        }
        state.total += 1;
        true
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn release(&self, socket: PooledSocket) {
        if !socket.is_alive() || !self.is_alive() {
            debug!(endpoint = %self.endpoint, socket = socket.id(), "destroying socket");
            drop(socket);
            self.release_slot();
            return;
        }
        self.state.lock().idle.push_back(socket);
        self.available.notify_one();
    }
}

/// RAII lease returning its socket to the pool on drop.
pub struct PooledConnection {
    pool: Arc<NodePool>,
    socket: Option<PooledSocket>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn new(pool: Arc<NodePool>, socket: PooledSocket) -> Self {
        PooledConnection {
            pool,
            socket: Some(socket),
        }
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }
}

impl Deref for PooledConnection {
    type Target = PooledSocket;

    fn deref(&self) -> &PooledSocket {
        // Only `drop` takes the socket out.
        self.socket.as_ref().unwrap_or_else(|| unreachable!("socket taken before drop"))
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut PooledSocket {
        self.socket.as_mut().unwrap_or_else(|| unreachable!("socket taken before drop"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.pool.release(socket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    fn accept_forever(listener: TcpListener) {
        thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => held.push(stream),
                    Err(_) => break,
                }
            }
        });
    }

    fn config(max: usize) -> SocketPoolConfig {
        SocketPoolConfig {
            min_pool_size: 0,
            max_pool_size: max,
            connection_timeout: Duration::from_millis(200),
            receive_timeout: Duration::from_millis(200),
            dead_timeout: Duration::from_millis(100),
            ..SocketPoolConfig::default()
        }
    }

    #[test]
    fn reuses_released_connections() {
        let (listener, addr) = listener();
        accept_forever(listener);
        let pool = Arc::new(NodePool::new(&addr, config(2), None));

        let first_id = {
            let conn = pool.acquire().unwrap();
            conn.id()
        };
        let conn = pool.acquire().unwrap();
        assert_eq!(conn.id(), first_id);
        assert_eq!(pool.stats().total, 1);
    }

    #[test]
    fn exhausted_pool_times_out_without_dying() {
        let (listener, addr) = listener();
        accept_forever(listener);
        let pool = Arc::new(NodePool::new(&addr, config(1), None));

        let _held = pool.acquire().unwrap();
        let started = Instant::now();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, AcquireError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(pool.is_alive());
    }

    #[test]
    fn waiter_gets_released_connection() {
        let (listener, addr) = listener();
        accept_forever(listener);
        let mut cfg = config(1);
        cfg.connection_timeout = Duration::from_secs(2);
        let pool = Arc::new(NodePool::new(&addr, cfg, None));

        let held = pool.acquire().unwrap();
        let held_id = held.id();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|conn| conn.id()))
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), held_id);
    }

    #[test]
    fn dead_socket_is_destroyed_on_release() {
        let (listener, addr) = listener();
        accept_forever(listener);
        let pool = Arc::new(NodePool::new(&addr, config(2), None));

        let mut conn = pool.acquire().unwrap();
        conn.mark_dead();
        drop(conn);
        assert_eq!(pool.stats(), PoolStats { idle: 0, total: 0, alive: true });
    }

    #[test]
    fn dead_pool_refuses_without_io() {
        let pool = Arc::new(NodePool::new("127.0.0.1:1", config(2), None));
        assert!(pool.mark_dead());
        assert!(!pool.mark_dead());
        assert!(pool.dead_since().is_some());
        assert!(matches!(
            pool.acquire(),
            Err(AcquireError::Unavailable(_))
        ));
    }

    #[test]
    fn warm_up_failure_marks_dead() {
        let (listener, addr) = listener();
        drop(listener);
        let pool = NodePool::new(&addr, config(4), None);
        assert!(pool.warm_up(2).is_err());
        assert!(!pool.is_alive());
        assert_eq!(pool.stats().total, 0);
    }

    #[test]
    fn warm_up_fills_idle_list() {
        let (listener, addr) = listener();
        accept_forever(listener);
        let pool = NodePool::new(&addr, config(3), None);
        pool.warm_up(5).unwrap();
        assert_eq!(pool.stats(), PoolStats { idle: 3, total: 3, alive: true });

        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_shut_down());
        assert!(pool.dead_since().is_none());
        assert_eq!(pool.stats(), PoolStats { idle: 0, total: 0, alive: false });
    }
}
