//! # Async Connection Layer
//!
//! Purpose: A tokio rendition of the socket and pool for callers that already
//! run inside a runtime. It reuses the same `Exchange` state machine as the
//! blocking path, so framing and decoding are shared.
//!
//! ## Design Principles
//! 1. **One Request In Flight**: A connection is leased exclusively; callers
//!    never interleave exchanges on one socket.
//! 2. **Timeouts Kill**: A timed-out or failed exchange leaves unread bytes
//!    on the wire, so the connection is destroyed instead of reused.
//! 3. **Semaphore Bound**: Permits cap open connections; a waiter gives up
//!    after `connection_timeout`.
//! 4. **Same Health Rules**: Idle connections are reset before reuse, and
//!    failures go through a failure policy that can take the pool out of
//!    service, as on the blocking path.
//!
//! ## Health
//! A dead pool refuses leases without I/O until `dead_timeout` has passed.
//! The next lease after that is a probe: a successful connect brings the
//! pool back and resets its policy.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use memring_common::{
    Exchange, Operation, OperationResult, Reply, RequestFrame, ResponseFrame, Status, Step,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::SocketPoolConfig;
use crate::error::{AcquireError, ConnectionError};
use crate::failure::{FailurePolicy, FailurePolicyFactory, ImmediateFailureFactory};

/// One async TCP connection to one node.
#[derive(Debug)]
pub struct AsyncConnection {
    endpoint: String,
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_body: usize,
    alive: bool,
}

impl AsyncConnection {
    pub async fn connect(endpoint: &str, connect_timeout: Duration) -> Result<Self, ConnectionError> {
        let stream = timeout(connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| timed_out("connect"))??;
        stream.set_nodelay(true)?;
        Ok(AsyncConnection {
            endpoint: endpoint.to_string(),
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_buf: BytesMut::with_capacity(1024),
            max_body: SocketPoolConfig::default().max_response_body(),
            alive: true,
        })
    }

    /// Caps the body length a response may announce.
    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Prepares an idle connection for a new lease.
    ///
    /// Bytes still buffered or waiting on the socket belong to an earlier
    /// exchange; they are dropped and logged. A closed peer is an error and
    /// leaves the connection dead.
    pub fn reset(&mut self) -> Result<(), ConnectionError> {
        let result = self.drain_stray();
        if result.is_err() {
            self.alive = false;
        }
        result
    }

    fn drain_stray(&mut self) -> Result<(), ConnectionError> {
        let mut stray = self.read_buf.len();
        self.read_buf.clear();
        let mut scratch = [0u8; 1024];
        loop {
            match self.stream.try_read(&mut scratch) {
                Ok(0) => return Err(ConnectionError::Closed),
                Ok(n) => stray += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ConnectionError::Io(err)),
            }
        }
        if stray > 0 {
            error!(endpoint = %self.endpoint, bytes = stray, "drained unread bytes from async connection");
        }
        Ok(())
    }

    /// Sends one request and waits for its response.
    pub async fn execute(
        &mut self,
        request: &RequestFrame,
        limit: Duration,
    ) -> Result<ResponseFrame, ConnectionError> {
        let outcome = timeout(limit, self.round_trip(request)).await;
        self.settle(outcome)
    }

    /// Drives a whole exchange (pipelined batches included).
    pub async fn run(&mut self, exchange: &mut Exchange, limit: Duration) -> Result<(), ConnectionError> {
        let outcome = timeout(limit, self.run_inner(exchange)).await;
        self.settle(outcome)
    }

    fn settle<T>(
        &mut self,
        outcome: Result<Result<T, ConnectionError>, tokio::time::error::Elapsed>,
    ) -> Result<T, ConnectionError> {
        let result = outcome.unwrap_or_else(|_| Err(timed_out("receive")));
        if result.is_err() {
            self.alive = false;
        }
        result
    }

    async fn round_trip(&mut self, request: &RequestFrame) -> Result<ResponseFrame, ConnectionError> {
        self.write_buf.clear();
        request.encode(&mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        let response = self.read_frame().await?;
        response.ensure_answers(request)?;
        Ok(response)
    }

    async fn run_inner(&mut self, exchange: &mut Exchange) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        for request in exchange.requests() {
            request.encode(&mut self.write_buf)?;
        }
        self.stream.write_all(&self.write_buf).await?;
        loop {
            let response = self.read_frame().await?;
            if exchange.accept(response)? == Step::Done {
                return Ok(());
            }
        }
    }

    async fn read_frame(&mut self) -> Result<ResponseFrame, ConnectionError> {
        loop {
            if let Some(frame) = ResponseFrame::decode_bounded(&mut self.read_buf, self.max_body)? {
                return Ok(frame);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(ConnectionError::Closed);
            }
        }
    }
}

fn timed_out(phase: &str) -> ConnectionError {
    ConnectionError::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{phase} timed out"),
    ))
}

/// Semaphore-bounded pool of async connections to one node.
#[derive(Debug)]
pub struct AsyncNodePool {
    endpoint: String,
    config: SocketPoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<AsyncConnection>>,
    policy: Mutex<Box<dyn FailurePolicy>>,
    alive: AtomicBool,
    dead_at: Mutex<Option<Instant>>,
}

impl AsyncNodePool {
    /// Pool whose first failure takes it out of service.
    pub fn new(endpoint: impl Into<String>, config: SocketPoolConfig) -> Arc<Self> {
        Self::with_policy(endpoint, config, &ImmediateFailureFactory)
    }

    pub fn with_policy(
        endpoint: impl Into<String>,
        config: SocketPoolConfig,
        policies: &dyn FailurePolicyFactory,
    ) -> Arc<Self> {
        let endpoint = endpoint.into();
        Arc::new(AsyncNodePool {
            permits: Arc::new(Semaphore::new(config.max_pool_size)),
            policy: Mutex::new(policies.create(&endpoint)),
            endpoint,
            config,
            idle: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            dead_at: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// When the pool was marked dead, if it is dead.
    pub fn dead_since(&self) -> Option<Instant> {
        *self.dead_at.lock()
    }

    /// Leases a connection: a reset idle one, or a new one when none is left.
    ///
    /// A dead pool answers `Unavailable` until `dead_timeout` has passed; the
    /// lease after that probes the node with a fresh connect.
    pub async fn acquire(self: &Arc<Self>) -> Result<AsyncPooledConnection, AcquireError> {
        if self.permits.is_closed() {
            return Err(AcquireError::Shutdown);
        }
        let probing = !self.is_alive();
        if probing {
            match self.dead_since() {
                Some(since) if since.elapsed() < self.config.dead_timeout => {
                    return Err(AcquireError::Unavailable(self.endpoint.clone()));
                }
                _ => {}
            }
        }

        let permit = timeout(
            self.config.connection_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| AcquireError::Timeout(self.config.connection_timeout))?
        .map_err(|_| AcquireError::Shutdown)?;

        let reused = self.idle.lock().pop();
        let conn = match reused {
            Some(mut conn) => match conn.reset() {
                Ok(()) => conn,
                Err(err) => {
                    self.record_failure();
                    return Err(AcquireError::Connect(err));
                }
            },
            None => match AsyncConnection::connect(&self.endpoint, self.config.connection_timeout)
                .await
            {
                Ok(conn) => conn.with_max_body(self.config.max_response_body()),
                Err(err) => {
                    if probing {
                        *self.dead_at.lock() = Some(Instant::now());
                    } else {
                        self.record_failure();
                    }
                    return Err(AcquireError::Connect(err));
                }
            },
        };
        if probing {
            self.revive();
        }
        Ok(AsyncPooledConnection {
            pool: Arc::clone(self),
            conn: Some(conn),
            _permit: permit,
        })
    }

    /// Runs one operation on a leased connection.
    pub async fn execute(self: &Arc<Self>, operation: &Operation) -> OperationResult<Reply> {
        let mut exchange = match Exchange::new(operation, |_| 0) {
            Ok(exchange) => exchange,
            Err(err) => return OperationResult::fail(Status::InvalidRequest, Some(err.to_string())),
        };
        let mut conn = match self.acquire().await {
            Ok(conn) => conn,
            Err(err) => return OperationResult::fail(err.status(), Some(err.to_string())),
        };
        let outcome = match conn.get_mut() {
            Some(socket) => socket.run(&mut exchange, self.config.receive_timeout).await,
            None => Err(ConnectionError::Closed),
        };
        match outcome {
            Ok(()) => exchange.finish().unwrap_or_else(|err| {
                OperationResult::fail(Status::Protocol, Some(err.to_string()))
            }),
            Err(err) => {
                drop(conn);
                let node_failed = self.record_failure();
                debug!(endpoint = %self.endpoint, error = %err, node_failed, "async exchange failed");
                exchange.abort(err.status(), err.to_string())
            }
        }
    }

    /// Flips the pool to dead. Returns true only for the call that flipped it.
    pub fn mark_dead(&self) -> bool {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return false;
        }
        *self.dead_at.lock() = Some(Instant::now());
        self.idle.lock().clear();
        warn!(endpoint = %self.endpoint, "async node marked dead");
        true
    }

    fn record_failure(&self) -> bool {
        if !self.is_alive() {
            return true;
        }
        let fail = self.policy.lock().should_fail();
        if fail {
            self.mark_dead();
        }
        fail
    }

    fn revive(&self) {
        if self.alive.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.dead_at.lock() = None;
        self.policy.lock().reset();
        info!(endpoint = %self.endpoint, "async node is back in service");
    }

    /// Closes idle connections and refuses further leases.
    pub fn shutdown(&self) {
        self.permits.close();
        self.alive.store(false, Ordering::Release);
        self.idle.lock().clear();
    }
}

/// Lease guard. A live connection goes back to the idle list on drop.
#[derive(Debug)]
pub struct AsyncPooledConnection {
    pool: Arc<AsyncNodePool>,
    conn: Option<AsyncConnection>,
    _permit: OwnedSemaphorePermit,
}

impl AsyncPooledConnection {
    pub fn get_mut(&mut self) -> Option<&mut AsyncConnection> {
        self.conn.as_mut()
    }
}

impl Drop for AsyncPooledConnection {
    fn drop(&mut self) {
        // Runs before the permit is released so a waiter finds the connection.
        if let Some(conn) = self.conn.take() {
            if conn.is_alive() && self.pool.is_alive() && !self.pool.permits.is_closed() {
                self.pool.idle.lock().push(conn);
            } else {
                debug!(endpoint = %self.pool.endpoint, "destroying async connection");
            }
        }
    }
}
