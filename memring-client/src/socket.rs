//! # Pooled Socket
//!
//! Purpose: One blocking TCP connection to one node, speaking binary frames.
//!
//! ## Design Principles
//! 1. **Fatal Errors**: Any I/O or framing error clears `alive`; the pool
//!    destroys the socket instead of returning it.
//! 2. **Reusable Buffers**: Writes go through one `BytesMut` kept on the
//!    socket; reads go through a `BufReader`.
//! 3. **Bounded I/O**: Reads use `receive_timeout`, connect and writes use
//!    `connection_timeout`. A response announcing a body above the item size
//!    limit is rejected before anything is allocated for it.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use memring_common::{
    next_opaque, Exchange, Opcode, RequestFrame, ResponseFrame, ResponseHeader, Status, Step,
    HEADER_LEN,
};
use tracing::{debug, error};

use crate::auth::SaslAuthenticator;
use crate::config::SocketPoolConfig;
use crate::error::ConnectionError;

static SOCKET_SEQ: AtomicU64 = AtomicU64::new(1);

pub struct PooledSocket {
    id: u64,
    endpoint: String,
    reader: BufReader<TcpStream>,
    write_buf: BytesMut,
    max_body: usize,
    alive: bool,
}

impl std::fmt::Debug for PooledSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSocket")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("alive", &self.alive)
            .finish()
    }
}

impl PooledSocket {
    /// Connects to `endpoint`, trying each resolved address in turn.
    pub fn connect(endpoint: &str, config: &SocketPoolConfig) -> Result<Self, ConnectionError> {
        let mut last_error = None;
        for addr in endpoint.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, config.connection_timeout) {
                Ok(stream) => return Self::from_stream(endpoint, stream, config),
                Err(err) => last_error = Some(err),
            }
        }
        match last_error {
            Some(err) => Err(ConnectionError::Io(err)),
            None => Err(ConnectionError::Unresolved(endpoint.to_string())),
        }
    }

    fn from_stream(
        endpoint: &str,
        stream: TcpStream,
        config: &SocketPoolConfig,
    ) -> Result<Self, ConnectionError> {
        stream.set_read_timeout(non_zero(config.receive_timeout))?;
        stream.set_write_timeout(non_zero(config.connection_timeout))?;
        // Small request frames; don't wait on Nagle.
        stream.set_nodelay(true)?;

        let socket = PooledSocket {
            id: SOCKET_SEQ.fetch_add(1, Ordering::Relaxed),
            endpoint: endpoint.to_string(),
            reader: BufReader::new(stream),
            write_buf: BytesMut::with_capacity(256),
            max_body: config.max_response_body(),
            alive: true,
        };
        debug!(endpoint = %socket.endpoint, socket = socket.id, "socket connected");
        Ok(socket)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Flags the socket for destruction on release.
    pub fn mark_dead(&mut self) {
        self.alive = false;
    }

    /// Prepares an idle socket for a new lease.
    ///
    /// Unread bytes at this point mean an earlier exchange left the stream out
    /// of sync. They are drained and logged; a closed peer is an error.
    pub fn reset(&mut self) -> Result<(), ConnectionError> {
        let result = self.drain_stray();
        if result.is_err() {
            self.alive = false;
        }
        result
    }

    fn drain_stray(&mut self) -> Result<(), ConnectionError> {
        let mut stray = self.reader.buffer().len();
        self.reader.consume(stray);

        let stream = self.reader.get_mut();
        stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 1024];
        let outcome = loop {
            match stream.read(&mut scratch) {
                Ok(0) => break Err(ConnectionError::Closed),
                Ok(n) => stray += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => break Err(ConnectionError::Io(err)),
            }
        };
        stream.set_nonblocking(false)?;
        outcome?;

        if stray > 0 {
            error!(
                endpoint = %self.endpoint,
                socket = self.id,
                bytes = stray,
                "drained unread bytes from pooled socket"
            );
        }
        Ok(())
    }

    /// Writes all frames in one flush.
    pub fn send(&mut self, frames: &[RequestFrame]) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        for frame in frames {
            frame.encode(&mut self.write_buf)?;
        }
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        Ok(())
    }

    /// Reads one complete response frame.
    pub fn receive(&mut self) -> Result<ResponseFrame, ConnectionError> {
        let mut raw = [0u8; HEADER_LEN];
        read_full(&mut self.reader, &mut raw)?;
        let header = ResponseHeader::decode(&raw)?;
        header.check_body(self.max_body)?;
        let mut body = vec![0u8; header.body_len as usize];
        read_full(&mut self.reader, &mut body)?;
        Ok(ResponseFrame::from_parts(header, Bytes::from(body))?)
    }

    /// Sends the exchange's requests and feeds responses until it completes.
    pub fn run(&mut self, exchange: &mut Exchange) -> Result<(), ConnectionError> {
        let result = self.run_inner(exchange);
        if result.is_err() {
            self.alive = false;
        }
        result
    }

    fn run_inner(&mut self, exchange: &mut Exchange) -> Result<(), ConnectionError> {
        self.send(exchange.requests())?;
        loop {
            let response = self.receive()?;
            if exchange.accept(response)? == Step::Done {
                return Ok(());
            }
        }
    }

    /// Runs the SASL exchange. Any failure leaves the socket unusable.
    pub fn authenticate(&mut self, auth: &dyn SaslAuthenticator) -> Result<(), ConnectionError> {
        let result = self.authenticate_inner(auth);
        if result.is_err() {
            self.alive = false;
        }
        result
    }

    fn authenticate_inner(&mut self, auth: &dyn SaslAuthenticator) -> Result<(), ConnectionError> {
        let mechanism = Bytes::copy_from_slice(auth.mechanism().as_bytes());
        let mut request = RequestFrame::new(Opcode::SaslAuth, next_opaque())
            .with_key(mechanism.clone())
            .with_value(auth.initial_response());

        loop {
            self.send(std::slice::from_ref(&request))?;
            let response = self.receive()?;
            response.ensure_answers(&request)?;
            match response.status() {
                Status::NoError => {
                    debug!(endpoint = %self.endpoint, socket = self.id, "authenticated");
                    return Ok(());
                }
                Status::AuthContinue => {
                    let payload = auth.step(&response.value).map_err(ConnectionError::Auth)?;
                    request = RequestFrame::new(Opcode::SaslStep, next_opaque())
                        .with_key(mechanism.clone())
                        .with_value(payload);
                }
                status => {
                    return Err(ConnectionError::Auth(format!(
                        "{}: {}",
                        status,
                        response.value_text()
                    )));
                }
            }
        }
    }
}

fn read_full(reader: &mut BufReader<TcpStream>, buf: &mut [u8]) -> Result<(), ConnectionError> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => ConnectionError::Closed,
        _ => ConnectionError::Io(err),
    })
}

fn non_zero(timeout: std::time::Duration) -> Option<std::time::Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}
