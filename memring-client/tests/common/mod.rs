#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use memring_common::{Opcode, RequestFrame, ResponseFrame, HEADER_LEN};
use parking_lot::Mutex;

const KEY_ENOENT: u16 = 0x01;
const KEY_EEXISTS: u16 = 0x02;
const NOT_STORED: u16 = 0x05;
const NON_NUMERIC: u16 = 0x06;
const AUTH_ERROR: u16 = 0x20;
const UNKNOWN_COMMAND: u16 = 0x81;

#[derive(Clone)]
struct Entry {
    flags: u32,
    data: Vec<u8>,
    cas: u64,
}

struct Shared {
    items: Mutex<HashMap<Vec<u8>, Entry>>,
    next_cas: AtomicU64,
    running: AtomicBool,
    accepted: AtomicUsize,
    requests: AtomicUsize,
    streams: Mutex<Vec<TcpStream>>,
    credentials: Option<Vec<u8>>,
    delay: Mutex<Duration>,
}

/// In-process binary-protocol server backed by a hash map.
pub struct MockServer {
    addr: String,
    shared: Arc<Shared>,
}

impl MockServer {
    pub fn start() -> Self {
        Self::spawn(None)
    }

    /// Server that requires SASL PLAIN with `user`/`password` (empty zone).
    pub fn with_credentials(user: &str, password: &str) -> Self {
        let mut creds = vec![0u8];
        creds.extend_from_slice(user.as_bytes());
        creds.push(0);
        creds.extend_from_slice(password.as_bytes());
        Self::spawn(Some(creds))
    }

    fn spawn(credentials: Option<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let shared = Arc::new(Shared {
            items: Mutex::new(HashMap::new()),
            next_cas: AtomicU64::new(1),
            running: AtomicBool::new(true),
            accepted: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            streams: Mutex::new(Vec::new()),
            credentials,
            delay: Mutex::new(Duration::ZERO),
        });
        accept_loop(listener, Arc::clone(&shared));
        MockServer { addr, shared }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    pub fn item_count(&self) -> usize {
        self.shared.items.lock().len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shared.items.lock().contains_key(key.as_bytes())
    }

    /// Delays every response by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.shared.delay.lock() = delay;
    }

    /// Closes the listener and every open connection. Items are kept.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        for stream in self.shared.streams.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        // Give the accept loop time to drop the listener.
        thread::sleep(Duration::from_millis(50));
    }

    /// Listens again on the same address.
    pub fn restart(&self) {
        let listener = TcpListener::bind(&self.addr).expect("rebind");
        self.shared.running.store(true, Ordering::SeqCst);
        accept_loop(listener, Arc::clone(&self.shared));
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        for stream in self.shared.streams.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    listener.set_nonblocking(true).expect("nonblocking");
    thread::spawn(move || {
        while shared.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    let _ = stream.set_nonblocking(false);
                    shared.accepted.fetch_add(1, Ordering::SeqCst);
                    if let Ok(clone) = stream.try_clone() {
                        shared.streams.lock().push(clone);
                    }
                    let shared = Arc::clone(&shared);
                    thread::spawn(move || serve(stream, shared));
                }
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        }
    });
}

fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut authenticated = shared.credentials.is_none();
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 4096];
    loop {
        loop {
            let request = match RequestFrame::decode(&mut buf) {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(_) => return,
            };
            shared.requests.fetch_add(1, Ordering::SeqCst);
            let delay = *shared.delay.lock();
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            let mut out = BytesMut::new();
            for response in handle(&shared, &request, &mut authenticated) {
                response.encode(&mut out);
            }
            if stream.write_all(&out).is_err() {
                return;
            }
        }
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        if buf.len() >= HEADER_LEN && buf[0] != 0x80 {
            return;
        }
    }
}

fn handle(shared: &Shared, request: &RequestFrame, authenticated: &mut bool) -> Vec<ResponseFrame> {
    let reply = |status: u16| ResponseFrame::reply(request, status);
    let text = |status: u16, message: &str| {
        reply(status).with_body(
            Bytes::new(),
            Bytes::new(),
            Bytes::copy_from_slice(message.as_bytes()),
        )
    };

    match request.opcode {
        Opcode::SaslListMechs => {
            return vec![text(0, "PLAIN")];
        }
        Opcode::SaslAuth => {
            let ok = shared.credentials.as_deref() == Some(&request.value[..]);
            *authenticated = ok;
            return vec![if ok {
                text(0, "Authenticated")
            } else {
                text(AUTH_ERROR, "Auth failure")
            }];
        }
        _ if !*authenticated => return vec![text(AUTH_ERROR, "Auth required")],
        _ => {}
    }

    let key = request.key.to_vec();
    let mut items = shared.items.lock();
    let next_cas = || shared.next_cas.fetch_add(1, Ordering::SeqCst);

    match request.opcode {
        Opcode::Get | Opcode::GetQ | Opcode::GetAndTouch => match items.get(&key) {
            Some(entry) => vec![reply(0).with_cas(entry.cas).with_body(
                Bytes::copy_from_slice(&entry.flags.to_be_bytes()),
                Bytes::new(),
                Bytes::copy_from_slice(&entry.data),
            )],
            None if request.opcode == Opcode::GetQ => Vec::new(),
            None => vec![text(KEY_ENOENT, "Not found")],
        },
        Opcode::Set | Opcode::Add | Opcode::Replace => {
            let existing = items.get(&key);
            let status = match (request.opcode, existing) {
                (Opcode::Add, Some(_)) => Some(KEY_EEXISTS),
                (Opcode::Replace, None) => Some(KEY_ENOENT),
                (_, None) if request.cas != 0 => Some(KEY_ENOENT),
                (_, Some(entry)) if request.cas != 0 && entry.cas != request.cas => {
                    Some(KEY_EEXISTS)
                }
                _ => None,
            };
            if let Some(status) = status {
                return vec![text(status, "Not stored")];
            }
            let mut extras = request.extras.clone();
            let flags = extras.get_u32();
            let cas = next_cas();
            items.insert(
                key,
                Entry {
                    flags,
                    data: request.value.to_vec(),
                    cas,
                },
            );
            vec![reply(0).with_cas(cas)]
        }
        Opcode::Delete => match items.get(&key) {
            None => vec![text(KEY_ENOENT, "Not found")],
            Some(entry) if request.cas != 0 && entry.cas != request.cas => {
                vec![text(KEY_EEXISTS, "Data exists for key")]
            }
            Some(_) => {
                items.remove(&key);
                vec![reply(0)]
            }
        },
        Opcode::Increment | Opcode::Decrement => {
            let mut extras = request.extras.clone();
            let delta = extras.get_u64();
            let initial = extras.get_u64();
            let expiration = extras.get_u32();
            let value = match items.get(&key) {
                None if expiration == u32::MAX => return vec![text(KEY_ENOENT, "Not found")],
                None => initial,
                Some(entry) => {
                    let current = match std::str::from_utf8(&entry.data)
                        .ok()
                        .and_then(|s| s.parse::<u64>().ok())
                    {
                        Some(current) => current,
                        None => return vec![text(NON_NUMERIC, "Non-numeric server-side value")],
                    };
                    if request.opcode == Opcode::Increment {
                        current.wrapping_add(delta)
                    } else {
                        current.saturating_sub(delta)
                    }
                }
            };
            let cas = next_cas();
            items.insert(
                key,
                Entry {
                    flags: 0,
                    data: value.to_string().into_bytes(),
                    cas,
                },
            );
            vec![reply(0).with_cas(cas).with_body(
                Bytes::new(),
                Bytes::new(),
                Bytes::copy_from_slice(&value.to_be_bytes()),
            )]
        }
        Opcode::Append | Opcode::Prepend => match items.get_mut(&key) {
            None => vec![text(NOT_STORED, "Not stored")],
            Some(entry) if request.cas != 0 && entry.cas != request.cas => {
                vec![text(KEY_EEXISTS, "Data exists for key")]
            }
            Some(entry) => {
                if request.opcode == Opcode::Append {
                    entry.data.extend_from_slice(&request.value);
                } else {
                    let mut data = request.value.to_vec();
                    data.extend_from_slice(&entry.data);
                    entry.data = data;
                }
                entry.cas = next_cas();
                vec![reply(0).with_cas(entry.cas)]
            }
        },
        Opcode::Touch => {
            if items.contains_key(&key) {
                vec![reply(0)]
            } else {
                vec![text(KEY_ENOENT, "Not found")]
            }
        }
        Opcode::Flush => {
            items.clear();
            vec![reply(0)]
        }
        Opcode::Stat => {
            let count = items.len().to_string();
            let stat = |name: &str, value: &str| {
                reply(0).with_body(
                    Bytes::new(),
                    Bytes::copy_from_slice(name.as_bytes()),
                    Bytes::copy_from_slice(value.as_bytes()),
                )
            };
            vec![stat("curr_items", &count), stat("pid", "42"), reply(0)]
        }
        Opcode::Version => vec![text(0, "1.6.21-mock")],
        Opcode::NoOp => vec![reply(0)],
        _ => vec![text(UNKNOWN_COMMAND, "Unknown command")],
    }
}
