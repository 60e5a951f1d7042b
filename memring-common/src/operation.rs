//! # Operations
//!
//! Purpose: Describe every supported cache operation as one tagged value and
//! translate it to request frames and back to an `OperationResult`.
//!
//! ## Design Principles
//!
//! 1. **Tagged Variants**: `Operation` carries only the fields each command needs.
//! 2. **One Codec Pair per Variant**: `encode_*` builds frames, `decode_*`
//!    interprets the response. No trait hierarchy.
//! 3. **Exchange State Machine**: `Exchange` drives single-response, stats
//!    stream and pipelined multi-get exchanges through the same
//!    `requests` / `accept` / `finish` steps for both sync and async sockets.
//!
//! ## Extras Layout
//!
//! ```text
//! Store   (Add/Set/Replace): flags:4B | expiration:4B
//! Mutate  (Incr/Decr):       delta:8B | initial:8B | expiration:4B
//! Touch / GetAndTouch:       expiration:4B
//! Flush:                     delay:4B (optional)
//! Get response:              flags:4B
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use hashbrown::HashMap;

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{RequestFrame, ResponseFrame, MAX_KEY_LENGTH};
use crate::opcode::Opcode;
use crate::result::OperationResult;
use crate::status::Status;
use crate::types::{CacheItem, Cas, ConcatMode, MutationMode, StoreMode};

/// Expiration value telling the server not to create a missing counter.
pub const NO_AUTO_CREATE: u32 = u32::MAX;

static OPAQUE_SEQ: AtomicU32 = AtomicU32::new(1);

/// Returns a fresh, non-zero correlation id.
pub fn next_opaque() -> u32 {
    loop {
        let id = OPAQUE_SEQ.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// One cache operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Get {
        key: Bytes,
    },
    GetAndTouch {
        key: Bytes,
        expiration: u32,
    },
    MultiGet {
        keys: Vec<Bytes>,
    },
    Store {
        mode: StoreMode,
        key: Bytes,
        item: CacheItem,
        expiration: u32,
        cas: Cas,
    },
    Delete {
        key: Bytes,
        cas: Cas,
    },
    Mutate {
        mode: MutationMode,
        key: Bytes,
        delta: u64,
        initial: u64,
        expiration: u32,
        cas: Cas,
    },
    Concat {
        mode: ConcatMode,
        key: Bytes,
        data: Bytes,
        cas: Cas,
    },
    Touch {
        key: Bytes,
        expiration: u32,
    },
    Flush {
        delay: u32,
    },
    Stats {
        group: Option<Bytes>,
    },
    Version,
    NoOp,
}

impl Operation {
    /// Short name used in logs and metrics.
    pub const fn name(&self) -> &'static str {
        match self {
            Operation::Get { .. } => "get",
            Operation::GetAndTouch { .. } => "get_and_touch",
            Operation::MultiGet { .. } => "multi_get",
            Operation::Store { .. } => "store",
            Operation::Delete { .. } => "delete",
            Operation::Mutate { .. } => "mutate",
            Operation::Concat { .. } => "concat",
            Operation::Touch { .. } => "touch",
            Operation::Flush { .. } => "flush",
            Operation::Stats { .. } => "stats",
            Operation::Version => "version",
            Operation::NoOp => "noop",
        }
    }

    /// Routing key, when the operation targets a single key.
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            Operation::Get { key }
            | Operation::GetAndTouch { key, .. }
            | Operation::Store { key, .. }
            | Operation::Delete { key, .. }
            | Operation::Mutate { key, .. }
            | Operation::Concat { key, .. }
            | Operation::Touch { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Decoded payload of a finished exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Fetched item (get, get-and-touch).
    Item(CacheItem),
    /// Counter value after increment/decrement.
    Counter(u64),
    /// Multi-get hits keyed by the original request key.
    Items(HashMap<Bytes, (CacheItem, Cas)>),
    /// Stats key/value pairs in server order.
    Stats(Vec<(String, String)>),
    /// Server version string.
    Version(String),
    /// Operation without payload (store, delete, touch, flush, ...).
    Done,
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

fn keyed(opcode: Opcode, key: &Bytes) -> ProtocolResult<RequestFrame> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(ProtocolError::KeyTooLong(key.len()));
    }
    Ok(RequestFrame::new(opcode, next_opaque()).with_key(key.clone()))
}

pub fn encode_get(key: &Bytes) -> ProtocolResult<RequestFrame> {
    keyed(Opcode::Get, key)
}

pub fn encode_get_and_touch(key: &Bytes, expiration: u32) -> ProtocolResult<RequestFrame> {
    Ok(keyed(Opcode::GetAndTouch, key)?.with_extras(expiration.to_be_bytes().to_vec()))
}

pub fn encode_store(
    mode: StoreMode,
    key: &Bytes,
    item: &CacheItem,
    expiration: u32,
    cas: Cas,
) -> ProtocolResult<RequestFrame> {
    let opcode = match mode {
        StoreMode::Add => Opcode::Add,
        StoreMode::Set => Opcode::Set,
        StoreMode::Replace => Opcode::Replace,
    };
    let mut extras = BytesMut::with_capacity(8);
    extras.put_u32(item.flags);
    extras.put_u32(expiration);
    Ok(keyed(opcode, key)?
        .with_extras(extras.freeze())
        .with_value(item.data.clone())
        .with_cas(cas.get()))
}

pub fn encode_delete(key: &Bytes, cas: Cas) -> ProtocolResult<RequestFrame> {
    Ok(keyed(Opcode::Delete, key)?.with_cas(cas.get()))
}

pub fn encode_mutate(
    mode: MutationMode,
    key: &Bytes,
    delta: u64,
    initial: u64,
    expiration: u32,
    cas: Cas,
) -> ProtocolResult<RequestFrame> {
    let opcode = match mode {
        MutationMode::Increment => Opcode::Increment,
        MutationMode::Decrement => Opcode::Decrement,
    };
    let mut extras = BytesMut::with_capacity(20);
    extras.put_u64(delta);
    extras.put_u64(initial);
    extras.put_u32(expiration);
    Ok(keyed(opcode, key)?
        .with_extras(extras.freeze())
        .with_cas(cas.get()))
}

pub fn encode_concat(
    mode: ConcatMode,
    key: &Bytes,
    data: &Bytes,
    cas: Cas,
) -> ProtocolResult<RequestFrame> {
    let opcode = match mode {
        ConcatMode::Append => Opcode::Append,
        ConcatMode::Prepend => Opcode::Prepend,
    };
    Ok(keyed(opcode, key)?.with_value(data.clone()).with_cas(cas.get()))
}

pub fn encode_touch(key: &Bytes, expiration: u32) -> ProtocolResult<RequestFrame> {
    Ok(keyed(Opcode::Touch, key)?.with_extras(expiration.to_be_bytes().to_vec()))
}

pub fn encode_flush(delay: u32) -> RequestFrame {
    let frame = RequestFrame::new(Opcode::Flush, next_opaque());
    if delay == 0 {
        frame
    } else {
        frame.with_extras(delay.to_be_bytes().to_vec())
    }
}

pub fn encode_stats(group: Option<&Bytes>) -> ProtocolResult<RequestFrame> {
    match group {
        Some(group) => keyed(Opcode::Stat, group),
        None => Ok(RequestFrame::new(Opcode::Stat, next_opaque())),
    }
}

pub fn encode_version() -> RequestFrame {
    RequestFrame::new(Opcode::Version, next_opaque())
}

pub fn encode_noop() -> RequestFrame {
    RequestFrame::new(Opcode::NoOp, next_opaque())
}

// ---------------------------------------------------------------------------
// Decoders
// ---------------------------------------------------------------------------

fn failure<T>(response: &ResponseFrame) -> OperationResult<T> {
    let message = if response.value.is_empty() {
        None
    } else {
        Some(response.value_text())
    };
    OperationResult::fail(response.status(), message)
}

/// Decodes a get / get-and-touch response: flags in extras, value in body.
pub fn decode_get(response: &ResponseFrame) -> ProtocolResult<OperationResult<CacheItem>> {
    if !response.status().is_success() {
        return Ok(failure(response));
    }
    let flags = read_flags(response)?;
    let item = CacheItem::new(flags, response.value.clone());
    Ok(OperationResult::ok(item, Cas::new(response.cas())))
}

fn read_flags(response: &ResponseFrame) -> ProtocolResult<u32> {
    match response.extras.len() {
        4 => Ok(u32::from_be_bytes([
            response.extras[0],
            response.extras[1],
            response.extras[2],
            response.extras[3],
        ])),
        found => Err(ProtocolError::BadExtras {
            opcode: Opcode::from_u8(response.header.opcode).unwrap_or(Opcode::Get),
            expected: 4,
            found,
        }),
    }
}

/// Decodes a response that only carries status and CAS.
pub fn decode_status(response: &ResponseFrame) -> OperationResult<()> {
    if !response.status().is_success() {
        return failure(response);
    }
    OperationResult::ok((), Cas::new(response.cas()))
}

/// Decodes an increment/decrement response.
///
/// The body must be exactly one big-endian u64; any other length means the
/// stored value was not a counter and is reported as `NonNumeric`.
pub fn decode_mutate(response: &ResponseFrame) -> OperationResult<u64> {
    if !response.status().is_success() {
        return failure(response);
    }
    let body = &response.value;
    if body.len() != 8 {
        return OperationResult::fail(
            Status::NonNumeric,
            Some(format!("counter body has {} bytes, expected 8", body.len())),
        );
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(body);
    OperationResult::ok(u64::from_be_bytes(raw), Cas::new(response.cas()))
}

pub fn decode_version(response: &ResponseFrame) -> OperationResult<String> {
    if !response.status().is_success() {
        return failure(response);
    }
    OperationResult::ok(response.value_text(), Cas::NONE)
}

// ---------------------------------------------------------------------------
// Multi-frame exchanges
// ---------------------------------------------------------------------------

/// Accumulates a stats stream until the empty-key terminator.
#[derive(Debug)]
pub struct StatsCollector {
    opaque: u32,
    entries: Vec<(String, String)>,
    failed: Option<OperationResult<Vec<(String, String)>>>,
}

impl StatsCollector {
    pub fn new(request: &RequestFrame) -> Self {
        StatsCollector {
            opaque: request.opaque,
            entries: Vec::new(),
            failed: None,
        }
    }

    /// Feeds one response. Returns true once the stream is complete.
    pub fn accept(&mut self, response: &ResponseFrame) -> ProtocolResult<bool> {
        if response.opaque() != self.opaque {
            return Err(ProtocolError::OpaqueMismatch {
                sent: self.opaque,
                received: response.opaque(),
            });
        }
        if !response.status().is_success() {
            self.failed = Some(failure(response));
            return Ok(true);
        }
        if response.key.is_empty() {
            return Ok(true);
        }
        let key = String::from_utf8_lossy(&response.key).into_owned();
        self.entries.push((key, response.value_text()));
        Ok(false)
    }

    pub fn finish(self) -> OperationResult<Vec<(String, String)>> {
        match self.failed {
            Some(failed) => failed,
            None => OperationResult::ok(self.entries, Cas::NONE),
        }
    }
}

/// Pipelined quiet gets terminated by a NoOp.
///
/// Each GetQ opaque is recorded against its key before anything is sent.
/// Misses produce no response at all; the NoOp reply proves every earlier
/// request has been answered.
#[derive(Debug)]
pub struct MultiGetBatch {
    requests: Vec<RequestFrame>,
    pending: HashMap<u32, Bytes>,
    noop_opaque: u32,
    hits: HashMap<Bytes, (CacheItem, Cas)>,
}

impl MultiGetBatch {
    /// Builds the pipeline. `vbucket` maps each key to its vbucket id.
    pub fn new<F>(keys: &[Bytes], mut vbucket: F) -> ProtocolResult<Self>
    where
        F: FnMut(&Bytes) -> u16,
    {
        let mut requests = Vec::with_capacity(keys.len() + 1);
        let mut pending = HashMap::with_capacity(keys.len());
        for key in keys {
            let frame = keyed(Opcode::GetQ, key)?.with_vbucket(vbucket(key));
            pending.insert(frame.opaque, key.clone());
            requests.push(frame);
        }
        let noop = encode_noop();
        let noop_opaque = noop.opaque;
        requests.push(noop);

        Ok(MultiGetBatch {
            requests,
            pending,
            noop_opaque,
            hits: HashMap::with_capacity(keys.len()),
        })
    }

    pub fn requests(&self) -> &[RequestFrame] {
        &self.requests
    }

    /// Feeds one response. Returns true once the NoOp reply arrives.
    pub fn accept(&mut self, response: &ResponseFrame) -> ProtocolResult<bool> {
        let opaque = response.opaque();
        if opaque == self.noop_opaque {
            return Ok(true);
        }
        let key = self
            .pending
            .remove(&opaque)
            .ok_or(ProtocolError::OpaqueMismatch {
                sent: self.noop_opaque,
                received: opaque,
            })?;
        if response.status().is_success() {
            let flags = read_flags(response)?;
            let item = CacheItem::new(flags, response.value.clone());
            self.hits.insert(key, (item, Cas::new(response.cas())));
        }
        Ok(false)
    }

    /// Hits collected so far.
    pub fn hits(&self) -> usize {
        self.hits.len()
    }

    pub fn finish(self) -> OperationResult<HashMap<Bytes, (CacheItem, Cas)>> {
        OperationResult::ok(self.hits, Cas::NONE)
    }

    /// Returns whatever was parsed before the stream broke.
    pub fn finish_partial(self, reason: String) -> OperationResult<HashMap<Bytes, (CacheItem, Cas)>> {
        let mut result = OperationResult::ok(self.hits, Cas::NONE);
        result.message = Some(reason);
        result
    }
}

/// Progress of an exchange after one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More responses are expected.
    Continue,
    /// The exchange is complete; call `finish`.
    Done,
}

#[derive(Debug)]
enum ExchangeState {
    Single {
        request: RequestFrame,
        response: Option<ResponseFrame>,
    },
    Stats {
        request: RequestFrame,
        collector: StatsCollector,
    },
    MultiGet(MultiGetBatch),
}

type Decoder = fn(&ResponseFrame) -> ProtocolResult<OperationResult<Reply>>;

/// Request/response state machine for one `Operation`.
#[derive(Debug)]
pub struct Exchange {
    operation: &'static str,
    decode: Decoder,
    state: ExchangeState,
}

impl Exchange {
    /// Encodes `operation`. `vbucket` supplies the vbucket id per key.
    pub fn new<F>(operation: &Operation, mut vbucket: F) -> ProtocolResult<Self>
    where
        F: FnMut(&Bytes) -> u16,
    {
        let name = operation.name();
        let single = |request: RequestFrame, decode: Decoder| Exchange {
            operation: name,
            decode,
            state: ExchangeState::Single {
                request,
                response: None,
            },
        };

        let exchange = match operation {
            Operation::Get { key } => {
                single(encode_get(key)?.with_vbucket(vbucket(key)), reply_item)
            }
            Operation::GetAndTouch { key, expiration } => single(
                encode_get_and_touch(key, *expiration)?.with_vbucket(vbucket(key)),
                reply_item,
            ),
            Operation::Store {
                mode,
                key,
                item,
                expiration,
                cas,
            } => single(
                encode_store(*mode, key, item, *expiration, *cas)?.with_vbucket(vbucket(key)),
                reply_done,
            ),
            Operation::Delete { key, cas } => {
                single(encode_delete(key, *cas)?.with_vbucket(vbucket(key)), reply_done)
            }
            Operation::Mutate {
                mode,
                key,
                delta,
                initial,
                expiration,
                cas,
            } => single(
                encode_mutate(*mode, key, *delta, *initial, *expiration, *cas)?
                    .with_vbucket(vbucket(key)),
                reply_counter,
            ),
            Operation::Concat {
                mode,
                key,
                data,
                cas,
            } => single(
                encode_concat(*mode, key, data, *cas)?.with_vbucket(vbucket(key)),
                reply_done,
            ),
            Operation::Touch { key, expiration } => single(
                encode_touch(key, *expiration)?.with_vbucket(vbucket(key)),
                reply_done,
            ),
            Operation::Flush { delay } => single(encode_flush(*delay), reply_done),
            Operation::Version => single(encode_version(), reply_version),
            Operation::NoOp => single(encode_noop(), reply_done),
            Operation::Stats { group } => {
                let request = encode_stats(group.as_ref())?;
                let collector = StatsCollector::new(&request);
                Exchange {
                    operation: name,
                    decode: reply_done,
                    state: ExchangeState::Stats { request, collector },
                }
            }
            Operation::MultiGet { keys } => Exchange {
                operation: name,
                decode: reply_done,
                state: ExchangeState::MultiGet(MultiGetBatch::new(keys, vbucket)?),
            },
        };
        Ok(exchange)
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Frames to write, in order.
    pub fn requests(&self) -> &[RequestFrame] {
        match &self.state {
            ExchangeState::Single { request, .. } => std::slice::from_ref(request),
            ExchangeState::Stats { request, .. } => std::slice::from_ref(request),
            ExchangeState::MultiGet(batch) => batch.requests(),
        }
    }

    /// Feeds one response frame.
    pub fn accept(&mut self, response: ResponseFrame) -> ProtocolResult<Step> {
        let done = match &mut self.state {
            ExchangeState::Single {
                request,
                response: slot,
            } => {
                response.ensure_answers(request)?;
                *slot = Some(response);
                true
            }
            ExchangeState::Stats { collector, .. } => collector.accept(&response)?,
            ExchangeState::MultiGet(batch) => batch.accept(&response)?,
        };
        Ok(if done { Step::Done } else { Step::Continue })
    }

    /// Produces the result of a completed exchange.
    pub fn finish(self) -> ProtocolResult<OperationResult<Reply>> {
        match self.state {
            ExchangeState::Single { response, .. } => match response {
                Some(response) => (self.decode)(&response),
                None => Ok(OperationResult::fail(
                    Status::Protocol,
                    Some("exchange finished without a response".to_string()),
                )),
            },
            ExchangeState::Stats { collector, .. } => Ok(collector.finish().map(Reply::Stats)),
            ExchangeState::MultiGet(batch) => Ok(batch.finish().map(Reply::Items)),
        }
    }

    /// Result for an exchange interrupted by a transport or protocol failure.
    ///
    /// A multi-get keeps the hits parsed so far; everything else fails with
    /// `status`.
    pub fn abort(self, status: Status, reason: String) -> OperationResult<Reply> {
        match self.state {
            ExchangeState::MultiGet(batch) => batch.finish_partial(reason).map(Reply::Items),
            _ => OperationResult::fail(status, Some(reason)),
        }
    }
}

fn reply_item(response: &ResponseFrame) -> ProtocolResult<OperationResult<Reply>> {
    Ok(decode_get(response)?.map(Reply::Item))
}

fn reply_done(response: &ResponseFrame) -> ProtocolResult<OperationResult<Reply>> {
    Ok(decode_status(response).map(|_| Reply::Done))
}

fn reply_counter(response: &ResponseFrame) -> ProtocolResult<OperationResult<Reply>> {
    Ok(decode_mutate(response).map(Reply::Counter))
}

fn reply_version(response: &ResponseFrame) -> ProtocolResult<OperationResult<Reply>> {
    Ok(decode_version(response).map(Reply::Version))
}
