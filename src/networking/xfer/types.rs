//! Xfer session bookkeeping
//!
//! Pure state for both directions of a transfer. Nothing here touches the
//! network; the manager decides what to send from the values returned.

use crate::networking::NetworkResult;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// Bit of the packet number marking the final chunk
pub const LAST_PACKET_FLAG: u32 = 0x8000_0000;

/// Size of the total-length prefix carried at the start of chunk 0
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest chunk a `Variable 2` data field can carry
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize;

pub fn encode_packet_number(index: u32, last: bool) -> u32 {
    if last {
        index | LAST_PACKET_FLAG
    } else {
        index & !LAST_PACKET_FLAG
    }
}

/// Split a packet number into `(index, is_last)`
pub fn decode_packet_number(packet: u32) -> (u32, bool) {
    (packet & !LAST_PACKET_FLAG, packet & LAST_PACKET_FLAG != 0)
}

/// What the requester asks the peer to send
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XferRequest {
    pub filename: String,
    /// ELLPath selector on the serving side
    pub path: u8,
    pub delete_on_completion: bool,
    pub use_big_packets: bool,
    pub vfile_id: Uuid,
    pub vfile_type: i16,
}

impl XferRequest {
    pub fn file(filename: impl Into<String>) -> Self {
        Self { filename: filename.into(), ..Self::default() }
    }

    pub fn vfile(vfile_id: Uuid, vfile_type: i16) -> Self {
        Self { vfile_id, vfile_type, ..Self::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferState {
    Requested,
    Transferring,
    Completed,
    Aborted,
}

/// Result codes carried by `AbortXfer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferAbortCode {
    RequestFailed,
    NotInDatabase,
    CannotOpenFile,
    FileNotFound,
    FileEmpty,
    Timeout,
    CircuitGone,
    Other(i32),
}

impl XferAbortCode {
    pub fn code(self) -> i32 {
        match self {
            XferAbortCode::RequestFailed => -1,
            XferAbortCode::NotInDatabase => -3,
            XferAbortCode::CannotOpenFile => -42,
            XferAbortCode::FileNotFound => -43,
            XferAbortCode::FileEmpty => -44,
            XferAbortCode::Timeout => -23016,
            XferAbortCode::CircuitGone => -23017,
            XferAbortCode::Other(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => XferAbortCode::RequestFailed,
            -3 => XferAbortCode::NotInDatabase,
            -42 => XferAbortCode::CannotOpenFile,
            -43 => XferAbortCode::FileNotFound,
            -44 => XferAbortCode::FileEmpty,
            -23016 => XferAbortCode::Timeout,
            -23017 => XferAbortCode::CircuitGone,
            other => XferAbortCode::Other(other),
        }
    }
}

impl std::fmt::Display for XferAbortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            XferAbortCode::RequestFailed => write!(f, "request failed"),
            XferAbortCode::NotInDatabase => write!(f, "not in database"),
            XferAbortCode::CannotOpenFile => write!(f, "cannot open file"),
            XferAbortCode::FileNotFound => write!(f, "file not found"),
            XferAbortCode::FileEmpty => write!(f, "file empty"),
            XferAbortCode::Timeout => write!(f, "timed out"),
            XferAbortCode::CircuitGone => write!(f, "circuit gone"),
            XferAbortCode::Other(code) => write!(f, "error {}", code),
        }
    }
}

/// Events emitted by the xfer manager
#[derive(Debug, Clone, PartialEq)]
pub enum XferEvent {
    /// Download finished; `data` excludes the length prefix
    Completed { id: u64, data: Bytes },
    /// Upload confirmed in full
    Sent { id: u64, size: usize },
    Aborted { id: u64, reason: String },
}

/// Frame `payload` into chunks of at most `chunk_size` bytes.
///
/// The first chunk begins with the little-endian total length; an empty payload
/// still produces one chunk.
pub fn split_payload(payload: &[u8], chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.clamp(LENGTH_PREFIX_LEN + 1, MAX_CHUNK_SIZE);
    let mut framed = BytesMut::with_capacity(payload.len() + LENGTH_PREFIX_LEN);
    framed.put_u32_le(payload.len() as u32);
    framed.put_slice(payload);
    let framed = framed.freeze();

    let mut chunks = Vec::with_capacity(framed.len() / chunk_size + 1);
    let mut offset = 0;
    while offset < framed.len() {
        let end = (offset + chunk_size).min(framed.len());
        chunks.push(framed.slice(offset..end));
        offset = end;
    }
    chunks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Index already applied
    Duplicate,
    /// Stored; more chunks needed
    Buffered,
    /// Every index through the last one is present
    Complete,
    /// Index beyond the announced last chunk, or a second last marker
    Rejected,
    /// Index too far ahead of the first missing chunk
    OutOfWindow,
}

/// Receiving side of one transfer
#[derive(Debug)]
pub struct IncomingXfer {
    pub id: u64,
    pub request: XferRequest,
    pub state: XferState,
    chunks: BTreeMap<u32, Bytes>,
    last_index: Option<u32>,
    /// chunks 0..contiguous are all present
    contiguous: u32,
    max_ahead: u32,
    pub last_activity: Instant,
    waiter: Option<oneshot::Sender<NetworkResult<Bytes>>>,
}

impl IncomingXfer {
    /// `max_ahead` bounds how far past the first missing chunk an index may land
    pub fn new(
        id: u64,
        request: XferRequest,
        max_ahead: u32,
        waiter: Option<oneshot::Sender<NetworkResult<Bytes>>>,
    ) -> Self {
        Self {
            id,
            request,
            state: XferState::Requested,
            chunks: BTreeMap::new(),
            last_index: None,
            contiguous: 0,
            max_ahead: max_ahead.max(1),
            last_activity: Instant::now(),
            waiter,
        }
    }

    pub fn apply(&mut self, index: u32, last: bool, data: Bytes, now: Instant) -> ChunkOutcome {
        self.last_activity = now;
        if self.chunks.contains_key(&index) {
            return ChunkOutcome::Duplicate;
        }
        if u64::from(index) >= u64::from(self.contiguous) + u64::from(self.max_ahead) {
            return ChunkOutcome::OutOfWindow;
        }
        if let Some(last_index) = self.last_index {
            if index > last_index || last {
                return ChunkOutcome::Rejected;
            }
        } else if last && self.chunks.keys().next_back().is_some_and(|&max| max > index) {
            return ChunkOutcome::Rejected;
        }

        if last {
            self.last_index = Some(index);
        }
        self.chunks.insert(index, data);
        while self.chunks.contains_key(&self.contiguous) {
            self.contiguous += 1;
        }
        self.state = XferState::Transferring;

        if self.is_complete() {
            ChunkOutcome::Complete
        } else {
            ChunkOutcome::Buffered
        }
    }

    pub fn is_complete(&self) -> bool {
        self.last_index.is_some_and(|last| self.chunks.len() as u64 == u64::from(last) + 1)
    }

    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenate the chunks in index order and strip the length prefix
    pub fn assemble(&self) -> Result<Bytes, String> {
        if !self.is_complete() {
            return Err(format!("transfer {} is missing chunks", self.id));
        }
        let total: usize = self.chunks.values().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(total);
        for chunk in self.chunks.values() {
            data.put_slice(chunk);
        }

        if data.len() < LENGTH_PREFIX_LEN {
            return Err(format!("first chunk is {} bytes, shorter than its length prefix", data.len()));
        }
        let payload = data.split_off(LENGTH_PREFIX_LEN).freeze();
        let declared = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if declared != payload.len() {
            return Err(format!("declared {} bytes but received {}", declared, payload.len()));
        }
        Ok(payload)
    }

    pub fn resolve(&mut self, outcome: NetworkResult<Bytes>) {
        self.state = if outcome.is_ok() { XferState::Completed } else { XferState::Aborted };
        if let Some(tx) = self.waiter.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Sending side of one transfer
#[derive(Debug)]
pub struct OutgoingXfer {
    pub id: u64,
    pub state: XferState,
    chunks: Vec<Bytes>,
    payload_len: usize,
    next_index: usize,
    in_flight: BTreeSet<u32>,
    pub last_activity: Instant,
}

impl OutgoingXfer {
    pub fn new(id: u64, payload: &[u8], chunk_size: usize) -> Self {
        Self {
            id,
            state: XferState::Transferring,
            chunks: split_payload(payload, chunk_size),
            payload_len: payload.len(),
            next_index: 0,
            in_flight: BTreeSet::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Chunks that may be sent now as `(packet number, data)`, marked in flight
    pub fn next_chunks(&mut self, window: usize) -> Vec<(u32, Bytes)> {
        let window = window.max(1);
        let mut ready = Vec::new();
        while self.in_flight.len() < window && self.next_index < self.chunks.len() {
            let index = self.next_index as u32;
            let last = self.next_index + 1 == self.chunks.len();
            ready.push((encode_packet_number(index, last), self.chunks[self.next_index].clone()));
            self.in_flight.insert(index);
            self.next_index += 1;
        }
        ready
    }

    /// Record a confirmation; returns true once every chunk is confirmed
    pub fn confirm(&mut self, index: u32, now: Instant) -> bool {
        if self.in_flight.remove(&index) {
            self.last_activity = now;
        }
        let done = self.in_flight.is_empty() && self.next_index == self.chunks.len();
        if done {
            self.state = XferState::Completed;
        }
        done
    }
}
