//! Xfer manager for one circuit
//!
//! Tracks downloads this side requested and uploads it is serving. Every xfer
//! message goes out reliably, so chunk loss is left to the circuit.

use super::messages;
use super::types::{
    decode_packet_number, ChunkOutcome, IncomingXfer, OutgoingXfer, XferAbortCode, XferEvent, XferRequest,
};
use crate::config::XferSettings;
use crate::networking::circuit::MessageSink;
use crate::networking::packets::Message;
use crate::networking::{NetworkError, NetworkResult};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Supplies payloads for transfers the peer requests
#[async_trait]
pub trait XferSource: Send + Sync {
    async fn fetch(&self, request: &XferRequest) -> NetworkResult<Bytes>;
}

/// In-memory files keyed by filename
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: HashMap<String, Bytes>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, filename: impl Into<String>, data: impl Into<Bytes>) {
        self.files.insert(filename.into(), data.into());
    }

    pub fn with_file(mut self, filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.insert(filename, data);
        self
    }
}

#[async_trait]
impl XferSource for MemorySource {
    async fn fetch(&self, request: &XferRequest) -> NetworkResult<Bytes> {
        self.files.get(&request.filename).cloned().ok_or_else(|| NetworkError::TransferAborted {
            id: 0,
            reason: format!("no file named '{}'", request.filename),
        })
    }
}

/// A download in progress
#[derive(Debug)]
pub struct PendingXfer {
    id: u64,
    rx: oneshot::Receiver<NetworkResult<Bytes>>,
}

impl PendingXfer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the assembled payload
    pub async fn wait(self) -> NetworkResult<Bytes> {
        let id = self.id;
        self.rx.await.unwrap_or_else(|_| {
            Err(NetworkError::TransferAborted { id, reason: "transfer manager dropped".to_string() })
        })
    }
}

#[derive(Debug, Default)]
struct XferInner {
    incoming: HashMap<u64, IncomingXfer>,
    outgoing: HashMap<u64, OutgoingXfer>,
}

/// Xfer transfers carried over one circuit
pub struct XferManager {
    sink: Arc<dyn MessageSink>,
    settings: XferSettings,
    source: Option<Arc<dyn XferSource>>,
    inner: Mutex<XferInner>,
    event_tx: mpsc::UnboundedSender<XferEvent>,
}

impl std::fmt::Debug for XferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XferManager")
            .field("settings", &self.settings)
            .field("serving", &self.source.is_some())
            .finish()
    }
}

impl XferManager {
    pub fn new(sink: Arc<dyn MessageSink>, settings: XferSettings, event_tx: mpsc::UnboundedSender<XferEvent>) -> Self {
        Self { sink, settings, source: None, inner: Mutex::new(XferInner::default()), event_tx }
    }

    /// Serve inbound `RequestXfer` from `source`
    pub fn with_source(mut self, source: Arc<dyn XferSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Ids of live transfers in both directions
    pub async fn active(&self) -> Vec<u64> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<u64> = inner.incoming.keys().chain(inner.outgoing.keys()).copied().collect();
        ids.sort_unstable();
        ids
    }

    fn emit(&self, event: XferEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Ask the peer for a resource, returning a handle to the download
    pub async fn request_transfer(&self, request: XferRequest) -> NetworkResult<PendingXfer> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut inner = self.inner.lock().await;
            let id = allocate_id(&inner);
            let xfer = IncomingXfer::new(id, request.clone(), self.settings.max_pending_chunks, Some(tx));
            inner.incoming.insert(id, xfer);
            id
        };

        let schema = self.sink.schema();
        let sent = match messages::request_xfer(&schema, id, &request) {
            Ok(message) => self.sink.send_message(message, true).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            self.inner.lock().await.incoming.remove(&id);
            return Err(e);
        }

        info!("Requested xfer {} for '{}'", id, request.filename);
        Ok(PendingXfer { id, rx })
    }

    /// Upload `data` under an id the peer already knows about
    pub async fn send_transfer(&self, id: u64, data: Bytes) -> NetworkResult<()> {
        {
            let mut inner = self.inner.lock().await;
            let xfer = OutgoingXfer::new(id, &data, self.settings.chunk_size);
            debug!("Starting upload {} ({} bytes, {} chunks)", id, data.len(), xfer.chunk_count());
            inner.outgoing.insert(id, xfer);
        }
        self.pump(id).await
    }

    /// Send whatever chunks the window allows
    async fn pump(&self, id: u64) -> NetworkResult<()> {
        let ready = {
            let mut inner = self.inner.lock().await;
            match inner.outgoing.get_mut(&id) {
                Some(xfer) => xfer.next_chunks(self.settings.window),
                None => return Ok(()),
            }
        };

        let schema = self.sink.schema();
        for (packet, data) in ready {
            trace!("Sending xfer {} packet {:#x} ({} bytes)", id, packet, data.len());
            let message = messages::send_xfer_packet(&schema, id, packet, &data)?;
            self.sink.send_message(message, true).await?;
        }
        Ok(())
    }

    /// Consume an xfer message; returns false for anything else
    pub async fn handle_message(self: &Arc<Self>, message: &Message) -> NetworkResult<bool> {
        match message.name() {
            "RequestXfer" => {
                let (id, request) = messages::read_request(message)?;
                self.handle_request(id, request).await?;
            }
            "SendXferPacket" => {
                let (id, packet, data) = messages::read_packet(message)?;
                self.handle_packet(id, packet, data).await?;
            }
            "ConfirmXferPacket" => {
                let (id, packet) = messages::read_confirm(message)?;
                self.handle_confirm(id, packet).await?;
            }
            "AbortXfer" => {
                let (id, result) = messages::read_abort(message)?;
                self.handle_abort(id, XferAbortCode::from_code(result)).await;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    async fn handle_request(self: &Arc<Self>, id: u64, request: XferRequest) -> NetworkResult<()> {
        let Some(source) = self.source.clone() else {
            debug!("No source for xfer request {} ('{}'), refusing", id, request.filename);
            return self.send_abort(id, XferAbortCode::FileNotFound).await;
        };

        info!("Serving xfer {} for '{}'", id, request.filename);
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let fetched = source.fetch(&request).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let result = match fetched {
                Ok(data) => manager.send_transfer(id, data).await,
                Err(e) => {
                    warn!("Xfer {} for '{}' failed: {}", id, request.filename, e);
                    manager.send_abort(id, XferAbortCode::FileNotFound).await
                }
            };
            if let Err(e) = result {
                warn!("Xfer {} could not be served: {}", id, e);
            }
        });
        Ok(())
    }

    async fn handle_packet(&self, id: u64, packet: u32, data: Bytes) -> NetworkResult<()> {
        let (index, last) = decode_packet_number(packet);
        let now = Instant::now();

        let outcome = {
            let mut inner = self.inner.lock().await;
            let Some(xfer) = inner.incoming.get_mut(&id) else {
                debug!("Ignoring packet {} for unknown xfer {}", index, id);
                return Ok(());
            };
            xfer.apply(index, last, data, now)
        };

        if outcome == ChunkOutcome::OutOfWindow {
            warn!("Xfer {} packet {} is too far ahead of the missing chunks, aborting", id, index);
            return self.abort(id, XferAbortCode::RequestFailed).await;
        }

        // duplicates are confirmed again, the earlier confirm may have been lost
        let confirm = messages::confirm_xfer_packet(&self.sink.schema(), id, index)?;
        self.sink.send_message(confirm, true).await?;

        match outcome {
            ChunkOutcome::Duplicate => debug!("Duplicate xfer {} packet {}", id, index),
            ChunkOutcome::Buffered => trace!("Xfer {} packet {} buffered", id, index),
            ChunkOutcome::Rejected => warn!("Xfer {} packet {} is past the last packet, ignoring", id, index),
            ChunkOutcome::Complete => self.finish_download(id).await?,
            ChunkOutcome::OutOfWindow => {}
        }
        Ok(())
    }

    async fn finish_download(&self, id: u64) -> NetworkResult<()> {
        let Some(mut xfer) = self.inner.lock().await.incoming.remove(&id) else {
            return Ok(());
        };

        match xfer.assemble() {
            Ok(data) => {
                info!("Xfer {} complete ({} bytes in {} packets)", id, data.len(), xfer.received());
                xfer.resolve(Ok(data.clone()));
                self.emit(XferEvent::Completed { id, data });
                Ok(())
            }
            Err(reason) => {
                warn!("Xfer {} failed to assemble: {}", id, reason);
                xfer.resolve(Err(NetworkError::TransferAborted { id, reason: reason.clone() }));
                self.emit(XferEvent::Aborted { id, reason });
                self.send_abort(id, XferAbortCode::RequestFailed).await
            }
        }
    }

    async fn handle_confirm(&self, id: u64, packet: u32) -> NetworkResult<()> {
        let (index, _) = decode_packet_number(packet);
        let done = {
            let mut inner = self.inner.lock().await;
            let Some(xfer) = inner.outgoing.get_mut(&id) else {
                debug!("Ignoring confirm {} for unknown xfer {}", index, id);
                return Ok(());
            };
            if xfer.confirm(index, Instant::now()) {
                inner.outgoing.remove(&id).map(|xfer| xfer.payload_len())
            } else {
                None
            }
        };

        match done {
            Some(size) => {
                info!("Upload {} confirmed ({} bytes)", id, size);
                self.emit(XferEvent::Sent { id, size });
                Ok(())
            }
            None => self.pump(id).await,
        }
    }

    async fn handle_abort(&self, id: u64, code: XferAbortCode) {
        let reason = format!("aborted by peer: {}", code);
        if !self.fail_local(id, &reason).await {
            debug!("Ignoring abort for unknown xfer {}", id);
        }
    }

    /// Drop a live transfer locally; returns false if the id is unknown
    async fn fail_local(&self, id: u64, reason: &str) -> bool {
        let (incoming, outgoing) = {
            let mut inner = self.inner.lock().await;
            (inner.incoming.remove(&id), inner.outgoing.remove(&id))
        };
        if incoming.is_none() && outgoing.is_none() {
            return false;
        }

        if let Some(mut xfer) = incoming {
            xfer.resolve(Err(NetworkError::TransferAborted { id, reason: reason.to_string() }));
        }
        warn!("Xfer {} aborted: {}", id, reason);
        self.emit(XferEvent::Aborted { id, reason: reason.to_string() });
        true
    }

    async fn send_abort(&self, id: u64, code: XferAbortCode) -> NetworkResult<()> {
        let message = messages::abort_xfer(&self.sink.schema(), id, code.code())?;
        self.sink.send_message(message, true).await?;
        Ok(())
    }

    /// Abort a live transfer and tell the peer
    pub async fn abort(&self, id: u64, code: XferAbortCode) -> NetworkResult<()> {
        if !self.fail_local(id, &format!("aborted locally: {}", code)).await {
            return Err(NetworkError::UnknownTransfer { id });
        }
        self.send_abort(id, code).await
    }

    /// Fail every live transfer without contacting the peer
    pub async fn abort_all(&self, reason: &str) -> usize {
        let ids = self.active().await;
        let mut aborted = 0;
        for id in ids {
            if self.fail_local(id, reason).await {
                aborted += 1;
            }
        }
        aborted
    }

    /// Abort transfers idle for longer than the configured timeout
    pub async fn expire(&self, now: Instant) -> usize {
        let timeout = self.settings.idle_timeout();
        let stale: Vec<u64> = {
            let inner = self.inner.lock().await;
            let incoming = inner.incoming.values().map(|x| (x.id, x.last_activity));
            let outgoing = inner.outgoing.values().map(|x| (x.id, x.last_activity));
            incoming
                .chain(outgoing)
                .filter(|(_, last)| now.duration_since(*last) >= timeout)
                .map(|(id, _)| id)
                .collect()
        };

        for &id in &stale {
            if let Err(e) = self.abort(id, XferAbortCode::Timeout).await {
                debug!("Abort of idle xfer {} not delivered: {}", id, e);
            }
        }
        stale.len()
    }

    /// Spawn the idle-expiry task; it stops once the manager is dropped
    pub fn start(self: &Arc<Self>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.expire_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                let now = interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.expire(now).await;
            }
        });
    }
}

/// Random non-zero id not used by a live transfer
fn allocate_id(inner: &XferInner) -> u64 {
    let mut rng = rand::rng();
    loop {
        let id: u64 = rng.random();
        if id != 0 && !inner.incoming.contains_key(&id) && !inner.outgoing.contains_key(&id) {
            return id;
        }
    }
}
