//! Circuit management for Second Life UDP connections
//!
//! Each circuit represents a connection to one remote endpoint, handling
//! sequence numbering, packet acknowledgment, retransmission, duplicate
//! suppression and ping-based liveness.

use crate::config::CircuitSettings;
use crate::networking::packets::{builders, Message};
use crate::networking::serialization::template_registry::Schema;
use crate::networking::serialization::{self, Packet, PacketCodec};
use crate::networking::{NetworkError, NetworkResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Circuit options for connecting to a simulator
#[derive(Debug, Clone)]
pub struct CircuitOptions {
    pub circuit_code: u32,
    pub address: SocketAddr,
    pub agent_id: Uuid,
    pub session_id: Uuid,
    /// sequence number of the first packet sent
    pub first_sequence: u32,
    /// Peer may send messages whose template is `Trusted`
    pub trusted_peer: bool,
}

impl CircuitOptions {
    pub fn new(circuit_code: u32, address: SocketAddr, agent_id: Uuid, session_id: Uuid) -> Self {
        Self { circuit_code, address, agent_id, session_id, first_sequence: 1, trusted_peer: true }
    }
}

/// Outcome delivered to a caller waiting on a reliable send
type DeliveryTx = oneshot::Sender<NetworkResult<()>>;

/// Reliable packet waiting for acknowledgment
#[derive(Debug)]
struct PendingPacket {
    data: Bytes,
    message: String,
    sent_at: Instant,
    retry_count: u32,
    resolve_tx: Option<DeliveryTx>,
}

impl PendingPacket {
    fn resolve(&mut self, outcome: NetworkResult<()>) {
        if let Some(tx) = self.resolve_tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Circuit acknowledgment manager
#[derive(Debug)]
struct Acknowledger {
    /// Packets waiting for acknowledgment (sequence -> packet)
    pending_reliable: HashMap<u32, PendingPacket>,
    /// Sequences we've received (for duplicate detection)
    received_sequences: VecDeque<u32>,
    /// Acknowledgments to send to the peer
    pending_acks: VecDeque<u32>,
    max_received_window: usize,
}

impl Acknowledger {
    fn new(max_received_window: usize) -> Self {
        Self {
            pending_reliable: HashMap::new(),
            received_sequences: VecDeque::with_capacity(max_received_window),
            pending_acks: VecDeque::new(),
            max_received_window,
        }
    }

    /// Check if a sequence number is new (not already received)
    fn is_sequence_new(&mut self, sequence: u32) -> bool {
        if self.received_sequences.contains(&sequence) {
            return false;
        }

        self.received_sequences.push_back(sequence);
        while self.received_sequences.len() > self.max_received_window {
            self.received_sequences.pop_front();
        }
        true
    }

    fn queue_ack(&mut self, sequence: u32) {
        self.pending_acks.push_back(sequence);
    }

    /// Take up to `max` queued acknowledgments, oldest first
    fn take_acks(&mut self, max: usize) -> Vec<u32> {
        let count = self.pending_acks.len().min(max);
        self.pending_acks.drain(..count).collect()
    }

    /// Put acks back at the front after a failed send
    fn requeue_acks(&mut self, acks: Vec<u32>) {
        for ack in acks.into_iter().rev() {
            self.pending_acks.push_front(ack);
        }
    }

    fn add_pending_reliable(&mut self, sequence: u32, pending: PendingPacket) {
        self.pending_reliable.insert(sequence, pending);
    }

    fn handle_ack(&mut self, sequence: u32) -> Option<PendingPacket> {
        self.pending_reliable.remove(&sequence)
    }

    /// Outstanding sequences, oldest first. Age is measured back from
    /// `next_sequence` so the order survives the u32 wrap.
    fn outstanding(&self, next_sequence: u32) -> Vec<u32> {
        let mut sequences: Vec<u32> = self.pending_reliable.keys().copied().collect();
        sequences.sort_unstable_by_key(|sequence| std::cmp::Reverse(next_sequence.wrapping_sub(*sequence)));
        sequences
    }

    /// Oldest outstanding sequence, or 0 when nothing is outstanding
    fn oldest_unacked(&self, next_sequence: u32) -> u32 {
        self.pending_reliable
            .keys()
            .copied()
            .max_by_key(|sequence| next_sequence.wrapping_sub(*sequence))
            .unwrap_or(0)
    }

    /// Packets due for retransmission and packets that ran out of retries.
    ///
    /// An entry is due once `base * 2^min(retry_count, cap)` has passed since it
    /// was last sent. An entry that is due with `retry_count >= max_retries` fails.
    fn get_retransmits(
        &mut self,
        now: Instant,
        base_timeout: Duration,
        backoff_cap: u32,
        max_retries: u32,
    ) -> (Vec<(u32, Bytes)>, Vec<(u32, PendingPacket)>) {
        let mut retransmits = Vec::new();
        let mut failed = Vec::new();

        for (sequence, pending) in self.pending_reliable.iter_mut() {
            let retry_timeout = base_timeout * (1u32 << pending.retry_count.min(backoff_cap));
            if now.duration_since(pending.sent_at) < retry_timeout {
                continue;
            }
            if pending.retry_count >= max_retries {
                failed.push(*sequence);
            } else {
                pending.retry_count += 1;
                pending.sent_at = now;
                retransmits.push((*sequence, serialization::mark_resent(&pending.data)));
            }
        }

        retransmits.sort_by_key(|(sequence, _)| *sequence);
        failed.sort_unstable();
        let failed = failed
            .into_iter()
            .filter_map(|sequence| self.pending_reliable.remove(&sequence).map(|p| (sequence, p)))
            .collect();
        (retransmits, failed)
    }

    /// Forget everything, handing back the packets that were still outstanding
    fn reset(&mut self) -> Vec<(u32, PendingPacket)> {
        self.received_sequences.clear();
        self.pending_acks.clear();
        self.pending_reliable.drain().collect()
    }
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// UseCircuitCode sent, nothing heard back yet
    Opening,
    Active,
    /// Pings or reliable sends are failing
    Suspect,
    Closing,
    Closed,
}

/// Ping tracking for circuit health monitoring
#[derive(Debug)]
struct PingTracker {
    /// Outstanding pings (ping_id -> sent_time)
    outstanding_pings: HashMap<u8, Instant>,
    next_ping_id: u8,
    /// Pings that timed out since the last answered one
    missed: u32,
    ping_count: u32,
}

impl PingTracker {
    fn new() -> Self {
        Self { outstanding_pings: HashMap::new(), next_ping_id: 0, missed: 0, ping_count: 0 }
    }

    fn start_ping(&mut self, now: Instant) -> u8 {
        let ping_id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        self.outstanding_pings.insert(ping_id, now);
        self.ping_count += 1;
        ping_id
    }

    /// Complete a ping and return its round trip
    fn complete_ping(&mut self, ping_id: u8, now: Instant) -> Option<Duration> {
        let sent = self.outstanding_pings.remove(&ping_id)?;
        self.missed = 0;
        Some(now.duration_since(sent))
    }

    /// Drop pings older than `timeout`, counting them as missed
    fn expire(&mut self, now: Instant, timeout: Duration) -> u32 {
        let before = self.outstanding_pings.len();
        self.outstanding_pings.retain(|_, sent| now.duration_since(*sent) < timeout);
        let expired = (before - self.outstanding_pings.len()) as u32;
        self.missed += expired;
        expired
    }

    fn reset(&mut self) {
        self.outstanding_pings.clear();
        self.missed = 0;
    }
}

/// Events emitted by the circuit
#[derive(Debug, Clone)]
pub enum CircuitEvent {
    /// First traffic heard from the peer
    Activated,
    /// A reliable packet exhausted its retries
    DeliveryFailed { sequence: u32, message: String },
    Suspect { reason: String },
    /// Liveness restored after being suspect
    Recovered,
    Closed { reason: String },
}

/// Traffic counters and current estimates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircuitStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_resent: u64,
    pub duplicates_dropped: u64,
    pub undecodable_dropped: u64,
    pub untrusted_dropped: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub delivery_failures: u64,
    pub rtt: Option<Duration>,
    pub outstanding: usize,
}

struct CircuitInner {
    state: CircuitState,
    next_sequence: u32,
    acknowledger: Acknowledger,
    ping_tracker: PingTracker,
    rtt: Option<Duration>,
    consecutive_failures: u32,
    /// why the circuit last went suspect
    suspect_reason: Option<String>,
    last_activity: Instant,
    stats: CircuitStats,
}

/// Circuit for managing the conversation with one remote endpoint
pub struct Circuit {
    options: CircuitOptions,
    settings: CircuitSettings,
    codec: PacketCodec,
    inner: Mutex<CircuitInner>,
    /// Channel for sending packets to transport
    packet_tx: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    event_tx: mpsc::UnboundedSender<CircuitEvent>,
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("options", &self.options)
            .field("retransmit_timeout", &self.settings.retransmit_timeout())
            .field("max_retries", &self.settings.max_retries)
            .finish()
    }
}

impl Circuit {
    pub fn new(
        options: CircuitOptions,
        settings: CircuitSettings,
        schema: Arc<Schema>,
        packet_tx: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
        event_tx: mpsc::UnboundedSender<CircuitEvent>,
    ) -> Self {
        let inner = CircuitInner {
            state: CircuitState::Opening,
            next_sequence: options.first_sequence,
            acknowledger: Acknowledger::new(settings.dedup_window),
            ping_tracker: PingTracker::new(),
            rtt: None,
            consecutive_failures: 0,
            suspect_reason: None,
            last_activity: Instant::now(),
            stats: CircuitStats::default(),
        };
        Self {
            options,
            settings,
            codec: PacketCodec::new(schema),
            inner: Mutex::new(inner),
            packet_tx,
            event_tx,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.options.address
    }

    pub fn circuit_code(&self) -> u32 {
        self.options.circuit_code
    }

    pub fn options(&self) -> &CircuitOptions {
        &self.options
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.codec.schema()
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Fails with `CircuitSuspect` or `CircuitClosed` unless the peer looks alive
    pub async fn check_health(&self) -> NetworkResult<()> {
        let inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Opening | CircuitState::Active => Ok(()),
            CircuitState::Suspect => Err(NetworkError::CircuitSuspect {
                address: self.options.address,
                reason: inner.suspect_reason.clone().unwrap_or_default(),
            }),
            CircuitState::Closing | CircuitState::Closed => {
                Err(NetworkError::CircuitClosed { address: self.options.address })
            }
        }
    }

    /// Smoothed round-trip estimate
    pub async fn rtt(&self) -> Option<Duration> {
        self.inner.lock().await.rtt
    }

    pub async fn last_activity(&self) -> Instant {
        self.inner.lock().await.last_activity
    }

    /// Sequence numbers of reliable packets still awaiting an ack, oldest first
    pub async fn outstanding(&self) -> Vec<u32> {
        let inner = self.inner.lock().await;
        inner.acknowledger.outstanding(inner.next_sequence)
    }

    pub async fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock().await;
        CircuitStats {
            rtt: inner.rtt,
            outstanding: inner.acknowledger.pending_reliable.len(),
            ..inner.stats.clone()
        }
    }

    /// Bind the circuit to the session by sending `UseCircuitCode` reliably
    pub async fn open(&self) -> NetworkResult<u32> {
        let message = builders::use_circuit_code(
            self.schema(),
            self.options.circuit_code,
            self.options.session_id,
            self.options.agent_id,
        )?;
        info!("Opening circuit {} with code {}", self.options.address, self.options.circuit_code);
        self.send(message, true).await
    }

    /// Send a message, returning its sequence number
    pub async fn send(&self, message: Message, reliable: bool) -> NetworkResult<u32> {
        let mut inner = self.inner.lock().await;
        self.send_locked(&mut inner, message, reliable, true, None)
    }

    /// Send with the template's default reliability
    pub async fn send_default(&self, message: Message) -> NetworkResult<u32> {
        let reliable = message.reliable();
        self.send(message, reliable).await
    }

    /// Send reliably and wait for the peer's ack
    pub async fn send_and_wait(&self, message: Message, timeout: Duration) -> NetworkResult<u32> {
        let (resolve_tx, resolve_rx) = oneshot::channel();
        let sequence = {
            let mut inner = self.inner.lock().await;
            self.send_locked(&mut inner, message, true, true, Some(resolve_tx))?
        };

        match tokio::time::timeout(timeout, resolve_rx).await {
            Ok(Ok(outcome)) => outcome.map(|()| sequence),
            Ok(Err(_)) => Err(NetworkError::CircuitClosed { address: self.options.address }),
            Err(_) => Err(NetworkError::Timeout { after: timeout }),
        }
    }

    fn send_locked(
        &self,
        inner: &mut CircuitInner,
        message: Message,
        reliable: bool,
        piggyback_acks: bool,
        resolve_tx: Option<DeliveryTx>,
    ) -> NetworkResult<u32> {
        if matches!(inner.state, CircuitState::Closing | CircuitState::Closed) {
            return Err(NetworkError::CircuitClosed { address: self.options.address });
        }

        let sequence = inner.next_sequence;
        let acks = if piggyback_acks {
            inner.acknowledger.take_acks(self.settings.max_acks_per_packet)
        } else {
            Vec::new()
        };
        let ack_count = acks.len();
        let name = message.name().to_string();

        let packet = Packet::new(message, sequence, reliable).with_acks(acks);
        let data = match self.codec.encode(&packet) {
            Ok(data) => data,
            Err(e) => {
                inner.acknowledger.requeue_acks(packet.acks);
                return Err(e.into());
            }
        };
        inner.next_sequence = sequence.wrapping_add(1);

        if reliable {
            inner.acknowledger.add_pending_reliable(
                sequence,
                PendingPacket {
                    data: data.clone(),
                    message: name.clone(),
                    sent_at: Instant::now(),
                    retry_count: 0,
                    resolve_tx,
                },
            );
        }

        trace!("Sending {} seq={} reliable={} acks={} to {}", name, sequence, reliable, ack_count, self.options.address);
        inner.stats.acks_sent += ack_count as u64;
        self.transmit(inner, data)?;
        Ok(sequence)
    }

    fn transmit(&self, inner: &mut CircuitInner, data: Bytes) -> NetworkResult<()> {
        inner.stats.packets_sent += 1;
        inner.stats.bytes_sent += data.len() as u64;
        self.packet_tx
            .send((data, self.options.address))
            .map_err(|_| NetworkError::Transport { reason: "transport channel closed".to_string() })
    }

    fn emit(&self, event: CircuitEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Receive path for one datagram from this circuit's peer.
    ///
    /// Returns the decoded message when it is meant for the application; circuit
    /// control messages are consumed here. Reliable packets are acked even when
    /// they are duplicates or their body cannot be decoded.
    pub async fn handle_datagram(&self, data: &[u8]) -> NetworkResult<Option<Message>> {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::Closed {
            debug!("Dropping {} bytes from {} on closed circuit", data.len(), self.options.address);
            return Ok(None);
        }

        let envelope = match PacketCodec::read_envelope(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                inner.stats.undecodable_dropped += 1;
                debug!("Dropping unreadable packet from {}: {}", self.options.address, e);
                return Err(e.into());
            }
        };

        let now = Instant::now();
        inner.stats.packets_received += 1;
        inner.stats.bytes_received += data.len() as u64;
        inner.last_activity = now;

        if inner.state == CircuitState::Opening {
            inner.state = CircuitState::Active;
            info!("Circuit {} is active", self.options.address);
            self.emit(CircuitEvent::Activated);
        }

        for ack in &envelope.acks {
            self.acknowledge(&mut inner, *ack, now);
        }

        let sequence = envelope.header.sequence;
        if envelope.header.is_reliable() {
            inner.acknowledger.queue_ack(sequence);
        }
        if !inner.acknowledger.is_sequence_new(sequence) {
            inner.stats.duplicates_dropped += 1;
            debug!("Ignoring duplicate packet {} from {}", sequence, self.options.address);
            return Ok(None);
        }

        let message = match self.codec.decode_envelope(&envelope) {
            Ok(message) => message,
            Err(e) => {
                inner.stats.undecodable_dropped += 1;
                debug!("Dropping packet {} from {}: {}", sequence, self.options.address, e);
                return Err(e.into());
            }
        };
        trace!("Received {} seq={} from {}", message.name(), sequence, self.options.address);

        if message.template().is_trusted() && !self.options.trusted_peer {
            inner.stats.untrusted_dropped += 1;
            warn!("Dropping trusted message {} from untrusted peer {}", message.name(), self.options.address);
            return Ok(None);
        }

        match message.name() {
            "PacketAck" => {
                for ack in builders::acked_ids(&message)? {
                    self.acknowledge(&mut inner, ack, now);
                }
                Ok(None)
            }
            "StartPingCheck" => {
                let ping_id = message.get("PingID", "PingID")?.as_u8()?;
                let reply = builders::complete_ping_check(self.schema(), ping_id)?;
                self.send_locked(&mut inner, reply, false, true, None)?;
                Ok(None)
            }
            "CompletePingCheck" => {
                let ping_id = message.get("PingID", "PingID")?.as_u8()?;
                match inner.ping_tracker.complete_ping(ping_id, now) {
                    Some(rtt) => {
                        debug!("Ping {} to {} completed in {:?}", ping_id, self.options.address, rtt);
                        self.update_rtt(&mut inner, rtt);
                        self.maybe_recover(&mut inner);
                    }
                    None => debug!("Received ping response for unknown ping ID {}", ping_id),
                }
                Ok(None)
            }
            "CloseCircuit" => {
                self.close_locked(&mut inner, "closed by peer");
                Ok(None)
            }
            _ => Ok(Some(message)),
        }
    }

    fn acknowledge(&self, inner: &mut CircuitInner, sequence: u32, now: Instant) {
        inner.stats.acks_received += 1;
        let Some(mut pending) = inner.acknowledger.handle_ack(sequence) else {
            trace!("Ack for unknown or expired sequence {}", sequence);
            return;
        };

        debug!("Acknowledged {} seq={}", pending.message, sequence);
        // resent packets give ambiguous samples
        if pending.retry_count == 0 {
            self.update_rtt(inner, now.duration_since(pending.sent_at));
        }
        pending.resolve(Ok(()));
        inner.consecutive_failures = 0;
        self.maybe_recover(inner);
    }

    fn update_rtt(&self, inner: &mut CircuitInner, sample: Duration) {
        let weight = self.settings.rtt_weight;
        inner.rtt = Some(match inner.rtt {
            Some(current) => current.mul_f64(1.0 - weight) + sample.mul_f64(weight),
            None => sample,
        });
    }

    fn maybe_suspect(&self, inner: &mut CircuitInner, reason: String) {
        if inner.state == CircuitState::Active {
            warn!("Circuit {} is suspect: {}", self.options.address, reason);
            inner.state = CircuitState::Suspect;
            inner.suspect_reason = Some(reason.clone());
            self.emit(CircuitEvent::Suspect { reason });
        }
    }

    fn maybe_recover(&self, inner: &mut CircuitInner) {
        let pings_ok = inner.ping_tracker.missed < self.settings.missed_pings_suspect;
        if inner.state == CircuitState::Suspect && pings_ok && inner.consecutive_failures == 0 {
            info!("Circuit {} recovered", self.options.address);
            inner.state = CircuitState::Active;
            inner.suspect_reason = None;
            self.emit(CircuitEvent::Recovered);
        }
    }

    /// Send every queued ack in `PacketAck` messages
    pub async fn flush_acks(&self) -> NetworkResult<usize> {
        let mut inner = self.inner.lock().await;
        let mut flushed = 0;
        loop {
            let acks = inner.acknowledger.take_acks(self.settings.max_acks_per_packet);
            if acks.is_empty() {
                break;
            }
            let message = match builders::packet_ack(self.schema(), &acks) {
                Ok(message) => message,
                Err(e) => {
                    inner.acknowledger.requeue_acks(acks);
                    return Err(e.into());
                }
            };
            if let Err(e) = self.send_locked(&mut inner, message, false, false, None) {
                inner.acknowledger.requeue_acks(acks);
                return Err(e);
            }
            inner.stats.acks_sent += acks.len() as u64;
            flushed += acks.len();
        }
        if flushed > 0 {
            trace!("Flushed {} acks to {}", flushed, self.options.address);
        }
        Ok(flushed)
    }

    /// Retransmit overdue reliable packets and fail the ones out of retries
    pub async fn sweep(&self, now: Instant) -> NetworkResult<()> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, CircuitState::Closing | CircuitState::Closed) {
            return Ok(());
        }

        let (retransmits, failed) = inner.acknowledger.get_retransmits(
            now,
            self.settings.retransmit_timeout(),
            self.settings.max_backoff_exponent,
            self.settings.max_retries,
        );

        let any_failed = !failed.is_empty();
        for (sequence, mut pending) in failed {
            warn!(
                "Packet sequence {} ({}) to {} failed after {} retries",
                sequence, pending.message, self.options.address, pending.retry_count
            );
            pending.resolve(Err(NetworkError::DeliveryFailed { sequence, message: pending.message.clone() }));
            inner.stats.delivery_failures += 1;
            inner.consecutive_failures += 1;
            self.emit(CircuitEvent::DeliveryFailed { sequence, message: pending.message });
        }

        let mut send_error = None;
        for (sequence, data) in retransmits {
            info!("Retransmitting packet sequence {} to {}", sequence, self.options.address);
            inner.stats.packets_resent += 1;
            if let Err(e) = self.transmit(&mut inner, data) {
                warn!("Retransmit of {} to {} failed: {}", sequence, self.options.address, e);
                send_error.get_or_insert(e);
            }
        }

        // nothing ever heard from the peer, UseCircuitCode included
        if any_failed && inner.state == CircuitState::Opening {
            self.close_locked(&mut inner, "peer never answered");
        } else if inner.consecutive_failures >= self.settings.failures_before_close {
            let reason = format!("{} consecutive delivery failures", inner.consecutive_failures);
            self.close_locked(&mut inner, &reason);
        } else if inner.consecutive_failures > 0 {
            let reason = format!("{} consecutive delivery failures", inner.consecutive_failures);
            self.maybe_suspect(&mut inner, reason);
        }
        send_error.map_or(Ok(()), Err)
    }

    /// One ping round: time out stale pings, then send a fresh `StartPingCheck`
    pub async fn tick_ping(&self, now: Instant) -> NetworkResult<()> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, CircuitState::Active | CircuitState::Suspect) {
            return Ok(());
        }

        let expired = inner.ping_tracker.expire(now, self.settings.ping_timeout());
        if expired > 0 {
            warn!("Circuit {} had {} ping timeouts", self.options.address, expired);
        }

        let missed = inner.ping_tracker.missed;
        if missed >= self.settings.missed_pings_close {
            self.close_locked(&mut inner, &format!("no answer to {} pings", missed));
            return Ok(());
        }
        if missed >= self.settings.missed_pings_suspect {
            self.maybe_suspect(&mut inner, format!("{} unanswered pings", missed));
        }

        let ping_id = inner.ping_tracker.start_ping(now);
        let oldest = inner.acknowledger.oldest_unacked(inner.next_sequence);
        let ping = builders::start_ping_check(self.schema(), ping_id, oldest)?;
        self.send_locked(&mut inner, ping, false, true, None)?;
        debug!("Sent ping {} to {}", ping_id, self.options.address);
        Ok(())
    }

    /// Close the circuit, telling the peer and failing outstanding sends
    pub async fn close(&self) -> NetworkResult<()> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, CircuitState::Closing | CircuitState::Closed) {
            return Ok(());
        }

        let goodbye = builders::close_circuit(self.schema())?;
        if let Err(e) = self.send_locked(&mut inner, goodbye, false, false, None) {
            warn!("Failed to send CloseCircuit to {}: {}", self.options.address, e);
        }
        inner.state = CircuitState::Closing;
        self.close_locked(&mut inner, "closed locally");
        Ok(())
    }

    fn close_locked(&self, inner: &mut CircuitInner, reason: &str) {
        if inner.state == CircuitState::Closed {
            return;
        }
        inner.state = CircuitState::Closed;

        let outstanding = inner.acknowledger.reset();
        if !outstanding.is_empty() {
            debug!("Failing {} outstanding packets on {}", outstanding.len(), self.options.address);
        }
        for (_, mut pending) in outstanding {
            pending.resolve(Err(NetworkError::CircuitClosed { address: self.options.address }));
        }
        inner.ping_tracker.reset();

        info!("Circuit {} closed: {}", self.options.address, reason);
        self.emit(CircuitEvent::Closed { reason: reason.to_string() });
    }

    /// Spawn the retransmission, ack flush and ping tasks.
    ///
    /// Tasks hold a weak reference and stop once the circuit is closed or dropped.
    pub fn start(self: &Arc<Self>) {
        spawn_ticker(Arc::downgrade(self), self.settings.sweep_interval(), |circuit, now| {
            Box::pin(async move { circuit.sweep(now).await })
        });
        spawn_ticker(Arc::downgrade(self), self.settings.ack_flush_interval(), |circuit, _| {
            Box::pin(async move { circuit.flush_acks().await.map(|_| ()) })
        });
        spawn_ticker(Arc::downgrade(self), self.settings.ping_interval(), |circuit, now| {
            Box::pin(async move { circuit.tick_ping(now).await })
        });
        info!("Circuit {} started", self.options.address);
    }
}

type TickFuture = std::pin::Pin<Box<dyn std::future::Future<Output = NetworkResult<()>> + Send>>;

fn spawn_ticker<F>(circuit: Weak<Circuit>, period: Duration, tick: F)
where
    F: Fn(Arc<Circuit>, Instant) -> TickFuture + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            let now = interval.tick().await;
            let Some(circuit) = circuit.upgrade() else {
                break;
            };
            if circuit.state().await == CircuitState::Closed {
                break;
            }
            let address = circuit.address();
            if let Err(e) = tick(circuit, now).await {
                warn!("Circuit {} timer task failed: {}", address, e);
            }
        }
    });
}

/// Anything that can carry messages to a peer
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Send a message, returning its sequence number
    async fn send_message(&self, message: Message, reliable: bool) -> NetworkResult<u32>;

    fn schema(&self) -> Arc<Schema>;
}

#[async_trait]
impl MessageSink for Circuit {
    async fn send_message(&self, message: Message, reliable: bool) -> NetworkResult<u32> {
        self.send(message, reliable).await
    }

    fn schema(&self) -> Arc<Schema> {
        self.codec.schema().clone()
    }
}
