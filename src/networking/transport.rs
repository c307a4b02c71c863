//! UDP transport layer
//!
//! Handles the low-level UDP socket operations. Outbound datagrams are queued on
//! an unbounded channel shared by every circuit; inbound datagrams are forwarded
//! raw, leaving all parsing to the circuits.

use crate::networking::NetworkResult;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// UDP transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Local bind address (0.0.0.0:0 for any)
    pub bind_addr: SocketAddr,
    /// Largest datagram accepted
    pub max_packet_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), max_packet_size: 1500 }
    }
}

impl TransportConfig {
    pub fn loopback() -> Self {
        Self { bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), ..Self::default() }
    }
}

#[derive(Debug, Default)]
struct TransportCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    receive_errors: AtomicU64,
}

/// UDP transport for Second Life protocol
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    config: TransportConfig,
    /// Channel for sending packets
    send_tx: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    send_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>>,
    counters: Arc<TransportCounters>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local_addr", &self.local_addr)
            .field("config", &self.config)
            .finish()
    }
}

impl UdpTransport {
    /// Create a new UDP transport
    pub async fn new(config: TransportConfig) -> NetworkResult<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr()?;
        info!("UDP transport bound to {}", local_addr);

        let (send_tx, send_rx) = mpsc::unbounded_channel();

        Ok(Self {
            socket: Arc::new(socket),
            config,
            send_tx,
            send_rx: std::sync::Mutex::new(Some(send_rx)),
            counters: Arc::new(TransportCounters::default()),
            tasks: std::sync::Mutex::new(Vec::new()),
            local_addr,
        })
    }

    /// Get local socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get sender for outgoing packets
    pub fn get_sender(&self) -> mpsc::UnboundedSender<(Bytes, SocketAddr)> {
        self.send_tx.clone()
    }

    /// Start the sender and receiver tasks.
    ///
    /// Returns the stream of inbound datagrams; `None` if already started.
    pub fn start(&self) -> Option<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>> {
        let send_rx = self.send_rx.lock().ok()?.take()?;
        let (recv_tx, recv_rx) = mpsc::unbounded_channel();

        let sender = self.start_packet_sender(send_rx);
        let receiver = self.start_packet_receiver(recv_tx);
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(sender);
            tasks.push(receiver);
        }

        info!("UDP transport started on {}", self.local_addr);
        Some(recv_rx)
    }

    /// Send a packet directly, bypassing the queue
    pub async fn send_packet(&self, data: Bytes, dest: SocketAddr) -> NetworkResult<()> {
        send_direct(&self.socket, &self.counters, &data, dest).await
    }

    fn start_packet_sender(&self, mut send_rx: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let counters = Arc::clone(&self.counters);

        tokio::spawn(async move {
            while let Some((data, dest)) = send_rx.recv().await {
                if let Err(e) = send_direct(&socket, &counters, &data, dest).await {
                    counters.send_errors.fetch_add(1, Ordering::Relaxed);
                    error!("Failed to send packet to {}: {}", dest, e);
                }
            }
            debug!("UDP sender task exiting");
        })
    }

    fn start_packet_receiver(&self, recv_tx: mpsc::UnboundedSender<(Bytes, SocketAddr)>) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let counters = Arc::clone(&self.counters);
        let max_packet_size = self.config.max_packet_size;

        tokio::spawn(async move {
            let mut buffer = vec![0u8; max_packet_size];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, src)) => {
                        trace!("Received {} bytes from {}", len, src);
                        counters.packets_received.fetch_add(1, Ordering::Relaxed);
                        counters.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
                        if recv_tx.send((Bytes::copy_from_slice(&buffer[..len]), src)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        counters.receive_errors.fetch_add(1, Ordering::Relaxed);
                        // ICMP port unreachable surfaces as a reset on some platforms
                        if e.kind() == std::io::ErrorKind::ConnectionReset
                            || e.kind() == std::io::ErrorKind::ConnectionAborted
                        {
                            debug!("Ignoring UDP receive error: {}", e);
                            continue;
                        }
                        error!("UDP receive error: {}", e);
                        break;
                    }
                }
            }

            info!("UDP receiver task exiting");
        })
    }

    /// Stop the background tasks
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Get transport statistics
    pub fn get_stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            receive_errors: c.receive_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn send_direct(socket: &UdpSocket, counters: &TransportCounters, data: &[u8], dest: SocketAddr) -> NetworkResult<()> {
    let bytes_sent = socket.send_to(data, dest).await?;
    if bytes_sent != data.len() {
        warn!("Partial send: {} bytes of {} to {}", bytes_sent, data.len(), dest);
    }
    counters.packets_sent.fetch_add(1, Ordering::Relaxed);
    counters.bytes_sent.fetch_add(bytes_sent as u64, Ordering::Relaxed);
    trace!("Sent {} bytes to {}", bytes_sent, dest);
    Ok(())
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
}
