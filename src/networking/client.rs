//! High-level client interface
//!
//! Owns one UDP transport and any number of circuits on it, keyed by remote
//! address. Inbound datagrams are routed to their circuit, xfer traffic to that
//! circuit's xfer manager, and everything else surfaces as a `ClientEvent`.

use crate::config::NetworkSettings;
use crate::networking::circuit::{Circuit, CircuitEvent, CircuitOptions, MessageSink};
use crate::networking::packets::Message;
use crate::networking::serialization::template_registry::Schema;
use crate::networking::serialization::PacketCodec;
use crate::networking::transport::UdpTransport;
use crate::networking::xfer::{PendingXfer, XferEvent, XferManager, XferRequest, XferSource};
use crate::networking::{NetworkError, NetworkResult};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Events surfaced to the application
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Application message received on a circuit
    Message { address: SocketAddr, message: Message },
    Circuit { address: SocketAddr, event: CircuitEvent },
    Xfer { address: SocketAddr, event: XferEvent },
}

#[derive(Clone)]
struct Connection {
    circuit: Arc<Circuit>,
    xfer: Arc<XferManager>,
}

type Connections = Arc<RwLock<HashMap<SocketAddr, Connection>>>;

/// Drop the entry for `address` only while it still holds `circuit`; a
/// reconnect may already have replaced it
async fn remove_connection(connections: &Connections, address: SocketAddr, circuit: &Weak<Circuit>) -> bool {
    let mut connections = connections.write().await;
    let current = connections
        .get(&address)
        .is_some_and(|c| std::ptr::eq(Arc::as_ptr(&c.circuit), circuit.as_ptr()));
    if current {
        connections.remove(&address);
    }
    current
}

/// LLUDP client driving circuits over one socket
pub struct Client {
    settings: NetworkSettings,
    codec: PacketCodec,
    transport: Arc<UdpTransport>,
    connections: Connections,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    source: Option<Arc<dyn XferSource>>,
    /// Open a circuit for unknown peers that send `UseCircuitCode`
    accept_circuits: AtomicBool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("local_addr", &self.transport.local_addr())
            .field("accept_circuits", &self.accept_circuits.load(Ordering::Relaxed))
            .finish()
    }
}

impl Client {
    /// Bind with the built-in message template and no xfer source
    pub async fn bind(settings: NetworkSettings) -> NetworkResult<(Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>)> {
        let schema = Schema::builtin()?;
        Self::bind_with(settings, schema, None).await
    }

    /// Bind the transport, start it and spawn the dispatch loop
    pub async fn bind_with(
        settings: NetworkSettings,
        schema: Arc<Schema>,
        source: Option<Arc<dyn XferSource>>,
    ) -> NetworkResult<(Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>)> {
        let transport = Arc::new(UdpTransport::new(settings.transport.clone()).await?);
        let inbound = transport
            .start()
            .ok_or_else(|| NetworkError::Transport { reason: "transport already started".to_string() })?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            settings,
            codec: PacketCodec::new(schema),
            transport,
            connections: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            source,
            accept_circuits: AtomicBool::new(false),
        });

        client.spawn_dispatch(inbound);
        info!("Client listening on {}", client.local_addr());
        Ok((client, event_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.codec.schema()
    }

    pub fn transport(&self) -> &Arc<UdpTransport> {
        &self.transport
    }

    /// Accept circuits opened by peers, as a simulator does
    pub fn accept_circuits(&self, accept: bool) {
        self.accept_circuits.store(accept, Ordering::Relaxed);
    }

    pub async fn circuit(&self, address: SocketAddr) -> Option<Arc<Circuit>> {
        self.connections.read().await.get(&address).map(|c| c.circuit.clone())
    }

    pub async fn xfer(&self, address: SocketAddr) -> Option<Arc<XferManager>> {
        self.connections.read().await.get(&address).map(|c| c.xfer.clone())
    }

    pub async fn addresses(&self) -> Vec<SocketAddr> {
        self.connections.read().await.keys().copied().collect()
    }

    /// Create a circuit to `options.address` and send `UseCircuitCode`
    pub async fn connect(&self, options: CircuitOptions) -> NetworkResult<Arc<Circuit>> {
        let address = options.address;
        if self.connections.read().await.contains_key(&address) {
            return Err(NetworkError::Transport { reason: format!("circuit to {} already exists", address) });
        }

        let circuit = self.add_connection(options).await;
        if let Err(e) = circuit.open().await {
            self.connections.write().await.remove(&address);
            return Err(e);
        }
        info!("Connecting to {}", address);
        Ok(circuit)
    }

    async fn add_connection(&self, options: CircuitOptions) -> Arc<Circuit> {
        let address = options.address;
        let (circuit_tx, circuit_rx) = mpsc::unbounded_channel();
        let (xfer_tx, xfer_rx) = mpsc::unbounded_channel();

        let circuit = Arc::new(Circuit::new(
            options,
            self.settings.circuit.clone(),
            self.schema().clone(),
            self.transport.get_sender(),
            circuit_tx,
        ));
        let sink: Arc<dyn MessageSink> = circuit.clone();
        let mut xfer = XferManager::new(sink, self.settings.xfer.clone(), xfer_tx);
        if let Some(source) = &self.source {
            xfer = xfer.with_source(source.clone());
        }
        let xfer = Arc::new(xfer);

        self.connections
            .write()
            .await
            .insert(address, Connection { circuit: circuit.clone(), xfer: xfer.clone() });

        circuit.start();
        xfer.start();
        self.spawn_forwarders(address, circuit_rx, xfer_rx, Arc::downgrade(&circuit), Arc::downgrade(&xfer));
        circuit
    }

    fn spawn_forwarders(
        &self,
        address: SocketAddr,
        mut circuit_rx: mpsc::UnboundedReceiver<CircuitEvent>,
        mut xfer_rx: mpsc::UnboundedReceiver<XferEvent>,
        circuit: Weak<Circuit>,
        xfer: Weak<XferManager>,
    ) {
        let event_tx = self.event_tx.clone();
        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            while let Some(event) = circuit_rx.recv().await {
                if let CircuitEvent::Closed { reason } = &event {
                    if let Some(xfer) = xfer.upgrade() {
                        let aborted = xfer.abort_all(&format!("circuit closed: {}", reason)).await;
                        if aborted > 0 {
                            debug!("Aborted {} transfers on {}", aborted, address);
                        }
                    }
                    remove_connection(&connections, address, &circuit).await;
                }
                let closed = matches!(event, CircuitEvent::Closed { .. });
                let _ = event_tx.send(ClientEvent::Circuit { address, event });
                if closed {
                    break;
                }
            }
        });

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = xfer_rx.recv().await {
                let _ = event_tx.send(ClientEvent::Xfer { address, event });
            }
        });
    }

    fn spawn_dispatch(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>) {
        let client = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some((data, address)) = inbound.recv().await {
                let Some(client) = client.upgrade() else {
                    break;
                };
                client.dispatch(&data, address).await;
            }
            debug!("Client dispatch loop exiting");
        });
    }

    async fn dispatch(&self, data: &[u8], address: SocketAddr) {
        let connection = self.connections.read().await.get(&address).cloned();
        let connection = match connection {
            Some(connection) => connection,
            None => match self.accept(data, address).await {
                Some(connection) => connection,
                None => {
                    debug!("Dropping {} bytes from {}, no circuit", data.len(), address);
                    return;
                }
            },
        };

        let message = match connection.circuit.handle_datagram(data).await {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                debug!("Bad packet from {}: {}", address, e);
                return;
            }
        };

        match connection.xfer.handle_message(&message).await {
            Ok(true) => {}
            Ok(false) => {
                let _ = self.event_tx.send(ClientEvent::Message { address, message });
            }
            Err(e) => warn!("Xfer message {} from {} failed: {}", message.name(), address, e),
        }
    }

    /// Open a circuit for a peer whose first packet is `UseCircuitCode`
    async fn accept(&self, data: &[u8], address: SocketAddr) -> Option<Connection> {
        if !self.accept_circuits.load(Ordering::Relaxed) {
            return None;
        }
        let packet = self.codec.decode(data).ok()?;
        if packet.message.name() != "UseCircuitCode" {
            return None;
        }

        let block = packet.message.block("CircuitCode").ok()?;
        let code = block.get("Code").and_then(|v| v.as_u32()).ok()?;
        let session_id = block.get("SessionID").and_then(|v| v.as_uuid()).ok()?;
        let agent_id = block.get("ID").and_then(|v| v.as_uuid()).ok()?;

        info!("Accepting circuit {} from {}", code, address);
        let mut options = CircuitOptions::new(code, address, agent_id, session_id);
        options.trusted_peer = false;
        self.add_connection(options).await;
        self.connections.read().await.get(&address).cloned()
    }

    /// Send on the circuit to `address`
    pub async fn send(&self, address: SocketAddr, message: Message, reliable: bool) -> NetworkResult<u32> {
        let circuit = self.circuit(address).await.ok_or(NetworkError::CircuitClosed { address })?;
        circuit.send(message, reliable).await
    }

    /// Request a resource over the circuit to `address`; refused while the circuit is suspect
    pub async fn request_transfer(&self, address: SocketAddr, request: XferRequest) -> NetworkResult<PendingXfer> {
        let connection = self.connections.read().await.get(&address).cloned();
        let connection = connection.ok_or(NetworkError::CircuitClosed { address })?;
        connection.circuit.check_health().await?;
        connection.xfer.request_transfer(request).await
    }

    pub async fn close(&self, address: SocketAddr) -> NetworkResult<()> {
        let circuit = self.circuit(address).await.ok_or(NetworkError::CircuitClosed { address })?;
        circuit.close().await
    }

    /// Close every circuit; the socket is released when the client is dropped
    pub async fn shutdown(&self) {
        let connections: Vec<Connection> = self.connections.read().await.values().cloned().collect();
        for connection in connections {
            if let Err(e) = connection.circuit.close().await {
                warn!("Error closing circuit {}: {}", connection.circuit.address(), e);
            }
        }
        info!("Client on {} shut down", self.local_addr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitSettings, XferSettings};
    use uuid::Uuid;

    fn connection(address: SocketAddr, code: u32) -> Connection {
        let schema = Schema::builtin().unwrap();
        let (packet_tx, _packet_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let options = CircuitOptions::new(code, address, Uuid::new_v4(), Uuid::new_v4());
        let circuit = Arc::new(Circuit::new(options, CircuitSettings::default(), schema, packet_tx, event_tx));
        let sink: Arc<dyn MessageSink> = circuit.clone();
        let (xfer_tx, _xfer_rx) = mpsc::unbounded_channel();
        let xfer = Arc::new(XferManager::new(sink, XferSettings::default(), xfer_tx));
        Connection { circuit, xfer }
    }

    #[tokio::test]
    async fn test_stale_close_keeps_replacement_circuit() {
        let address: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let connections: Connections = Arc::new(RwLock::new(HashMap::new()));

        let old = connection(address, 1);
        let old_circuit = Arc::downgrade(&old.circuit);
        connections.write().await.insert(address, old);

        // reconnect to the same address before the old close event is handled
        let new = connection(address, 2);
        let new_circuit = Arc::downgrade(&new.circuit);
        connections.write().await.insert(address, new);

        assert!(!remove_connection(&connections, address, &old_circuit).await);
        let kept = connections.read().await.get(&address).map(|c| c.circuit.circuit_code());
        assert_eq!(kept, Some(2));

        assert!(remove_connection(&connections, address, &new_circuit).await);
        assert!(connections.read().await.is_empty());
    }
}
