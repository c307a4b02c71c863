//! Second Life networking implementation
//!
//! This module provides the LLUDP wire codec, the per-circuit reliability layer
//! and the xfer bulk-transfer protocol that sit underneath every simulator
//! conversation.

pub mod circuit;
pub mod client;
pub mod packets;
pub mod serialization;
pub mod transport;
pub mod xfer;

// Re-export main types for convenience
pub use circuit::{Circuit, CircuitEvent, CircuitOptions, CircuitState, CircuitStats, MessageSink};
pub use client::{Client, ClientEvent};
pub use packets::{Block, FieldType, FieldValue, Message};
pub use serialization::template_registry::{
    BlockTemplate, FieldTemplate, Frequency, MessageNumber, MessageTemplate, Occurrence, Schema,
};
pub use serialization::{CodecError, CodecResult, Packet, PacketCodec, PacketFlags, PacketHeader};
pub use transport::{TransportConfig, UdpTransport};
pub use xfer::{PendingXfer, XferAbortCode, XferEvent, XferManager, XferRequest, XferSource};

// Error types
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Reliable packet {sequence} ({message}) was never acknowledged")]
    DeliveryFailed { sequence: u32, message: String },

    #[error("Circuit to {address} is suspect: {reason}")]
    CircuitSuspect { address: std::net::SocketAddr, reason: String },

    #[error("Circuit to {address} is closed")]
    CircuitClosed { address: std::net::SocketAddr },

    #[error("Transfer {id} aborted: {reason}")]
    TransferAborted { id: u64, reason: String },

    #[error("Unknown transfer {id}")]
    UnknownTransfer { id: u64 },

    #[error("Timed out after {after:?}")]
    Timeout { after: std::time::Duration },

    #[error("Transport error: {reason}")]
    Transport { reason: String },
}

pub type NetworkResult<T> = Result<T, NetworkError>;

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        NetworkError::Transport { reason: err.to_string() }
    }
}
