// SLV-LLUDP: the Second Life UDP protocol core
// Wire codec, circuit reliability and xfer transfers

pub mod config;
pub mod networking;
pub mod utils;

// Re-export commonly used types for convenience
pub use config::{CircuitSettings, NetworkSettings, XferSettings};
pub use networking::{
    Circuit, CircuitEvent, CircuitOptions, Client, ClientEvent, Message, NetworkError, NetworkResult, PacketCodec,
    Schema,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
