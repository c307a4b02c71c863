//! Xfer: chunked bulk transfer over a circuit

pub mod manager;
pub mod messages;
pub mod types;

pub use manager::{MemorySource, PendingXfer, XferManager, XferSource};
pub use types::{XferAbortCode, XferEvent, XferRequest, XferState};
