//! LSP protocol stack: framing, JSON-RPC, and the typed client

pub mod client;
pub mod framing;
pub mod protocol;

pub use client::{DocumentSelector, LspClient, LspError};
pub use protocol::{JsonRpcClient, JsonRpcError, TransportEvent};
