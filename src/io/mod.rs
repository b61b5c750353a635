//! I/O layer - Generic abstractions for process management and transport
//!
//! - **Transport**: Pure I/O layer for bidirectional message exchange
//! - **Process**: Server process lifecycle management with stdio integration
//!
//! Nothing here knows about message framing or the LSP protocol.

pub mod process;
pub mod transport;

// Re-export main types for convenience
pub use process::{ProcessManager, ProcessState, ServerProcess, StderrMonitor, StopMode};
pub use transport::{StdioTransport, Transport};
