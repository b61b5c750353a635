//! Lifecycle manager and LSP client for the tndr language server
//!
//! The crate discovers the tndr executable, runs it as a child process,
//! speaks LSP to it over stdio, and applies the client-side policies the
//! server relies on: completion stabilization, parameter-hint attachment,
//! configuration relay, and a no-auto-restart fault policy.

pub mod config;
pub mod io;
pub mod lifecycle;
pub mod locator;
pub mod logging;
pub mod lsp;
pub mod middleware;
pub mod recovery;
pub mod session;

pub use config::{ClientConfiguration, ClientConfigurationBuilder, HintSettings};
pub use lifecycle::{LifecycleController, LifecycleState, Notice};
pub use locator::ExecutableLocator;
pub use lsp::{DocumentSelector, LspClient, LspError};
pub use session::{ServerSession, SessionFactory, SessionHandle, TndrSessionFactory};
