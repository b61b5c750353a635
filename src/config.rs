//! Configuration for tndr language server sessions
//!
//! Provides ClientConfiguration with builder pattern, validation, and
//! assembly of the server command line from the configured options.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default timeout for LSP initialization (30 seconds)
///
/// Allows the server time to start and load its template cache before the
/// initialize response arrives.
pub const DEFAULT_INITIALIZATION_TIMEOUT_SECS: u64 = 30;

/// Default timeout for individual LSP requests (10 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Maximum allowed initialization timeout (5 minutes)
///
/// Prevents configuration of unreasonably long timeouts that would hang the
/// host indefinitely on a wedged server binary.
pub const MAX_INITIALIZATION_TIMEOUT_SECS: u64 = 300;

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration validation and building errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid path format or value
    #[error("Invalid path: {path} - {reason}")]
    InvalidPath { path: String, reason: String },

    /// Invalid timeout value
    #[error("Invalid timeout: {timeout:?} - {reason}")]
    InvalidTimeout { timeout: Duration, reason: String },

    /// Invalid debug/profiling address
    #[error("Invalid listen address: {address} - {reason}")]
    InvalidAddress { address: String, reason: String },
}

impl ConfigError {
    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid timeout error
    pub fn invalid_timeout(timeout: Duration, reason: impl Into<String>) -> Self {
        Self::InvalidTimeout {
            timeout,
            reason: reason.into(),
        }
    }

    /// Create an invalid address error
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Parameter Hint Settings
// ============================================================================

/// Settings controlling parameter-hint command attachment on completion items
///
/// A per-language override always beats the generic flag; the generic flag
/// applies only to languages without an override. Absent both, hints are off.
#[derive(Debug, Clone, Default)]
pub struct HintSettings {
    /// Generic (all-languages) flag, if configured
    pub generic: Option<bool>,

    /// Per-language overrides keyed by language identifier
    overrides: HashMap<String, bool>,
}

impl HintSettings {
    /// Create empty settings (hints disabled everywhere)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the generic flag
    pub fn with_generic(mut self, enabled: bool) -> Self {
        self.generic = Some(enabled);
        self
    }

    /// Set an override for a specific language identifier
    pub fn with_override(mut self, language_id: impl Into<String>, enabled: bool) -> Self {
        self.overrides.insert(language_id.into(), enabled);
        self
    }

    /// Resolve the effective setting for a language
    pub fn resolve(&self, language_id: &str) -> bool {
        self.overrides
            .get(language_id)
            .copied()
            .unwrap_or_else(|| self.generic.unwrap_or(false))
    }
}

// ============================================================================
// Core Configuration Type
// ============================================================================

/// Complete tndr session configuration
#[derive(Debug, Clone)]
pub struct ClientConfiguration {
    /// File path for the server's internal gopls log, if any
    pub gopls_log: Option<PathBuf>,

    /// Enable RPC tracing between the server and its embedded gopls
    pub gopls_rpc_trace: bool,

    /// File path for the server's own log, if any
    pub log: Option<PathBuf>,

    /// Enable the server's pprof profiling endpoint
    pub pprof: bool,

    /// Debug HTTP listen address (host:port), if any
    pub http: Option<String>,

    /// Root URI for LSP initialization
    pub root_uri: Option<String>,

    /// Timeout for LSP initialization
    pub initialization_timeout: Duration,

    /// Timeout for individual LSP requests
    pub request_timeout: Duration,

    /// Parameter-hint attachment settings
    pub hints: HintSettings,
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        Self {
            gopls_log: None,
            gopls_rpc_trace: false,
            log: None,
            pprof: false,
            http: None,
            root_uri: None,
            initialization_timeout: Duration::from_secs(DEFAULT_INITIALIZATION_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            hints: HintSettings::default(),
        }
    }
}

impl ClientConfiguration {
    /// Create a builder with defaults
    pub fn builder() -> ClientConfigurationBuilder {
        ClientConfigurationBuilder::new()
    }

    /// Assemble the server command line from the configured options
    ///
    /// The `lsp` subcommand always comes first; optional flags follow in a
    /// fixed order so the argv is reproducible across restarts.
    pub fn server_args(&self) -> Vec<String> {
        let mut args = vec!["lsp".to_string()];

        if let Some(path) = &self.gopls_log {
            args.push(format!("-goplsLog={}", path.to_string_lossy()));
        }

        if self.gopls_rpc_trace {
            args.push("-goplsRPCTrace=true".to_string());
        }

        if let Some(path) = &self.log {
            args.push(format!("-log={}", path.to_string_lossy()));
        }

        if self.pprof {
            args.push("-pprof=true".to_string());
        }

        if let Some(address) = &self.http {
            args.push(format!("-http={address}"));
        }

        args
    }
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for ClientConfiguration with validation
#[derive(Debug, Default)]
pub struct ClientConfigurationBuilder {
    gopls_log: Option<PathBuf>,
    gopls_rpc_trace: bool,
    log: Option<PathBuf>,
    pprof: bool,
    http: Option<String>,
    root_uri: Option<String>,
    initialization_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    hints: HintSettings,
}

impl ClientConfigurationBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gopls log file path
    pub fn gopls_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.gopls_log = Some(path.into());
        self
    }

    /// Enable gopls RPC tracing
    pub fn gopls_rpc_trace(mut self, enabled: bool) -> Self {
        self.gopls_rpc_trace = enabled;
        self
    }

    /// Set the server log file path
    pub fn log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log = Some(path.into());
        self
    }

    /// Enable the pprof profiling endpoint
    pub fn pprof(mut self, enabled: bool) -> Self {
        self.pprof = enabled;
        self
    }

    /// Set the debug HTTP listen address
    pub fn http(mut self, address: impl Into<String>) -> Self {
        self.http = Some(address.into());
        self
    }

    /// Set the LSP root URI
    pub fn root_uri(mut self, uri: impl Into<String>) -> Self {
        self.root_uri = Some(uri.into());
        self
    }

    /// Set the LSP initialization timeout
    pub fn initialization_timeout(mut self, timeout: Duration) -> Self {
        self.initialization_timeout = Some(timeout);
        self
    }

    /// Set the LSP request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the parameter-hint settings
    pub fn hints(mut self, hints: HintSettings) -> Self {
        self.hints = hints;
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<ClientConfiguration, ConfigError> {
        let initialization_timeout = self
            .initialization_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_INITIALIZATION_TIMEOUT_SECS));
        let request_timeout = self
            .request_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS));

        Self::validate_timeout(initialization_timeout)?;
        Self::validate_timeout(request_timeout)?;

        if let Some(path) = &self.gopls_log {
            Self::validate_log_path(path)?;
        }
        if let Some(path) = &self.log {
            Self::validate_log_path(path)?;
        }
        if let Some(address) = &self.http {
            Self::validate_address(address)?;
        }

        Ok(ClientConfiguration {
            gopls_log: self.gopls_log,
            gopls_rpc_trace: self.gopls_rpc_trace,
            log: self.log,
            pprof: self.pprof,
            http: self.http,
            root_uri: self.root_uri,
            initialization_timeout,
            request_timeout,
            hints: self.hints,
        })
    }

    /// Validate a timeout value is positive and within the allowed ceiling
    fn validate_timeout(timeout: Duration) -> Result<(), ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::invalid_timeout(
                timeout,
                "timeout must be greater than zero",
            ));
        }
        if timeout > Duration::from_secs(MAX_INITIALIZATION_TIMEOUT_SECS) {
            return Err(ConfigError::invalid_timeout(
                timeout,
                format!("timeout exceeds maximum of {MAX_INITIALIZATION_TIMEOUT_SECS}s"),
            ));
        }
        Ok(())
    }

    /// Validate a log file path has a writable parent directory
    fn validate_log_path(path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            // An empty parent means a bare file name relative to the cwd
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(ConfigError::invalid_path(
                    path.to_string_lossy(),
                    "parent directory does not exist",
                ));
            }
        }
        Ok(())
    }

    /// Validate a host:port listen address
    fn validate_address(address: &str) -> Result<(), ConfigError> {
        match address.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => Ok(()),
            _ => Err(ConfigError::invalid_address(
                address,
                "expected host:port with a numeric port",
            )),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
