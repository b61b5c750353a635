//! tndr server session management
//!
//! A session owns one server process plus the LSP client connected to it.
//! Construction performs the full startup sequence (spawn, transport wiring,
//! initialize handshake); if it succeeds, the session is operational.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ClientConfiguration;
use crate::io::{ProcessManager, ServerProcess, StderrMonitor, StdioTransport, StopMode};
use crate::locator::{ExecutableLocator, LocatorError};
use crate::lsp::protocol::{JsonRpcErrorCode, JsonRpcRequest, JsonRpcResponse};
use crate::lsp::{DocumentSelector, LspClient, LspError, TransportEvent};
use crate::middleware::{ConfigurationScope, MiddlewarePipeline};

/// Hard deadline for a graceful stop before the process is force-killed
pub const STOP_DEADLINE: Duration = Duration::from_millis(2000);

// ============================================================================
// Session Errors
// ============================================================================

/// Errors from session construction and teardown
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Server executable could not be discovered
    #[error("Executable discovery failed: {0}")]
    Locator(#[from] LocatorError),

    /// Process management failure
    #[error("Process error: {0}")]
    Process(#[from] crate::io::process::ProcessError),

    /// LSP-level failure
    #[error("LSP error: {0}")]
    Lsp(#[from] LspError),
}

// ============================================================================
// Session Traits
// ============================================================================

/// Session abstraction so the lifecycle layer can run against mocks
#[async_trait]
pub trait SessionHandle: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Client: Send + Sync;

    /// Take the transport event stream (once per session)
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Whether the underlying server process is still alive
    fn is_running(&self) -> bool;

    /// LSP client access
    fn client(&self) -> &Self::Client;
    fn client_mut(&mut self) -> &mut Self::Client;

    /// Graceful teardown (consumes self)
    async fn close(self) -> Result<(), Self::Error>;
}

/// Factory abstraction over session creation
#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: SessionHandle;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn create_session(
        &self,
        config: ClientConfiguration,
    ) -> Result<Self::Session, Self::Error>;
}

// ============================================================================
// Server Session
// ============================================================================

/// One running tndr server and its connected client
pub struct ServerSession {
    /// Session configuration
    config: ClientConfiguration,

    /// Process manager for the server (always running once constructed)
    process: ServerProcess,

    /// LSP client (always present and initialized)
    client: LspClient<StdioTransport>,

    /// Session start timestamp
    started_at: Instant,
}

impl ServerSession {
    /// Start a server at the given path and complete the LSP handshake
    ///
    /// If this succeeds the session is fully operational; on failure the
    /// spawned process (if any) has already been cleaned up.
    pub async fn new(
        config: ClientConfiguration,
        server_path: PathBuf,
        middleware: Arc<MiddlewarePipeline>,
    ) -> Result<Self, SessionError> {
        info!("Starting tndr session");
        debug!("Server path: {}", server_path.display());

        let args = config.server_args();
        let mut process = ServerProcess::new(server_path, args, None);
        process.on_stderr_line(|line| debug!(target: "tndr::server", "{line}"));
        process.start().await?;

        match Self::connect_client(&mut process, &config, &middleware).await {
            Ok(client) => {
                info!("tndr session started");
                Ok(Self {
                    config,
                    process,
                    client,
                    started_at: Instant::now(),
                })
            }
            Err(e) => {
                warn!("Session startup failed: {e}");
                process.kill_sync();
                Err(e)
            }
        }
    }

    /// Wire the transport and run the initialize handshake
    async fn connect_client(
        process: &mut ServerProcess,
        config: &ClientConfiguration,
        middleware: &Arc<MiddlewarePipeline>,
    ) -> Result<LspClient<StdioTransport>, SessionError> {
        debug!("Creating stdio transport");
        let transport = process.create_stdio_transport()?;

        let mut client = LspClient::new(
            transport,
            DocumentSelector::tndr(),
            Arc::clone(middleware),
            config.request_timeout,
        );

        // Handlers must be in place before initialize; the server may issue
        // workspace/configuration as soon as it receives `initialized`
        let pipeline = Arc::clone(middleware);
        client
            .on_request(move |request| handle_server_request(&pipeline, request))
            .await;
        client
            .on_notification(|notification| {
                debug!("Server notification: {}", notification.method);
            })
            .await;

        debug!("Initializing LSP connection");
        client
            .initialize(config.root_uri.clone(), config.initialization_timeout)
            .await?;

        Ok(client)
    }

    /// Graceful teardown under the stop deadline
    ///
    /// Runs the shutdown/exit handshake and a graceful process stop; if the
    /// whole sequence misses the deadline the process is force-killed. The
    /// session is consumed either way.
    pub async fn close(mut self) -> Result<(), SessionError> {
        info!("Shutting down tndr session");

        let graceful = tokio::time::timeout(STOP_DEADLINE, async {
            if let Err(e) = self.client.shutdown().await {
                warn!("LSP shutdown handshake failed: {e}");
            }
            let _ = self.client.close().await;
            self.process.stop(StopMode::Graceful).await
        })
        .await;

        match graceful {
            Ok(Ok(())) => debug!("Session shutdown completed"),
            Ok(Err(e)) => {
                warn!("Graceful stop failed ({e}), force killing server");
                self.process.kill_sync();
            }
            Err(_) => {
                warn!("Stop deadline of {STOP_DEADLINE:?} exceeded, force killing server");
                self.process.kill_sync();
            }
        }

        Ok(())
    }

    pub fn config(&self) -> &ClientConfiguration {
        &self.config
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Answer a server-initiated request
///
/// workspace/configuration resolves through the configuration middleware;
/// progress-token creation is accepted silently; everything else gets a
/// method-not-found error.
fn handle_server_request(pipeline: &MiddlewarePipeline, request: JsonRpcRequest) -> JsonRpcResponse {
    match request.method.as_str() {
        "workspace/configuration" => {
            let items: Vec<ConfigurationScope> = match request
                .params
                .as_ref()
                .and_then(|params| params.get("items"))
                .map(|items| serde_json::from_value(items.clone()))
            {
                Some(Ok(items)) => items,
                _ => {
                    return JsonRpcResponse::failure(
                        request.id,
                        JsonRpcErrorCode::InvalidParams,
                        "workspace/configuration requires an items array",
                    );
                }
            };

            let values = pipeline.configuration.resolve(&items);
            match serde_json::to_value(values) {
                Ok(values) => JsonRpcResponse::success(request.id, values),
                Err(e) => JsonRpcResponse::failure(
                    request.id,
                    JsonRpcErrorCode::InternalError,
                    format!("Failed to serialize configuration: {e}"),
                ),
            }
        }
        "window/workDoneProgress/create" => {
            debug!("Accepting workDoneProgress/create request: {:?}", request.id);
            JsonRpcResponse::success(request.id, serde_json::Value::Null)
        }
        method => JsonRpcResponse::failure(
            request.id,
            JsonRpcErrorCode::MethodNotFound,
            format!("Method not found: {method}"),
        ),
    }
}

/// Drop fallback when close() was not called
impl Drop for ServerSession {
    fn drop(&mut self) {
        if self.process.is_running() {
            eprintln!("Warning: ServerSession dropped without calling close() - force killing process");
            self.process.kill_sync();
        }
    }
}

#[async_trait]
impl SessionHandle for ServerSession {
    type Error = SessionError;
    type Client = LspClient<StdioTransport>;

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.client.take_events()
    }

    fn is_running(&self) -> bool {
        self.process.is_running()
    }

    fn client(&self) -> &Self::Client {
        &self.client
    }

    fn client_mut(&mut self) -> &mut Self::Client {
        &mut self.client
    }

    async fn close(self) -> Result<(), Self::Error> {
        ServerSession::close(self).await
    }
}

// ============================================================================
// Session Factory
// ============================================================================

/// Factory that discovers the tndr executable and builds real sessions
pub struct TndrSessionFactory {
    /// Executable discovery strategy
    locator: ExecutableLocator,

    /// Middleware shared by all sessions this factory creates
    middleware: Arc<MiddlewarePipeline>,
}

impl TndrSessionFactory {
    pub fn new(locator: ExecutableLocator, middleware: Arc<MiddlewarePipeline>) -> Self {
        Self {
            locator,
            middleware,
        }
    }

    pub fn locator(&self) -> &ExecutableLocator {
        &self.locator
    }
}

#[async_trait]
impl SessionFactory for TndrSessionFactory {
    type Session = ServerSession;
    type Error = SessionError;

    async fn create_session(
        &self,
        config: ClientConfiguration,
    ) -> Result<Self::Session, Self::Error> {
        let server_path = self.locator.locate()?;
        ServerSession::new(config, server_path, Arc::clone(&self.middleware)).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_session_construction_failure() {
        let config = ClientConfiguration::default();
        let result = ServerSession::new(
            config,
            PathBuf::from("nonexistent-tndr-binary"),
            Arc::new(MiddlewarePipeline::default()),
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_factory_surfaces_locator_failure() {
        // Skip when a real binary is on PATH; discovery would then succeed
        if which::which("tndr").is_ok() || which::which("t1").is_ok() {
            return;
        }

        let factory = TndrSessionFactory::new(
            ExecutableLocator::with_fallback_dirs(vec![]),
            Arc::new(MiddlewarePipeline::default()),
        );

        let result = factory.create_session(ClientConfiguration::default()).await;
        assert!(matches!(result, Err(SessionError::Locator(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_force_kills_hung_server_within_deadline() {
        use std::os::unix::fs::PermissionsExt;

        // Answers the initialize request, ignores SIGTERM, and never answers
        // shutdown, so close() has to hit the deadline and force-kill
        let script = concat!(
            "#!/bin/sh\n",
            "trap '' TERM\n",
            "read _header\n",
            "read _blank\n",
            "BODY='{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"capabilities\":{}}}'\n",
            "printf 'Content-Length: %s\\r\\n\\r\\n%s' \"${#BODY}\" \"$BODY\"\n",
            "while true; do sleep 1; done\n",
        );

        let temp_dir = tempfile::tempdir().unwrap();
        let server_path = temp_dir.path().join("hung-server.sh");
        std::fs::write(&server_path, script).unwrap();
        std::fs::set_permissions(&server_path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let session = ServerSession::new(
            ClientConfiguration::default(),
            server_path,
            Arc::new(MiddlewarePipeline::default()),
        )
        .await
        .unwrap();
        assert!(session.is_running());
        let pid = session.process.get_state().pid().unwrap();

        let begin = Instant::now();
        session.close().await.unwrap();
        let elapsed = begin.elapsed();

        assert!(elapsed >= STOP_DEADLINE);
        assert!(elapsed < STOP_DEADLINE + Duration::from_millis(1500));

        // The wait task reaps the killed child shortly after close returns
        let mut gone = false;
        for _ in 0..40 {
            if unsafe { libc::kill(pid as i32, 0) } != 0 {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "server process survived the stop deadline");
    }

    #[test]
    fn test_configuration_request_resolved_through_middleware() {
        let pipeline = MiddlewarePipeline::new(
            crate::config::HintSettings::default(),
            Arc::new(|_scope, section| match section {
                Some("tndr") => json!({"enable": true}),
                _ => serde_json::Value::Null,
            }),
        );

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: json!(7),
            method: "workspace/configuration".to_string(),
            params: Some(json!({
                "items": [
                    {"scopeUri": "file:///ws", "section": "tndr"},
                    {"section": "other"}
                ]
            })),
        };

        let response = handle_server_request(&pipeline, request);
        assert_eq!(response.result, Some(json!([{"enable": true}, null])));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_configuration_request_rejects_missing_items() {
        let pipeline = MiddlewarePipeline::default();
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: json!(8),
            method: "workspace/configuration".to_string(),
            params: Some(json!({})),
        };

        let response = handle_server_request(&pipeline, request);
        assert_eq!(response.error.unwrap().code, -32602);
    }

    #[test]
    fn test_progress_create_accepted() {
        let pipeline = MiddlewarePipeline::default();
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: json!(9),
            method: "window/workDoneProgress/create".to_string(),
            params: Some(json!({"token": "t"})),
        };

        let response = handle_server_request(&pipeline, request);
        assert_eq!(response.result, Some(serde_json::Value::Null));
    }

    #[test]
    fn test_unknown_server_request_rejected() {
        let pipeline = MiddlewarePipeline::default();
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: json!(10),
            method: "client/unregisterCapability".to_string(),
            params: None,
        };

        let response = handle_server_request(&pipeline, request);
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[cfg(feature = "tndr-integration-tests")]
    #[tokio::test]
    async fn test_session_lifecycle_against_real_server() {
        let locator = ExecutableLocator::from_env();
        let Ok(server_path) = locator.locate() else {
            println!("Skipping integration test: tndr binary not found");
            return;
        };

        let session = ServerSession::new(
            ClientConfiguration::default(),
            server_path,
            Arc::new(MiddlewarePipeline::default()),
        )
        .await
        .unwrap();

        assert!(session.is_running());
        assert!(session.client().is_initialized());
        assert!(session.uptime().as_nanos() > 0);

        session.close().await.unwrap();
    }
}
