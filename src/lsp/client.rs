//! High-level LSP client
//!
//! Provides a typed API for Language Server Protocol communication using the
//! lsp-types crate. Document-sync notifications, completion, hover and
//! formatting all flow through here; completion responses are additionally
//! run through the middleware pipeline.

use crate::io::transport::Transport;
use crate::lsp::protocol::{JsonRpcClient, JsonRpcError, TransportEvent};
use crate::middleware::MiddlewarePipeline;
use lsp_types::{
    ClientCapabilities, CompletionClientCapabilities, CompletionItemCapability, CompletionParams,
    CompletionResponse, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DidSaveTextDocumentParams, DocumentFilter,
    DocumentFormattingClientCapabilities, DocumentFormattingParams, Hover, HoverClientCapabilities,
    HoverParams, InitializeParams, InitializeResult, InitializedParams, Position,
    TextDocumentClientCapabilities, TextDocumentContentChangeEvent, TextDocumentIdentifier,
    TextDocumentItem, TextDocumentPositionParams, TextDocumentSyncClientCapabilities, TextEdit,
    VersionedTextDocumentIdentifier, WorkspaceClientCapabilities,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

// ============================================================================
// LSP Client Errors
// ============================================================================

/// LSP client errors
#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("LSP client not initialized")]
    NotInitialized,

    #[error("LSP protocol error: {0}")]
    Protocol(String),

    #[error("Invalid document URI: {uri} - {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Document not open: {uri}")]
    DocumentNotOpen { uri: String },

    #[error("LSP request timeout: {method}")]
    RequestTimeout { method: String },
}

// ============================================================================
// Document Selector
// ============================================================================

/// Which documents this client governs
///
/// A document is in scope when any filter matches both its language id and
/// its URI scheme. Documents out of scope are silently skipped by the
/// document-sync methods.
#[derive(Debug, Clone)]
pub struct DocumentSelector {
    filters: Vec<DocumentFilter>,
}

impl DocumentSelector {
    /// Selector for tndr template files on disk
    pub fn tndr() -> Self {
        Self {
            filters: vec![DocumentFilter {
                language: Some("tndr".to_string()),
                scheme: Some("file".to_string()),
                pattern: None,
            }],
        }
    }

    /// Build a selector from explicit filters
    pub fn new(filters: Vec<DocumentFilter>) -> Self {
        Self { filters }
    }

    /// Check whether a document falls under this selector
    pub fn governs(&self, language_id: &str, scheme: &str) -> bool {
        self.filters.iter().any(|filter| {
            filter
                .language
                .as_deref()
                .map(|l| l == language_id)
                .unwrap_or(true)
                && filter
                    .scheme
                    .as_deref()
                    .map(|s| s == scheme)
                    .unwrap_or(true)
        })
    }
}

// ============================================================================
// URI normalization
// ============================================================================

/// Normalize a raw document path or URI into a typed URI
///
/// Bare filesystem paths get the file scheme; anything that already carries
/// a scheme passes through untouched.
pub fn normalize_uri(raw: &str) -> Result<lsp_types::Uri, LspError> {
    let with_scheme = if uri_scheme(raw).is_some() {
        raw.to_string()
    } else {
        format!("file://{raw}")
    };

    with_scheme
        .parse::<lsp_types::Uri>()
        .map_err(|e| LspError::InvalidUri {
            uri: raw.to_string(),
            reason: e.to_string(),
        })
}

/// Extract the scheme of a URI-shaped string, if it has one
pub fn uri_scheme(raw: &str) -> Option<&str> {
    let colon = raw.find(':')?;
    // A colon after a path separator is not a scheme delimiter
    if raw[..colon].contains('/') || colon == 0 {
        return None;
    }
    Some(&raw[..colon])
}

// ============================================================================
// High-level LSP Client
// ============================================================================

/// State tracked per open document
#[derive(Debug, Clone)]
struct OpenDocument {
    language_id: String,
    version: i32,
}

/// High-level LSP client over any transport
pub struct LspClient<T: Transport> {
    /// JSON-RPC client for communication
    rpc_client: JsonRpcClient<T>,

    /// Documents this client governs
    selector: DocumentSelector,

    /// Interception pipeline for completion and document sync
    middleware: Arc<MiddlewarePipeline>,

    /// Timeout applied to ordinary requests
    request_timeout: Duration,

    /// Initialization state
    initialized: bool,

    /// Server capabilities from initialization
    server_capabilities: Option<lsp_types::ServerCapabilities>,

    /// Open documents keyed by normalized URI string
    open_documents: HashMap<String, OpenDocument>,
}

impl<T: Transport + 'static> LspClient<T> {
    /// Create a new LSP client with a transport
    pub fn new(
        transport: T,
        selector: DocumentSelector,
        middleware: Arc<MiddlewarePipeline>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            rpc_client: JsonRpcClient::new(transport),
            selector,
            middleware,
            request_timeout,
            initialized: false,
            server_capabilities: None,
            open_documents: HashMap::new(),
        }
    }

    /// Take the transport event stream (once)
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.rpc_client.take_events()
    }

    /// Install a handler for server-initiated requests
    pub async fn on_request<F>(&self, handler: F)
    where
        F: Fn(crate::lsp::protocol::JsonRpcRequest) -> crate::lsp::protocol::JsonRpcResponse
            + Send
            + Sync
            + 'static,
    {
        self.rpc_client.on_request(handler).await;
    }

    /// Install a handler for server notifications
    pub async fn on_notification<F>(&self, handler: F)
    where
        F: Fn(crate::lsp::protocol::JsonRpcNotification) + Send + Sync + 'static,
    {
        self.rpc_client.on_notification(handler).await;
    }

    /// Initialize the LSP connection
    pub async fn initialize(
        &mut self,
        root_uri: Option<String>,
        timeout: Duration,
    ) -> Result<InitializeResult, LspError> {
        if self.initialized {
            return Err(LspError::Protocol("Client already initialized".to_string()));
        }

        info!("Initializing LSP client");

        let root_uri = root_uri.map(|uri| normalize_uri(&uri)).transpose()?;
        let params = build_initialize_params(root_uri);

        let result: InitializeResult = match self
            .rpc_client
            .request_with_timeout("initialize", Some(params), timeout)
            .await
        {
            Ok(result) => result,
            Err(JsonRpcError::Timeout) => {
                return Err(LspError::RequestTimeout {
                    method: "initialize".to_string(),
                });
            }
            Err(e) => return Err(LspError::JsonRpc(e)),
        };

        debug!("LSP server capabilities: {:?}", result.capabilities);
        self.server_capabilities = Some(result.capabilities.clone());

        self.rpc_client
            .notify("initialized", Some(InitializedParams {}))
            .await?;

        self.initialized = true;
        info!("LSP client initialized successfully");

        Ok(result)
    }

    /// Shutdown the LSP connection
    pub async fn shutdown(&mut self) -> Result<(), LspError> {
        if !self.initialized {
            return Ok(());
        }

        info!("Shutting down LSP client");

        let _: () = match self.rpc_client.request("shutdown", None::<Value>).await {
            Ok(result) => result,
            Err(JsonRpcError::Timeout) => {
                return Err(LspError::RequestTimeout {
                    method: "shutdown".to_string(),
                });
            }
            Err(e) => return Err(LspError::JsonRpc(e)),
        };

        self.rpc_client.notify("exit", None::<Value>).await?;

        self.initialized = false;
        info!("LSP client shutdown complete");

        Ok(())
    }

    /// Check if the client is initialized
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Get server capabilities
    pub fn server_capabilities(&self) -> Option<&lsp_types::ServerCapabilities> {
        self.server_capabilities.as_ref()
    }

    /// Check if the connection is active
    pub fn is_connected(&self) -> bool {
        self.rpc_client.is_connected()
    }

    /// Number of documents currently tracked as open
    pub fn open_document_count(&self) -> usize {
        self.open_documents.len()
    }

    /// Close the connection and drop all per-document state
    ///
    /// Does not stop the external process; pending requests are failed with
    /// SessionClosed.
    pub async fn close(&mut self) -> Result<(), LspError> {
        self.open_documents.clear();
        self.initialized = false;
        self.rpc_client.close().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Document synchronization
    // ------------------------------------------------------------------

    /// Notify the server that a document was opened
    ///
    /// Returns false (without sending) when the document is outside the
    /// selector or the sync policy suppresses the notification.
    pub async fn did_open(
        &mut self,
        uri: &str,
        language_id: &str,
        text: String,
    ) -> Result<bool, LspError> {
        self.ensure_initialized()?;

        let scheme = uri_scheme(uri).unwrap_or("file");
        if !self.selector.governs(language_id, scheme) {
            debug!("Skipping didOpen for ungoverned document: {}", uri);
            return Ok(false);
        }
        if !self.middleware.document_sync.forward_open() {
            return Ok(false);
        }

        let normalized = normalize_uri(uri)?;
        let key = normalized.to_string();
        let version = 1;

        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: normalized,
                language_id: language_id.to_string(),
                version,
                text,
            },
        };
        self.rpc_client
            .notify("textDocument/didOpen", Some(params))
            .await?;

        self.open_documents.insert(
            key,
            OpenDocument {
                language_id: language_id.to_string(),
                version,
            },
        );
        Ok(true)
    }

    /// Notify the server of a full-text document change
    pub async fn did_change(&mut self, uri: &str, text: String) -> Result<bool, LspError> {
        self.ensure_initialized()?;
        if !self.middleware.document_sync.forward_change() {
            return Ok(false);
        }

        let normalized = normalize_uri(uri)?;
        let key = normalized.to_string();

        let version = {
            let document =
                self.open_documents
                    .get_mut(&key)
                    .ok_or_else(|| LspError::DocumentNotOpen {
                        uri: uri.to_string(),
                    })?;
            document.version += 1;
            document.version
        };

        let params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: normalized,
                version,
            },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text,
            }],
        };
        self.rpc_client
            .notify("textDocument/didChange", Some(params))
            .await?;
        Ok(true)
    }

    /// Notify the server that a document was saved
    pub async fn did_save(&mut self, uri: &str, text: Option<String>) -> Result<bool, LspError> {
        self.ensure_initialized()?;
        if !self.middleware.document_sync.forward_save() {
            return Ok(false);
        }

        let normalized = normalize_uri(uri)?;
        let params = DidSaveTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: normalized },
            text,
        };
        self.rpc_client
            .notify("textDocument/didSave", Some(params))
            .await?;
        Ok(true)
    }

    /// Notify the server that a document was closed
    pub async fn did_close(&mut self, uri: &str) -> Result<bool, LspError> {
        self.ensure_initialized()?;
        if !self.middleware.document_sync.forward_close() {
            return Ok(false);
        }

        let normalized = normalize_uri(uri)?;
        self.open_documents.remove(&normalized.to_string());

        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: normalized },
        };
        self.rpc_client
            .notify("textDocument/didClose", Some(params))
            .await?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Language features
    // ------------------------------------------------------------------

    /// Request completions at a position
    ///
    /// The raw response is run through the completion middleware: filterText
    /// stabilization and parameter-hint command attachment.
    pub async fn completion(
        &mut self,
        uri: &str,
        position: Position,
    ) -> Result<Option<CompletionResponse>, LspError> {
        self.ensure_initialized()?;

        let normalized = normalize_uri(uri)?;
        let language_id = self
            .open_documents
            .get(&normalized.to_string())
            .map(|d| d.language_id.clone())
            .unwrap_or_else(|| "tndr".to_string());

        let params = CompletionParams {
            text_document_position: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri: normalized },
                position,
            },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
            context: None,
        };

        let mut response: Option<CompletionResponse> = self
            .rpc_client
            .request_with_timeout("textDocument/completion", Some(params), self.request_timeout)
            .await?;

        if let Some(response) = response.as_mut() {
            self.middleware.completion.apply(&language_id, response);
        }

        Ok(response)
    }

    /// Request hover information at a position
    pub async fn hover(&mut self, uri: &str, position: Position) -> Result<Option<Hover>, LspError> {
        self.ensure_initialized()?;

        let params = HoverParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier {
                    uri: normalize_uri(uri)?,
                },
                position,
            },
            work_done_progress_params: Default::default(),
        };

        Ok(self
            .rpc_client
            .request_with_timeout("textDocument/hover", Some(params), self.request_timeout)
            .await?)
    }

    /// Request whole-document formatting edits
    pub async fn formatting(
        &mut self,
        uri: &str,
        options: lsp_types::FormattingOptions,
    ) -> Result<Option<Vec<TextEdit>>, LspError> {
        self.ensure_initialized()?;

        let params = DocumentFormattingParams {
            text_document: TextDocumentIdentifier {
                uri: normalize_uri(uri)?,
            },
            options,
            work_done_progress_params: Default::default(),
        };

        let edits: Option<Vec<TextEdit>> = self
            .rpc_client
            .request_with_timeout("textDocument/formatting", Some(params), self.request_timeout)
            .await?;

        // Formatting is a pure pass-through stage in the pipeline
        Ok(edits.map(|e| self.middleware.formatting_passthrough(e)))
    }

    fn ensure_initialized(&self) -> Result<(), LspError> {
        if self.initialized {
            Ok(())
        } else {
            Err(LspError::NotInitialized)
        }
    }
}

/// Build the initialize request parameters with this client's capability set
#[allow(deprecated)]
fn build_initialize_params(root_uri: Option<lsp_types::Uri>) -> InitializeParams {
    InitializeParams {
        process_id: Some(std::process::id()),
        root_uri,
        capabilities: ClientCapabilities {
            workspace: Some(WorkspaceClientCapabilities {
                configuration: Some(true),
                workspace_folders: Some(true),
                ..Default::default()
            }),
            text_document: Some(TextDocumentClientCapabilities {
                synchronization: Some(TextDocumentSyncClientCapabilities {
                    dynamic_registration: Some(false),
                    will_save: Some(false),
                    will_save_wait_until: Some(false),
                    did_save: Some(true),
                }),
                completion: Some(CompletionClientCapabilities {
                    dynamic_registration: Some(false),
                    completion_item: Some(CompletionItemCapability {
                        snippet_support: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                hover: Some(HoverClientCapabilities {
                    dynamic_registration: Some(false),
                    content_format: Some(vec![lsp_types::MarkupKind::Markdown]),
                }),
                formatting: Some(DocumentFormattingClientCapabilities {
                    dynamic_registration: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        trace: Some(lsp_types::TraceValue::Off),
        client_info: Some(lsp_types::ClientInfo {
            name: "tndr-lsp-client".to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
        ..Default::default()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::SilentTransport;

    fn test_client() -> LspClient<SilentTransport> {
        LspClient::new(
            SilentTransport::new(),
            DocumentSelector::tndr(),
            Arc::new(MiddlewarePipeline::default()),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_normalize_uri_adds_file_scheme() {
        let uri = normalize_uri("/home/user/template.tndr").unwrap();
        assert_eq!(uri.to_string(), "file:///home/user/template.tndr");
    }

    #[test]
    fn test_normalize_uri_keeps_existing_scheme() {
        let uri = normalize_uri("file:///x/y.tndr").unwrap();
        assert_eq!(uri.to_string(), "file:///x/y.tndr");

        let untitled = normalize_uri("untitled:Untitled-1").unwrap();
        assert_eq!(untitled.to_string(), "untitled:Untitled-1");
    }

    #[test]
    fn test_uri_scheme_extraction() {
        assert_eq!(uri_scheme("file:///a/b"), Some("file"));
        assert_eq!(uri_scheme("untitled:Untitled-1"), Some("untitled"));
        assert_eq!(uri_scheme("/plain/path"), None);
        // Windows-style drive letters would be schemes by this rule; tndr
        // only targets unix hosts so a single-letter scheme never occurs
        assert_eq!(uri_scheme("relative/pa:th"), None);
    }

    #[test]
    fn test_selector_governs_matching_documents() {
        let selector = DocumentSelector::tndr();
        assert!(selector.governs("tndr", "file"));
        assert!(!selector.governs("go", "file"));
        assert!(!selector.governs("tndr", "untitled"));
    }

    #[test]
    fn test_selector_wildcard_filter() {
        let selector = DocumentSelector::new(vec![DocumentFilter {
            language: Some("tndr".to_string()),
            scheme: None,
            pattern: None,
        }]);
        assert!(selector.governs("tndr", "file"));
        assert!(selector.governs("tndr", "untitled"));
    }

    #[tokio::test]
    async fn test_document_sync_rejected_before_initialize() {
        let mut client = test_client();

        let result = client
            .did_open("/tmp/a.tndr", "tndr", "hello".to_string())
            .await;
        assert!(matches!(result, Err(LspError::NotInitialized)));

        let result = client.did_change("/tmp/a.tndr", "hello2".to_string()).await;
        assert!(matches!(result, Err(LspError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_completion_rejected_before_initialize() {
        let mut client = test_client();
        let result = client
            .completion("/tmp/a.tndr", Position::new(0, 0))
            .await;
        assert!(matches!(result, Err(LspError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_ungoverned_document_not_forwarded() {
        let mut client = test_client();
        // Bypass the handshake: selector filtering happens either way
        client.initialized = true;

        let forwarded = client
            .did_open("/tmp/main.go", "go", "package main".to_string())
            .await
            .unwrap();
        assert!(!forwarded);
        assert_eq!(client.open_document_count(), 0);
    }

    #[tokio::test]
    async fn test_open_change_close_tracks_versions() {
        let mut client = test_client();
        client.initialized = true;

        client
            .did_open("/tmp/a.tndr", "tndr", "v1".to_string())
            .await
            .unwrap();
        assert_eq!(client.open_document_count(), 1);

        client.did_change("/tmp/a.tndr", "v2".to_string()).await.unwrap();
        let entry = client.open_documents.get("file:///tmp/a.tndr").unwrap();
        assert_eq!(entry.version, 2);

        client.did_close("/tmp/a.tndr").await.unwrap();
        assert_eq!(client.open_document_count(), 0);
    }

    #[tokio::test]
    async fn test_change_for_unopened_document_rejected() {
        let mut client = test_client();
        client.initialized = true;

        let result = client.did_change("/tmp/never-opened.tndr", "x".to_string()).await;
        assert!(matches!(result, Err(LspError::DocumentNotOpen { .. })));
    }

    #[tokio::test]
    async fn test_close_clears_document_state() {
        let mut client = test_client();
        client.initialized = true;

        client
            .did_open("/tmp/a.tndr", "tndr", "v1".to_string())
            .await
            .unwrap();
        client.close().await.unwrap();

        assert_eq!(client.open_document_count(), 0);
        assert!(!client.is_initialized());
    }

    #[test]
    fn test_initialize_params_identify_client() {
        let params = build_initialize_params(None);
        let info = params.client_info.unwrap();
        assert_eq!(info.name, "tndr-lsp-client");
        assert_eq!(params.process_id, Some(std::process::id()));

        let workspace = params.capabilities.workspace.unwrap();
        assert_eq!(workspace.configuration, Some(true));
    }
}
