//! JSON-RPC 2.0 protocol layer
//!
//! Implements JSON-RPC 2.0 with request/response correlation, server-request
//! and notification handling, and a transport-event stream the lifecycle
//! layer consumes to drive its recovery policy.

use crate::io::transport::Transport;
use crate::lsp::framing::FramedTransport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{Level, debug, error, trace};

// ============================================================================
// JSON-RPC Types
// ============================================================================

/// JSON-RPC 2.0 request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier
    pub id: serde_json::Value,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 response message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier (matches the request)
    pub id: serde_json::Value,

    /// Result (present if successful)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Error (present if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

impl JsonRpcResponse {
    /// Build a success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response
    pub fn failure(id: Value, code: JsonRpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcErrorObject {
                code: code as i32,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 notification message (no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Optional additional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ============================================================================
// JSON-RPC Errors
// ============================================================================

/// JSON-RPC error codes as defined in the specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
#[allow(dead_code)]
pub enum JsonRpcErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
}

/// JSON-RPC error type
#[derive(Debug, thiserror::Error)]
pub enum JsonRpcError {
    #[error("JSON-RPC server error ({code}): {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),

    #[error("Request timeout")]
    Timeout,

    #[error("Session closed before response arrived")]
    SessionClosed,

    #[error("Missing result in response")]
    MissingResult,
}

// ============================================================================
// Transport Events
// ============================================================================

/// Protocol-level events surfaced to the lifecycle layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message failed to parse or violated framing; the stream continues
    ReadError(String),

    /// The transport is gone; no further traffic is possible
    Closed,
}

// ============================================================================
// JSON-RPC Client
// ============================================================================

/// Type alias for notification handler to reduce signature noise
type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;

/// Type alias for server-request handler
type RequestHandler = Arc<dyn Fn(JsonRpcRequest) -> JsonRpcResponse + Send + Sync>;

/// Pending request table shared with the reader task
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// JSON-RPC client with request/response correlation
pub struct JsonRpcClient<T: Transport> {
    /// Channel for sending outbound messages (requests and notifications)
    outbound_sender: mpsc::UnboundedSender<String>,

    /// Request ID counter
    request_id: AtomicU64,

    /// Pending requests waiting for responses
    pending_requests: PendingMap,

    /// Notification handler (shared with reader task)
    notification_handler: Arc<Mutex<Option<NotificationHandler>>>,

    /// Server-request handler (shared with reader task)
    request_handler: Arc<Mutex<Option<RequestHandler>>>,

    /// Transport event stream, handed out once via take_events()
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,

    /// Type parameter marker
    _phantom: std::marker::PhantomData<T>,
}

impl<T: Transport + 'static> JsonRpcClient<T> {
    /// Create a new JSON-RPC client over a raw transport
    pub fn new(transport: T) -> Self {
        let framed = Arc::new(Mutex::new(FramedTransport::new(transport)));
        let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<String>();
        let (event_sender, event_receiver) = mpsc::unbounded_channel::<TransportEvent>();
        let pending_requests: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let notification_handler = Arc::new(Mutex::new(None::<NotificationHandler>));
        let request_handler = Arc::new(Mutex::new(None::<RequestHandler>));

        let transport_task = Arc::clone(&framed);
        let pending_task = Arc::clone(&pending_requests);
        let notification_task = Arc::clone(&notification_handler);
        let request_task = Arc::clone(&request_handler);
        let reply_sender = outbound_sender.clone();

        // Single task owns the transport for both directions
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Outbound messages (prioritized)
                    Some(message) = outbound_receiver.recv() => {
                        let mut transport = transport_task.lock().await;
                        if let Err(e) = transport.send(&message).await {
                            error!("Failed to send message: {}", e);
                            let _ = event_sender.send(TransportEvent::Closed);
                            break;
                        }
                    }
                    // Inbound messages
                    result = async {
                        let mut transport = transport_task.lock().await;
                        transport.receive().await
                    } => {
                        match result {
                            Ok(message) => {
                                Self::process_inbound_message(
                                    message,
                                    &pending_task,
                                    &notification_task,
                                    &request_task,
                                    &reply_sender,
                                )
                                .await;
                            }
                            Err(e) if e.is_transport() => {
                                debug!("Transport closed: {}", e);
                                let _ = event_sender.send(TransportEvent::Closed);
                                break;
                            }
                            Err(e) => {
                                error!("Protocol fault on inbound stream: {}", e);
                                let _ = event_sender.send(
                                    TransportEvent::ReadError(e.to_string()),
                                );
                            }
                        }
                    }
                }
            }
            trace!("Transport handler task finished");
        });

        Self {
            outbound_sender,
            request_id: AtomicU64::new(1),
            pending_requests,
            notification_handler,
            request_handler,
            events: Some(event_receiver),
            _phantom: std::marker::PhantomData,
        }
    }

    /// Take the transport event stream
    ///
    /// Yields ReadError for recoverable protocol faults and Closed exactly
    /// once when the transport is gone. Can only be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }

    /// Set the notification handler
    pub async fn on_notification<F>(&self, handler: F)
    where
        F: Fn(JsonRpcNotification) + Send + Sync + 'static,
    {
        *self.notification_handler.lock().await = Some(Arc::new(handler));
    }

    /// Set the handler for requests initiated by the server
    ///
    /// Without a handler installed every server request is answered with
    /// MethodNotFound.
    pub async fn on_request<F>(&self, handler: F)
    where
        F: Fn(JsonRpcRequest) -> JsonRpcResponse + Send + Sync + 'static,
    {
        *self.request_handler.lock().await = Some(Arc::new(handler));
    }

    /// Route one inbound message to the pending table or a handler
    async fn process_inbound_message(
        message: String,
        pending_requests: &PendingMap,
        notification_handler: &Arc<Mutex<Option<NotificationHandler>>>,
        request_handler: &Arc<Mutex<Option<RequestHandler>>>,
        reply_sender: &mpsc::UnboundedSender<String>,
    ) {
        crate::log_lsp_message!(Level::TRACE, "inbound", "raw", message);

        let Ok(value) = serde_json::from_str::<Value>(&message) else {
            debug!("Received unparseable message: {}", message);
            return;
        };

        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some();

        match (has_method, has_id) {
            // Server-initiated request: dispatch to handler, send the reply
            (true, true) => {
                let Ok(request) = serde_json::from_value::<JsonRpcRequest>(value) else {
                    debug!("Malformed server request: {}", message);
                    return;
                };

                let handler = request_handler.lock().await.clone();
                let response = match handler {
                    Some(handler) => handler(request),
                    None => {
                        debug!("No handler for server request: {}", request.method);
                        JsonRpcResponse::failure(
                            request.id,
                            JsonRpcErrorCode::MethodNotFound,
                            format!("method not found: {}", request.method),
                        )
                    }
                };

                match serde_json::to_string(&response) {
                    Ok(json) => {
                        if reply_sender.send(json).is_err() {
                            debug!("Outbound channel closed, dropping server-request reply");
                        }
                    }
                    Err(e) => error!("Failed to serialize server-request reply: {}", e),
                }
            }
            // Notification
            (true, false) => {
                let Ok(notification) = serde_json::from_value::<JsonRpcNotification>(value) else {
                    debug!("Malformed notification: {}", message);
                    return;
                };
                trace!("Received notification: {}", notification.method);
                let handler = notification_handler.lock().await.clone();
                if let Some(handler) = handler {
                    handler(notification);
                }
            }
            // Response to one of our requests
            (false, true) => {
                let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value) else {
                    debug!("Malformed response: {}", message);
                    return;
                };
                let Some(id) = response.id.as_u64() else {
                    debug!("Response with non-numeric id: {:?}", response.id);
                    return;
                };

                let mut pending = pending_requests.lock().await;
                match pending.remove(&id) {
                    Some(sender) => {
                        if sender.send(response).is_err() {
                            debug!("Response receiver dropped for request {}", id);
                        }
                    }
                    None => debug!("Received response for unknown request {}", id),
                }
            }
            (false, false) => {
                debug!("Message is neither request, response nor notification: {}", message);
            }
        }
    }

    /// Send a JSON-RPC request with default timeout (30 seconds)
    pub async fn request<P, R>(
        &mut self,
        method: &str,
        params: Option<P>,
    ) -> Result<R, JsonRpcError>
    where
        P: serde::Serialize,
        R: for<'de> serde::Deserialize<'de>,
    {
        self.request_with_timeout(method, params, std::time::Duration::from_secs(30))
            .await
    }

    /// Send a JSON-RPC request with custom timeout
    pub async fn request_with_timeout<P, R>(
        &mut self,
        method: &str,
        params: Option<P>,
        timeout: std::time::Duration,
    ) -> Result<R, JsonRpcError>
    where
        P: serde::Serialize,
        R: for<'de> serde::Deserialize<'de>,
    {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let (response_sender, response_receiver) = oneshot::channel();

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Value::Number(serde_json::Number::from(id)),
            method: method.to_string(),
            params: params
                .map(|p| serde_json::to_value(p).map_err(JsonRpcError::Serialization))
                .transpose()?,
        };

        let request_json = serde_json::to_string(&request).map_err(JsonRpcError::Serialization)?;
        crate::log_lsp_message!(Level::DEBUG, "outbound", method, request_json);

        // Register pending request before the bytes can hit the wire
        {
            let mut pending = self.pending_requests.lock().await;
            pending.insert(id, response_sender);
        }

        self.outbound_sender
            .send(request_json)
            .map_err(|_| JsonRpcError::Transport("Outbound channel closed".to_string()))?;

        let response = match tokio::time::timeout(timeout, response_receiver).await {
            Ok(Ok(response)) => response,
            // Sender dropped: the pending table was torn down underneath us
            Ok(Err(_)) => return Err(JsonRpcError::SessionClosed),
            Err(_) => {
                let mut pending = self.pending_requests.lock().await;
                pending.remove(&id);
                return Err(JsonRpcError::Timeout);
            }
        };

        if let Some(error) = response.error {
            return Err(JsonRpcError::Server {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }

        match response.result {
            // Null results (e.g. shutdown) deserialize as R where R allows it
            Some(result) => serde_json::from_value(result).map_err(JsonRpcError::Deserialization),
            None => serde_json::from_value(Value::Null).map_err(|_| JsonRpcError::MissingResult),
        }
    }

    /// Send a JSON-RPC notification
    pub async fn notify<P>(&mut self, method: &str, params: Option<P>) -> Result<(), JsonRpcError>
    where
        P: serde::Serialize,
    {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: params
                .map(|p| serde_json::to_value(p).map_err(JsonRpcError::Serialization))
                .transpose()?,
        };

        let notification_json =
            serde_json::to_string(&notification).map_err(JsonRpcError::Serialization)?;
        crate::log_lsp_message!(Level::DEBUG, "outbound", method, notification_json);

        self.outbound_sender
            .send(notification_json)
            .map_err(|_| JsonRpcError::Transport("Outbound channel closed".to_string()))?;

        Ok(())
    }

    /// Check if the outbound path is still open
    pub fn is_connected(&self) -> bool {
        !self.outbound_sender.is_closed()
    }

    /// Fail all pending requests with SessionClosed
    ///
    /// Dropping the oneshot senders wakes every in-flight request with a
    /// receive error, which the request path maps to SessionClosed.
    pub async fn reject_pending(&mut self) {
        let mut pending = self.pending_requests.lock().await;
        for (id, _sender) in pending.drain() {
            debug!("Rejecting pending request ID {}", id);
        }
    }

    /// Close the connection
    pub async fn close(&mut self) -> Result<(), JsonRpcError> {
        self.reject_pending().await;
        // The transport task exits when the outbound channel closes on drop
        Ok(())
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending_requests.lock().await.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
