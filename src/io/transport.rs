//! Transport layer - Pure I/O abstraction for message exchange
//!
//! Handles bidirectional raw-string exchange with a child process over its
//! stdio pipes. No knowledge of framing, JSON-RPC, or process lifecycle.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::{error, trace};

/// Chunk size for stdout reads
const READ_CHUNK_SIZE: usize = 4096;

/// Core transport trait for bidirectional message exchange
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a message (raw string)
    async fn send(&mut self, message: &str) -> Result<(), Self::Error>;

    /// Receive a message (raw string)
    async fn receive(&mut self) -> Result<String, Self::Error>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stdio Transport Implementation
// ============================================================================

/// Error types for stdio transport
#[derive(Debug, thiserror::Error)]
pub enum StdioTransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Transport over a child process's stdin/stdout pipes
///
/// A writer task drains an outbound channel into stdin; a reader task pushes
/// stdout chunks into an inbound channel. Chunks are cut at UTF-8 character
/// boundaries so a multi-byte character split across reads never produces a
/// broken string.
#[derive(Debug)]
pub struct StdioTransport {
    /// Channel feeding the stdin writer task
    stdin_sender: Option<mpsc::UnboundedSender<String>>,

    /// Channel fed by the stdout reader task
    stdout_receiver: Option<mpsc::UnboundedReceiver<String>>,

    /// Connection status
    connected: bool,
}

impl StdioTransport {
    /// Create a new StdioTransport from child process streams
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let (stdin_sender, stdin_receiver) = mpsc::unbounded_channel();
        let (stdout_sender, stdout_receiver) = mpsc::unbounded_channel();

        tokio::spawn(Self::stdin_writer_task(stdin, stdin_receiver));
        tokio::spawn(Self::stdout_reader_task(stdout, stdout_sender));

        Self {
            stdin_sender: Some(stdin_sender),
            stdout_receiver: Some(stdout_receiver),
            connected: true,
        }
    }

    /// Background task that writes outbound messages to stdin
    async fn stdin_writer_task(
        mut stdin: ChildStdin,
        mut receiver: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(message) = receiver.recv().await {
            trace!("StdioTransport: writing {} bytes to stdin", message.len());

            if let Err(e) = stdin.write_all(message.as_bytes()).await {
                error!("Failed to write to stdin: {}", e);
                break;
            }

            if let Err(e) = stdin.flush().await {
                error!("Failed to flush stdin: {}", e);
                break;
            }
        }

        trace!("StdioTransport: stdin writer task finished");
    }

    /// Background task that reads stdout and forwards UTF-8 complete chunks
    async fn stdout_reader_task(stdout: ChildStdout, sender: mpsc::UnboundedSender<String>) {
        let mut reader = BufReader::new(stdout);
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        // Incomplete trailing UTF-8 bytes carried into the next read
        let mut tail: Vec<u8> = Vec::new();

        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    trace!("StdioTransport: stdout reader reached EOF");
                    if !tail.is_empty() {
                        error!(
                            "StdioTransport: {} incomplete UTF-8 bytes at EOF",
                            tail.len()
                        );
                    }
                    break;
                }
                Ok(n) => {
                    tail.extend_from_slice(&chunk[..n]);
                    if let Some(text) = take_valid_utf8(&mut tail) {
                        if sender.send(text).is_err() {
                            trace!("StdioTransport: stdout receiver dropped, stopping reader");
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to read from stdout: {}", e);
                    break;
                }
            }
        }

        trace!("StdioTransport: stdout reader task finished");
    }
}

/// Split the longest valid UTF-8 prefix off the buffer
///
/// Leaves any trailing partial character in place so it can be completed by
/// the next read. Returns None when no complete character is available yet.
fn take_valid_utf8(buffer: &mut Vec<u8>) -> Option<String> {
    if buffer.is_empty() {
        return None;
    }

    let valid_len = match std::str::from_utf8(buffer) {
        Ok(_) => buffer.len(),
        Err(e) => e.valid_up_to(),
    };

    if valid_len == 0 {
        return None;
    }

    let rest = buffer.split_off(valid_len);
    let prefix = std::mem::replace(buffer, rest);
    // Prefix length came from UTF-8 validation above
    String::from_utf8(prefix).ok()
}

#[async_trait]
impl Transport for StdioTransport {
    type Error = StdioTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let sender = self
            .stdin_sender
            .as_ref()
            .ok_or(StdioTransportError::Disconnected)?;

        sender
            .send(message.to_string())
            .map_err(|e| StdioTransportError::Channel(e.to_string()))?;

        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let receiver = self
            .stdout_receiver
            .as_mut()
            .ok_or(StdioTransportError::Disconnected)?;

        receiver
            .recv()
            .await
            .ok_or(StdioTransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.stdin_sender.take();
        self.stdout_receiver.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Mock Transport Implementation
// ============================================================================

/// Error type for mock transport
#[cfg(test)]
#[derive(Debug, thiserror::Error)]
pub enum MockTransportError {
    #[error("Transport is disconnected")]
    Disconnected,
    #[error("No more responses available")]
    NoMoreResponses,
}

/// Mock transport for testing - records sent messages, replays scripted input
#[cfg(test)]
pub struct MockTransport {
    sent_messages: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    responses: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<String>>>,
    connected: bool,
}

#[cfg(test)]
impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self {
            sent_messages: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
            responses: std::sync::Arc::new(std::sync::Mutex::new(
                std::collections::VecDeque::new(),
            )),
            connected: true,
        }
    }

    /// Create a mock transport with predefined responses
    pub fn with_responses(responses: Vec<String>) -> Self {
        let transport = Self::new();
        transport.responses.lock().unwrap().extend(responses);
        transport
    }

    /// Add a response that will be returned by a later receive() call
    pub fn add_response(&mut self, response: String) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// Get all messages that were sent via this transport
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent_messages.lock().unwrap().clone()
    }

    /// Check if there are more scripted responses left
    pub fn has_responses(&self) -> bool {
        !self.responses.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Test transport that accepts sends but never produces inbound data
///
/// MockTransport errors once its scripted responses run out, which reads as
/// transport loss. Tests that only exercise the outbound path use this one
/// so the connection stays "alive".
#[cfg(test)]
pub struct SilentTransport {
    sent_messages: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

#[cfg(test)]
impl SilentTransport {
    pub fn new() -> Self {
        Self {
            sent_messages: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Get all messages that were sent via this transport
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent_messages.lock().unwrap().clone()
    }

    /// Shared handle to the sent-message log, usable after the transport
    /// has been consumed by a client
    pub fn sent_messages_handle(&self) -> std::sync::Arc<std::sync::Mutex<Vec<String>>> {
        std::sync::Arc::clone(&self.sent_messages)
    }
}

#[cfg(test)]
impl Default for SilentTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for SilentTransport {
    type Error = MockTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        self.sent_messages.lock().unwrap().push(message.to_string());
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        std::future::pending().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        self.sent_messages.lock().unwrap().push(message.to_string());
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        let mut responses = self.responses.lock().unwrap();
        responses
            .pop_front()
            .ok_or(MockTransportError::NoMoreResponses)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_stdio_transport_echo() {
        let mut child = Command::new("echo")
            .arg("hello world")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn echo command");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();

        let mut transport = StdioTransport::new(stdin, stdout);

        let output = transport.receive().await.unwrap();
        assert_eq!(output.trim(), "hello world");

        assert!(transport.is_connected());

        transport.close().await.unwrap();
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_mock_transport_send_receive() {
        let mut transport =
            MockTransport::with_responses(vec!["response1".to_string(), "response2".to_string()]);

        transport.send("message1").await.unwrap();
        transport.send("message2").await.unwrap();

        assert_eq!(transport.receive().await.unwrap(), "response1");
        assert_eq!(transport.receive().await.unwrap(), "response2");

        let sent = transport.sent_messages();
        assert_eq!(sent, vec!["message1", "message2"]);

        assert!(transport.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_mock_transport_disconnect() {
        let mut transport = MockTransport::new();

        assert!(transport.is_connected());

        transport.close().await.unwrap();

        assert!(!transport.is_connected());
        assert!(transport.send("test").await.is_err());
        assert!(transport.receive().await.is_err());
    }

    #[test]
    fn test_take_valid_utf8_holds_partial_character() {
        // First 2 bytes of "世" - no complete character yet
        let mut buffer = vec![0xE4, 0xB8];
        assert!(take_valid_utf8(&mut buffer).is_none());

        // Final byte completes the character
        buffer.push(0x96);
        assert_eq!(take_valid_utf8(&mut buffer).unwrap(), "世");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_take_valid_utf8_splits_at_boundary() {
        let mut buffer = b"abc".to_vec();
        buffer.extend_from_slice(&[0xE4, 0xB8]); // partial "世"

        assert_eq!(take_valid_utf8(&mut buffer).unwrap(), "abc");
        assert_eq!(buffer, vec![0xE4, 0xB8]);
    }
}
