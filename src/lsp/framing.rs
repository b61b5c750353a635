//! LSP message framing layer
//!
//! Handles Content-Length framing as specified by the Language Server
//! Protocol:
//!
//! Content-Length: <length>\r\n\r\n<content>

use crate::io::transport::Transport;
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::trace;

/// Error types for LSP framing
#[derive(Debug, thiserror::Error)]
pub enum FrameError<T: std::error::Error + Send + Sync + 'static> {
    #[error("Transport error: {0}")]
    Transport(T),

    #[error("Invalid LSP message format: {0}")]
    InvalidFormat(String),

    #[error("Invalid content length: {0}")]
    InvalidContentLength(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl<T: std::error::Error + Send + Sync + 'static> FrameError<T> {
    /// Whether this error means the underlying transport is gone
    ///
    /// Malformed frames are recoverable; the stream continues with whatever
    /// bytes follow. Transport loss is terminal.
    pub fn is_transport(&self) -> bool {
        matches!(self, FrameError::Transport(_))
    }
}

/// Maximum message size to prevent memory exhaustion
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Content-Length framing wrapper over any transport
///
/// The underlying transport works with raw byte chunks; this wrapper
/// accumulates them and cuts complete messages along header boundaries.
pub struct FramedTransport<T: Transport> {
    /// Underlying transport
    transport: T,

    /// Buffer for accumulating partial messages
    receive_buffer: String,

    /// Queue of complete messages ready to be returned
    message_queue: VecDeque<String>,
}

impl<T: Transport> FramedTransport<T> {
    /// Create a new framing wrapper around a transport
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            receive_buffer: String::new(),
            message_queue: VecDeque::new(),
        }
    }

    /// Get a reference to the underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Try to cut one complete message off the front of the receive buffer
    ///
    /// Returns Some(message) if a complete message was parsed, None if more
    /// data is needed. On a malformed header the offending header block is
    /// discarded so the stream can resynchronize on later bytes.
    fn try_parse_message(&mut self) -> Result<Option<String>, FrameError<T::Error>> {
        let Some(header_end) = self.receive_buffer.find("\r\n\r\n") else {
            return Ok(None);
        };
        let content_start = header_end + 4;

        let content_length = match parse_content_length::<T>(&self.receive_buffer[..header_end]) {
            Ok(length) => length,
            Err(e) => {
                self.receive_buffer.drain(..content_start);
                return Err(e);
            }
        };

        let available_content = self.receive_buffer.len() - content_start;
        if available_content < content_length {
            trace!(
                "FramedTransport: incomplete message - need {} more bytes",
                content_length - available_content
            );
            return Ok(None);
        }

        let content_end = content_start + content_length;
        let Some(content) = self.receive_buffer.get(content_start..content_end) else {
            // Declared length lands inside a multi-byte UTF-8 character, so
            // the frame cannot be cut as sent. Discard through the next
            // character boundary and let the stream resynchronize.
            let mut boundary = content_end;
            while !self.receive_buffer.is_char_boundary(boundary) {
                boundary += 1;
            }
            self.receive_buffer.drain(..boundary);
            return Err(FrameError::InvalidFormat(format!(
                "Content-Length {content_length} splits a UTF-8 character"
            )));
        };
        let message = content.to_string();
        self.receive_buffer.drain(..content_end);

        trace!(
            "FramedTransport: parsed complete message ({} bytes)",
            content_length
        );
        Ok(Some(message))
    }

    /// Pull data from the transport and extract any complete messages
    async fn process_transport_data(&mut self) -> Result<(), FrameError<T::Error>> {
        let new_data = self
            .transport
            .receive()
            .await
            .map_err(FrameError::Transport)?;

        self.receive_buffer.push_str(&new_data);

        while let Some(message) = self.try_parse_message()? {
            self.message_queue.push_back(message);
        }

        Ok(())
    }
}

/// Parse Content-Length from an LSP header block
fn parse_content_length<T: Transport>(header: &str) -> Result<usize, FrameError<T::Error>> {
    for line in header.lines() {
        if let Some(length_str) = line.strip_prefix("Content-Length:") {
            let length_str = length_str.trim();
            let length = length_str
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(length_str.to_string()))?;

            if length > MAX_MESSAGE_SIZE {
                return Err(FrameError::MessageTooLarge {
                    size: length,
                    max: MAX_MESSAGE_SIZE,
                });
            }

            return Ok(length);
        }
    }

    Err(FrameError::InvalidFormat(
        "Missing Content-Length header".to_string(),
    ))
}

#[async_trait]
impl<T: Transport> Transport for FramedTransport<T> {
    type Error = FrameError<T::Error>;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        let framed_message = format!("Content-Length: {}\r\n\r\n{}", message.len(), message);

        trace!(
            "FramedTransport: sending framed message ({} bytes content)",
            message.len()
        );

        self.transport
            .send(&framed_message)
            .await
            .map_err(FrameError::Transport)
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if let Some(message) = self.message_queue.pop_front() {
            return Ok(message);
        }

        loop {
            self.process_transport_data().await?;

            if let Some(message) = self.message_queue.pop_front() {
                return Ok(message);
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.transport.close().await.map_err(FrameError::Transport)
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::MockTransport;

    fn frame(message: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", message.len(), message)
    }

    #[tokio::test]
    async fn test_framing_send() {
        let mock_transport = MockTransport::new();
        let mut framing = FramedTransport::new(mock_transport);

        let message = r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#;
        framing.send(message).await.unwrap();

        let sent = framing.transport().sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], frame(message));
    }

    #[tokio::test]
    async fn test_framing_receive() {
        let message = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;

        let mock_transport = MockTransport::with_responses(vec![frame(message)]);
        let mut framing = FramedTransport::new(mock_transport);

        let received = framing.receive().await.unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_framing_partial_message() {
        let message = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        let framed = frame(message);
        let (first, second) = framed.split_at(framed.len() - 10);

        let mock_transport =
            MockTransport::with_responses(vec![first.to_string(), second.to_string()]);
        let mut framing = FramedTransport::new(mock_transport);

        let received = framing.receive().await.unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_framing_multiple_messages_in_one_chunk() {
        let message1 = r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#;
        let message2 = r#"{"jsonrpc":"2.0","id":2,"method":"shutdown"}"#;

        let combined = format!("{}{}", frame(message1), frame(message2));

        let mock_transport = MockTransport::with_responses(vec![combined]);
        let mut framing = FramedTransport::new(mock_transport);

        assert_eq!(framing.receive().await.unwrap(), message1);
        assert_eq!(framing.receive().await.unwrap(), message2);
    }

    #[tokio::test]
    async fn test_framing_extra_headers_tolerated() {
        let message = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        let framed = format!(
            "Content-Type: application/vscode-jsonrpc\r\nContent-Length: {}\r\n\r\n{}",
            message.len(),
            message
        );

        let mock_transport = MockTransport::with_responses(vec![framed]);
        let mut framing = FramedTransport::new(mock_transport);

        assert_eq!(framing.receive().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_framing_invalid_content_length() {
        let invalid_message = "Content-Length: invalid\r\n\r\n{}";

        let mock_transport = MockTransport::with_responses(vec![invalid_message.to_string()]);
        let mut framing = FramedTransport::new(mock_transport);

        let result = framing.receive().await;
        match result.unwrap_err() {
            FrameError::InvalidContentLength(text) => assert_eq!(text, "invalid"),
            other => panic!("Expected InvalidContentLength error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_framing_recovers_after_malformed_header() {
        let good = r#"{"jsonrpc":"2.0","id":7,"result":{}}"#;
        let mock_transport = MockTransport::with_responses(vec![
            "Content-Length: nope\r\n\r\n".to_string(),
            frame(good),
        ]);
        let mut framing = FramedTransport::new(mock_transport);

        assert!(framing.receive().await.is_err());
        // Stream stays usable after the malformed frame
        assert_eq!(framing.receive().await.unwrap(), good);
    }

    #[tokio::test]
    async fn test_framing_content_length_inside_multibyte_char() {
        // Length 2 cuts into the two-byte 'é'; must error, not panic
        let good = r#"{"jsonrpc":"2.0","id":3,"result":{}}"#;
        let mock_transport = MockTransport::with_responses(vec![
            "Content-Length: 2\r\n\r\naé".to_string(),
            frame(good),
        ]);
        let mut framing = FramedTransport::new(mock_transport);

        match framing.receive().await.unwrap_err() {
            FrameError::InvalidFormat(text) => assert!(text.contains("UTF-8")),
            other => panic!("Expected InvalidFormat error, got: {other:?}"),
        }
        // Stream stays usable after the bad frame
        assert_eq!(framing.receive().await.unwrap(), good);
    }

    #[tokio::test]
    async fn test_framing_message_too_large() {
        let large_size = MAX_MESSAGE_SIZE + 1;
        let invalid_message = format!("Content-Length: {large_size}\r\n\r\n");

        let mock_transport = MockTransport::with_responses(vec![invalid_message]);
        let mut framing = FramedTransport::new(mock_transport);

        let result = framing.receive().await;
        match result.unwrap_err() {
            FrameError::MessageTooLarge { size, max } => {
                assert_eq!(size, large_size);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("Expected MessageTooLarge error, got: {other:?}"),
        }
    }

    #[test]
    fn test_is_transport_classification() {
        let transport_err: FrameError<crate::io::transport::MockTransportError> =
            FrameError::Transport(crate::io::transport::MockTransportError::Disconnected);
        assert!(transport_err.is_transport());

        let format_err: FrameError<crate::io::transport::MockTransportError> =
            FrameError::InvalidFormat("bad".to_string());
        assert!(!format_err.is_transport());
    }
}
