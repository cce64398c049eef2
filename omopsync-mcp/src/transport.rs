//! Transport layer for the MCP server.
//!
//! - [`StdioTransport`]: newline-delimited JSON (NDJSON) over stdin/stdout
//! - [`ChannelTransport`]: in-process tokio mpsc channels (for testing)
//!
//! The server polls `read_message` inside `tokio::select!` alongside finished
//! tool calls, so every `read_message` must be cancel-safe: a read dropped
//! halfway through a line must not lose the bytes it already consumed.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::mpsc;

use crate::error::McpError;

/// Reads and writes JSON-RPC messages over some framing.
#[async_trait]
pub trait Transport: Send {
    /// The next message, `Ok(None)` on EOF. Must be cancel-safe.
    async fn read_message(&mut self) -> Result<Option<String>, McpError>;

    /// Write one message, framing and flushing it.
    async fn write_message(&mut self, message: &str) -> Result<(), McpError>;

    async fn close(&mut self) -> Result<(), McpError>;
}

// ---------------------------------------------------------------------------
// StdioTransport
// ---------------------------------------------------------------------------

/// One JSON-RPC message per line on stdin and stdout.
///
/// Logging never goes to stdout while this transport is in use.
pub struct StdioTransport {
    reader: BufReader<Stdin>,
    writer: Stdout,
    /// Bytes of a line not yet terminated; kept across cancelled reads.
    pending: Vec<u8>,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self {
            reader: BufReader::new(tokio::io::stdin()),
            writer: tokio::io::stdout(),
            pending: Vec::new(),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn read_message(&mut self) -> Result<Option<String>, McpError> {
        read_line_into(&mut self.reader, &mut self.pending).await
    }

    async fn write_message(&mut self, message: &str) -> Result<(), McpError> {
        self.writer.write_all(message.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        self.writer.flush().await?;
        Ok(())
    }
}

/// Read one line into `pending`, returning it once terminated.
///
/// `read_until` appends to `pending` as it goes, so a cancelled call leaves
/// the partial line there for the next one. A final unterminated line is
/// returned at EOF.
async fn read_line_into<R>(reader: &mut R, pending: &mut Vec<u8>) -> Result<Option<String>, McpError>
where
    R: tokio::io::AsyncBufRead + Unpin + Send,
{
    let read = reader.read_until(b'\n', pending).await?;
    if read == 0 && pending.is_empty() {
        return Ok(None);
    }
    let line = std::mem::take(pending);
    let text = String::from_utf8(line).map_err(|e| McpError::ParseError {
        message: format!("message is not valid UTF-8: {e}"),
    })?;
    Ok(Some(text.trim_end().to_string()))
}

// ---------------------------------------------------------------------------
// ChannelTransport
// ---------------------------------------------------------------------------

/// In-process transport backed by tokio mpsc channels, for tests.
pub struct ChannelTransport {
    receiver: mpsc::Receiver<String>,
    sender: mpsc::Sender<String>,
}

impl ChannelTransport {
    pub fn new(receiver: mpsc::Receiver<String>, sender: mpsc::Sender<String>) -> Self {
        Self { receiver, sender }
    }

    /// A linked pair: what one side writes, the other reads.
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(buffer);
        let (tx_b, rx_b) = mpsc::channel(buffer);
        (
            ChannelTransport::new(rx_a, tx_b),
            ChannelTransport::new(rx_b, tx_a),
        )
    }

    pub fn into_parts(self) -> (mpsc::Receiver<String>, mpsc::Sender<String>) {
        (self.receiver, self.sender)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn read_message(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.receiver.recv().await)
    }

    async fn write_message(&mut self, message: &str) -> Result<(), McpError> {
        self.sender
            .send(message.to_string())
            .await
            .map_err(|e| McpError::TransportError {
                message: format!("channel send failed: {e}"),
            })
    }

    async fn close(&mut self) -> Result<(), McpError> {
        self.receiver.close();
        Ok(())
    }
}
