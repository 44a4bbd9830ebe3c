//! Inbound frame extraction.
//!
//! Bytes read from the socket accumulate in a buffer; every complete
//! `\n`-terminated run is split off, decoded lossily and trimmed. An
//! undelimited tail stays buffered until a later read completes it, so
//! a line split across reads comes out exactly as if it had arrived whole.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::error::AgentError;
use crate::protocol::DELIMITER;

/// Lazy, ordered source of decoded command lines.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader issuing reads of at most `read_size` bytes.
    pub fn new(reader: R, read_size: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(read_size),
            chunk: vec![0u8; read_size.max(1)],
        }
    }

    /// Next decoded line.
    ///
    /// `Ok(None)` once the peer closes the connection; any bytes left
    /// without a delimiter at that point are dropped. Cancel safe: a
    /// dropped call loses no buffered or already-read bytes.
    pub async fn next_frame(&mut self) -> Result<Option<String>, AgentError> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }

            let n = self
                .reader
                .read(&mut self.chunk)
                .await
                .map_err(AgentError::Read)?;
            if n == 0 {
                if self.pending() > 0 {
                    trace!(
                        dropped = self.pending(),
                        "Discarding undelimited tail at end of stream"
                    );
                }
                return Ok(None);
            }

            self.buffer.extend_from_slice(&self.chunk[..n]);
        }
    }

    /// Bytes held back waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = find_delimiter(&self.buffer)?;
        let line = decode_line(&self.buffer[..pos]);
        self.buffer.advance(pos + 1);
        Some(line)
    }
}

/// Lossy decode: invalid UTF-8 becomes U+FFFD, never an error.
fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim().to_string()
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == DELIMITER)
}
