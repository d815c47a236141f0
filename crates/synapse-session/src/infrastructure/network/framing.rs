//! Frame-level I/O over any async byte stream.
//!
//! [`FrameReader`] accumulates bytes until the codec can decode a whole
//! frame, so a frame split across many TCP segments (or several frames in
//! one segment) is handled transparently.  [`FrameWriter`] numbers outgoing
//! frames with its own [`SequenceCounter`].
//!
//! # Cancel safety
//!
//! [`FrameReader::next_message`] may be dropped at any `.await` (for example
//! when it loses a `tokio::select!` race) without losing data: bytes already
//! read stay in the reader's buffer and are used by the next call.

use std::io;

use synapse_core::protocol::{decode_message, encode_message_now, SequenceCounter};
use synapse_core::{ProtocolError, SessionMessage};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 4096;

/// Errors raised while reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Reads whole [`SessionMessage`] frames from a byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Returns the next frame, or `None` if the peer closed the stream
    /// cleanly between frames.
    ///
    /// # Errors
    ///
    /// - [`FrameError::Protocol`] if the buffered bytes are not a valid frame.
    /// - [`FrameError::Io`] on socket errors, including EOF in the middle of
    ///   a frame (`UnexpectedEof`).
    pub async fn next_message(&mut self) -> Result<Option<SessionMessage>, FrameError> {
        loop {
            match decode_message(&self.buf) {
                Ok((msg, consumed)) => {
                    self.buf.drain(..consumed);
                    return Ok(Some(msg));
                }
                Err(ProtocolError::InsufficientData { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed with {} bytes of a partial frame", self.buf.len()),
                )
                .into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Number of bytes received but not yet decoded.
    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Writes [`SessionMessage`] frames to a byte stream.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    seq: SequenceCounter,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            seq: SequenceCounter::new(),
        }
    }

    /// Encodes `msg` with the next sequence number and flushes it.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Io`] if the socket write fails.
    pub async fn send(&mut self, msg: &SessionMessage) -> Result<(), FrameError> {
        let bytes = encode_message_now(msg, self.seq.next())?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Number of frames sent so far.
    #[cfg(test)]
    pub fn frames_sent(&self) -> u64 {
        self.seq.current()
    }

    /// Shuts down the write half so the peer sees EOF.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
