//! Shared write half of a connection.
//!
//! Every outbound frame goes through one [`FrameWriter`]. The write half sits
//! behind an async mutex so that:
//!
//! - concurrent senders never interleave bytes of two frames
//! - [`FrameWriter::shutdown`] waits for an in-flight write before closing
//! - a write after shutdown fails with `NotConnected` instead of touching a
//!   released stream
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► Mutex<Option<BoxedWriter>> ─► Stream
//! Caller N ─┘
//! ```

use std::fmt;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{Result, SpheroError};
use crate::protocol::Frame;

/// Type-erased write half of a device stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Serialized access to the write half of a connection.
#[derive(Default)]
pub struct FrameWriter {
    inner: Mutex<Option<BoxedWriter>>,
}

impl FrameWriter {
    /// Create a writer with no stream installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the write half of a freshly opened stream.
    ///
    /// A previously installed writer is dropped without shutdown.
    pub async fn install<W>(&self, writer: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        *self.inner.lock().await = Some(Box::new(writer));
    }

    /// Write one encoded frame and flush it.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// - [`SpheroError::NotConnected`] if no stream is installed
    /// - [`SpheroError::TransportClosed`] if the stream rejects the write
    pub async fn write_frame(&self, frame: &Frame) -> Result<usize> {
        self.write_bytes(&frame.encode()).await
    }

    /// Write pre-encoded bytes and flush them.
    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<usize> {
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(SpheroError::NotConnected)?;

        if let Err(e) = write_and_flush(writer, bytes).await {
            tracing::error!("Frame write failed: {}", e);
            return Err(SpheroError::TransportClosed);
        }
        Ok(bytes.len())
    }

    /// Take the write half and shut it down.
    ///
    /// Waits for any in-flight write to finish first. Returns `false` if no
    /// stream was installed.
    pub async fn shutdown(&self) -> bool {
        let taken = self.inner.lock().await.take();
        match taken {
            Some(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("Write half shutdown failed: {}", e);
                }
                true
            }
            None => false,
        }
    }

    /// Check if a stream is installed.
    pub async fn is_installed(&self) -> bool {
        self.inner.lock().await.is_some()
    }
}

impl fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let installed = self.inner.try_lock().map(|guard| guard.is_some()).ok();
        f.debug_struct("FrameWriter")
            .field("installed", &installed)
            .finish()
    }
}

async fn write_and_flush(writer: &mut BoxedWriter, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}
