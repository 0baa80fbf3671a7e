//! Positioned stream over a blob item.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::domain::options::StreamMode;
use crate::domain::ports::CacheStrategy;
use crate::error::{Error, Result};

/// An open stream on one key.
///
/// Reads and writes advance the position. Close the stream explicitly;
/// dropping it without closing leaves the server-side handle to expire.
pub struct CacheStream {
    strategy: Arc<dyn CacheStrategy>,
    key: String,
    handle: String,
    mode: StreamMode,
    position: u64,
    closed: bool,
}

impl CacheStream {
    pub(crate) fn new(strategy: Arc<dyn CacheStrategy>, key: String, handle: String, mode: StreamMode) -> Self {
        Self {
            strategy,
            key,
            handle,
            mode,
            position: 0,
            closed: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn can_write(&self) -> bool {
        self.mode == StreamMode::Write && !self.closed
    }

    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::OperationFailed(format!("stream on '{}' is closed", self.key)));
        }
        Ok(())
    }

    /// Read up to `length` bytes from the current position.
    pub async fn read(&mut self, length: usize) -> Result<Bytes> {
        self.ensure_open()?;
        let data = self
            .strategy
            .read_from_stream(&self.key, &self.handle, self.position, length)
            .await?;
        self.position += data.len() as u64;
        Ok(data)
    }

    /// Read from the current position to the end.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let remaining = self.length().await?.saturating_sub(self.position);
        self.read(remaining as usize).await
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if self.mode != StreamMode::Write {
            return Err(Error::InvalidArgument(format!(
                "stream on '{}' was not opened for writing",
                self.key
            )));
        }
        self.strategy
            .write_to_stream(&self.key, &self.handle, self.position, Bytes::copy_from_slice(data))
            .await?;
        self.position += data.len() as u64;
        Ok(())
    }

    pub async fn length(&self) -> Result<u64> {
        self.ensure_open()?;
        self.strategy.get_stream_length(&self.key, &self.handle).await
    }

    /// Release the stream. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!(key = %self.key, handle = %self.handle, "Closing cache stream");
        self.strategy.close_stream(&self.key, &self.handle).await
    }
}

impl Drop for CacheStream {
    fn drop(&mut self) {
        if !self.closed {
            warn!(key = %self.key, "Cache stream dropped without close");
        }
    }
}

impl std::fmt::Debug for CacheStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStream")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("position", &self.position)
            .field("closed", &self.closed)
            .finish()
    }
}
