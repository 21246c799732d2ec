//! Memory-then-disk payload storage.
//!
//! A [`SpoolWriter`] keeps bytes in memory until the configured threshold is
//! crossed, then moves everything written so far into an anonymous temporary
//! file and appends there. [`SpoolWriter::finish`] seals the writer into a
//! [`SpooledPayload`], which is read back from the start exactly once through
//! [`SpooledPayload::into_reader`].
//!
//! Temporary files are created with [`tempfile::tempfile`], so the OS reclaims
//! them as soon as the handle is dropped.

use std::io::SeekFrom;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::Result;

enum Store {
    Memory(Vec<u8>),
    Disk(File),
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory(buf) => f.debug_tuple("Memory").field(&buf.len()).finish(),
            Self::Disk(_) => f.write_str("Disk"),
        }
    }
}

/// Accumulates an upload.
#[derive(Debug)]
pub struct SpoolWriter {
    store: Store,
    threshold: usize,
    len: u64,
}

impl SpoolWriter {
    /// Create a writer that spills to disk past `threshold` bytes.
    #[must_use]
    pub const fn new(threshold: usize) -> Self {
        Self {
            store: Store::Memory(Vec::new()),
            threshold,
            len: 0,
        }
    }

    /// Append `data`.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if let Store::Memory(buf) = &mut self.store {
            if buf.len() + data.len() <= self.threshold {
                buf.extend_from_slice(data);
                self.len += data.len() as u64;
                return Ok(());
            }

            let mut file = File::from_std(tempfile::tempfile()?);
            file.write_all(buf).await?;
            tracing::debug!(bytes = buf.len(), "spool threshold crossed, spilling to disk");
            self.store = Store::Disk(file);
        }

        if let Store::Disk(file) = &mut self.store {
            file.write_all(data).await?;
        }
        self.len += data.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing has been written.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Seal the writer.
    pub async fn finish(self) -> Result<SpooledPayload> {
        let store = match self.store {
            Store::Memory(buf) => Store::Memory(buf),
            Store::Disk(mut file) => {
                file.flush().await?;
                Store::Disk(file)
            }
        };

        Ok(SpooledPayload {
            store,
            len: self.len,
        })
    }
}

/// A fully received payload.
#[derive(Debug)]
pub struct SpooledPayload {
    store: Store,
    len: u64,
}

impl SpooledPayload {
    /// Payload size in bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Whether the payload is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the payload was spilled to a temporary file.
    #[must_use]
    pub const fn is_on_disk(&self) -> bool {
        matches!(self.store, Store::Disk(_))
    }

    /// Consume the payload into a reader positioned at its start.
    pub async fn into_reader(self) -> Result<PayloadReader> {
        let store = match self.store {
            Store::Memory(buf) => Store::Memory(buf),
            Store::Disk(mut file) => {
                file.seek(SeekFrom::Start(0)).await?;
                Store::Disk(file)
            }
        };

        Ok(PayloadReader {
            store,
            pos: 0,
            len: self.len,
        })
    }
}

/// Sequential chunk reader over a [`SpooledPayload`].
#[derive(Debug)]
pub struct PayloadReader {
    store: Store,
    pos: u64,
    len: u64,
}

impl PayloadReader {
    /// Read up to `max` bytes. Returns `None` once the payload is exhausted.
    ///
    /// Chunks are always full-sized except for the last one.
    pub async fn next_chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        let remaining = self.len - self.pos;
        if remaining == 0 || max == 0 {
            return Ok(None);
        }
        let want = usize::try_from(remaining).map_or(max, |r| r.min(max));

        let chunk = match &mut self.store {
            Store::Memory(buf) => {
                let start = self.pos as usize;
                buf[start..start + want].to_vec()
            }
            Store::Disk(file) => {
                let mut chunk = vec![0u8; want];
                file.read_exact(&mut chunk).await?;
                chunk
            }
        };

        self.pos += chunk.len() as u64;
        Ok(Some(chunk))
    }

    /// Bytes returned so far.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.pos
    }

    /// Total payload size.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Whether the payload is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}
