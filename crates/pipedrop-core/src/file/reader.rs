//! Two-level buffered file reader for the sender.
//!
//! Disk reads happen in large batches (`chunk_size * batch_chunks`), each with a
//! single seek + read. Batches are then sliced into network chunks without
//! further I/O. Batches are aligned to whole-batch boundaries of the file, so a
//! reader resumed mid-batch first reads only up to the next boundary.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Error, Result};

/// One network chunk produced by [`StreamingFileReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkChunk {
    /// Chunk bytes, or `None` once the file is exhausted
    pub chunk: Option<Vec<u8>>,
    /// Absolute chunk index over the whole file
    pub chunk_index: u64,
    /// Chunk count over the whole file
    pub total_chunks: u64,
    /// Byte offset of the chunk
    pub file_offset: u64,
    /// Whether this is the final chunk
    pub is_last_chunk: bool,
}

/// Streaming reader that yields fixed-size network chunks.
///
/// Methods take `&mut self`, so a second read cannot start while one is in
/// progress.
#[derive(Debug)]
pub struct StreamingFileReader {
    file: File,
    path: PathBuf,
    file_size: u64,
    chunk_size: usize,
    chunks_per_batch: usize,
    total_chunks: u64,
    /// Offset of the next chunk to emit
    total_file_offset: u64,
    batch: Vec<u8>,
    batch_pos: usize,
    /// Index of the next chunk inside its (aligned) batch
    batch_relative_index: usize,
}

impl StreamingFileReader {
    /// Open a reader starting at the beginning of the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(path: &Path, chunk_size: usize, batch_chunks: usize) -> Result<Self> {
        Self::open_at(path, chunk_size, batch_chunks, 0).await
    }

    /// Open a reader resuming at `start_offset`.
    ///
    /// An offset that is not a multiple of `chunk_size` is rounded down to the
    /// start of its chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open_at(
        path: &Path,
        chunk_size: usize,
        batch_chunks: usize,
        start_offset: u64,
    ) -> Result<Self> {
        if chunk_size == 0 || batch_chunks == 0 {
            return Err(Error::InvalidConfig {
                key: "transfer.chunk_size".to_string(),
                reason: "chunk size and batch size must be non-zero".to_string(),
            });
        }

        let file = File::open(path)
            .await
            .map_err(|e| Error::resource(path, e))?;
        let file_size = file
            .metadata()
            .await
            .map_err(|e| Error::resource(path, e))?
            .len();

        let chunk = chunk_size as u64;
        let start_index = start_offset / chunk;
        if start_offset % chunk != 0 {
            tracing::warn!(
                start_offset,
                chunk_size,
                "Resume offset not chunk-aligned, rounding down"
            );
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            file_size,
            chunk_size,
            chunks_per_batch: batch_chunks,
            total_chunks: file_size.div_ceil(chunk),
            total_file_offset: (start_index * chunk).min(file_size),
            batch: Vec::new(),
            batch_pos: 0,
            batch_relative_index: (start_index % batch_chunks as u64) as usize,
        })
    }

    /// Size of the underlying file.
    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Offset of the next chunk to be emitted.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.total_file_offset
    }

    /// Chunk count over the whole file.
    #[must_use]
    pub const fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Produce the next network chunk.
    ///
    /// Returns a [`NetworkChunk`] with `chunk: None` once the file is exhausted.
    ///
    /// # Errors
    ///
    /// Returns `Error::Resource` if reading the file fails.
    pub async fn next_network_chunk(&mut self) -> Result<NetworkChunk> {
        let chunk_index = self.total_file_offset / self.chunk_size as u64;

        if self.total_file_offset >= self.file_size {
            return Ok(NetworkChunk {
                chunk: None,
                chunk_index,
                total_chunks: self.total_chunks,
                file_offset: self.total_file_offset,
                is_last_chunk: true,
            });
        }

        if self.batch_pos >= self.batch.len() {
            self.read_batch().await?;
        }

        let end = (self.batch_pos + self.chunk_size).min(self.batch.len());
        let data = self.batch[self.batch_pos..end].to_vec();
        let file_offset = self.total_file_offset;

        self.batch_pos = end;
        self.total_file_offset += data.len() as u64;
        self.batch_relative_index = (self.batch_relative_index + 1) % self.chunks_per_batch;

        Ok(NetworkChunk {
            chunk: Some(data),
            chunk_index,
            total_chunks: self.total_chunks,
            file_offset,
            is_last_chunk: self.total_file_offset >= self.file_size,
        })
    }

    async fn read_batch(&mut self) -> Result<()> {
        let chunks_left_in_batch = (self.chunks_per_batch - self.batch_relative_index) as u64;
        let remaining = self.file_size - self.total_file_offset;
        let len = (chunks_left_in_batch * self.chunk_size as u64).min(remaining) as usize;

        self.batch.resize(len, 0);
        self.file
            .seek(SeekFrom::Start(self.total_file_offset))
            .await
            .map_err(|e| Error::resource(&self.path, e))?;
        self.file
            .read_exact(&mut self.batch)
            .await
            .map_err(|e| Error::resource(&self.path, e))?;
        self.batch_pos = 0;

        tracing::trace!(
            offset = self.total_file_offset,
            bytes = len,
            "Read batch from {}",
            self.path.display()
        );
        Ok(())
    }
}
