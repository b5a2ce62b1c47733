//! Validation of incoming chunk packets.

use crate::error::{Error, Result};
use crate::protocol::{decode_chunk_packet, ChunkPacket};

/// Parses chunk packets and maps them onto the active reception.
#[derive(Debug, Clone, Copy)]
pub struct ChunkProcessor {
    chunk_size: usize,
}

impl ChunkProcessor {
    /// Create a processor for the configured chunk size.
    #[must_use]
    pub const fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    /// Decode a packet.
    ///
    /// A payload whose length differs from the declared `chunkSize` is kept;
    /// the received length is what counts.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedPacket` if the packet cannot be parsed.
    pub fn decode(&self, data: &[u8]) -> Result<ChunkPacket> {
        let packet = decode_chunk_packet(data)?;
        if packet.payload.len() as u64 != packet.meta.chunk_size {
            tracing::warn!(
                file_id = %packet.meta.file_id,
                chunk_index = packet.meta.chunk_index,
                declared = packet.meta.chunk_size,
                actual = packet.payload.len(),
                "Chunk payload length differs from declared size"
            );
        }
        if packet.payload.len() > self.chunk_size {
            return Err(Error::MalformedPacket(format!(
                "chunk {} carries {} bytes, more than the {} byte chunk size",
                packet.meta.chunk_index,
                packet.payload.len(),
                self.chunk_size
            )));
        }
        Ok(packet)
    }

    /// Check the packet belongs to the file being received.
    ///
    /// # Errors
    ///
    /// Returns `Error::FileMismatch` for a packet of another file.
    pub fn check_file(packet: &ChunkPacket, active_file_id: &str) -> Result<()> {
        if packet.meta.file_id == active_file_id {
            Ok(())
        } else {
            Err(Error::FileMismatch {
                expected: active_file_id.to_string(),
                actual: packet.meta.file_id.clone(),
            })
        }
    }

    /// Session-relative slot of an absolute chunk index.
    ///
    /// `None` means the chunk lies outside `[0, expected_chunks)` for a
    /// reception resumed at `resume_offset` and should be dropped.
    #[must_use]
    pub fn relative_index(&self, absolute: u64, resume_offset: u64, expected_chunks: usize) -> Option<usize> {
        let start = resume_offset / self.chunk_size as u64;
        let relative = usize::try_from(absolute.checked_sub(start)?).ok()?;
        (relative < expected_chunks).then_some(relative)
    }
}
