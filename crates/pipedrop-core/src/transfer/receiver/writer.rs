//! Strictly ordered disk writes with a bounded reorder buffer.
//!
//! Chunks are appended at the write cursor as long as they arrive in order.
//! A chunk from the future waits in the reorder buffer; when the buffer is
//! full, its oldest entry is written out of order at its own offset (seek,
//! write, seek back) to make room. Chunks behind the cursor are discarded.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Ordered writer in front of a seekable sink.
#[derive(Debug)]
pub struct SequencedDiskWriter<W> {
    sink: W,
    location: PathBuf,
    chunk_size: u64,
    next_write_index: u64,
    buffer: BTreeMap<u64, Vec<u8>>,
    capacity: usize,
    /// Indexes ahead of the cursor that were force-written
    flushed_ahead: BTreeSet<u64>,
    bytes_written: u64,
}

impl<W> SequencedDiskWriter<W>
where
    W: AsyncWrite + AsyncSeek + Unpin,
{
    /// Wrap a sink positioned at `start_index * chunk_size`.
    pub fn new(
        sink: W,
        location: impl Into<PathBuf>,
        chunk_size: usize,
        start_index: u64,
        capacity: usize,
    ) -> Self {
        Self {
            sink,
            location: location.into(),
            chunk_size: chunk_size as u64,
            next_write_index: start_index,
            buffer: BTreeMap::new(),
            capacity: capacity.max(1),
            flushed_ahead: BTreeSet::new(),
            bytes_written: 0,
        }
    }

    /// Index the writer expects next.
    #[must_use]
    pub const fn next_write_index(&self) -> u64 {
        self.next_write_index
    }

    /// Indexes waiting in the reorder buffer, in order.
    #[must_use]
    pub fn buffered_indices(&self) -> Vec<u64> {
        self.buffer.keys().copied().collect()
    }

    /// Bytes written to the sink so far.
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Where the sink writes to.
    #[must_use]
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Write chunk `index`, in order or via the reorder buffer.
    ///
    /// # Errors
    ///
    /// Returns `Error::Resource` if the sink fails.
    pub async fn write_chunk(&mut self, index: u64, data: Vec<u8>) -> Result<()> {
        if index < self.next_write_index
            || self.flushed_ahead.contains(&index)
            || self.buffer.contains_key(&index)
        {
            tracing::trace!(chunk_index = index, "Discarding stale chunk");
            return Ok(());
        }

        if index == self.next_write_index {
            self.append(&data).await?;
            self.next_write_index += 1;
            return self.drain().await;
        }

        if self.buffer.len() >= self.capacity {
            self.force_write_oldest().await?;
        }
        self.buffer.insert(index, data);
        Ok(())
    }

    /// Flush buffered chunks to their offsets and close the sink.
    ///
    /// Errors from a sink that is already shutting down are ignored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Resource` for any other sink failure.
    pub async fn close(mut self) -> Result<()> {
        let result = self.flush_and_shutdown().await;
        match result {
            Err(e) if matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::NotConnected) => {
                tracing::debug!(error = %e, "Sink already closing, ignoring");
                Ok(())
            }
            Err(e) => Err(Error::resource(&self.location, e)),
            Ok(()) => Ok(()),
        }
    }

    async fn flush_and_shutdown(&mut self) -> std::io::Result<()> {
        let buffered = std::mem::take(&mut self.buffer);
        for (index, data) in buffered {
            self.sink
                .seek(SeekFrom::Start(index * self.chunk_size))
                .await?;
            self.sink.write_all(&data).await?;
            self.bytes_written += data.len() as u64;
        }
        self.sink.flush().await?;
        self.sink.shutdown().await
    }

    async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.sink
            .write_all(data)
            .await
            .map_err(|e| Error::resource(&self.location, e))?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        let mut skipped = false;
        loop {
            if self.flushed_ahead.remove(&self.next_write_index) {
                self.next_write_index += 1;
                skipped = true;
                continue;
            }
            let Some(data) = self.buffer.remove(&self.next_write_index) else {
                break;
            };
            if skipped {
                self.seek_to_cursor().await?;
                skipped = false;
            }
            self.append(&data).await?;
            self.next_write_index += 1;
        }
        if skipped {
            self.seek_to_cursor().await?;
        }
        Ok(())
    }

    async fn force_write_oldest(&mut self) -> Result<()> {
        let Some((index, data)) = self.buffer.pop_first() else {
            return Ok(());
        };
        tracing::debug!(
            chunk_index = index,
            next = self.next_write_index,
            "Reorder buffer full, writing chunk out of order"
        );

        let location = &self.location;
        self.sink
            .seek(SeekFrom::Start(index * self.chunk_size))
            .await
            .map_err(|e| Error::resource(location, e))?;
        self.sink
            .write_all(&data)
            .await
            .map_err(|e| Error::resource(location, e))?;
        self.bytes_written += data.len() as u64;
        self.flushed_ahead.insert(index);

        self.seek_to_cursor().await
    }

    async fn seek_to_cursor(&mut self) -> Result<()> {
        self.sink
            .seek(SeekFrom::Start(self.next_write_index * self.chunk_size))
            .await
            .map_err(|e| Error::resource(&self.location, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Cursor sink that records the offset of every write.
    #[derive(Default)]
    struct RecordingSink {
        inner: Cursor<Vec<u8>>,
        writes: Vec<u64>,
        fail_with: Option<ErrorKind>,
    }

    impl AsyncWrite for RecordingSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if let Some(kind) = self.fail_with {
                return Poll::Ready(Err(std::io::Error::from(kind)));
            }
            let position = self.inner.position();
            self.writes.push(position);
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl AsyncSeek for RecordingSink {
        fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
            Pin::new(&mut self.inner).start_seek(position)
        }

        fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
            Pin::new(&mut self.inner).poll_complete(cx)
        }
    }

    fn chunk(index: u64) -> Vec<u8> {
        vec![index as u8 + 1; 4]
    }

    #[tokio::test]
    async fn test_in_order_writes_are_sequential() {
        let mut writer = SequencedDiskWriter::new(RecordingSink::default(), "t", 4, 0, 3);
        for index in 0..4 {
            writer.write_chunk(index, chunk(index)).await.unwrap();
        }

        assert_eq!(writer.next_write_index(), 4);
        assert_eq!(writer.sink.writes, vec![0, 4, 8, 12]);
        assert_eq!(
            writer.sink.inner.get_ref(),
            &[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4]
        );
    }

    #[tokio::test]
    async fn test_reorder_scenario() {
        // resume at chunk 3, capacity 3
        let mut sink = RecordingSink::default();
        sink.inner.set_position(12);
        let mut writer = SequencedDiskWriter::new(sink, "t", 4, 3, 3);

        writer.write_chunk(5, chunk(5)).await.unwrap();
        assert_eq!(writer.buffered_indices(), vec![5]);
        assert!(writer.sink.writes.is_empty());

        writer.write_chunk(3, chunk(3)).await.unwrap();
        writer.write_chunk(4, chunk(4)).await.unwrap();
        assert_eq!(writer.sink.writes, vec![12, 16, 20]);
        assert_eq!(writer.next_write_index(), 6);

        writer.write_chunk(7, chunk(7)).await.unwrap();
        assert_eq!(writer.buffered_indices(), vec![7]);
        assert_eq!(writer.sink.writes.len(), 3);

        writer.write_chunk(6, chunk(6)).await.unwrap();
        assert_eq!(writer.sink.writes, vec![12, 16, 20, 24, 28]);
        assert!(writer.buffered_indices().is_empty());
        assert_eq!(writer.next_write_index(), 8);
    }

    #[tokio::test]
    async fn test_full_buffer_forces_oldest_by_seek() {
        let mut writer = SequencedDiskWriter::new(RecordingSink::default(), "t", 4, 0, 2);

        writer.write_chunk(2, chunk(2)).await.unwrap();
        writer.write_chunk(3, chunk(3)).await.unwrap();
        // buffer full: chunk 2 is written at its own offset
        writer.write_chunk(4, chunk(4)).await.unwrap();
        assert_eq!(writer.sink.writes, vec![8]);
        assert_eq!(writer.buffered_indices(), vec![3, 4]);
        assert_eq!(writer.sink.inner.position(), 0);

        writer.write_chunk(0, chunk(0)).await.unwrap();
        writer.write_chunk(1, chunk(1)).await.unwrap();
        // 2 was already on disk, so 3 and 4 follow after a seek
        assert_eq!(writer.sink.writes, vec![8, 0, 4, 12, 16]);
        assert_eq!(writer.next_write_index(), 5);

        let expected: Vec<u8> = (1..=5u8).flat_map(|i| [i; 4]).collect();
        assert_eq!(writer.sink.inner.get_ref(), &expected);
    }

    #[tokio::test]
    async fn test_stale_and_duplicate_chunks_discarded() {
        let mut writer = SequencedDiskWriter::new(RecordingSink::default(), "t", 4, 0, 3);

        writer.write_chunk(0, chunk(0)).await.unwrap();
        writer.write_chunk(0, chunk(9)).await.unwrap();
        writer.write_chunk(2, chunk(2)).await.unwrap();
        writer.write_chunk(2, chunk(9)).await.unwrap();

        assert_eq!(writer.sink.writes, vec![0]);
        assert_eq!(writer.buffered_indices(), vec![2]);
        assert_eq!(writer.bytes_written(), 4);
    }

    #[tokio::test]
    async fn test_close_flushes_buffer_to_offsets() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("out.bin");
        let file = tokio::fs::File::create(&path).await.expect("create");

        let mut writer = SequencedDiskWriter::new(file, &path, 4, 0, 10);
        writer.write_chunk(0, chunk(0)).await.unwrap();
        writer.write_chunk(3, chunk(3)).await.unwrap();
        writer.write_chunk(2, chunk(2)).await.unwrap();
        assert_eq!(writer.buffered_indices(), vec![2, 3]);
        writer.close().await.expect("close");

        let content = std::fs::read(&path).expect("read");
        assert_eq!(content.len(), 16);
        assert_eq!(&content[0..4], &[1; 4]);
        // chunk 1 never arrived
        assert_eq!(&content[4..8], &[0; 4]);
        assert_eq!(&content[8..12], &[3; 4]);
        assert_eq!(&content[12..16], &[4; 4]);
    }

    #[tokio::test]
    async fn test_close_swallows_closing_errors() {
        let mut writer = SequencedDiskWriter::new(RecordingSink::default(), "t", 4, 0, 10);
        writer.write_chunk(1, chunk(1)).await.unwrap();
        writer.sink.fail_with = Some(ErrorKind::BrokenPipe);
        writer.close().await.expect("closing errors ignored");

        let mut writer = SequencedDiskWriter::new(RecordingSink::default(), "t", 4, 0, 10);
        writer.write_chunk(1, chunk(1)).await.unwrap();
        writer.sink.fail_with = Some(ErrorKind::PermissionDenied);
        assert!(matches!(writer.close().await, Err(Error::Resource { .. })));
    }

    #[tokio::test]
    async fn test_write_error_is_resource_error() {
        let sink = RecordingSink {
            fail_with: Some(ErrorKind::Other),
            ..RecordingSink::default()
        };
        let mut writer = SequencedDiskWriter::new(sink, "dir/file.bin", 4, 0, 10);

        match writer.write_chunk(0, chunk(0)).await {
            Err(Error::Resource { path, .. }) => assert_eq!(path, PathBuf::from("dir/file.bin")),
            other => panic!("expected resource error, got {other:?}"),
        }
    }
}
