//! Storage for received files.
//!
//! The receiver only needs three things from its storage: the size of a
//! partial file left by an earlier attempt, a writable sink positioned at a
//! resume offset, and a printable location for diagnostics. [`FsStorage`]
//! provides them on a local directory.

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite};

use crate::error::{Error, Result};
use crate::file::sanitize_path;

/// Disk-backed hierarchical storage.
///
/// Paths are `/`-separated and relative to the storage root.
pub trait Storage: Send + Sync + 'static {
    /// Writable, seekable handle to one file.
    type Sink: AsyncWrite + AsyncSeek + Unpin + Send + 'static;

    /// Size of an existing file, or `None` if there is none.
    fn existing_size(&self, relative: &str) -> impl Future<Output = Result<Option<u64>>> + Send;

    /// Open a sink positioned at `offset`.
    ///
    /// Missing parents are created. Bytes at or after `offset` are discarded so
    /// a resumed file never carries stale data past the write cursor.
    fn open_sink(
        &self,
        relative: &str,
        offset: u64,
    ) -> impl Future<Output = Result<Self::Sink>> + Send;

    /// Location of a file, for error reports and events.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPath` if the path would escape the storage root.
    fn locate(&self, relative: &str) -> Result<PathBuf>;
}

/// Storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Create storage rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let relative: PathBuf = relative.split('/').filter(|p| !p.is_empty()).collect();
        if relative.as_os_str().is_empty() {
            return Err(Error::InvalidPath("empty file path".to_string()));
        }
        sanitize_path(&self.root, &relative).ok_or_else(|| {
            Error::InvalidPath(format!(
                "'{}' escapes the output directory",
                relative.display()
            ))
        })
    }
}

impl Storage for FsStorage {
    type Sink = File;

    async fn existing_size(&self, relative: &str) -> Result<Option<u64>> {
        let path = self.resolve(relative)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Err(Error::InvalidPath(format!(
                "{} exists and is not a file",
                path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::resource(path, e)),
        }
    }

    async fn open_sink(&self, relative: &str, offset: u64) -> Result<File> {
        let path = self.resolve(relative)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::resource(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| Error::resource(&path, e))?;

        file.set_len(offset)
            .await
            .map_err(|e| Error::resource(&path, e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::resource(&path, e))?;

        tracing::debug!(offset, "Opened sink {}", path.display());
        Ok(file)
    }

    fn locate(&self, relative: &str) -> Result<PathBuf> {
        self.resolve(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_existing_size() {
        let dir = TempDir::new().expect("temp dir");
        let storage = FsStorage::new(dir.path());

        assert_eq!(storage.existing_size("a/b.bin").await.unwrap(), None);

        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/b.bin"), vec![0u8; 1234]).unwrap();
        assert_eq!(storage.existing_size("a/b.bin").await.unwrap(), Some(1234));
    }

    #[tokio::test]
    async fn test_open_sink_truncates_to_offset() {
        let dir = TempDir::new().expect("temp dir");
        let storage = FsStorage::new(dir.path());
        std::fs::write(dir.path().join("f.bin"), b"0123456789").unwrap();

        let mut sink = storage.open_sink("f.bin", 4).await.expect("open");
        sink.write_all(b"ab").await.unwrap();
        sink.shutdown().await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), b"0123ab");
    }

    #[tokio::test]
    async fn test_open_sink_creates_parents() {
        let dir = TempDir::new().expect("temp dir");
        let storage = FsStorage::new(dir.path().join("out"));

        let mut sink = storage.open_sink("album/nested/x.txt", 0).await.expect("open");
        sink.write_all(b"hi").await.unwrap();
        sink.shutdown().await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("out/album/nested/x.txt")).unwrap(),
            b"hi"
        );
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = TempDir::new().expect("temp dir");
        let storage = FsStorage::new(dir.path());

        assert!(matches!(
            storage.open_sink("../evil.txt", 0).await,
            Err(Error::InvalidPath(_))
        ));
        assert!(storage.locate("").is_err());
        assert!(storage.locate("ok/file.txt").is_ok());
    }
}
