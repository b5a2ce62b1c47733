//! Receiver state: per-peer metadata, folder aggregates, save decisions and
//! the single active reception.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncSeek, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use super::writer::SequencedDiskWriter;
use crate::channel::PeerId;
use crate::error::{Error, Result};
use crate::events::ReceivedFile;
use crate::file::{FileMetadata, FolderRegistry};
use crate::protocol::TextAssembler;

/// Lifecycle of one reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceptionState {
    /// Request sent, no chunk yet
    Requested,
    /// Chunks arriving
    Receiving,
    /// Completion detected, closing out
    Finalizing,
    /// Finalized successfully
    Complete,
    /// Aborted
    Failed,
}

/// Persist-to-disk decisions, made once per file or folder at request time.
#[derive(Debug, Default, Clone)]
pub struct SaveTypeRegistry {
    files: HashMap<String, bool>,
    folders: HashMap<String, bool>,
}

impl SaveTypeRegistry {
    /// Decide for a standalone file. An earlier decision wins.
    pub fn decide_file(&mut self, file_id: &str, to_disk: bool) -> bool {
        *self.files.entry(file_id.to_string()).or_insert(to_disk)
    }

    /// Decide for a folder. An earlier decision wins.
    pub fn decide_folder(&mut self, folder_name: &str, to_disk: bool) -> bool {
        *self.folders.entry(folder_name.to_string()).or_insert(to_disk)
    }
}

/// Result of storing one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// First copy of this chunk
    Stored,
    /// Chunk already received
    Duplicate,
}

/// The file currently being received from a peer.
#[derive(Debug)]
pub struct ActiveReception<W> {
    /// Target file
    pub meta: FileMetadata,
    /// Lifecycle state
    pub state: ReceptionState,
    /// Byte offset the reception resumed from
    pub resume_offset: u64,
    /// Absolute index of the first expected chunk
    pub start_index: u64,
    /// Chunks expected in this session
    pub expected_chunks: usize,
    /// Unique chunks received
    pub received_count: usize,
    /// Payload bytes received in this session
    pub received_bytes: u64,
    /// Distinguishes successive receptions from the same peer
    pub serial: u64,
    /// When the request went out or the last new chunk was stored
    pub last_activity: Instant,
    slots: Vec<Option<Vec<u8>>>,
    presence: Vec<bool>,
    writer: Option<SequencedDiskWriter<W>>,
    notifier: Option<oneshot::Sender<Result<ReceivedFile>>>,
    finalized: bool,
}

impl<W> ActiveReception<W>
where
    W: AsyncWrite + AsyncSeek + Unpin,
{
    /// Create a reception expecting `ceil((size - resume_offset) / chunk_size)` chunks.
    pub fn new(
        meta: FileMetadata,
        chunk_size: usize,
        resume_offset: u64,
        writer: Option<SequencedDiskWriter<W>>,
        notifier: oneshot::Sender<Result<ReceivedFile>>,
    ) -> Self {
        let chunk = chunk_size as u64;
        let expected_chunks = meta.size.saturating_sub(resume_offset).div_ceil(chunk) as usize;
        // Only the memory path keeps payloads.
        let slots = if writer.is_some() {
            Vec::new()
        } else {
            vec![None; expected_chunks]
        };

        Self {
            meta,
            state: ReceptionState::Requested,
            resume_offset,
            start_index: resume_offset / chunk,
            expected_chunks,
            received_count: 0,
            received_bytes: 0,
            serial: 0,
            last_activity: Instant::now(),
            slots,
            presence: vec![false; expected_chunks],
            writer,
            notifier: Some(notifier),
            finalized: false,
        }
    }

    /// Whether the once-only finalize already started.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Store a chunk in its slot or hand it to the disk writer.
    ///
    /// # Errors
    ///
    /// Returns `Error::Resource` if the disk write fails.
    pub async fn store(&mut self, relative: usize, absolute: u64, payload: Vec<u8>) -> Result<StoreOutcome> {
        if self.presence[relative] {
            return Ok(StoreOutcome::Duplicate);
        }

        let len = payload.len() as u64;
        match self.writer.as_mut() {
            Some(writer) => writer.write_chunk(absolute, payload).await?,
            None => self.slots[relative] = Some(payload),
        }

        self.presence[relative] = true;
        self.received_count += 1;
        self.received_bytes += len;
        self.last_activity = Instant::now();
        self.state = ReceptionState::Receiving;
        Ok(StoreOutcome::Stored)
    }

    /// Every expected chunk arrived.
    #[must_use]
    pub fn is_sequence_complete(&self) -> bool {
        self.received_count == self.expected_chunks
    }

    /// Enough bytes arrived to cover the rest of the file.
    #[must_use]
    pub fn is_size_complete(&self) -> bool {
        self.received_bytes >= self.meta.size.saturating_sub(self.resume_offset)
    }

    /// Both completion conditions hold.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.is_sequence_complete() && self.is_size_complete()
    }

    /// Enter finalization. Returns false if it already started.
    pub fn begin_finalize(&mut self) -> bool {
        if self.finalized {
            return false;
        }
        self.finalized = true;
        self.state = ReceptionState::Finalizing;
        true
    }

    /// Bytes of the file present after this session (resume prefix included).
    #[must_use]
    pub fn file_progress(&self) -> u64 {
        self.resume_offset + self.received_bytes
    }

    /// Take the disk writer for closing.
    pub fn take_writer(&mut self) -> Option<SequencedDiskWriter<W>> {
        self.writer.take()
    }

    /// Take the in-memory chunk slots.
    pub fn take_slots(&mut self) -> Vec<Option<Vec<u8>>> {
        std::mem::take(&mut self.slots)
    }

    /// Resolve the completion notifier. Later calls are no-ops.
    pub fn resolve(&mut self, file: ReceivedFile) {
        self.state = ReceptionState::Complete;
        if let Some(notifier) = self.notifier.take() {
            let _ = notifier.send(Ok(file));
        }
    }

    /// Reject the completion notifier. Later calls are no-ops.
    pub fn reject(&mut self, error: Error) {
        self.state = ReceptionState::Failed;
        if let Some(notifier) = self.notifier.take() {
            let _ = notifier.send(Err(error));
        }
    }

    /// Close the disk writer, keeping whatever reached the disk.
    pub async fn close_partial(&mut self) {
        if let Some(writer) = self.writer.take() {
            let written = writer.bytes_written();
            if let Err(e) = writer.close().await {
                tracing::warn!(error = %e, "Failed to close partial file");
            } else {
                tracing::debug!(
                    file_id = %self.meta.file_id,
                    written,
                    "Partial file kept for resume"
                );
            }
        }
    }
}

/// Everything the receiver tracks for one peer.
#[derive(Debug)]
pub struct PeerReceptionState<W> {
    /// Announced files by id, in announcement order
    pub metadata: HashMap<String, FileMetadata>,
    /// Announcement order of file ids
    pub order: Vec<String>,
    /// Folder aggregates of announced members, with bytes present
    pub folders: FolderRegistry,
    file_progress: HashMap<String, u64>,
    /// Save-to-disk decisions
    pub save_types: SaveTypeRegistry,
    /// Pending text message
    pub text: TextAssembler,
    /// Reception in flight
    pub active: Option<ActiveReception<W>>,
}

impl<W> Default for PeerReceptionState<W> {
    fn default() -> Self {
        Self {
            metadata: HashMap::new(),
            order: Vec::new(),
            folders: FolderRegistry::new(),
            file_progress: HashMap::new(),
            save_types: SaveTypeRegistry::default(),
            text: TextAssembler::new(),
            active: None,
        }
    }
}

impl<W> PeerReceptionState<W> {
    /// Record announced metadata. Returns false for a repeated announcement.
    pub fn announce(&mut self, meta: FileMetadata) -> bool {
        if self.metadata.contains_key(&meta.file_id) {
            return false;
        }
        self.folders.record(&meta);
        self.order.push(meta.file_id.clone());
        self.metadata.insert(meta.file_id.clone(), meta);
        true
    }

    /// Record the bytes of a file present locally (resume prefix included)
    /// and carry the change into its folder aggregate.
    pub fn set_file_progress(&mut self, file_id: &str, bytes: u64) {
        let previous = self
            .file_progress
            .insert(file_id.to_string(), bytes)
            .unwrap_or(0);
        let Some(meta) = self.metadata.get(file_id) else {
            return;
        };
        if let Some(folder) = self.folders.get_mut(&meta.folder_name) {
            folder.received_or_sent_size = (folder.received_or_sent_size + bytes).saturating_sub(previous);
        }
    }

    /// Bytes of a file present locally.
    #[must_use]
    pub fn file_progress(&self, file_id: &str) -> u64 {
        self.file_progress.get(file_id).copied().unwrap_or(0)
    }

    /// Bytes present across the members of a folder.
    #[must_use]
    pub fn folder_progress(&self, folder_name: &str) -> u64 {
        self.folders
            .get(folder_name)
            .map_or(0, |folder| folder.received_or_sent_size)
    }

    /// Announced files in announcement order.
    #[must_use]
    pub fn files(&self) -> Vec<FileMetadata> {
        self.order
            .iter()
            .filter_map(|id| self.metadata.get(id).cloned())
            .collect()
    }
}

/// Shared handle to one peer's state.
pub type SharedPeerState<W> = Arc<Mutex<PeerReceptionState<W>>>;

/// Receiver state for every peer, each behind its own lock.
#[derive(Debug)]
pub struct ReceptionStateManager<W> {
    peers: Mutex<HashMap<PeerId, SharedPeerState<W>>>,
}

impl<W> Default for ReceptionStateManager<W> {
    fn default() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }
}

impl<W> ReceptionStateManager<W> {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State of a peer, created on first reference.
    pub async fn peer(&self, peer: &PeerId) -> SharedPeerState<W> {
        let mut peers = self.peers.lock().await;
        Arc::clone(peers.entry(peer.clone()).or_default())
    }

    /// State of a peer if it exists.
    pub async fn existing(&self, peer: &PeerId) -> Option<SharedPeerState<W>> {
        self.peers.lock().await.get(peer).cloned()
    }

    /// Remove a peer's state.
    pub async fn remove(&self, peer: &PeerId) -> Option<SharedPeerState<W>> {
        self.peers.lock().await.remove(peer)
    }

    /// Remove every peer's state.
    pub async fn drain(&self) -> Vec<(PeerId, SharedPeerState<W>)> {
        self.peers.lock().await.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    type Reception = ActiveReception<Cursor<Vec<u8>>>;

    fn reception(size: u64, chunk: usize, resume: u64) -> (Reception, oneshot::Receiver<Result<ReceivedFile>>) {
        let (tx, rx) = oneshot::channel();
        let meta = FileMetadata::new("a.bin", size, "", "a.bin", "");
        (ActiveReception::new(meta, chunk, resume, None, tx), rx)
    }

    #[test]
    fn test_expected_chunks_from_resume() {
        let (fresh, _rx) = reception(200_000, 65_536, 0);
        assert_eq!(fresh.expected_chunks, 4);
        assert_eq!(fresh.start_index, 0);

        let (resumed, _rx) = reception(200_000, 65_536, 131_072);
        assert_eq!(resumed.expected_chunks, 2);
        assert_eq!(resumed.start_index, 2);
        assert_eq!(resumed.file_progress(), 131_072);
    }

    #[test]
    fn test_resume_alignment_for_many_sizes() {
        let chunk = 1000usize;
        for size in [1u64, 999, 1000, 1001, 5500, 10_000] {
            for existing in 0..size {
                let resume = existing / chunk as u64 * chunk as u64;
                let (r, _rx) = reception(size, chunk, resume);
                assert_eq!(r.resume_offset % chunk as u64, 0);
                assert_eq!(
                    r.expected_chunks as u64,
                    (size - resume).div_ceil(chunk as u64)
                );
            }
        }
    }

    #[tokio::test]
    async fn test_completion_needs_count_and_bytes() {
        let (mut r, _rx) = reception(10, 4, 0);
        assert_eq!(r.expected_chunks, 3);

        r.store(0, 0, vec![0; 4]).await.unwrap();
        r.store(1, 1, vec![0; 4]).await.unwrap();
        assert!(!r.is_complete());
        assert_eq!(r.store(1, 1, vec![0; 4]).await.unwrap(), StoreOutcome::Duplicate);
        assert_eq!(r.received_count, 2);

        // count complete but bytes short
        r.store(2, 2, vec![0; 1]).await.unwrap();
        assert!(r.is_sequence_complete());
        assert!(!r.is_size_complete());
        assert!(!r.is_complete());
    }

    #[tokio::test]
    async fn test_finalize_once_and_notify_once() {
        let (mut r, rx) = reception(4, 4, 0);
        r.store(0, 0, vec![1; 4]).await.unwrap();
        assert!(r.is_complete());

        assert!(r.begin_finalize());
        assert!(!r.begin_finalize());
        assert_eq!(r.state, ReceptionState::Finalizing);

        r.reject(Error::Cancelled);
        r.reject(Error::Cancelled);
        assert_eq!(r.state, ReceptionState::Failed);
        assert!(matches!(rx.await, Ok(Err(Error::Cancelled))));
    }

    #[test]
    fn test_save_type_decided_once() {
        let mut registry = SaveTypeRegistry::default();
        assert!(registry.decide_file("a", true));
        assert!(registry.decide_file("a", false));
        assert!(!registry.decide_folder("pics", false));
        assert!(!registry.decide_folder("pics", true));
        // decisions are per file
        assert!(!registry.decide_file("b", false));
    }

    #[test]
    fn test_duplicate_announcement_ignored() {
        let mut state = PeerReceptionState::<Cursor<Vec<u8>>>::default();
        let meta = FileMetadata::new("a", 100, "", "pics/a", "pics");

        assert!(state.announce(meta.clone()));
        assert!(!state.announce(meta));
        assert_eq!(state.files().len(), 1);
        assert_eq!(state.folders.get("pics").map(|f| f.total_size), Some(100));
    }

    #[test]
    fn test_folder_progress_sums_members() {
        let mut state = PeerReceptionState::<Cursor<Vec<u8>>>::default();
        let a = FileMetadata::new("a", 100, "", "pics/a", "pics");
        let b = FileMetadata::new("b", 50, "", "pics/b", "pics");
        state.announce(a.clone());
        state.announce(b.clone());

        state.set_file_progress(&a.file_id, 100);
        state.set_file_progress(&b.file_id, 10);
        state.set_file_progress(&b.file_id, 30);
        assert_eq!(state.folder_progress("pics"), 130);
        assert_eq!(state.folders.get("pics").map(|f| f.received_or_sent_size), Some(130));
        assert_eq!(state.file_progress(&b.file_id), 30);
        assert_eq!(state.folder_progress("other"), 0);
    }
}
