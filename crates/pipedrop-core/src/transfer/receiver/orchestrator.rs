//! Receiver entry point.
//!
//! Requests announced files (resuming from partial files on disk), feeds
//! incoming chunk packets into the active reception and finalizes it exactly
//! once: the disk sink is closed or the chunks are assembled in memory, the
//! sender gets a `fileReceiveComplete` receipt and the caller's pending
//! request resolves. A reception that stops receiving chunks is aborted
//! after `transfer.receive_idle_timeout`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use super::assembler::FileAssembler;
use super::chunk::ChunkProcessor;
use super::processor::MessageProcessor;
use super::state::{
    ActiveReception, PeerReceptionState, ReceptionState, ReceptionStateManager, StoreOutcome,
};
use super::writer::SequencedDiskWriter;
use crate::channel::{PeerChannel, PeerId};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventSink, ReceivedContent, ReceivedFile, SessionEvent};
use crate::file::{FileMetadata, FolderAggregate};
use crate::protocol::ControlMessage;
use crate::storage::Storage;
use crate::transfer::{send_control, ProgressTarget, ProgressTracker, TransferDirection};

/// A requested file whose bytes are on their way.
#[derive(Debug)]
pub struct PendingReception {
    /// Requested file
    pub file_id: String,
    /// Offset the request resumed from
    pub resume_offset: u64,
    /// Chunks expected in this session
    pub expected_chunks: usize,
    rx: oneshot::Receiver<Result<ReceivedFile>>,
}

impl PendingReception {
    /// Wait until the file is finalized or the reception fails.
    ///
    /// # Errors
    ///
    /// Returns the error that aborted the reception, `Error::PeerGone` if the
    /// peer disconnected and `Error::Cancelled` if the session was closed.
    pub async fn wait(self) -> Result<ReceivedFile> {
        self.rx.await.map_err(|_| Error::Cancelled)?
    }
}

/// Outcome of [`ReceiveOrchestrator::request_file`].
#[derive(Debug)]
pub enum RequestOutcome {
    /// The file was already complete on disk; nothing was requested
    AlreadyComplete(ReceivedFile),
    /// A request was sent
    Pending(PendingReception),
}

/// Summary of a completed folder request.
#[derive(Debug, Clone)]
pub struct FolderReceipt {
    /// Folder name
    pub folder_name: String,
    /// Members received (or already complete), in request order
    pub completed_file_ids: Vec<String>,
    /// The received members
    pub files: Vec<ReceivedFile>,
    /// Whether every member was persisted to disk
    pub all_store_updated: bool,
}

struct ReceiverInner<S: Storage> {
    channel: Arc<dyn PeerChannel>,
    storage: S,
    config: Config,
    state: Arc<ReceptionStateManager<S::Sink>>,
    processor: MessageProcessor<S::Sink>,
    chunks: ChunkProcessor,
    assembler: FileAssembler,
    progress: Mutex<ProgressTracker>,
    events: EventSink,
    next_serial: AtomicU64,
}

/// Public entry point of the receiving pipeline.
///
/// Cheap to clone; clones share state.
pub struct ReceiveOrchestrator<S: Storage> {
    inner: Arc<ReceiverInner<S>>,
}

impl<S: Storage> Clone for ReceiveOrchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Storage> std::fmt::Debug for ReceiveOrchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveOrchestrator")
            .field("config", &self.inner.config.transfer)
            .finish_non_exhaustive()
    }
}

impl<S: Storage> ReceiveOrchestrator<S> {
    /// Create the receiver on top of `channel`, persisting into `storage`.
    pub fn new(config: &Config, channel: Arc<dyn PeerChannel>, storage: S, events: EventSink) -> Self {
        let state = Arc::new(ReceptionStateManager::new());
        Self {
            inner: Arc::new(ReceiverInner {
                processor: MessageProcessor::new(Arc::clone(&state), events.clone()),
                chunks: ChunkProcessor::new(config.transfer.chunk_size),
                assembler: FileAssembler::from_config(&config.transfer),
                progress: Mutex::new(ProgressTracker::new(
                    TransferDirection::Receive,
                    &config.progress,
                )),
                channel,
                storage,
                config: config.clone(),
                state,
                events,
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    /// Storage received files are written to.
    #[must_use]
    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    /// Handle an announcement or text message from `peer`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProtocolViolation` for messages the receiver rejects.
    pub async fn handle_control(&self, peer: &PeerId, message: ControlMessage) -> Result<()> {
        self.inner.processor.process(peer, message).await
    }

    /// Files announced by `peer`, in announcement order.
    pub async fn available_files(&self, peer: &PeerId) -> Vec<FileMetadata> {
        match self.inner.state.existing(peer).await {
            Some(state) => state.lock().await.files(),
            None => Vec::new(),
        }
    }

    /// Folder aggregate announced by `peer`.
    pub async fn folder(&self, peer: &PeerId, folder_name: &str) -> Option<FolderAggregate> {
        let state = self.inner.state.existing(peer).await?;
        let state = state.lock().await;
        state.folders.get(folder_name).cloned()
    }

    /// State of the reception in flight from `peer`.
    pub async fn reception_state(&self, peer: &PeerId) -> Option<ReceptionState> {
        let state = self.inner.state.existing(peer).await?;
        let state = state.lock().await;
        state.active.as_ref().map(|active| active.state)
    }

    /// Request a file announced by `peer`.
    ///
    /// When persisting, a partial file left by an earlier attempt turns into
    /// the resume offset (rounded down to a chunk boundary); a file already
    /// complete on disk is not requested again.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownFile` if the file was not announced,
    /// `Error::ReceptionInProgress` if another file from the peer is in
    /// flight, and storage or transport errors from setting up the request.
    pub async fn request_file(
        &self,
        peer: &PeerId,
        file_id: &str,
        save_to_disk: bool,
    ) -> Result<RequestOutcome> {
        let inner = &self.inner;
        let state = inner
            .state
            .existing(peer)
            .await
            .ok_or_else(|| Error::UnknownFile(file_id.to_string()))?;
        let mut state = state.lock().await;

        let meta = state
            .metadata
            .get(file_id)
            .cloned()
            .ok_or_else(|| Error::UnknownFile(file_id.to_string()))?;
        if state.active.is_some() {
            return Err(Error::ReceptionInProgress(peer.to_string()));
        }

        let to_disk = if meta.is_in_folder() {
            state.save_types.decide_folder(&meta.folder_name, save_to_disk)
        } else {
            state.save_types.decide_file(file_id, save_to_disk)
        };

        let (tx, rx) = oneshot::channel();
        let writer = if to_disk {
            let existing = self.partial_size(&meta).await?;
            if existing == Some(meta.size) {
                let file = ReceivedFile {
                    content: ReceivedContent::OnDisk(inner.storage.locate(&meta.full_relative_path)?),
                    resumed_from: meta.size,
                    received_at: Utc::now(),
                    metadata: meta,
                };
                state.set_file_progress(file_id, file.metadata.size);
                tracing::info!(peer = %peer, file_id, "File already complete on disk");
                return Ok(RequestOutcome::AlreadyComplete(file));
            }
            let resume_offset = self.resume_offset(existing.unwrap_or(0));
            Some((self.open_writer(&meta, resume_offset).await?, resume_offset))
        } else {
            None
        };

        let resume_offset = writer.as_ref().map_or(0, |(_, offset)| *offset);
        let writer = writer.map(|(writer, _)| writer);
        let mut active = ActiveReception::new(
            meta.clone(),
            inner.config.transfer.chunk_size,
            resume_offset,
            writer,
            tx,
        );
        let expected_chunks = active.expected_chunks;
        let serial = inner.next_serial.fetch_add(1, Ordering::Relaxed);
        active.serial = serial;
        state.active = Some(active);
        state.set_file_progress(file_id, resume_offset);
        inner
            .progress
            .lock()
            .await
            .reset(peer, &ProgressTarget::File(file_id.to_string()));

        let request = ControlMessage::FileRequest {
            file_id: file_id.to_string(),
            offset: resume_offset,
        };
        if let Err(e) = send_control(inner.channel.as_ref(), peer, &request) {
            if let Some(mut active) = state.active.take() {
                active.close_partial().await;
            }
            return Err(e);
        }

        tracing::info!(
            peer = %peer,
            file_id,
            name = %meta.name,
            resume_offset,
            expected_chunks,
            to_disk,
            "Requested file"
        );

        if expected_chunks == 0 {
            if let Some(active) = state.active.as_mut() {
                active.begin_finalize();
            }
            Self::finalize(inner, peer, &mut state).await;
        } else {
            Self::watch_idle(Arc::downgrade(inner), peer.clone(), serial);
        }

        Ok(RequestOutcome::Pending(PendingReception {
            file_id: file_id.to_string(),
            resume_offset,
            expected_chunks,
            rx,
        }))
    }

    /// Request every member of a folder, one after another, then confirm the
    /// folder to the sender.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownFile` for an unknown folder and the first member
    /// failure, which stops the loop. Members already received stay on disk.
    pub async fn request_folder(
        &self,
        peer: &PeerId,
        folder_name: &str,
        save_to_disk: bool,
    ) -> Result<FolderReceipt> {
        let inner = &self.inner;
        let state = inner
            .state
            .existing(peer)
            .await
            .ok_or_else(|| Error::UnknownFile(folder_name.to_string()))?;

        let (members, to_disk, total_size) = {
            let mut state = state.lock().await;
            let aggregate = state
                .folders
                .get(folder_name)
                .cloned()
                .ok_or_else(|| Error::UnknownFile(folder_name.to_string()))?;
            let to_disk = state.save_types.decide_folder(folder_name, save_to_disk);
            let members: Vec<FileMetadata> = aggregate
                .member_file_ids
                .iter()
                .filter_map(|id| state.metadata.get(id).cloned())
                .collect();
            (members, to_disk, aggregate.total_size)
        };

        // Seed with what is already on disk so progress starts where it left off.
        if to_disk {
            let mut seeded = Vec::with_capacity(members.len());
            for meta in &members {
                let present = match self.partial_size(meta).await? {
                    Some(size) if size == meta.size => size,
                    Some(size) => self.resume_offset(size),
                    None => 0,
                };
                seeded.push((meta.file_id.clone(), present));
            }
            let mut state = state.lock().await;
            for (file_id, present) in seeded {
                state.set_file_progress(&file_id, present);
            }
            let present = state.folder_progress(folder_name);
            drop(state);
            tracing::debug!(peer = %peer, folder = %folder_name, present, total_size, "Seeded folder progress");
            let target = ProgressTarget::Folder(folder_name.to_string());
            let mut progress = inner.progress.lock().await;
            progress.reset(peer, &target);
            if let Some(report) = progress.update(peer, &target, present, total_size) {
                inner.events.emit(SessionEvent::Progress(report));
            }
        }

        tracing::info!(
            peer = %peer,
            folder = %folder_name,
            files = members.len(),
            total_size,
            "Requesting folder"
        );

        let mut files = Vec::with_capacity(members.len());
        for meta in &members {
            let file = match self.request_file(peer, &meta.file_id, to_disk).await? {
                RequestOutcome::AlreadyComplete(file) => file,
                RequestOutcome::Pending(pending) => pending.wait().await?,
            };
            files.push(file);
        }

        let completed_file_ids: Vec<String> =
            files.iter().map(|f| f.metadata.file_id.clone()).collect();
        let all_store_updated = files.iter().all(ReceivedFile::store_updated);

        send_control(
            inner.channel.as_ref(),
            peer,
            &ControlMessage::FolderReceiveComplete {
                folder_name: folder_name.to_string(),
                completed_file_ids: completed_file_ids.clone(),
                all_store_updated,
            },
        )?;

        tracing::info!(peer = %peer, folder = %folder_name, files = files.len(), "Folder received");
        inner.events.emit(SessionEvent::FolderReceived {
            peer: peer.clone(),
            folder_name: folder_name.to_string(),
            completed_file_ids: completed_file_ids.clone(),
            all_store_updated,
        });

        Ok(FolderReceipt {
            folder_name: folder_name.to_string(),
            completed_file_ids,
            files,
            all_store_updated,
        })
    }

    /// Handle a binary chunk packet from `peer`.
    ///
    /// Stale chunks (no active reception, finalized reception, outside the
    /// expected range, duplicates) are dropped silently. A storage failure
    /// aborts the reception and is reported as an event.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedPacket` for an unparsable packet and
    /// `Error::FileMismatch` for a chunk of another file.
    pub async fn handle_chunk(&self, peer: &PeerId, data: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let packet = inner.chunks.decode(data)?;
        let index = packet.meta.chunk_index;

        let Some(state) = inner.state.existing(peer).await else {
            tracing::debug!(peer = %peer, chunk_index = index, "Chunk from unknown peer dropped");
            return Ok(());
        };
        let mut state = state.lock().await;
        let Some(active) = state.active.as_mut() else {
            tracing::debug!(peer = %peer, chunk_index = index, "Chunk without active reception dropped");
            return Ok(());
        };
        if active.is_finalized() {
            tracing::debug!(peer = %peer, chunk_index = index, "Late chunk dropped");
            return Ok(());
        }
        ChunkProcessor::check_file(&packet, &active.meta.file_id)?;

        let Some(relative) =
            inner
                .chunks
                .relative_index(index, active.resume_offset, active.expected_chunks)
        else {
            tracing::debug!(
                peer = %peer,
                chunk_index = index,
                resume_offset = active.resume_offset,
                "Chunk outside expected range dropped"
            );
            return Ok(());
        };

        match active.store(relative, index, packet.payload).await {
            Ok(StoreOutcome::Stored) => {}
            Ok(StoreOutcome::Duplicate) => {
                tracing::debug!(peer = %peer, chunk_index = index, "Duplicate chunk dropped");
                return Ok(());
            }
            Err(e) => {
                Self::abort(inner, peer, &mut state, e).await;
                return Ok(());
            }
        }

        let file_id = active.meta.file_id.clone();
        let progress = active.file_progress();
        let complete = active.is_complete() && active.begin_finalize();
        state.set_file_progress(&file_id, progress);
        Self::report_progress(inner, peer, &state).await;

        if complete {
            Self::finalize(inner, peer, &mut state).await;
        }
        Ok(())
    }

    /// Drop a peer: close any disk sink (keeping the partial file) and fail
    /// its pending request.
    pub async fn peer_disconnected(&self, peer: &PeerId) {
        if let Some(state) = self.inner.state.remove(peer).await {
            let mut state = state.lock().await;
            if let Some(mut active) = state.active.take() {
                tracing::info!(
                    peer = %peer,
                    file_id = %active.meta.file_id,
                    received = active.received_bytes,
                    "Reception interrupted by disconnect"
                );
                active.close_partial().await;
                active.reject(Error::PeerGone(peer.to_string()));
            }
        }
        self.inner.progress.lock().await.forget_peer(peer);
    }

    /// Abort every reception and drop all state.
    pub async fn close(&self) {
        for (peer, state) in self.inner.state.drain().await {
            let mut state = state.lock().await;
            if let Some(mut active) = state.active.take() {
                tracing::debug!(peer = %peer, file_id = %active.meta.file_id, "Cancelling reception");
                active.close_partial().await;
                active.reject(Error::Cancelled);
            }
        }
    }

    async fn partial_size(&self, meta: &FileMetadata) -> Result<Option<u64>> {
        let existing = self
            .inner
            .storage
            .existing_size(&meta.full_relative_path)
            .await?;
        Ok(match existing {
            Some(size) if size > meta.size => {
                tracing::warn!(
                    file_id = %meta.file_id,
                    existing = size,
                    declared = meta.size,
                    "Existing file is larger than announced, starting over"
                );
                Some(0)
            }
            other => other,
        })
    }

    fn resume_offset(&self, existing: u64) -> u64 {
        let chunk = self.inner.config.transfer.chunk_size as u64;
        existing / chunk * chunk
    }

    async fn open_writer(
        &self,
        meta: &FileMetadata,
        resume_offset: u64,
    ) -> Result<SequencedDiskWriter<S::Sink>> {
        let inner = &self.inner;
        let transfer = &inner.config.transfer;
        let location = inner.storage.locate(&meta.full_relative_path)?;
        let sink = inner
            .storage
            .open_sink(&meta.full_relative_path, resume_offset)
            .await?;
        Ok(SequencedDiskWriter::new(
            sink,
            location,
            transfer.chunk_size,
            resume_offset / transfer.chunk_size as u64,
            transfer.reorder_buffer_chunks,
        ))
    }

    /// Abort reception `serial` from `peer` once no chunk has arrived for
    /// the configured idle timeout. Exits when that reception is gone.
    fn watch_idle(inner: Weak<ReceiverInner<S>>, peer: PeerId, serial: u64) {
        tokio::spawn(async move {
            let mut deadline = match inner.upgrade() {
                Some(inner) => Instant::now() + inner.config.transfer.receive_idle_timeout,
                None => return,
            };
            loop {
                tokio::time::sleep_until(deadline).await;
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let Some(state) = inner.state.existing(&peer).await else {
                    return;
                };
                let mut state = state.lock().await;
                let idle = inner.config.transfer.receive_idle_timeout;
                let last_activity = match state.active.as_ref() {
                    Some(active) if active.serial == serial && !active.is_finalized() => {
                        active.last_activity
                    }
                    _ => return,
                };

                let next = last_activity + idle;
                if next > Instant::now() {
                    deadline = next;
                    continue;
                }
                tracing::warn!(
                    peer = %peer,
                    idle_secs = idle.as_secs_f64(),
                    "No chunk within the idle timeout"
                );
                Self::abort(&inner, &peer, &mut state, Error::Timeout(idle.as_secs())).await;
                return;
            }
        });
    }

    async fn report_progress(
        inner: &ReceiverInner<S>,
        peer: &PeerId,
        state: &PeerReceptionState<S::Sink>,
    ) {
        let Some(active) = state.active.as_ref() else {
            return;
        };
        let meta = &active.meta;
        let mut progress = inner.progress.lock().await;

        let file_target = ProgressTarget::File(meta.file_id.clone());
        if let Some(report) = progress.update(peer, &file_target, active.file_progress(), meta.size) {
            inner.events.emit(SessionEvent::Progress(report));
        }

        if let Some(folder) = state.folders.get(&meta.folder_name) {
            let target = ProgressTarget::Folder(meta.folder_name.clone());
            let present = state.folder_progress(&meta.folder_name);
            if let Some(report) = progress.update(peer, &target, present, folder.total_size) {
                inner.events.emit(SessionEvent::Progress(report));
            }
        }
    }

    async fn abort(
        inner: &ReceiverInner<S>,
        peer: &PeerId,
        state: &mut PeerReceptionState<S::Sink>,
        error: Error,
    ) {
        let Some(mut active) = state.active.take() else {
            return;
        };
        let file_id = active.meta.file_id.clone();
        tracing::warn!(peer = %peer, file_id = %file_id, error = %error, "Reception aborted");
        active.close_partial().await;
        inner
            .events
            .emit(SessionEvent::failed(peer, Some(&file_id), &error));
        active.reject(error);
    }

    async fn finalize(inner: &ReceiverInner<S>, peer: &PeerId, state: &mut PeerReceptionState<S::Sink>) {
        let Some(mut active) = state.active.take() else {
            return;
        };
        let file_id = active.meta.file_id.clone();

        let content = match active.take_writer() {
            Some(writer) => {
                let location = writer.location().to_path_buf();
                writer.close().await.map(|()| ReceivedContent::OnDisk(location))
            }
            None => {
                let slots = active.take_slots();
                inner
                    .assembler
                    .assemble(&active.meta, active.resume_offset, slots)
                    .map(ReceivedContent::InMemory)
            }
        };
        let content = match content {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(peer = %peer, file_id = %file_id, error = %e, "Finalize failed");
                inner
                    .events
                    .emit(SessionEvent::failed(peer, Some(&file_id), &e));
                active.reject(e);
                return;
            }
        };

        let file = ReceivedFile {
            metadata: active.meta.clone(),
            content,
            resumed_from: active.resume_offset,
            received_at: Utc::now(),
        };
        let store_updated = file.store_updated();

        let receipt = ControlMessage::FileReceiveComplete {
            file_id: file_id.clone(),
            received_size: active.received_bytes,
            received_chunks: active.received_count as u64,
            store_updated,
        };
        if let Err(e) = send_control(inner.channel.as_ref(), peer, &receipt) {
            tracing::warn!(peer = %peer, file_id = %file_id, error = %e, "Failed to send receipt");
        }

        tracing::info!(
            peer = %peer,
            file_id = %file_id,
            received = active.received_bytes,
            chunks = active.received_count,
            store_updated,
            "File received"
        );
        inner.events.emit(SessionEvent::FileReceived {
            peer: peer.clone(),
            file: file.clone(),
        });
        active.resolve(file);
    }
}
