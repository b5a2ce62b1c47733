//! Sender entry point.
//!
//! Announces files, sends text, and serves `fileRequest`s by streaming the
//! requested file from the requested offset in a background task. The task
//! ends when the peer's receipt arrives, the peer goes away or the receipt
//! wait times out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::state::TransferStateManager;
use crate::channel::{PeerChannel, PeerId};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventSink, SessionEvent};
use crate::file::{OutgoingFile, StreamingFileReader};
use crate::protocol::{split_text, ChunkMeta, ControlMessage};
use crate::transfer::{
    send_control, NetworkMetrics, NetworkTransmitter, ProgressTarget, ProgressTracker,
    TransferDirection,
};

struct SenderInner {
    channel: Arc<dyn PeerChannel>,
    config: Config,
    files: Mutex<HashMap<String, OutgoingFile>>,
    state: TransferStateManager,
    progress: Mutex<ProgressTracker>,
    transmitter: NetworkTransmitter,
    events: EventSink,
    tasks: Mutex<HashMap<PeerId, (u64, AbortHandle)>>,
    next_task_id: AtomicU64,
}

/// Public entry point of the sending pipeline.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TransferOrchestrator {
    inner: Arc<SenderInner>,
}

impl std::fmt::Debug for TransferOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOrchestrator")
            .field("config", &self.inner.config.transfer)
            .finish_non_exhaustive()
    }
}

impl TransferOrchestrator {
    /// Create the sender on top of `channel`.
    pub fn new(config: &Config, channel: Arc<dyn PeerChannel>, events: EventSink) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                transmitter: NetworkTransmitter::new(
                    Arc::clone(&channel),
                    config.backpressure.clone(),
                ),
                channel,
                config: config.clone(),
                files: Mutex::new(HashMap::new()),
                state: TransferStateManager::new(config.backpressure.clone()),
                progress: Mutex::new(ProgressTracker::new(
                    TransferDirection::Send,
                    &config.progress,
                )),
                events,
                tasks: Mutex::new(HashMap::new()),
                next_task_id: AtomicU64::new(0),
            }),
        }
    }

    /// Sender state, for inspection.
    #[must_use]
    pub fn state(&self) -> &TransferStateManager {
        &self.inner.state
    }

    fn targets(&self, peer: Option<&PeerId>) -> Vec<PeerId> {
        peer.map_or_else(|| self.inner.channel.connected_peers(), |p| vec![p.clone()])
    }

    /// Announce files to one peer, or to every connected peer when `peer` is
    /// `None`.
    ///
    /// The files become requestable and folder members are added to their
    /// folder aggregate.
    ///
    /// # Errors
    ///
    /// Returns a transport error if sending to an explicitly named peer fails.
    /// Broadcast failures are reported per peer as events.
    pub async fn send_file_meta(&self, files: &[OutgoingFile], peer: Option<&PeerId>) -> Result<()> {
        {
            let mut registry = self.inner.files.lock().await;
            for file in files {
                registry
                    .entry(file.metadata.file_id.clone())
                    .or_insert_with(|| file.clone());
            }
        }
        for file in files {
            self.inner.state.record_announced(&file.metadata).await;
        }

        for target in self.targets(peer) {
            let sent = files.iter().try_for_each(|file| {
                send_control(
                    self.inner.channel.as_ref(),
                    &target,
                    &ControlMessage::FileMeta(file.metadata.clone()),
                )
            });

            match sent {
                Ok(()) => {
                    tracing::info!(peer = %target, files = files.len(), "Announced files");
                }
                Err(e) if peer.is_some() => return Err(e),
                Err(e) => {
                    tracing::warn!(peer = %target, error = %e, "Failed to announce files");
                    self.inner
                        .events
                        .emit(SessionEvent::failed(&target, None, &e));
                }
            }
        }
        Ok(())
    }

    /// Send a text message to one peer, or to every connected peer when `peer`
    /// is `None`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if sending to an explicitly named peer fails.
    pub fn send_string(&self, text: &str, peer: Option<&PeerId>) -> Result<()> {
        let pieces = split_text(text, self.inner.config.transfer.string_chunk_size);
        let total = u32::try_from(pieces.len())
            .map_err(|_| Error::ProtocolViolation("text has too many pieces".to_string()))?;

        for target in self.targets(peer) {
            let sent = send_control(
                self.inner.channel.as_ref(),
                &target,
                &ControlMessage::StringMetadata {
                    length: text.len() as u64,
                },
            )
            .and_then(|()| {
                pieces.iter().zip(0u32..).try_for_each(|(piece, index)| {
                    send_control(
                        self.inner.channel.as_ref(),
                        &target,
                        &ControlMessage::String {
                            chunk: (*piece).to_string(),
                            index,
                            total,
                        },
                    )
                })
            });

            match sent {
                Ok(()) => tracing::debug!(peer = %target, bytes = text.len(), pieces = total, "Sent text"),
                Err(e) if peer.is_some() => return Err(e),
                Err(e) => {
                    tracing::warn!(peer = %target, error = %e, "Failed to send text");
                    self.inner
                        .events
                        .emit(SessionEvent::failed(&target, None, &e));
                }
            }
        }
        Ok(())
    }

    /// Serve a `fileRequest`.
    ///
    /// State is set up before this returns; the bytes are streamed by a
    /// background task.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownFile` if the file was never announced and
    /// `Error::AlreadySending` if a file is already in flight to the peer.
    pub async fn handle_file_request(&self, peer: &PeerId, file_id: &str, offset: u64) -> Result<()> {
        let file = self.inner.files.lock().await.get(file_id).cloned();
        let Some(file) = file else {
            let err = Error::UnknownFile(file_id.to_string());
            tracing::warn!(peer = %peer, file_id, "Request for unknown file");
            self.inner
                .events
                .emit(SessionEvent::failed(peer, Some(file_id), &err));
            return Err(err);
        };

        // Streaming restarts at the enclosing chunk boundary.
        let chunk = self.inner.config.transfer.chunk_size as u64;
        let offset = offset.min(file.metadata.size) / chunk * chunk;
        let ack = self.inner.state.begin_send(peer, &file.metadata, offset).await?;
        self.inner
            .progress
            .lock()
            .await
            .reset(peer, &ProgressTarget::File(file_id.to_string()));

        tracing::info!(
            peer = %peer,
            file_id,
            name = %file.metadata.name,
            offset,
            size = file.metadata.size,
            "Starting file send"
        );

        // Held until the handle is registered so the task cannot deregister first.
        let mut tasks = self.inner.tasks.lock().await;
        let task_id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task_peer = peer.clone();
        let handle = tokio::spawn(async move {
            Self::run_send(&inner, &task_peer, &file, offset, &ack).await;

            let mut tasks = inner.tasks.lock().await;
            if tasks.get(&task_peer).is_some_and(|(id, _)| *id == task_id) {
                tasks.remove(&task_peer);
            }
        });
        tasks.insert(peer.clone(), (task_id, handle.abort_handle()));
        Ok(())
    }

    /// Handle a `fileReceiveComplete` receipt.
    pub async fn handle_receive_complete(&self, peer: &PeerId, file_id: &str, store_updated: bool) {
        if !self
            .inner
            .state
            .acknowledge(peer, file_id, store_updated)
            .await
        {
            tracing::debug!(peer = %peer, file_id, "Receipt for unknown peer state, ignored");
        }
    }

    /// Handle a `folderReceiveComplete` receipt.
    pub fn handle_folder_complete(
        &self,
        peer: &PeerId,
        folder_name: String,
        completed_file_ids: Vec<String>,
    ) {
        tracing::info!(peer = %peer, folder = %folder_name, "Folder delivered");
        self.inner.events.emit(SessionEvent::FolderSent {
            peer: peer.clone(),
            folder_name,
            completed_file_ids,
        });
    }

    /// Whether a file is in flight to the peer.
    pub async fn is_sending(&self, peer: &PeerId) -> bool {
        self.inner.state.is_sending(peer).await
    }

    /// Stop sending to a peer and drop its state.
    pub async fn peer_disconnected(&self, peer: &PeerId) {
        if let Some((_, handle)) = self.inner.tasks.lock().await.remove(peer) {
            handle.abort();
        }
        if let Some(state) = self.inner.state.remove_peer(peer).await {
            if let Some(file_id) = state.current_file {
                tracing::info!(peer = %peer, file_id = %file_id, "Send interrupted by disconnect");
            }
        }
        self.inner.progress.lock().await.forget_peer(peer);
    }

    /// Abort every send and drop all state, including announced files.
    pub async fn close(&self) {
        for (peer, (_, handle)) in self.inner.tasks.lock().await.drain() {
            tracing::debug!(peer = %peer, "Aborting send task");
            handle.abort();
        }
        self.inner.state.clear().await;
        self.inner.files.lock().await.clear();
    }

    async fn run_send(
        inner: &SenderInner,
        peer: &PeerId,
        file: &OutgoingFile,
        offset: u64,
        ack: &Notify,
    ) {
        let file_id = &file.metadata.file_id;
        let result = Self::stream_file(inner, peer, file, offset).await;
        let result = match result {
            Ok(()) => Self::wait_for_receipt(inner, peer, file_id, ack).await,
            Err(e) => Err(e),
        };

        inner.state.finish_send(peer, file_id).await;

        match result {
            Ok(store_updated) => {
                tracing::info!(peer = %peer, file_id = %file_id, store_updated, "File delivered");
                inner.events.emit(SessionEvent::FileSent {
                    peer: peer.clone(),
                    file_id: file_id.clone(),
                    store_updated,
                });
            }
            Err(e) => {
                tracing::warn!(peer = %peer, file_id = %file_id, error = %e, "File send failed");
                inner
                    .events
                    .emit(SessionEvent::failed(peer, Some(file_id), &e));
            }
        }
    }

    async fn stream_file(
        inner: &SenderInner,
        peer: &PeerId,
        file: &OutgoingFile,
        offset: u64,
    ) -> Result<()> {
        let transfer = &inner.config.transfer;
        let mut reader = StreamingFileReader::open_at(
            &file.source,
            transfer.chunk_size,
            transfer.batch_chunks,
            offset,
        )
        .await?;

        if reader.file_size() != file.metadata.size {
            return Err(Error::ProtocolViolation(format!(
                "{} changed size since it was announced ({} -> {} bytes)",
                file.source.display(),
                file.metadata.size,
                reader.file_size()
            )));
        }

        let mut metrics = inner.state.metrics(peer).await;
        let streamed = Self::stream_chunks(inner, peer, file, &mut reader, &mut metrics).await;
        inner.state.store_metrics(peer, metrics).await;
        streamed
    }

    async fn stream_chunks(
        inner: &SenderInner,
        peer: &PeerId,
        file: &OutgoingFile,
        reader: &mut StreamingFileReader,
        metrics: &mut NetworkMetrics,
    ) -> Result<()> {
        let meta = &file.metadata;
        let file_target = ProgressTarget::File(meta.file_id.clone());

        loop {
            let next = reader.next_network_chunk().await?;
            let Some(data) = next.chunk else {
                break;
            };

            let chunk = ChunkMeta {
                chunk_index: next.chunk_index,
                total_chunks: next.total_chunks,
                chunk_size: data.len() as u64,
                is_last_chunk: next.is_last_chunk,
                file_offset: next.file_offset,
                file_id: meta.file_id.clone(),
            };
            inner
                .transmitter
                .send_chunk(peer, &chunk, &data, metrics)
                .await?;

            let sent = inner
                .state
                .add_sent(peer, &meta.file_id, data.len() as u64)
                .await;
            Self::report_progress(inner, peer, file, &file_target, sent).await;
        }

        tracing::debug!(peer = %peer, file_id = %meta.file_id, "All chunks sent");
        Ok(())
    }

    async fn report_progress(
        inner: &SenderInner,
        peer: &PeerId,
        file: &OutgoingFile,
        target: &ProgressTarget,
        sent: u64,
    ) {
        let meta = &file.metadata;
        let folder = if meta.is_in_folder() {
            inner.state.folder(peer, &meta.folder_name).await
        } else {
            None
        };

        let mut progress = inner.progress.lock().await;
        if let Some(report) = progress.update(peer, target, sent, meta.size) {
            inner.events.emit(SessionEvent::Progress(report));
        }
        if let Some(aggregate) = folder {
            let target = ProgressTarget::Folder(meta.folder_name.clone());
            if let Some(report) =
                progress.update(peer, &target, aggregate.received_or_sent_size, aggregate.total_size)
            {
                inner.events.emit(SessionEvent::Progress(report));
            }
        }
    }

    async fn wait_for_receipt(
        inner: &SenderInner,
        peer: &PeerId,
        file_id: &str,
        ack: &Notify,
    ) -> Result<bool> {
        let transfer = &inner.config.transfer;
        let deadline = Instant::now() + transfer.ack_timeout;

        loop {
            if let Some(store_updated) = inner.state.acknowledgement(peer, file_id).await {
                return Ok(store_updated);
            }
            if !inner.channel.is_open(peer) || !inner.state.has_peer(peer).await {
                return Err(Error::PeerGone(peer.to_string()));
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(transfer.ack_timeout.as_secs()));
            }

            tokio::select! {
                () = ack.notified() => {}
                () = tokio::time::sleep(transfer.ack_poll_interval) => {}
            }
        }
    }
}
