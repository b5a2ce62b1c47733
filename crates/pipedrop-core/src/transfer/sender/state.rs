//! Per-peer sender state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::channel::PeerId;
use crate::config::BackpressureConfig;
use crate::error::{Error, Result};
use crate::file::{FileMetadata, FolderAggregate, FolderRegistry};
use crate::transfer::NetworkMetrics;

/// What the sender knows about one peer.
#[derive(Debug)]
pub struct PeerTransferState {
    /// A file is being streamed to the peer
    pub is_sending: bool,
    /// File currently in flight
    pub current_file: Option<String>,
    /// Folder of the file in flight
    pub current_folder: Option<String>,
    /// Cumulative bytes sent per file, seeded with the request offset
    pub bytes_sent: HashMap<String, u64>,
    /// Offset of the next chunk to be read for the file in flight
    pub read_cursor: u64,
    /// Receipts: file id to whether the peer stored it on disk
    pub acknowledged: HashMap<String, bool>,
    /// Folders sent to this peer, with bytes sent across their members
    pub folders: HashMap<String, FolderAggregate>,
    /// Learned channel performance
    pub metrics: NetworkMetrics,
    ack: Arc<Notify>,
}

impl PeerTransferState {
    fn new(config: &BackpressureConfig) -> Self {
        Self {
            is_sending: false,
            current_file: None,
            current_folder: None,
            bytes_sent: HashMap::new(),
            read_cursor: 0,
            acknowledged: HashMap::new(),
            folders: HashMap::new(),
            metrics: NetworkMetrics::new(config),
            ack: Arc::new(Notify::new()),
        }
    }
}

/// Sender state for every peer plus the folders announced so far.
#[derive(Debug)]
pub struct TransferStateManager {
    peers: Mutex<HashMap<PeerId, PeerTransferState>>,
    folders: Mutex<FolderRegistry>,
    config: BackpressureConfig,
}

impl TransferStateManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            folders: Mutex::new(FolderRegistry::new()),
            config,
        }
    }

    /// Record an announced file in its folder aggregate.
    pub async fn record_announced(&self, meta: &FileMetadata) -> bool {
        self.folders.lock().await.record(meta)
    }

    /// Snapshot of a folder as sent to a peer.
    pub async fn folder(&self, peer: &PeerId, folder_name: &str) -> Option<FolderAggregate> {
        let peers = self.peers.lock().await;
        peers.get(peer)?.folders.get(folder_name).cloned()
    }

    /// Mark the peer as sending `file_id` from `offset`.
    ///
    /// Returns the notifier that fires when a receipt arrives.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadySending` if another file is in flight to the peer.
    pub async fn begin_send(
        &self,
        peer: &PeerId,
        meta: &FileMetadata,
        offset: u64,
    ) -> Result<Arc<Notify>> {
        let announced = if meta.is_in_folder() {
            self.folders.lock().await.get(&meta.folder_name).cloned()
        } else {
            None
        };

        let mut peers = self.peers.lock().await;
        let state = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerTransferState::new(&self.config));

        if state.is_sending {
            return Err(Error::AlreadySending {
                peer: peer.to_string(),
                file: state.current_file.clone().unwrap_or_default(),
            });
        }

        state.is_sending = true;
        state.current_file = Some(meta.file_id.clone());
        state.current_folder = meta.is_in_folder().then(|| meta.folder_name.clone());
        state.bytes_sent.insert(meta.file_id.clone(), offset);
        state.read_cursor = offset;
        state.acknowledged.remove(&meta.file_id);

        // Members announced since the last send are picked up here.
        if let Some(mut aggregate) = announced {
            aggregate.received_or_sent_size = aggregate
                .member_file_ids
                .iter()
                .filter_map(|id| state.bytes_sent.get(id))
                .sum();
            state.folders.insert(meta.folder_name.clone(), aggregate);
        }

        Ok(Arc::clone(&state.ack))
    }

    /// Add sent bytes, returning the file's cumulative count.
    pub async fn add_sent(&self, peer: &PeerId, file_id: &str, bytes: u64) -> u64 {
        let mut peers = self.peers.lock().await;
        let Some(state) = peers.get_mut(peer) else {
            return 0;
        };
        state.read_cursor += bytes;
        let total = state.bytes_sent.entry(file_id.to_string()).or_insert(0);
        *total += bytes;
        let total = *total;

        if let Some(aggregate) = state
            .current_folder
            .as_ref()
            .and_then(|name| state.folders.get_mut(name))
        {
            if aggregate.member_file_ids.iter().any(|id| id == file_id) {
                aggregate.received_or_sent_size += bytes;
            }
        }
        total
    }

    /// Store a receipt and wake the waiting stream task.
    ///
    /// Returns false if the peer has no state (late receipt after disconnect).
    pub async fn acknowledge(&self, peer: &PeerId, file_id: &str, store_updated: bool) -> bool {
        let mut peers = self.peers.lock().await;
        let Some(state) = peers.get_mut(peer) else {
            return false;
        };
        state.acknowledged.insert(file_id.to_string(), store_updated);
        // The receiver is done with this file and may request the next one
        // before the stream task gets to finish_send.
        if state.current_file.as_deref() == Some(file_id) {
            state.is_sending = false;
            // Folder members stay counted in their folder's progress.
            if state.current_folder.is_none() {
                state.bytes_sent.remove(file_id);
            }
        }
        state.ack.notify_one();
        true
    }

    /// The receipt for a file, if any: whether the peer stored it on disk.
    pub async fn acknowledgement(&self, peer: &PeerId, file_id: &str) -> Option<bool> {
        let peers = self.peers.lock().await;
        peers.get(peer)?.acknowledged.get(file_id).copied()
    }

    /// Clear the in-flight marker after a send ends, successfully or not.
    pub async fn finish_send(&self, peer: &PeerId, file_id: &str) {
        let mut peers = self.peers.lock().await;
        if let Some(state) = peers.get_mut(peer) {
            if state.current_file.as_deref() == Some(file_id) {
                state.is_sending = false;
                state.current_file = None;
                state.current_folder = None;
            }
            state.acknowledged.remove(file_id);
        }
    }

    /// Whether a file is in flight to the peer.
    pub async fn is_sending(&self, peer: &PeerId) -> bool {
        let peers = self.peers.lock().await;
        peers.get(peer).is_some_and(|state| state.is_sending)
    }

    /// Whether the peer has state.
    pub async fn has_peer(&self, peer: &PeerId) -> bool {
        self.peers.lock().await.contains_key(peer)
    }

    /// Learned metrics of a peer.
    pub async fn metrics(&self, peer: &PeerId) -> NetworkMetrics {
        let peers = self.peers.lock().await;
        peers
            .get(peer)
            .map_or_else(|| NetworkMetrics::new(&self.config), |s| s.metrics.clone())
    }

    /// Write back metrics updated by a stream task.
    pub async fn store_metrics(&self, peer: &PeerId, metrics: NetworkMetrics) {
        if let Some(state) = self.peers.lock().await.get_mut(peer) {
            state.metrics = metrics;
        }
    }

    /// Drop a peer. A stream task waiting for its receipt is woken.
    pub async fn remove_peer(&self, peer: &PeerId) -> Option<PeerTransferState> {
        let removed = self.peers.lock().await.remove(peer);
        if let Some(state) = &removed {
            state.ack.notify_one();
        }
        removed
    }

    /// Drop every peer and folder.
    pub async fn clear(&self) {
        let drained: Vec<_> = self.peers.lock().await.drain().collect();
        for (_, state) in drained {
            state.ack.notify_one();
        }
        self.folders.lock().await.clear();
    }
}
