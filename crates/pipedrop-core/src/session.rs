//! Session owning both transfer pipelines.
//!
//! A [`Session`] is opened on top of a [`PeerChannel`] and a [`Storage`]. The
//! embedding application feeds it every inbound channel message through
//! [`Session::handle_message`] and reads [`SessionEvent`]s from the receiver
//! returned by [`Session::open`]. Text messages are routed by type: requests
//! and receipts go to the sender, announcements and text to the receiver.
//! Binary messages are chunk packets for the receiver.
//!
//! ## Example
//!
//! ```rust,ignore
//! let (left, right) = MemoryChannel::pair("alice", "bob");
//! let (alice, _events) = Session::open(&Config::default(), left.channel, FsStorage::new("a"))?;
//! let (bob, mut events) = Session::open(&Config::default(), right.channel, FsStorage::new("b"))?;
//!
//! alice.send_file_meta(&enumerate_outgoing(&paths)?, None).await?;
//! // pump `left.inbox` into `alice.handle_message` and `right.inbox` into `bob`
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::channel::{ChannelMessage, PeerChannel, PeerId};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventSink, SessionEvent};
use crate::file::{FileMetadata, FolderAggregate, OutgoingFile};
use crate::protocol::decode_control;
use crate::storage::Storage;
use crate::transfer::receiver::FolderReceipt;
use crate::transfer::sender::MessageRouter;
use crate::transfer::{ReceiveOrchestrator, RequestOutcome, TransferOrchestrator};

/// Explicitly owned transfer session.
///
/// Cheap to clone; clones share state, so one clone can pump inbound messages
/// while another issues requests.
pub struct Session<S: Storage> {
    channel: Arc<dyn PeerChannel>,
    sender: TransferOrchestrator,
    router: MessageRouter,
    receiver: ReceiveOrchestrator<S>,
    events: EventSink,
    closed: Arc<AtomicBool>,
}

impl<S: Storage> Clone for Session<S> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            sender: self.sender.clone(),
            router: self.router.clone(),
            receiver: self.receiver.clone(),
            events: self.events.clone(),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<S: Storage> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.is_closed())
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .finish_non_exhaustive()
    }
}

impl<S: Storage> Session<S> {
    /// Open a session.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the configuration is inconsistent.
    pub fn open(
        config: &Config,
        channel: Arc<dyn PeerChannel>,
        storage: S,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;

        let (events, rx) = EventSink::channel();
        let sender = TransferOrchestrator::new(config, Arc::clone(&channel), events.clone());
        let receiver =
            ReceiveOrchestrator::new(config, Arc::clone(&channel), storage, events.clone());

        tracing::debug!(
            chunk_size = config.transfer.chunk_size,
            peers = channel.connected_peers().len(),
            "Session opened"
        );

        Ok((
            Self {
                router: MessageRouter::new(sender.clone()),
                channel,
                sender,
                receiver,
                events,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        ))
    }

    /// Sending pipeline.
    #[must_use]
    pub fn sender(&self) -> &TransferOrchestrator {
        &self.sender
    }

    /// Receiving pipeline.
    #[must_use]
    pub fn receiver(&self) -> &ReceiveOrchestrator<S> {
        &self.receiver
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Handle one inbound channel message from `peer`.
    ///
    /// A failing message never poisons the session; the error is returned
    /// for logging and the next message is processed normally.
    ///
    /// # Errors
    ///
    /// Returns the error raised while handling this message.
    pub async fn handle_message(&self, peer: &PeerId, message: ChannelMessage) -> Result<()> {
        if self.is_closed() {
            tracing::trace!(peer = %peer, "Message after close dropped");
            return Ok(());
        }

        match message {
            ChannelMessage::Text(text) => {
                let control = decode_control(&text)?;
                tracing::trace!(peer = %peer, kind = control.kind(), "Control message");
                if MessageRouter::accepts(&control) {
                    self.router.route(peer, control).await
                } else {
                    self.receiver.handle_control(peer, control).await
                }
            }
            ChannelMessage::Binary(data) => self.receiver.handle_chunk(peer, &data).await,
        }
    }

    /// Handle a message and log instead of returning a failure.
    pub async fn dispatch(&self, peer: &PeerId, message: ChannelMessage) {
        if let Err(e) = self.handle_message(peer, message).await {
            tracing::warn!(peer = %peer, error = %e, "Failed to handle message");
        }
    }

    /// Announce files to one peer or every connected peer.
    ///
    /// # Errors
    ///
    /// See [`TransferOrchestrator::send_file_meta`]; `Error::Cancelled` after
    /// close.
    pub async fn send_file_meta(&self, files: &[OutgoingFile], peer: Option<&PeerId>) -> Result<()> {
        self.ensure_open()?;
        self.sender.send_file_meta(files, peer).await
    }

    /// Send a text message to one peer or every connected peer.
    ///
    /// # Errors
    ///
    /// See [`TransferOrchestrator::send_string`]; `Error::Cancelled` after
    /// close.
    pub fn send_string(&self, text: &str, peer: Option<&PeerId>) -> Result<()> {
        self.ensure_open()?;
        self.sender.send_string(text, peer)
    }

    /// Request a file announced by `peer`.
    ///
    /// # Errors
    ///
    /// See [`ReceiveOrchestrator::request_file`]; `Error::Cancelled` after
    /// close.
    pub async fn request_file(
        &self,
        peer: &PeerId,
        file_id: &str,
        save_to_disk: bool,
    ) -> Result<RequestOutcome> {
        self.ensure_open()?;
        self.receiver.request_file(peer, file_id, save_to_disk).await
    }

    /// Request every member of a folder announced by `peer`.
    ///
    /// # Errors
    ///
    /// See [`ReceiveOrchestrator::request_folder`]; `Error::Cancelled` after
    /// close.
    pub async fn request_folder(
        &self,
        peer: &PeerId,
        folder_name: &str,
        save_to_disk: bool,
    ) -> Result<FolderReceipt> {
        self.ensure_open()?;
        self.receiver
            .request_folder(peer, folder_name, save_to_disk)
            .await
    }

    /// Files announced by `peer`.
    pub async fn available_files(&self, peer: &PeerId) -> Vec<FileMetadata> {
        self.receiver.available_files(peer).await
    }

    /// Folder announced by `peer`, with bytes present so far.
    pub async fn folder(&self, peer: &PeerId, folder_name: &str) -> Option<FolderAggregate> {
        self.receiver.folder(peer, folder_name).await
    }

    /// Forget a peer that went away.
    ///
    /// Its outgoing send is aborted, an incoming reception keeps its partial
    /// file for a later resume, and pending requests fail with
    /// `Error::PeerGone`.
    pub async fn peer_disconnected(&self, peer: &PeerId) {
        tracing::info!(peer = %peer, "Peer disconnected");
        self.sender.peer_disconnected(peer).await;
        self.receiver.peer_disconnected(peer).await;
        self.events
            .emit(SessionEvent::PeerDisconnected { peer: peer.clone() });
    }

    /// Close the session: abort sends, close disk sinks and drop all state.
    ///
    /// Pending requests fail with `Error::Cancelled`. Closing twice is a
    /// no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sender.close().await;
        self.receiver.close().await;
        tracing::debug!("Session closed");
    }
}
