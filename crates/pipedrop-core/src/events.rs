//! Events delivered to the embedding application.
//!
//! A [`Session`](crate::session::Session) never calls back into application
//! code. Everything observable (new files, received text, progress,
//! completions, failures) is pushed as a [`SessionEvent`] through the
//! [`EventSink`] created alongside the session.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::channel::PeerId;
use crate::error::Error;
use crate::file::FileMetadata;
use crate::transfer::TransferProgress;

/// Where a received file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedContent {
    /// Assembled in memory
    InMemory(Vec<u8>),
    /// Written to storage at this location
    OnDisk(PathBuf),
}

/// A fully received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Announced metadata
    pub metadata: FileMetadata,
    /// File contents or location
    pub content: ReceivedContent,
    /// Offset the reception resumed from (0 for a fresh transfer)
    pub resumed_from: u64,
    /// When the reception was finalized
    pub received_at: DateTime<Utc>,
}

impl ReceivedFile {
    /// Whether the file was persisted to storage.
    #[must_use]
    pub fn store_updated(&self) -> bool {
        matches!(self.content, ReceivedContent::OnDisk(_))
    }
}

/// Something that happened in a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A peer announced a file that was not known before
    FileAvailable {
        /// Announcing peer
        peer: PeerId,
        /// File metadata
        metadata: FileMetadata,
    },
    /// A folder gained a member
    FolderUpdated {
        /// Announcing peer
        peer: PeerId,
        /// Folder name
        folder_name: String,
        /// Running total of member sizes
        total_size: u64,
        /// Number of members seen so far
        file_count: usize,
    },
    /// A text message was fully received
    TextReceived {
        /// Sending peer
        peer: PeerId,
        /// Message text
        text: String,
    },
    /// Progress of a file or folder transfer
    Progress(TransferProgress),
    /// A file was acknowledged by the receiving peer
    FileSent {
        /// Receiving peer
        peer: PeerId,
        /// Sent file
        file_id: String,
        /// Whether the peer persisted the file to disk
        store_updated: bool,
    },
    /// A file was fully received
    FileReceived {
        /// Sending peer
        peer: PeerId,
        /// The file
        file: ReceivedFile,
    },
    /// Every requested member of a folder was received
    FolderReceived {
        /// Sending peer
        peer: PeerId,
        /// Folder name
        folder_name: String,
        /// Members that completed
        completed_file_ids: Vec<String>,
        /// Whether every member was persisted to disk
        all_store_updated: bool,
    },
    /// The receiving peer confirmed a whole folder
    FolderSent {
        /// Receiving peer
        peer: PeerId,
        /// Folder name
        folder_name: String,
        /// Members the peer completed
        completed_file_ids: Vec<String>,
    },
    /// A transfer failed
    TransferFailed {
        /// Peer on the other side
        peer: PeerId,
        /// Affected file, if the failure concerns one
        file_id: Option<String>,
        /// Error description
        message: String,
        /// Whether re-requesting the file later can recover
        recoverable: bool,
    },
    /// A peer went away; its state was dropped
    PeerDisconnected {
        /// The peer
        peer: PeerId,
    },
}

impl SessionEvent {
    /// Build a failure event from an error.
    #[must_use]
    pub fn failed(peer: &PeerId, file_id: Option<&str>, error: &Error) -> Self {
        Self::TransferFailed {
            peer: peer.clone(),
            file_id: file_id.map(ToString::to_string),
            message: error.to_string(),
            recoverable: error.is_recoverable(),
        }
    }
}

/// Sending half of the event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the application reads from.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Push an event. Events are dropped once the application stops listening.
    pub fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event receiver dropped, discarding event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(SessionEvent::PeerDisconnected {
            peer: PeerId::from("bob"),
        });

        match rx.recv().await {
            Some(SessionEvent::PeerDisconnected { peer }) => assert_eq!(peer.as_str(), "bob"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(SessionEvent::PeerDisconnected {
            peer: PeerId::from("bob"),
        });
    }

    #[test]
    fn test_failed_event_carries_recoverability() {
        let event = SessionEvent::failed(
            &PeerId::from("bob"),
            Some("abc"),
            &Error::PeerGone("bob".into()),
        );
        match event {
            SessionEvent::TransferFailed {
                file_id,
                recoverable,
                ..
            } => {
                assert_eq!(file_id.as_deref(), Some("abc"));
                assert!(recoverable);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
