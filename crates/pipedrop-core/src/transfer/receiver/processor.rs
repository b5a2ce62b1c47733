//! Control messages addressed to the receiver: announcements and text.

use std::path::Path;
use std::sync::Arc;

use super::state::ReceptionStateManager;
use crate::channel::PeerId;
use crate::error::{Error, Result};
use crate::events::{EventSink, SessionEvent};
use crate::file::{sanitize_path, FileMetadata};
use crate::protocol::ControlMessage;

/// Applies `fileMeta`, `stringMetadata` and `string` messages to peer state.
#[derive(Debug)]
pub struct MessageProcessor<W> {
    state: Arc<ReceptionStateManager<W>>,
    events: EventSink,
}

impl<W> MessageProcessor<W> {
    /// Create a processor writing into `state`.
    pub fn new(state: Arc<ReceptionStateManager<W>>, events: EventSink) -> Self {
        Self { state, events }
    }

    /// Whether the message is addressed to the receiving side.
    #[must_use]
    pub const fn accepts(message: &ControlMessage) -> bool {
        matches!(
            message,
            ControlMessage::FileMeta(_)
                | ControlMessage::StringMetadata { .. }
                | ControlMessage::String { .. }
        )
    }

    /// Handle one message from `peer`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProtocolViolation` for a message the receiver does not
    /// handle or an announcement with an unsafe path.
    pub async fn process(&self, peer: &PeerId, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::FileMeta(meta) => self.announce(peer, meta).await,
            ControlMessage::StringMetadata { length } => {
                let state = self.state.peer(peer).await;
                state.lock().await.text.begin(length);
                Ok(())
            }
            ControlMessage::String {
                chunk,
                index,
                total,
            } => {
                let state = self.state.peer(peer).await;
                let text = state.lock().await.text.push(chunk, index, total);
                if let Some(text) = text {
                    tracing::debug!(peer = %peer, bytes = text.len(), "Text received");
                    self.events.emit(SessionEvent::TextReceived {
                        peer: peer.clone(),
                        text,
                    });
                }
                Ok(())
            }
            other => Err(Error::ProtocolViolation(format!(
                "'{}' is not a receiver-bound message",
                other.kind()
            ))),
        }
    }

    async fn announce(&self, peer: &PeerId, meta: FileMetadata) -> Result<()> {
        if meta.full_relative_path.is_empty()
            || sanitize_path(Path::new(""), &meta.relative_path()).is_none()
        {
            return Err(Error::ProtocolViolation(format!(
                "announced path '{}' is not a safe relative path",
                meta.full_relative_path
            )));
        }

        let state = self.state.peer(peer).await;
        let mut state = state.lock().await;
        if !state.announce(meta.clone()) {
            tracing::debug!(peer = %peer, file_id = %meta.file_id, "Repeated announcement ignored");
            return Ok(());
        }

        tracing::info!(
            peer = %peer,
            file_id = %meta.file_id,
            name = %meta.name,
            size = meta.size,
            "File available"
        );

        let folder = state
            .folders
            .get(&meta.folder_name)
            .map(|f| (f.total_size, f.member_file_ids.len()));
        drop(state);

        let folder_name = meta.folder_name.clone();
        self.events.emit(SessionEvent::FileAvailable {
            peer: peer.clone(),
            metadata: meta,
        });
        if let Some((total_size, file_count)) = folder {
            self.events.emit(SessionEvent::FolderUpdated {
                peer: peer.clone(),
                folder_name,
                total_size,
                file_count,
            });
        }
        Ok(())
    }
}
