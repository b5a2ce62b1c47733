//! Dispatch of control messages addressed to the sender.

use super::TransferOrchestrator;
use crate::channel::PeerId;
use crate::error::{Error, Result};
use crate::protocol::ControlMessage;

/// Routes `fileRequest` and receipts from a peer into the orchestrator.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    orchestrator: TransferOrchestrator,
}

impl MessageRouter {
    /// Create a router driving `orchestrator`.
    #[must_use]
    pub fn new(orchestrator: TransferOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Whether the message is addressed to the sending side.
    #[must_use]
    pub const fn accepts(message: &ControlMessage) -> bool {
        matches!(
            message,
            ControlMessage::FileRequest { .. }
                | ControlMessage::FileReceiveComplete { .. }
                | ControlMessage::FolderReceiveComplete { .. }
        )
    }

    /// Handle one message from `peer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be served (unknown file, send
    /// already in flight) or the message is not meant for the sender.
    pub async fn route(&self, peer: &PeerId, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::FileRequest { file_id, offset } => {
                self.orchestrator
                    .handle_file_request(peer, &file_id, offset)
                    .await
            }
            ControlMessage::FileReceiveComplete {
                file_id,
                received_size,
                received_chunks,
                store_updated,
            } => {
                tracing::debug!(
                    peer = %peer,
                    file_id = %file_id,
                    received_size,
                    received_chunks,
                    "Receipt from peer"
                );
                self.orchestrator
                    .handle_receive_complete(peer, &file_id, store_updated)
                    .await;
                Ok(())
            }
            ControlMessage::FolderReceiveComplete {
                folder_name,
                completed_file_ids,
                all_store_updated,
            } => {
                tracing::debug!(
                    peer = %peer,
                    folder = %folder_name,
                    completed = completed_file_ids.len(),
                    all_store_updated,
                    "Folder receipt from peer"
                );
                self.orchestrator
                    .handle_folder_complete(peer, folder_name, completed_file_ids);
                Ok(())
            }
            other => Err(Error::ProtocolViolation(format!(
                "'{}' is not a sender-bound message",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_sender_bound_messages() {
        assert!(MessageRouter::accepts(&ControlMessage::FileRequest {
            file_id: "a".into(),
            offset: 0
        }));
        assert!(MessageRouter::accepts(&ControlMessage::FolderReceiveComplete {
            folder_name: "f".into(),
            completed_file_ids: vec![],
            all_store_updated: true,
        }));
        assert!(!MessageRouter::accepts(&ControlMessage::StringMetadata {
            length: 3
        }));
    }
}
