//! Transfer pipelines for Pipedrop.
//!
//! - [`sender`]: answers file requests by streaming chunk packets with
//!   adaptive pacing, then waits for the peer's receipt
//! - [`receiver`]: requests files, reassembles chunks in memory or on disk,
//!   resumes from partial files
//!
//! ## Transfer Protocol
//!
//! - Default chunk size: 64 KB, one self-describing packet per chunk
//! - Disk reads in 32 MB batches on the sender
//! - Reorder buffer of 100 chunks in front of the receiver's disk sink
//! - One file in flight per peer and direction

pub mod backpressure;
pub mod progress;
pub mod receiver;
pub mod sender;

pub use backpressure::{choose_strategy, NetworkMetrics, NetworkTransmitter, SendStrategy};
pub use progress::ProgressTracker;
pub use receiver::{PendingReception, ReceiveOrchestrator, RequestOutcome};
pub use sender::TransferOrchestrator;

use std::time::Duration;

use crate::channel::{ChannelMessage, PeerChannel, PeerId};
use crate::error::Result;
use crate::protocol::{encode_control, ControlMessage};

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    /// Sending files
    Send,
    /// Receiving files
    Receive,
}

/// What a progress report is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProgressTarget {
    /// A single file, by id
    File(String),
    /// A folder, by name
    Folder(String),
}

/// Progress snapshot for one file or folder.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    /// Direction of the transfer
    pub direction: TransferDirection,
    /// Peer on the other side
    pub peer: PeerId,
    /// File or folder the numbers refer to
    pub target: ProgressTarget,
    /// Bytes transferred, including any resumed prefix
    pub bytes_transferred: u64,
    /// Total bytes
    pub total_bytes: u64,
    /// Smoothed transfer speed in bytes per second
    pub speed_bps: u64,
    /// Estimated time remaining
    pub eta: Option<Duration>,
}

impl TransferProgress {
    /// Fraction transferred in `[0, 1]` (1.0 when there is nothing to send).
    #[must_use]
    pub fn ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64).min(1.0)
        }
    }

    /// Progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        self.ratio() * 100.0
    }

    /// Whether every byte has been transferred.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.bytes_transferred >= self.total_bytes
    }
}

/// Encode and send one control message.
pub(crate) fn send_control(
    channel: &dyn PeerChannel,
    peer: &PeerId,
    message: &ControlMessage,
) -> Result<()> {
    let text = encode_control(message)?;
    channel.send(peer, ChannelMessage::Text(text))?;
    tracing::trace!(peer = %peer, kind = message.kind(), "Sent control message");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_ratio() {
        let mut progress = TransferProgress {
            direction: TransferDirection::Receive,
            peer: PeerId::from("bob"),
            target: ProgressTarget::File("abc".into()),
            bytes_transferred: 50,
            total_bytes: 200,
            speed_bps: 0,
            eta: None,
        };
        assert!((progress.ratio() - 0.25).abs() < f64::EPSILON);
        assert!(!progress.is_complete());

        progress.total_bytes = 0;
        assert!((progress.percentage() - 100.0).abs() < f64::EPSILON);
    }
}
