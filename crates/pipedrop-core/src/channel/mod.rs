//! Peer message channel abstraction.
//!
//! Pipedrop runs on top of an ordered, reliable, message-oriented channel to
//! each peer (a WebRTC data channel or anything with the same guarantees).
//! Establishing that channel is not Pipedrop's job: the embedding application
//! hands a [`PeerChannel`] to [`Session::open`](crate::session::Session::open)
//! and forwards every inbound message to the session.
//!
//! [`MemoryChannel`] links two endpoints in-process.

pub mod memory;

pub use memory::{MemoryChannel, MemoryEndpoint, MemoryInbox};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifier of a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A single channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Text message carrying a JSON control message
    Text(String),
    /// Binary message carrying one chunk packet
    Binary(Vec<u8>),
}

impl ChannelMessage {
    /// Size of the message in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Whether the message is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outbound side of the channels to every connected peer.
///
/// `send` enqueues and returns without waiting for delivery, like a data
/// channel. Each message is delivered whole and in order, or not at all.
pub trait PeerChannel: Send + Sync {
    /// Enqueue a message for `peer`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the channel to `peer` is closed or the
    /// message cannot be accepted.
    fn send(&self, peer: &PeerId, message: ChannelMessage) -> Result<()>;

    /// Bytes queued towards `peer` but not yet handed to the network.
    fn buffered_amount(&self, peer: &PeerId) -> u64;

    /// Whether the channel to `peer` is open.
    fn is_open(&self, peer: &PeerId) -> bool;

    /// Every peer with an open channel.
    fn connected_peers(&self) -> Vec<PeerId>;
}
