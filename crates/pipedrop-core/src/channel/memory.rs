//! In-process channel linking two peers.
//!
//! Each direction is an unbounded queue. The sending side's
//! `buffered_amount` counts bytes that the other side has not pulled out of
//! its [`MemoryInbox`] yet, so a slow consumer produces real backpressure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::{ChannelMessage, PeerChannel, PeerId};
use crate::error::{Error, Result};

/// One endpoint of a linked pair.
#[derive(Debug)]
pub struct MemoryEndpoint {
    /// Outbound side, shared with the session
    pub channel: Arc<MemoryChannel>,
    /// Inbound messages from the other endpoint
    pub inbox: MemoryInbox,
}

/// Outbound side of an in-process link.
#[derive(Debug)]
pub struct MemoryChannel {
    local: PeerId,
    remote: PeerId,
    outbox: mpsc::UnboundedSender<ChannelMessage>,
    buffered: Arc<AtomicU64>,
    closed: Arc<watch::Sender<bool>>,
    max_message_size: usize,
}

impl MemoryChannel {
    /// Link two endpoints named `a` and `b`.
    ///
    /// The first endpoint is `a`'s view (its remote peer is `b`), the second
    /// is `b`'s view.
    #[must_use]
    pub fn pair(a: impl Into<PeerId>, b: impl Into<PeerId>) -> (MemoryEndpoint, MemoryEndpoint) {
        Self::pair_with_limit(a, b, crate::DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Link two endpoints, rejecting messages above `max_message_size` bytes.
    #[must_use]
    pub fn pair_with_limit(
        a: impl Into<PeerId>,
        b: impl Into<PeerId>,
        max_message_size: usize,
    ) -> (MemoryEndpoint, MemoryEndpoint) {
        let a = a.into();
        let b = b.into();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let (a_to_b, b_inbox_rx) = mpsc::unbounded_channel();
        let (b_to_a, a_inbox_rx) = mpsc::unbounded_channel();
        let a_buffered = Arc::new(AtomicU64::new(0));
        let b_buffered = Arc::new(AtomicU64::new(0));

        let a_end = MemoryEndpoint {
            channel: Arc::new(Self {
                local: a.clone(),
                remote: b.clone(),
                outbox: a_to_b,
                buffered: Arc::clone(&a_buffered),
                closed: Arc::clone(&closed),
                max_message_size,
            }),
            inbox: MemoryInbox {
                from: b.clone(),
                rx: a_inbox_rx,
                buffered: Arc::clone(&b_buffered),
                closed: closed.subscribe(),
            },
        };
        let b_end = MemoryEndpoint {
            channel: Arc::new(Self {
                local: b,
                remote: a.clone(),
                outbox: b_to_a,
                buffered: b_buffered,
                closed: Arc::clone(&closed),
                max_message_size,
            }),
            inbox: MemoryInbox {
                from: a,
                rx: b_inbox_rx,
                buffered: a_buffered,
                closed: closed.subscribe(),
            },
        };

        (a_end, b_end)
    }

    /// Close the link in both directions. Queued messages are dropped.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            tracing::debug!(local = %self.local, remote = %self.remote, "Memory channel closed");
        }
    }

    fn open(&self) -> bool {
        !*self.closed.borrow()
    }
}

impl PeerChannel for MemoryChannel {
    fn send(&self, peer: &PeerId, message: ChannelMessage) -> Result<()> {
        if peer != &self.remote {
            return Err(Error::Transport(format!("no channel to peer '{peer}'")));
        }
        if !self.open() {
            return Err(Error::Transport(format!("channel to '{peer}' is closed")));
        }
        let len = message.len();
        if len > self.max_message_size {
            return Err(Error::Transport(format!(
                "message of {len} bytes exceeds channel limit of {} bytes",
                self.max_message_size
            )));
        }

        self.buffered.fetch_add(len as u64, Ordering::SeqCst);
        self.outbox.send(message).map_err(|_| {
            self.buffered.fetch_sub(len as u64, Ordering::SeqCst);
            Error::Transport(format!("peer '{peer}' stopped receiving"))
        })
    }

    fn buffered_amount(&self, peer: &PeerId) -> u64 {
        if peer == &self.remote {
            self.buffered.load(Ordering::SeqCst)
        } else {
            0
        }
    }

    fn is_open(&self, peer: &PeerId) -> bool {
        peer == &self.remote && self.open() && !self.outbox.is_closed()
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        if self.is_open(&self.remote) {
            vec![self.remote.clone()]
        } else {
            Vec::new()
        }
    }
}

/// Inbound side of an in-process link.
#[derive(Debug)]
pub struct MemoryInbox {
    from: PeerId,
    rx: mpsc::UnboundedReceiver<ChannelMessage>,
    buffered: Arc<AtomicU64>,
    closed: watch::Receiver<bool>,
}

impl MemoryInbox {
    /// Peer the messages come from.
    #[must_use]
    pub fn peer(&self) -> &PeerId {
        &self.from
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the link is closed or the other endpoint is gone.
    pub async fn recv(&mut self) -> Option<(PeerId, ChannelMessage)> {
        if *self.closed.borrow() {
            return None;
        }

        let message = tokio::select! {
            biased;
            _ = self.closed.wait_for(|closed| *closed) => return None,
            message = self.rx.recv() => message?,
        };

        Some(self.take(message))
    }

    /// Take the next message if one is queued.
    pub fn try_recv(&mut self) -> Option<(PeerId, ChannelMessage)> {
        if *self.closed.borrow() {
            return None;
        }
        let message = self.rx.try_recv().ok()?;
        Some(self.take(message))
    }

    fn take(&self, message: ChannelMessage) -> (PeerId, ChannelMessage) {
        let len = message.len() as u64;
        let _ = self
            .buffered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| {
                Some(b.saturating_sub(len))
            });
        (self.from.clone(), message)
    }
}
