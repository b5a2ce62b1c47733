//! Common test utilities for `Pipedrop` integration tests.
//!
//! Two sessions, "alice" and "bob", are linked by an in-memory channel. Each
//! side's inbox is pumped into its session by a background task unless a test
//! takes the inbox to deliver messages by hand.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use pipedrop_core::channel::{MemoryChannel, MemoryInbox, PeerId};
use pipedrop_core::config::Config;
use pipedrop_core::events::SessionEvent;
use pipedrop_core::storage::FsStorage;
use pipedrop_core::Session;

/// How long a test waits for an expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// One side of a linked pair.
pub struct Side {
    /// The session
    pub session: Session<FsStorage>,
    /// Its event stream
    pub events: UnboundedReceiver<SessionEvent>,
    /// Its outbound channel, for closing the link
    pub channel: Arc<MemoryChannel>,
    /// Its inbox, if the test drives it by hand
    pub inbox: Option<MemoryInbox>,
    /// Root of its storage
    pub dir: tempfile::TempDir,
    /// Name of the other side
    pub remote: PeerId,
}

impl Side {
    /// Deliver inbound messages in the background until the link closes,
    /// then report the peer as gone.
    pub fn start_pump(&mut self) -> JoinHandle<()> {
        let mut inbox = self.inbox.take().expect("inbox already pumped");
        let session = self.session.clone();
        tokio::spawn(async move {
            while let Some((peer, message)) = inbox.recv().await {
                session.dispatch(&peer, message).await;
            }
            session.peer_disconnected(inbox.peer()).await;
        })
    }

    /// Wait for the first event matching `predicate`, skipping others.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                let event = self.events.recv().await.expect("event stream ended");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }
}

/// Two linked sessions.
pub struct Link {
    /// The sending side in most tests
    pub alice: Side,
    /// The receiving side in most tests
    pub bob: Side,
}

/// Link two sessions without starting their pumps.
pub fn link_with(config: &Config) -> Link {
    link_into(config, create_temp_dir())
}

/// Link two sessions, bob storing into `bob_dir`.
pub fn link_into(config: &Config, bob_dir: tempfile::TempDir) -> Link {
    let (a, b) = MemoryChannel::pair("alice", "bob");
    let alice_dir = create_temp_dir();

    let (alice, alice_events) =
        Session::open(config, a.channel.clone(), FsStorage::new(alice_dir.path()))
            .expect("open alice");
    let (bob, bob_events) =
        Session::open(config, b.channel.clone(), FsStorage::new(bob_dir.path())).expect("open bob");

    Link {
        alice: Side {
            session: alice,
            events: alice_events,
            channel: a.channel,
            inbox: Some(a.inbox),
            dir: alice_dir,
            remote: PeerId::from("bob"),
        },
        bob: Side {
            session: bob,
            events: bob_events,
            channel: b.channel,
            inbox: Some(b.inbox),
            dir: bob_dir,
            remote: PeerId::from("alice"),
        },
    }
}

/// Link two sessions with default configuration and pump both inboxes.
pub fn connect() -> Link {
    let mut link = link_with(&Config::default());
    link.alice.start_pump();
    link.bob.start_pump();
    link
}
