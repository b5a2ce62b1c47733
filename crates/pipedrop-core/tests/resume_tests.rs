//! Tests for resuming interrupted receptions from partial files on disk.

mod common;

use common::{connect, create_temp_dir, create_test_file, link_into, link_with, random_bytes, Side};

use pipedrop_core::channel::ChannelMessage;
use pipedrop_core::config::Config;
use pipedrop_core::events::{ReceivedContent, SessionEvent};
use pipedrop_core::file::{enumerate_outgoing, FileMetadata};
use pipedrop_core::transfer::RequestOutcome;
use pipedrop_core::Error;

const FILE_SIZE: usize = 200_000;
const TWO_CHUNKS: usize = 131_072;

async fn announce(alice: &Side, bob: &mut Side, content: &[u8]) -> FileMetadata {
    let path = create_test_file(alice.dir.path(), "video.bin", content);
    let files = enumerate_outgoing(&[path]).expect("enumerate");
    alice
        .session
        .send_file_meta(&files, None)
        .await
        .expect("announce");

    let SessionEvent::FileAvailable { metadata, .. } = bob
        .wait_for(|e| matches!(e, SessionEvent::FileAvailable { .. }))
        .await
    else {
        unreachable!();
    };
    metadata
}

/// Two chunks already on disk: only the last two are requested.
#[tokio::test]
async fn test_resume_from_two_chunks() {
    let content = random_bytes(FILE_SIZE);
    let bob_dir = create_temp_dir();
    create_test_file(bob_dir.path(), "video.bin", &content[..TWO_CHUNKS]);

    let mut link = link_into(&Config::default(), bob_dir);
    link.alice.start_pump();
    link.bob.start_pump();
    let meta = announce(&link.alice, &mut link.bob, &content).await;

    let RequestOutcome::Pending(pending) = link
        .bob
        .session
        .request_file(&link.bob.remote, &meta.file_id, true)
        .await
        .expect("request")
    else {
        panic!("partial file should be resumed");
    };
    assert_eq!(pending.resume_offset, 131_072);
    assert_eq!(pending.expected_chunks, 2);

    let file = pending.wait().await.expect("receive");
    assert_eq!(file.resumed_from, 131_072);
    let ReceivedContent::OnDisk(path) = &file.content else {
        panic!("expected file on disk");
    };
    assert_eq!(std::fs::metadata(path).unwrap().len(), FILE_SIZE as u64);
    assert_eq!(std::fs::read(path).unwrap(), content);

    link.alice
        .wait_for(|e| matches!(e, SessionEvent::FileSent { store_updated: true, .. }))
        .await;
}

/// A partial file not on a chunk boundary resumes from the boundary below.
#[tokio::test]
async fn test_unaligned_partial_rounds_down() {
    let content = random_bytes(FILE_SIZE);
    let bob_dir = create_temp_dir();
    create_test_file(bob_dir.path(), "video.bin", &content[..100_000]);

    let mut link = link_into(&Config::default(), bob_dir);
    link.alice.start_pump();
    link.bob.start_pump();
    let meta = announce(&link.alice, &mut link.bob, &content).await;

    let RequestOutcome::Pending(pending) = link
        .bob
        .session
        .request_file(&link.bob.remote, &meta.file_id, true)
        .await
        .unwrap()
    else {
        panic!("request expected");
    };
    assert_eq!(pending.resume_offset, 65_536);
    assert_eq!(pending.expected_chunks, 3);

    pending.wait().await.unwrap();
    assert_eq!(
        std::fs::read(link.bob.dir.path().join("video.bin")).unwrap(),
        content
    );
}

/// A complete file on disk is reported without a request.
#[tokio::test]
async fn test_complete_file_is_not_requested() {
    let mut link = connect();
    let content = random_bytes(10_000);
    create_test_file(link.bob.dir.path(), "video.bin", &content);
    let meta = announce(&link.alice, &mut link.bob, &content).await;

    let outcome = link
        .bob
        .session
        .request_file(&link.bob.remote, &meta.file_id, true)
        .await
        .unwrap();
    let RequestOutcome::AlreadyComplete(file) = outcome else {
        panic!("file is complete on disk");
    };
    assert!(file.store_updated());
    assert!(!link.alice.session.sender().is_sending(&link.alice.remote).await);
}

/// An interrupted reception keeps its flushed chunks, and a new session
/// finishes the file from there.
#[tokio::test]
async fn test_disconnect_then_resume() {
    let content = random_bytes(FILE_SIZE);
    let mut link = link_with(&Config::default());
    link.alice.start_pump();
    let mut bob_inbox = link.bob.inbox.take().expect("inbox");

    // deliver the announcement by hand
    let path = create_test_file(link.alice.dir.path(), "video.bin", &content);
    let files = enumerate_outgoing(&[path]).unwrap();
    let file_id = files[0].metadata.file_id.clone();
    link.alice.session.send_file_meta(&files, None).await.unwrap();
    let (peer, message) = bob_inbox.recv().await.expect("fileMeta");
    link.bob.session.handle_message(&peer, message).await.unwrap();

    let RequestOutcome::Pending(pending) = link
        .bob
        .session
        .request_file(&peer, &file_id, true)
        .await
        .unwrap()
    else {
        panic!("request expected");
    };

    // two of four chunks arrive, then the link drops
    for _ in 0..2 {
        let (peer, message) = bob_inbox.recv().await.expect("chunk");
        assert!(matches!(message, ChannelMessage::Binary(_)));
        link.bob.session.handle_message(&peer, message).await.unwrap();
    }
    link.bob.channel.close();
    link.bob.session.peer_disconnected(&peer).await;

    assert!(matches!(pending.wait().await, Err(Error::PeerGone(_))));
    let partial = link.bob.dir.path().join("video.bin");
    assert_eq!(std::fs::metadata(&partial).unwrap().len(), TWO_CHUNKS as u64);

    // a fresh link over the same receiving directory
    let mut link = link_into(&Config::default(), link.bob.dir);
    link.alice.start_pump();
    link.bob.start_pump();
    let meta = announce(&link.alice, &mut link.bob, &content).await;
    assert_eq!(meta.file_id, file_id);

    let RequestOutcome::Pending(pending) = link
        .bob
        .session
        .request_file(&link.bob.remote, &file_id, true)
        .await
        .unwrap()
    else {
        panic!("request expected");
    };
    assert_eq!(pending.resume_offset, TWO_CHUNKS as u64);
    pending.wait().await.unwrap();
    assert_eq!(std::fs::read(link.bob.dir.path().join("video.bin")).unwrap(), content);
}

/// A file on disk larger than announced is received again from the start.
#[tokio::test]
async fn test_oversized_partial_restarts() {
    let content = random_bytes(5_000);
    let bob_dir = create_temp_dir();
    create_test_file(bob_dir.path(), "video.bin", &random_bytes(9_000));

    let mut link = link_into(&Config::default(), bob_dir);
    link.alice.start_pump();
    link.bob.start_pump();
    let meta = announce(&link.alice, &mut link.bob, &content).await;

    let RequestOutcome::Pending(pending) = link
        .bob
        .session
        .request_file(&link.bob.remote, &meta.file_id, true)
        .await
        .unwrap()
    else {
        panic!("request expected");
    };
    assert_eq!(pending.resume_offset, 0);
    pending.wait().await.unwrap();
    assert_eq!(
        std::fs::read(link.bob.dir.path().join("video.bin")).unwrap(),
        content
    );
}

/// A sender that never answers fails the reception after the idle timeout,
/// keeps the partial file and leaves the peer free for a retry.
#[tokio::test]
async fn test_stalled_sender_times_out_then_resumes() {
    let content = random_bytes(FILE_SIZE);
    let bob_dir = create_temp_dir();
    create_test_file(bob_dir.path(), "video.bin", &content[..TWO_CHUNKS]);

    let mut config = Config::default();
    config.transfer.receive_idle_timeout = std::time::Duration::from_millis(300);
    let mut link = link_into(&config, bob_dir);
    // alice's inbox is not pumped yet: the request goes unanswered
    link.bob.start_pump();
    let meta = announce(&link.alice, &mut link.bob, &content).await;

    let RequestOutcome::Pending(pending) = link
        .bob
        .session
        .request_file(&link.bob.remote, &meta.file_id, true)
        .await
        .expect("request")
    else {
        panic!("partial file should be resumed");
    };
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), pending.wait())
        .await
        .expect("stalled reception should time out");
    assert!(matches!(result, Err(Error::Timeout(_))));
    link.bob
        .wait_for(|e| matches!(e, SessionEvent::TransferFailed { recoverable: true, .. }))
        .await;
    assert_eq!(
        std::fs::metadata(link.bob.dir.path().join("video.bin"))
            .unwrap()
            .len(),
        TWO_CHUNKS as u64
    );

    // the first request is lost, then alice comes back
    let stale = link.alice.inbox.as_mut().expect("inbox").try_recv();
    assert!(matches!(stale, Some((_, ChannelMessage::Text(_)))));
    link.alice.start_pump();
    let RequestOutcome::Pending(pending) = link
        .bob
        .session
        .request_file(&link.bob.remote, &meta.file_id, true)
        .await
        .expect("retry is not blocked by the timed-out reception")
    else {
        panic!("partial file should be resumed");
    };
    assert_eq!(pending.resume_offset, TWO_CHUNKS as u64);
    let file = pending.wait().await.expect("receive");
    let ReceivedContent::OnDisk(path) = &file.content else {
        panic!("expected file on disk");
    };
    assert_eq!(std::fs::read(path).unwrap(), content);
}
