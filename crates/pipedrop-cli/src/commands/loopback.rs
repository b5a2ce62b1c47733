//! Loopback command implementation.
//!
//! Runs a sending and a receiving session in one process, linked by an
//! in-memory channel, and streams the given paths from one to the other.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;

use pipedrop_core::channel::{ChannelMessage, MemoryChannel, MemoryInbox, PeerId};
use pipedrop_core::config::Config;
use pipedrop_core::events::{ReceivedContent, ReceivedFile, SessionEvent};
use pipedrop_core::file::{enumerate_outgoing, format_size, OutgoingFile};
use pipedrop_core::storage::FsStorage;
use pipedrop_core::transfer::{ProgressTarget, RequestOutcome, TransferDirection};
use pipedrop_core::Session;

use super::LoopbackArgs;

const SENDER: &str = "sender";
const RECEIVER: &str = "receiver";
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the loopback command.
pub async fn run(args: LoopbackArgs) -> Result<()> {
    let config = super::load_config();
    let files = enumerate_outgoing(&args.paths).context("Failed to read input paths")?;
    if files.is_empty() {
        bail!("Nothing to send: no regular files under the given paths");
    }

    let save_to_disk = config.general.save_to_disk && !args.memory;
    let output_dir = args
        .output
        .clone()
        .or_else(|| config.general.default_output.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    if save_to_disk {
        std::fs::create_dir_all(&output_dir).with_context(|| {
            format!("Failed to create output directory {}", output_dir.display())
        })?;
    }

    let total_size: u64 = files.iter().map(|f| f.metadata.size).sum();
    if !args.quiet {
        println!();
        println!("  Pipedrop loopback");
        println!("  {}", "─".repeat(40));
        println!(
            "  {} file(s), {}",
            files.len(),
            format_size(total_size)
        );
        if save_to_disk {
            println!("  Output: {}", output_dir.display());
        } else {
            println!("  Output: memory");
        }
        println!();
    }

    let outcome = transfer(&config, &args, &files, &output_dir, save_to_disk).await?;

    if args.quiet {
        return Ok(());
    }
    println!();
    match outcome {
        Outcome::Complete {
            received,
            skipped,
            elapsed,
        } => {
            println!("  Transfer complete!");
            println!(
                "  {} received, {} already present, {:.1}s",
                received,
                skipped,
                elapsed.as_secs_f64()
            );
            if save_to_disk {
                println!("  Files saved to: {}", output_dir.display());
            }
        }
        Outcome::Interrupted { chunks } => {
            println!("  Link dropped after {} chunk(s).", chunks);
            if save_to_disk {
                println!("  Partial files were kept; run the same command again to resume.");
            }
        }
    }
    println!();

    Ok(())
}

#[derive(Debug)]
enum Outcome {
    Complete {
        received: usize,
        skipped: usize,
        elapsed: Duration,
    },
    Interrupted {
        chunks: u64,
    },
}

async fn transfer(
    config: &Config,
    args: &LoopbackArgs,
    files: &[OutgoingFile],
    output_dir: &Path,
    save_to_disk: bool,
) -> Result<Outcome> {
    let (left, right) =
        MemoryChannel::pair_with_limit(SENDER, RECEIVER, config.transfer.max_message_size);
    let link = Arc::clone(&right.channel);

    let (sender, _sender_events) =
        Session::open(config, left.channel, FsStorage::new(output_dir))?;
    let (receiver, mut events) = Session::open(config, right.channel, FsStorage::new(output_dir))?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let chunks = Arc::new(AtomicU64::new(0));

    let sender_pump = tokio::spawn(pump(sender.clone(), left.inbox, None));
    let receiver_pump = tokio::spawn(pump(
        receiver.clone(),
        right.inbox,
        Some(Interrupt {
            after: args.stop_after,
            chunks: Arc::clone(&chunks),
            interrupted: Arc::clone(&interrupted),
            link,
        }),
    ));

    let peer = PeerId::from(SENDER);
    sender.send_file_meta(files, None).await?;
    if let Some(text) = &args.text {
        sender.send_string(text, None)?;
    }

    tokio::time::timeout(
        ANNOUNCE_TIMEOUT,
        wait_for_announcements(&mut events, files, args.text.is_some(), args.quiet),
    )
    .await
    .context("Timed out waiting for announcements")??;

    let names: HashMap<String, String> = files
        .iter()
        .map(|f| (f.metadata.file_id.clone(), f.metadata.name.clone()))
        .collect();
    let display = (!args.quiet).then(|| tokio::spawn(display_progress(events, names)));

    let start = Instant::now();
    let result = request_all(&receiver, &peer, files, save_to_disk).await;

    if let Some(handle) = display {
        handle.abort();
    }
    receiver.close().await;
    sender.close().await;
    sender_pump.abort();
    receiver_pump.abort();

    match result {
        Ok((received, skipped)) => Ok(Outcome::Complete {
            received,
            skipped,
            elapsed: start.elapsed(),
        }),
        Err(e) if interrupted.load(Ordering::SeqCst) => {
            tracing::debug!(error = %e, "Reception stopped by interruption");
            Ok(Outcome::Interrupted {
                chunks: chunks.load(Ordering::SeqCst),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Request standalone files one by one, then each folder.
///
/// Returns the number of files received and the number already present.
async fn request_all(
    receiver: &Session<FsStorage>,
    peer: &PeerId,
    files: &[OutgoingFile],
    save_to_disk: bool,
) -> pipedrop_core::Result<(usize, usize)> {
    let mut received = 0;
    let mut skipped = 0;
    let mut folders: Vec<&str> = Vec::new();

    for file in files {
        let meta = &file.metadata;
        if meta.is_in_folder() {
            if !folders.contains(&meta.folder_name.as_str()) {
                folders.push(&meta.folder_name);
            }
            continue;
        }

        match receiver
            .request_file(peer, &meta.file_id, save_to_disk)
            .await?
        {
            RequestOutcome::AlreadyComplete(_) => {
                tracing::info!(file = %meta.name, "Already complete, not requested");
                skipped += 1;
            }
            RequestOutcome::Pending(pending) => {
                pending.wait().await?;
                received += 1;
            }
        }
    }

    for folder in folders {
        let receipt = receiver.request_folder(peer, folder, save_to_disk).await?;
        tracing::info!(
            folder = %receipt.folder_name,
            files = receipt.completed_file_ids.len(),
            "Folder received"
        );
        // Members found complete on disk come back with nothing left to receive.
        let present = receipt
            .files
            .iter()
            .filter(|f| f.metadata.size > 0 && f.resumed_from == f.metadata.size)
            .count();
        skipped += present;
        received += receipt.files.len() - present;
    }

    Ok((received, skipped))
}

/// Drops the link once the receiver has taken `after` chunks.
struct Interrupt {
    after: Option<u64>,
    chunks: Arc<AtomicU64>,
    interrupted: Arc<AtomicBool>,
    link: Arc<MemoryChannel>,
}

/// Feed every inbound message of `inbox` into `session`.
async fn pump(session: Session<FsStorage>, mut inbox: MemoryInbox, interrupt: Option<Interrupt>) {
    while let Some((peer, message)) = inbox.recv().await {
        let is_chunk = matches!(message, ChannelMessage::Binary(_));
        session.dispatch(&peer, message).await;

        let Some(interrupt) = &interrupt else {
            continue;
        };
        if !is_chunk {
            continue;
        }
        let count = interrupt.chunks.fetch_add(1, Ordering::SeqCst) + 1;
        if interrupt.after.is_some_and(|after| count >= after) {
            tracing::info!(chunks = count, "Dropping the link");
            interrupt.interrupted.store(true, Ordering::SeqCst);
            interrupt.link.close();
            session.peer_disconnected(&peer).await;
            break;
        }
    }
}

async fn wait_for_announcements(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    files: &[OutgoingFile],
    expect_text: bool,
    quiet: bool,
) -> Result<()> {
    let mut missing = files.len();
    let mut text_pending = expect_text;

    while missing > 0 || text_pending {
        let Some(event) = events.recv().await else {
            bail!("Session closed before all files were announced");
        };
        match event {
            SessionEvent::FileAvailable { metadata, .. } => {
                missing = missing.saturating_sub(1);
                tracing::debug!(
                    file = %metadata.full_relative_path,
                    size = metadata.size,
                    "Announced"
                );
            }
            SessionEvent::TextReceived { text, .. } => {
                text_pending = false;
                if !quiet {
                    println!("  Message: {}", text);
                    println!();
                }
            }
            _ => {}
        }
    }

    Ok(())
}

async fn display_progress(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    names: HashMap<String, String>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Progress(progress) if progress.direction == TransferDirection::Receive => {
                let label = match &progress.target {
                    ProgressTarget::File(id) => names.get(id).map_or(id.as_str(), String::as_str),
                    ProgressTarget::Folder(name) => name.as_str(),
                };
                let eta = progress
                    .eta
                    .map_or_else(|| "--".to_string(), |d| format!("{}s", d.as_secs()));

                print!(
                    "\r  [{:>6.2}%] {} - {}/s - ETA: {}    ",
                    progress.percentage(),
                    label,
                    format_size(progress.speed_bps),
                    eta
                );
                let _ = io::stdout().flush();
            }
            SessionEvent::FileReceived { file, .. } => {
                println!("\r  {}", describe(&file));
            }
            SessionEvent::TransferFailed {
                file_id, message, ..
            } => {
                let label = file_id
                    .as_ref()
                    .and_then(|id| names.get(id))
                    .map_or("transfer", String::as_str);
                println!("\r  {} failed: {}", label, message);
            }
            _ => {}
        }
    }
}

fn describe(file: &ReceivedFile) -> String {
    let resumed = if file.resumed_from > 0 {
        format!(", resumed at {}", format_size(file.resumed_from))
    } else {
        String::new()
    };
    match &file.content {
        ReceivedContent::OnDisk(path) => format!(
            "✓ {} ({}{}) -> {}",
            file.metadata.full_relative_path,
            format_size(file.metadata.size),
            resumed,
            path.display()
        ),
        ReceivedContent::InMemory(data) => format!(
            "✓ {} ({} in memory{})",
            file.metadata.full_relative_path,
            format_size(data.len() as u64),
            resumed
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(paths: Vec<PathBuf>, output: &Path) -> LoopbackArgs {
        LoopbackArgs {
            paths,
            output: Some(output.to_path_buf()),
            memory: false,
            text: None,
            stop_after: None,
            quiet: true,
        }
    }

    #[tokio::test]
    async fn test_loopback_copies_file_and_folder() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        let file = src.path().join("notes.txt");
        std::fs::write(&file, b"hello loopback").unwrap();
        let album = src.path().join("album");
        std::fs::create_dir_all(album.join("nested")).unwrap();
        std::fs::write(album.join("a.bin"), vec![7u8; 150_000]).unwrap();
        std::fs::write(album.join("nested/b.txt"), b"bee").unwrap();

        let args = args(vec![file, album], out.path());
        let files = enumerate_outgoing(&args.paths).unwrap();
        let outcome = transfer(&Config::default(), &args, &files, out.path(), true)
            .await
            .unwrap();

        let Outcome::Complete {
            received, skipped, ..
        } = outcome
        else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(received, 3);
        assert_eq!(skipped, 0);
        assert_eq!(
            std::fs::read(out.path().join("notes.txt")).unwrap(),
            b"hello loopback"
        );
        assert_eq!(
            std::fs::read(out.path().join("album/a.bin")).unwrap().len(),
            150_000
        );
        assert_eq!(
            std::fs::read(out.path().join("album/nested/b.txt")).unwrap(),
            b"bee"
        );
    }

    #[tokio::test]
    async fn test_stop_after_then_resume() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let content: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let file = src.path().join("big.bin");
        std::fs::write(&file, &content).unwrap();

        let mut first = args(vec![file.clone()], out.path());
        first.stop_after = Some(2);
        let files = enumerate_outgoing(&first.paths).unwrap();
        let outcome = transfer(&Config::default(), &first, &files, out.path(), true)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Interrupted { chunks: 2 }));

        let partial = std::fs::metadata(out.path().join("big.bin")).unwrap().len();
        assert!(partial < content.len() as u64);

        let second = args(vec![file], out.path());
        let outcome = transfer(&Config::default(), &second, &files, out.path(), true)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Complete { received: 1, .. }));
        assert_eq!(std::fs::read(out.path().join("big.bin")).unwrap(), content);
    }
}
