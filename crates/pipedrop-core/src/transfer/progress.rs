//! Throttled progress reporting with smoothed speed.
//!
//! The same tracker serves both pipelines: the sender feeds it bytes sent,
//! the receiver bytes received. Reports are rate-limited per (peer, target)
//! but a report that reaches the total is never suppressed.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::{ProgressTarget, TransferDirection, TransferProgress};
use crate::channel::PeerId;
use crate::config::ProgressConfig;

#[derive(Debug)]
struct Entry {
    last_sample: Option<(Instant, u64)>,
    last_emit: Option<Instant>,
    speed: Option<f64>,
}

/// Converts byte counters into throttled [`TransferProgress`] reports.
#[derive(Debug)]
pub struct ProgressTracker {
    direction: TransferDirection,
    throttle: Duration,
    smoothing: f64,
    entries: HashMap<(PeerId, ProgressTarget), Entry>,
}

impl ProgressTracker {
    /// Create a tracker for one direction.
    #[must_use]
    pub fn new(direction: TransferDirection, config: &ProgressConfig) -> Self {
        Self {
            direction,
            throttle: config.throttle,
            smoothing: config.speed_smoothing,
            entries: HashMap::new(),
        }
    }

    /// Record the current byte count for a target.
    ///
    /// Returns a report when one is due.
    pub fn update(
        &mut self,
        peer: &PeerId,
        target: &ProgressTarget,
        bytes: u64,
        total: u64,
    ) -> Option<TransferProgress> {
        let now = Instant::now();
        let entry = self
            .entries
            .entry((peer.clone(), target.clone()))
            .or_insert(Entry {
                last_sample: None,
                last_emit: None,
                speed: None,
            });

        match entry.last_sample {
            Some((at, previous)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    let instant = bytes.saturating_sub(previous) as f64 / elapsed;
                    entry.speed = Some(match entry.speed {
                        Some(speed) => self.smoothing * instant + (1.0 - self.smoothing) * speed,
                        None => instant,
                    });
                    entry.last_sample = Some((now, bytes));
                }
            }
            None => entry.last_sample = Some((now, bytes)),
        }

        let finished = bytes >= total;
        let due = entry
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= self.throttle);
        if !finished && !due {
            return None;
        }
        entry.last_emit = Some(now);

        let speed_bps = entry.speed.unwrap_or(0.0).max(0.0) as u64;
        let remaining = total.saturating_sub(bytes);
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if speed_bps > 0 {
            Some(Duration::from_secs_f64(remaining as f64 / speed_bps as f64))
        } else {
            None
        };

        Some(TransferProgress {
            direction: self.direction,
            peer: peer.clone(),
            target: target.clone(),
            bytes_transferred: bytes,
            total_bytes: total,
            speed_bps,
            eta,
        })
    }

    /// Forget a target so its next transfer starts with fresh speed samples.
    pub fn reset(&mut self, peer: &PeerId, target: &ProgressTarget) {
        self.entries.remove(&(peer.clone(), target.clone()));
    }

    /// Forget every target of a peer.
    pub fn forget_peer(&mut self, peer: &PeerId) {
        self.entries.retain(|(p, _), _| p != peer);
    }
}
