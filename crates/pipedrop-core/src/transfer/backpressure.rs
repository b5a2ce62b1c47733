//! Adaptive send pacing.
//!
//! Before every chunk the transmitter compares the channel's buffered amount
//! with a per-peer adaptive threshold and picks a [`SendStrategy`]. Wait-mode
//! cycles measure how fast the channel drains, and that clearing rate re-tunes
//! the threshold for the next chunks.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::channel::{ChannelMessage, PeerChannel, PeerId};
use crate::config::BackpressureConfig;
use crate::error::{Error, Result};
use crate::protocol::{encode_chunk_packet, ChunkMeta};

/// How to pace the next chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStrategy {
    /// Send right away
    Immediate,
    /// Sleep for a fixed delay, then send
    Delay(Duration),
    /// Poll until the buffer drains, then send
    WaitForDrain,
}

/// Pick a strategy from the buffered amount and the adaptive threshold.
#[must_use]
pub fn choose_strategy(buffered: u64, threshold: u64, config: &BackpressureConfig) -> SendStrategy {
    let ratio = buffered as f64 / threshold.max(1) as f64;

    if ratio < config.aggressive_cutoff {
        SendStrategy::Immediate
    } else if ratio < config.normal_cutoff {
        SendStrategy::Delay(config.short_delay)
    } else if ratio < config.cautious_cutoff {
        SendStrategy::Delay(config.long_delay)
    } else {
        SendStrategy::WaitForDrain
    }
}

/// Learned performance of the channel to one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkMetrics {
    /// Moving average of the buffer clearing rate (bytes/s)
    pub clearing_rate: Option<f64>,
    /// Moving average of drain wait time
    pub wait_time: Option<Duration>,
    /// Current buffered-bytes threshold
    pub adaptive_threshold: u64,
    /// Number of drain waits measured
    pub samples: u64,
}

impl NetworkMetrics {
    /// Metrics before any measurement.
    #[must_use]
    pub fn new(config: &BackpressureConfig) -> Self {
        Self {
            clearing_rate: None,
            wait_time: None,
            adaptive_threshold: config.initial_threshold,
            samples: 0,
        }
    }

    /// Fold one drain measurement into the averages and re-band the threshold.
    pub fn record_drain(&mut self, cleared: u64, elapsed: Duration, config: &BackpressureConfig) {
        let weight = config.ema_weight;

        self.wait_time = Some(match self.wait_time {
            Some(avg) => avg.mul_f64(1.0 - weight) + elapsed.mul_f64(weight),
            None => elapsed,
        });

        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            let rate = cleared as f64 / secs;
            self.clearing_rate = Some(match self.clearing_rate {
                Some(avg) => weight * rate + (1.0 - weight) * avg,
                None => rate,
            });
        }
        self.samples += 1;

        let previous = self.adaptive_threshold;
        self.adaptive_threshold = match self.clearing_rate {
            Some(rate) if rate < config.poor_rate => config.poor_threshold,
            Some(rate) if rate >= config.good_rate => config.good_threshold,
            Some(_) => config.average_threshold,
            None => previous,
        };

        if previous != self.adaptive_threshold {
            tracing::debug!(
                previous,
                threshold = self.adaptive_threshold,
                rate = self.clearing_rate.unwrap_or_default(),
                "Adaptive threshold re-tuned"
            );
        }
    }
}

/// Sends chunk packets to peers with adaptive pacing.
pub struct NetworkTransmitter {
    channel: Arc<dyn PeerChannel>,
    config: BackpressureConfig,
}

impl std::fmt::Debug for NetworkTransmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkTransmitter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NetworkTransmitter {
    /// Create a transmitter on top of a channel.
    pub fn new(channel: Arc<dyn PeerChannel>, config: BackpressureConfig) -> Self {
        Self { channel, config }
    }

    /// Pace, encode and send one chunk.
    ///
    /// The packet goes out as a single channel message.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the channel closes or rejects the packet.
    pub async fn send_chunk(
        &self,
        peer: &PeerId,
        meta: &ChunkMeta,
        payload: &[u8],
        metrics: &mut NetworkMetrics,
    ) -> Result<()> {
        let packet = encode_chunk_packet(meta, payload)?;
        self.pace(peer, metrics).await?;

        self.channel.send(peer, ChannelMessage::Binary(packet))?;

        tracing::trace!(
            peer = %peer,
            file_id = %meta.file_id,
            chunk_index = meta.chunk_index,
            bytes = payload.len(),
            "Sent chunk"
        );
        Ok(())
    }

    /// Apply the strategy chosen for the current buffer level.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the channel is not open.
    pub async fn pace(&self, peer: &PeerId, metrics: &mut NetworkMetrics) -> Result<()> {
        if !self.channel.is_open(peer) {
            return Err(Error::Transport(format!("channel to '{peer}' is not open")));
        }

        let buffered = self.channel.buffered_amount(peer);
        match choose_strategy(buffered, metrics.adaptive_threshold, &self.config) {
            SendStrategy::Immediate => Ok(()),
            SendStrategy::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            SendStrategy::WaitForDrain => self.wait_for_drain(peer, buffered, metrics).await,
        }
    }

    async fn wait_for_drain(
        &self,
        peer: &PeerId,
        initial: u64,
        metrics: &mut NetworkMetrics,
    ) -> Result<()> {
        let target = (metrics.adaptive_threshold as f64 * self.config.drain_target) as u64;
        let started = Instant::now();

        tracing::debug!(
            peer = %peer,
            buffered = initial,
            threshold = metrics.adaptive_threshold,
            "Applying backpressure - waiting for buffer to drain"
        );

        let mut buffered = initial;
        loop {
            if !self.channel.is_open(peer) {
                return Err(Error::Transport(format!(
                    "channel to '{peer}' closed during backpressure wait"
                )));
            }
            buffered = self.channel.buffered_amount(peer);
            if buffered < target {
                break;
            }
            if started.elapsed() >= self.config.max_wait {
                tracing::warn!(
                    peer = %peer,
                    buffered,
                    "Buffer drain timeout - proceeding anyway"
                );
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        metrics.record_drain(
            initial.saturating_sub(buffered),
            started.elapsed(),
            &self.config,
        );
        Ok(())
    }
}
