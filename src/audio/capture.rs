//! Capture pipeline: microphone callback -> fixed blocks -> volume + outbound chunks
//!
//! ```text
//! Audio Thread (sync)                            Tokio Runtime (async)
//! ┌──────────────────────┐                       ┌───────────────────┐
//! │ CaptureTap           │── try_send(chunk) ──▶ │ transport writer  │
//! │  ├─ accumulate block │   (dropped when the   └───────────────────┘
//! │  ├─ RMS → volume     │    link is detached)
//! │  └─ encode PCM16     │
//! └──────────────────────┘
//! ```
//!
//! Nothing in here blocks the audio thread: the volume is an overwrite-only
//! `watch` value and the outbound send is a `try_send` on a bounded queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use super::codec::{encode_block, rms, AudioChunk};

/// Outcome of offering one chunk to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Sent,
    /// Transport not open yet (or already torn down)
    DroppedNotOpen,
    /// Transport queue full
    DroppedBackpressure,
}

/// Counters for outbound audio, readable from any thread.
#[derive(Debug, Default)]
struct LinkCounters {
    sent: AtomicU64,
    dropped_not_open: AtomicU64,
    dropped_backpressure: AtomicU64,
}

/// Snapshot of [`OutboundLink`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub sent: u64,
    pub dropped_not_open: u64,
    pub dropped_backpressure: u64,
}

/// Gate between the capture thread and the live transport.
///
/// Cloning shares the same gate. Chunks offered while detached are dropped,
/// never queued.
#[derive(Debug, Clone, Default)]
pub struct OutboundLink {
    sender: Arc<Mutex<Option<mpsc::Sender<AudioChunk>>>>,
    counters: Arc<LinkCounters>,
}

impl OutboundLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the gate onto a transport queue.
    pub fn attach(&self, sender: mpsc::Sender<AudioChunk>) {
        if let Ok(mut guard) = self.sender.lock() {
            *guard = Some(sender);
        }
    }

    /// Close the gate. Safe to call repeatedly.
    pub fn detach(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.sender
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    /// Hand one chunk to the transport without blocking.
    pub fn offer(&self, chunk: AudioChunk) -> OfferOutcome {
        let outcome = match self.sender.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(tx) => match tx.try_send(chunk) {
                    Ok(()) => OfferOutcome::Sent,
                    Err(mpsc::error::TrySendError::Full(_)) => OfferOutcome::DroppedBackpressure,
                    Err(mpsc::error::TrySendError::Closed(_)) => OfferOutcome::DroppedNotOpen,
                },
                None => OfferOutcome::DroppedNotOpen,
            },
            Err(_) => OfferOutcome::DroppedNotOpen,
        };

        let counter = match outcome {
            OfferOutcome::Sent => &self.counters.sent,
            OfferOutcome::DroppedNotOpen => &self.counters.dropped_not_open,
            OfferOutcome::DroppedBackpressure => &self.counters.dropped_backpressure,
        };
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;

        match outcome {
            OfferOutcome::Sent if n % 50 == 0 => log::debug!("Capture: sent {} chunks", n),
            OfferOutcome::DroppedBackpressure => {
                log::warn!("Capture: transport queue full, dropped chunk ({} total)", n)
            }
            OfferOutcome::DroppedNotOpen => {
                log::trace!("Capture: transport not open, dropped chunk")
            }
            _ => {}
        }

        outcome
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped_not_open: self.counters.dropped_not_open.load(Ordering::Relaxed),
            dropped_backpressure: self.counters.dropped_backpressure.load(Ordering::Relaxed),
        }
    }
}

/// Latest microphone level. Readers always see the most recent value.
#[derive(Debug, Clone)]
pub struct VolumeMeter {
    tx: Arc<watch::Sender<f32>>,
}

impl VolumeMeter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0.0);
        Self { tx: Arc::new(tx) }
    }

    pub fn publish(&self, level: f32) {
        self.tx.send_replace(level);
    }

    pub fn reset(&self) {
        self.tx.send_replace(0.0);
    }

    pub fn current(&self) -> f32 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<f32> {
        self.tx.subscribe()
    }
}

impl Default for VolumeMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-size processing tap fed by the input device callback.
pub struct CaptureTap {
    block_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    volume: VolumeMeter,
    link: OutboundLink,
    blocks: u64,
}

impl CaptureTap {
    pub fn new(block_size: usize, sample_rate: u32, volume: VolumeMeter, link: OutboundLink) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            sample_rate,
            pending: Vec::with_capacity(block_size * 2),
            volume,
            link,
            blocks: 0,
        }
    }

    /// Number of complete blocks processed so far
    pub fn blocks_processed(&self) -> u64 {
        self.blocks
    }

    /// Feed mono samples at the tap's sample rate.
    ///
    /// Device callbacks rarely line up with the block size, so samples
    /// accumulate until a full block is available.
    pub fn push_samples(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);

        let mut offset = 0;
        while self.pending.len() - offset >= self.block_size {
            let end = offset + self.block_size;
            let block = self.pending[offset..end].to_vec();
            self.process_block(&block);
            offset = end;
        }
        if offset > 0 {
            self.pending.drain(..offset);
        }
    }

    /// Publish the block's level and offer it to the transport.
    pub fn process_block(&mut self, block: &[f32]) -> OfferOutcome {
        self.blocks += 1;
        self.volume.publish(rms(block));
        self.link.offer(encode_block(block, self.sample_rate))
    }

    /// Discard any partially accumulated block.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tap_with(block_size: usize) -> (CaptureTap, VolumeMeter, OutboundLink) {
        let volume = VolumeMeter::new();
        let link = OutboundLink::new();
        let tap = CaptureTap::new(block_size, 16000, volume.clone(), link.clone());
        (tap, volume, link)
    }

    #[test]
    fn test_offer_without_transport_is_dropped() {
        let link = OutboundLink::new();
        let chunk = encode_block(&[0.1, 0.2], 16000);
        assert_eq!(link.offer(chunk), OfferOutcome::DroppedNotOpen);
        assert_eq!(link.stats().dropped_not_open, 1);
        assert_eq!(link.stats().sent, 0);
    }

    #[test]
    fn test_offer_after_attach_is_sent_in_order() {
        let link = OutboundLink::new();
        let (tx, mut rx) = mpsc::channel(8);
        link.attach(tx);
        assert!(link.is_attached());

        for i in 0..3 {
            let chunk = encode_block(&[i as f32 / 10.0], 16000);
            assert_eq!(link.offer(chunk), OfferOutcome::Sent);
        }

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        let third = rx.try_recv().unwrap();
        assert_eq!(first, encode_block(&[0.0], 16000));
        assert_eq!(second, encode_block(&[0.1], 16000));
        assert_eq!(third, encode_block(&[0.2], 16000));
        assert_eq!(link.stats().sent, 3);
    }

    #[test]
    fn test_offer_full_queue_drops() {
        let link = OutboundLink::new();
        let (tx, _rx) = mpsc::channel(1);
        link.attach(tx);
        assert_eq!(link.offer(encode_block(&[0.0], 16000)), OfferOutcome::Sent);
        assert_eq!(
            link.offer(encode_block(&[0.0], 16000)),
            OfferOutcome::DroppedBackpressure
        );
    }

    #[test]
    fn test_detach_is_idempotent() {
        let link = OutboundLink::new();
        let (tx, _rx) = mpsc::channel(1);
        link.attach(tx);
        link.detach();
        link.detach();
        assert!(!link.is_attached());
        assert_eq!(
            link.offer(encode_block(&[0.0], 16000)),
            OfferOutcome::DroppedNotOpen
        );
    }

    #[test]
    fn test_tap_emits_only_full_blocks() {
        let (mut tap, _volume, link) = tap_with(4);
        let (tx, mut rx) = mpsc::channel(16);
        link.attach(tx);

        tap.push_samples(&[0.0; 3]);
        assert_eq!(tap.blocks_processed(), 0);
        assert!(rx.try_recv().is_err());

        // 3 pending + 6 new = 2 blocks, 1 left over
        tap.push_samples(&[0.5; 6]);
        assert_eq!(tap.blocks_processed(), 2);
        let first = rx.try_recv().unwrap();
        assert_eq!(first.bytes.len(), 8);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        tap.push_samples(&[0.5; 3]);
        assert_eq!(tap.blocks_processed(), 3);
    }

    #[test]
    fn test_tap_publishes_latest_rms() {
        let (mut tap, volume, _link) = tap_with(4);
        let rx = volume.subscribe();

        tap.push_samples(&[0.5, -0.5, 0.5, -0.5]);
        assert!((*rx.borrow() - 0.5).abs() < 1e-6);

        tap.push_samples(&[0.0; 4]);
        assert_eq!(*rx.borrow(), 0.0);
        assert_eq!(volume.current(), 0.0);
    }

    #[test]
    fn test_tap_volume_updates_even_when_not_connected() {
        let (mut tap, volume, link) = tap_with(2);
        tap.push_samples(&[1.0, 1.0]);
        assert!((volume.current() - 1.0).abs() < 1e-6);
        assert_eq!(link.stats().dropped_not_open, 1);
    }

    #[test]
    fn test_tap_reset_discards_partial_block() {
        let (mut tap, _volume, _link) = tap_with(4);
        tap.push_samples(&[0.1; 3]);
        tap.reset();
        tap.push_samples(&[0.1; 3]);
        assert_eq!(tap.blocks_processed(), 0);
    }
}
