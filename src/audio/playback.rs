//! Playback scheduler
//!
//! Lines inbound speech chunks up back-to-back on the output device clock and
//! flushes everything on barge-in.
//!
//! # Scheduling rule
//!
//! ```text
//! now    = device clock
//! cursor = max(cursor, now)          // never schedule in the past
//! start chunk at cursor
//! cursor += chunk.duration
//! ```
//!
//! An interruption stops every active chunk and resets the cursor to zero,
//! so the next chunk is re-clamped to the device clock.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use super::codec::AudioBuffer;
use super::AudioError;

/// Identifier of one scheduled chunk, unique for the lifetime of a scheduler.
pub type PlaybackId = u64;

/// Channel on which an output device reports chunks that finished naturally.
pub type EndedSender = mpsc::UnboundedSender<PlaybackId>;
pub type EndedReceiver = mpsc::UnboundedReceiver<PlaybackId>;

/// An output device context with its own monotonically increasing clock.
///
/// `stop` and `close` must be safe to call more than once.
pub trait OutputDevice: Send {
    fn sample_rate(&self) -> u32;

    /// Device clock in seconds
    fn current_time(&self) -> f64;

    /// Start rendering `buffer` at device time `at`.
    fn start(&mut self, id: PlaybackId, buffer: AudioBuffer, at: f64) -> Result<(), AudioError>;

    /// Silence a chunk immediately. Unknown ids are ignored.
    fn stop(&mut self, id: PlaybackId);

    fn close(&mut self);
}

/// A chunk currently rendering (or waiting to render) on the output device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: PlaybackId,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledPlayback {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    cursor: f64,
    active: BTreeMap<PlaybackId, ScheduledPlayback>,
    next_id: PlaybackId,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device time at which the next chunk is due (0 after a flush).
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Queue one decoded chunk directly after the previous one.
    ///
    /// If the device rejects the chunk it is dropped and the cursor is left
    /// where it was.
    pub fn schedule(
        &mut self,
        output: &mut dyn OutputDevice,
        buffer: AudioBuffer,
    ) -> Result<ScheduledPlayback, AudioError> {
        let now = output.current_time();
        if self.cursor < now {
            if self.cursor > 0.0 {
                log::debug!(
                    "Playback: cursor fell behind by {:.3}s, catching up",
                    now - self.cursor
                );
            }
            self.cursor = now;
        }

        let id = self.next_id;
        self.next_id += 1;

        let playback = ScheduledPlayback {
            id,
            start: self.cursor,
            duration: buffer.duration(),
        };

        output.start(id, buffer, playback.start)?;

        self.cursor += playback.duration;
        self.active.insert(id, playback);

        log::trace!(
            "Playback: scheduled #{} at {:.3}s for {:.3}s ({} active)",
            id,
            playback.start,
            playback.duration,
            self.active.len()
        );

        Ok(playback)
    }

    /// Natural end-of-playback notification from the device.
    pub fn on_ended(&mut self, id: PlaybackId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Barge-in: stop everything still queued or playing.
    ///
    /// Returns the number of chunks that were cut off.
    pub fn interrupt(&mut self, output: &mut dyn OutputDevice) -> usize {
        let flushed = self.active.len();
        for id in self.active.keys() {
            output.stop(*id);
        }
        self.reset();

        if flushed > 0 {
            log::info!("Playback: interrupted, flushed {} chunk(s)", flushed);
        }
        flushed
    }

    /// Forget all state without touching a device (device already gone).
    pub fn reset(&mut self) {
        self.active.clear();
        self.cursor = 0.0;
    }
}
