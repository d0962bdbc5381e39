//! Audio subsystem for the voice bridge
//!
//! - `codec` - float <-> PCM16 <-> base64
//! - `capture` - microphone blocks, volume level, outbound gate
//! - `playback` - gapless scheduling of inbound speech, barge-in flush
//! - `input` / `output` - CPAL device contexts, each on its own audio thread

pub mod capture;
pub mod codec;
mod input;
mod output;
pub mod playback;

use thiserror::Error;

pub use capture::{CaptureTap, LinkStats, OfferOutcome, OutboundLink, VolumeMeter};
pub use codec::{AudioBuffer, AudioChunk, CodecError};
pub use input::{downmix_and_downsample, CpalInput};
pub use output::{CpalOutput, Mixer};
pub use playback::{
    EndedReceiver, EndedSender, OutputDevice, PlaybackId, PlaybackScheduler, ScheduledPlayback,
};

/// Microphone blocks are captured and sent at this rate.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Model speech arrives at this rate.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Errors that can occur while opening or driving an audio device.
#[derive(Debug, Clone, Error)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Microphone access denied: {0}")]
    MicrophoneDenied(String),

    #[error("No supported audio configuration: {0}")]
    NoSupportedConfig(String),

    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),

    #[error("Audio device closed")]
    DeviceClosed,
}

/// A running microphone capture (the stream plus its input context).
///
/// `stop` must be safe to call more than once.
pub trait InputDevice: Send {
    fn sample_rate(&self) -> u32;

    fn is_active(&self) -> bool;

    fn stop(&mut self);
}

/// Source of device contexts for a session.
pub trait AudioHost: Send + Sync {
    /// Acquire the microphone and start feeding `tap` at `sample_rate`.
    fn open_input(&self, sample_rate: u32, tap: CaptureTap) -> Result<Box<dyn InputDevice>, AudioError>;

    /// Open the output context; finished chunks are reported on `ended`.
    fn open_output(
        &self,
        sample_rate: u32,
        ended: EndedSender,
    ) -> Result<Box<dyn OutputDevice>, AudioError>;
}

/// Host backed by the system's default CPAL devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalHost;

impl AudioHost for CpalHost {
    fn open_input(&self, sample_rate: u32, tap: CaptureTap) -> Result<Box<dyn InputDevice>, AudioError> {
        Ok(Box::new(CpalInput::open(sample_rate, tap)?))
    }

    fn open_output(
        &self,
        sample_rate: u32,
        ended: EndedSender,
    ) -> Result<Box<dyn OutputDevice>, AudioError> {
        Ok(Box::new(CpalOutput::open(sample_rate, ended)?))
    }
}
