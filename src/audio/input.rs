//! Microphone capture using CPAL
//!
//! The CPAL stream lives on a dedicated audio thread so the handle returned
//! to the session is `Send`. Stopping signals that thread, which drops the
//! stream and releases the microphone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, FromSample, Sample, SampleFormat, SampleRate, SizedSample};
use cpal::{Stream, SupportedStreamConfig};

use super::capture::CaptureTap;
use super::{AudioError, InputDevice};

/// Handle to a running microphone capture.
pub struct CpalInput {
    sample_rate: u32,
    active: Arc<AtomicBool>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalInput {
    /// Acquire the default microphone and start feeding `tap`.
    ///
    /// Blocks only until the audio thread reports whether the stream started.
    pub fn open(sample_rate: u32, tap: CaptureTap) -> Result<Self, AudioError> {
        let active = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread_active = active.clone();
        let thread = std::thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || match build_capture_stream(sample_rate, tap, thread_active) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Park until stop() or the handle is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    log::debug!("Capture thread exiting");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!("Microphone capture started at {} Hz", sample_rate);
                Ok(Self {
                    sample_rate,
                    active,
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::StreamCreationFailed(
                    "capture thread exited before reporting".to_string(),
                ))
            }
        }
    }
}

impl InputDevice for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Capture thread panicked during shutdown");
            }
            log::info!("Microphone capture stopped");
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_capture_stream(
    sample_rate: u32,
    tap: CaptureTap,
    active: Arc<AtomicBool>,
) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let (supported, ratio) = choose_input_config(&device, sample_rate)?;

    log::info!(
        "Input config: {} Hz, {} channels, {:?} (downsample x{})",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format(),
        ratio
    );

    let stream = match supported.sample_format() {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &supported, ratio, tap, active)?,
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &supported, ratio, tap, active)?,
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &supported, ratio, tap, active)?,
        other => {
            return Err(AudioError::NoSupportedConfig(format!(
                "sample format {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| AudioError::MicrophoneDenied(format!("failed to start capture: {}", e)))?;

    Ok(stream)
}

fn is_usable_format(format: SampleFormat) -> bool {
    matches!(
        format,
        SampleFormat::I16 | SampleFormat::U16 | SampleFormat::F32
    )
}

/// Prefer a config running natively at `sample_rate`; otherwise fall back to
/// the default config if it is an integer multiple of it.
fn choose_input_config(
    device: &Device,
    sample_rate: u32,
) -> Result<(SupportedStreamConfig, usize), AudioError> {
    let target = SampleRate(sample_rate);

    if let Ok(ranges) = device.supported_input_configs() {
        let native = ranges
            .filter(|r| is_usable_format(r.sample_format()))
            .filter(|r| r.min_sample_rate() <= target && target <= r.max_sample_rate())
            .min_by_key(|r| r.channels());
        if let Some(range) = native {
            return Ok((range.with_sample_rate(target), 1));
        }
    }

    let default = device
        .default_input_config()
        .map_err(|e| AudioError::NoSupportedConfig(e.to_string()))?;

    let device_rate = default.sample_rate().0;
    if sample_rate == 0 || device_rate % sample_rate != 0 {
        return Err(AudioError::NoSupportedConfig(format!(
            "cannot convert {} Hz input to {} Hz",
            device_rate, sample_rate
        )));
    }

    Ok((default, (device_rate / sample_rate) as usize))
}

fn build_stream_typed<T>(
    device: &Device,
    supported: &SupportedStreamConfig,
    ratio: usize,
    mut tap: CaptureTap,
    active: Arc<AtomicBool>,
) -> Result<Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let config = supported.config();
    let channels = config.channels.max(1) as usize;
    let callback_active = active.clone();

    // Mono frames waiting for a full downsample group
    let mut carry: Vec<f32> = Vec::with_capacity(ratio * 2);

    device
        .build_input_stream(
            &config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !callback_active.load(Ordering::SeqCst) {
                    return;
                }

                for frame in data.chunks(channels) {
                    let sum: f32 = frame.iter().map(|&s| f32::from_sample(s)).sum();
                    carry.push(sum / frame.len() as f32);
                }

                let usable = carry.len() - carry.len() % ratio;
                if usable == 0 {
                    return;
                }
                let mono = downmix_and_downsample(&carry[..usable], 1, ratio);
                carry.drain(..usable);
                tap.push_samples(&mono);
            },
            move |err| {
                log::error!("Audio input stream error: {}", err);
                active.store(false, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| match e {
            BuildStreamError::DeviceNotAvailable => {
                AudioError::MicrophoneDenied("input device not available".to_string())
            }
            other => AudioError::StreamCreationFailed(other.to_string()),
        })
}

/// Average interleaved frames down to mono, then average groups of `ratio`
/// mono frames (e.g. 48kHz stereo -> 16kHz mono with `channels = 2, ratio = 3`).
///
/// A trailing partial group is averaged over what is present.
pub fn downmix_and_downsample(samples: &[f32], channels: usize, ratio: usize) -> Vec<f32> {
    let channels = channels.max(1);
    let ratio = ratio.max(1);

    let mono: Vec<f32> = samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    if ratio == 1 {
        return mono;
    }

    mono.chunks(ratio)
        .map(|group| group.iter().sum::<f32>() / group.len() as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_3x() {
        // 48kHz -> 16kHz
        let input = vec![0.3, 0.6, 0.9, -0.3, -0.6, -0.9];
        let output = downmix_and_downsample(&input, 1, 3);
        assert_eq!(output.len(), 2);
        assert!((output[0] - 0.6).abs() < 1e-6);
        assert!((output[1] + 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_downmix_stereo() {
        let input = vec![1.0, 0.0, 0.5, 0.5];
        let output = downmix_and_downsample(&input, 2, 1);
        assert_eq!(output, vec![0.5, 0.5]);
    }

    #[test]
    fn test_downmix_and_downsample_combined() {
        // stereo 32kHz -> mono 16kHz
        let input = vec![1.0, 1.0, 0.0, 0.0, 0.5, 0.5, 0.5, 0.5];
        let output = downmix_and_downsample(&input, 2, 2);
        assert_eq!(output, vec![0.5, 0.5]);
    }

    #[test]
    fn test_zero_ratio_and_channels_are_treated_as_one() {
        let input = vec![0.1, 0.2];
        assert_eq!(downmix_and_downsample(&input, 0, 0), input);
    }
}
