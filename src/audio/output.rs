//! Speaker output using CPAL
//!
//! A [`Mixer`] sums every scheduled chunk into the device callback and owns
//! the output clock (frames rendered / device rate). The CPAL stream runs on
//! its own thread, like capture.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};

use super::codec::AudioBuffer;
use super::playback::{EndedSender, OutputDevice, PlaybackId};
use super::AudioError;

struct Voice {
    id: PlaybackId,
    buffer: AudioBuffer,
    start: f64,
}

impl Voice {
    /// Source sample index at device time `t`, or None before the start.
    fn position(&self, t: f64) -> Option<usize> {
        let offset = t - self.start;
        if offset < 0.0 {
            return None;
        }
        Some((offset * self.buffer.sample_rate as f64) as usize)
    }

    fn finished_at(&self, t: f64) -> bool {
        self.position(t)
            .is_some_and(|pos| pos >= self.buffer.samples.len())
    }
}

/// Sums scheduled chunks onto the device timeline.
pub struct Mixer {
    device_rate: u32,
    frames_rendered: u64,
    voices: Vec<Voice>,
    ended: EndedSender,
}

impl Mixer {
    pub fn new(device_rate: u32, ended: EndedSender) -> Self {
        Self {
            device_rate: device_rate.max(1),
            frames_rendered: 0,
            voices: Vec::new(),
            ended,
        }
    }

    /// Output clock in seconds
    pub fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.device_rate as f64
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn add(&mut self, id: PlaybackId, buffer: AudioBuffer, at: f64) {
        self.voices.push(Voice {
            id,
            buffer,
            start: at,
        });
    }

    /// Cut a voice without reporting it as ended.
    pub fn remove(&mut self, id: PlaybackId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    pub fn clear(&mut self) {
        self.voices.clear();
    }

    /// Fill one interleaved device buffer and advance the clock.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let rate = self.device_rate as f64;

        for (i, frame) in out.chunks_mut(channels).enumerate() {
            let t = (self.frames_rendered + i as u64) as f64 / rate;
            let mut value = 0.0f32;
            for voice in &self.voices {
                if let Some(pos) = voice.position(t) {
                    if let Some(&s) = voice.buffer.samples.get(pos) {
                        value += s;
                    }
                }
            }
            let value = value.clamp(-1.0, 1.0);
            frame.iter_mut().for_each(|s| *s = value);
        }

        self.frames_rendered += (out.len() / channels) as u64;

        let now = self.current_time();
        let ended = &self.ended;
        self.voices.retain(|voice| {
            if voice.finished_at(now) {
                let _ = ended.send(voice.id);
                false
            } else {
                true
            }
        });
    }
}

/// Handle to a running speaker output.
pub struct CpalOutput {
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    closed: Arc<AtomicBool>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default speaker. `sample_rate` is the rate of the chunks
    /// that will be scheduled; the mixer adapts them to the device rate.
    pub fn open(sample_rate: u32, ended: EndedSender) -> Result<Self, AudioError> {
        let closed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) =
            std_mpsc::sync_channel::<Result<Arc<Mutex<Mixer>>, AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread_closed = closed.clone();
        let thread = std::thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || match build_playback_stream(ended, thread_closed) {
                Ok((stream, mixer)) => {
                    let _ = ready_tx.send(Ok(mixer));
                    let _ = stop_rx.recv();
                    drop(stream);
                    log::debug!("Playback thread exiting");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(mixer)) => {
                log::info!("Speaker output opened for {} Hz audio", sample_rate);
                Ok(Self {
                    sample_rate,
                    mixer,
                    closed,
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
                    "playback thread exited before reporting".to_string(),
                ))
            }
        }
    }
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.mixer.lock().map(|m| m.current_time()).unwrap_or(0.0)
    }

    fn start(&mut self, id: PlaybackId, buffer: AudioBuffer, at: f64) -> Result<(), AudioError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceClosed);
        }
        let mut mixer = self.mixer.lock().map_err(|_| AudioError::DeviceClosed)?;
        mixer.add(id, buffer, at);
        Ok(())
    }

    fn stop(&mut self, id: PlaybackId) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.remove(id);
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.clear();
        }
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Playback thread panicked during shutdown");
            }
            log::info!("Speaker output closed");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_playback_stream(
    ended: EndedSender,
    closed: Arc<AtomicBool>,
) -> Result<(Stream, Arc<Mutex<Mixer>>), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::NoSupportedConfig(e.to_string()))?;

    log::info!(
        "Output config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let config = supported.config();
    let mixer = Arc::new(Mutex::new(Mixer::new(config.sample_rate.0, ended)));

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, mixer.clone(), closed)?,
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, mixer.clone(), closed)?,
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, mixer.clone(), closed)?,
        other => {
            return Err(AudioError::NoSupportedConfig(format!(
                "sample format {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| AudioError::StreamCreationFailed(format!("failed to start playback: {}", e)))?;

    Ok((stream, mixer))
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
    closed: Arc<AtomicBool>,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.clear();
                scratch.resize(data.len(), 0.0);
                if let Ok(mut mixer) = mixer.lock() {
                    mixer.render(&mut scratch, channels);
                }
                for (out, &value) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(value);
                }
            },
            move |err| {
                log::error!("Audio output stream error: {}", err);
                closed.store(true, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn mixer(rate: u32) -> (Mixer, mpsc::UnboundedReceiver<PlaybackId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Mixer::new(rate, tx), rx)
    }

    #[test]
    fn test_clock_advances_by_frames() {
        let (mut mixer, _rx) = mixer(10);
        let mut out = vec![0.0; 10];
        mixer.render(&mut out, 2);
        assert!((mixer.current_time() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_voice_starts_at_scheduled_time() {
        let (mut mixer, _rx) = mixer(10);
        mixer.add(1, AudioBuffer::new(vec![0.5; 10], 10), 0.2);

        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5]);
    }

    #[test]
    fn test_fan_out_to_all_channels() {
        let (mut mixer, _rx) = mixer(10);
        mixer.add(1, AudioBuffer::new(vec![0.25; 4], 10), 0.0);

        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 2);
        assert_eq!(out, vec![0.25; 4]);
    }

    #[test]
    fn test_rate_adaptation_holds_samples() {
        // 5 Hz chunk on a 10 Hz device: each sample lasts two frames
        let (mut mixer, _rx) = mixer(10);
        mixer.add(1, AudioBuffer::new(vec![0.1, 0.2], 5), 0.0);

        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn test_finished_voice_reports_ended() {
        let (mut mixer, mut rx) = mixer(10);
        mixer.add(7, AudioBuffer::new(vec![0.1; 3], 10), 0.0);

        let mut out = vec![0.0; 2];
        mixer.render(&mut out, 1);
        assert!(rx.try_recv().is_err());

        mixer.render(&mut out, 1);
        assert_eq!(rx.try_recv().unwrap(), 7);
        assert_eq!(mixer.voice_count(), 0);
    }

    #[test]
    fn test_removed_voice_is_silent_and_not_reported() {
        let (mut mixer, mut rx) = mixer(10);
        mixer.add(3, AudioBuffer::new(vec![0.9; 100], 10), 0.0);
        assert!(mixer.remove(3));
        assert!(!mixer.remove(3));

        let mut out = vec![1.0; 4];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.0; 4]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_overlapping_voices_are_summed_and_clamped() {
        let (mut mixer, _rx) = mixer(10);
        mixer.add(1, AudioBuffer::new(vec![0.75; 4], 10), 0.0);
        mixer.add(2, AudioBuffer::new(vec![0.75; 4], 10), 0.0);

        let mut out = vec![0.0; 1];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![1.0]);
    }
}
