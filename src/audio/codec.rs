//! Linear PCM codec
//!
//! Converts between float samples, 16-bit signed PCM and the base64 text
//! encoding used on the wire. Everything here is pure and stateless.

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

/// Errors raised while decoding an inbound payload.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload was not valid base64
    #[error("failed to decode audio payload: {0}")]
    Decode(#[from] base64::DecodeError),

    /// PCM16 payload with a dangling half-sample
    #[error("malformed PCM16 audio: {len} bytes is not a whole number of samples")]
    MalformedAudio { len: usize },
}

/// A mono buffer of float samples ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Number of frames (one channel, so also the sample count)
    pub fn frames(&self) -> usize {
        self.samples.len()
    }

    /// Playback length in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// An immutable block of little-endian PCM16 bytes at a fixed rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
}

impl AudioChunk {
    /// MIME type announced to the remote model, e.g. `audio/pcm;rate=16000`
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Base64 text form of the payload
    pub fn to_text(&self) -> String {
        bytes_to_text(&self.bytes)
    }
}

/// Clamp to [-1, 1] and scale into the signed 16-bit range.
///
/// Negative values scale by 32768 and non-negative values by 32767 so both
/// ends of the range are reachable without overflow.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = s.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}

/// Pack samples as little-endian bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

pub fn bytes_to_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn text_to_bytes(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(STANDARD.decode(text)?)
}

/// Reinterpret little-endian PCM16 bytes as a mono float buffer.
pub fn pcm16_to_audio_buffer(bytes: &[u8], sample_rate: u32) -> Result<AudioBuffer, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::MalformedAudio { len: bytes.len() });
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    Ok(AudioBuffer::new(samples, sample_rate))
}

/// Decode one base64 inbound payload straight into a playable buffer.
pub fn decode_payload(text: &str, sample_rate: u32) -> Result<AudioBuffer, CodecError> {
    let bytes = text_to_bytes(text)?;
    pcm16_to_audio_buffer(&bytes, sample_rate)
}

/// Build an outbound chunk from one captured block.
pub fn encode_block(block: &[f32], sample_rate: u32) -> AudioChunk {
    AudioChunk {
        bytes: pcm16_to_bytes(&float_to_pcm16(block)),
        sample_rate,
    }
}

/// Root-mean-square level of a block; 0 for an empty block.
pub fn rms(block: &[f32]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = block.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / block.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_to_pcm16_asymmetric_scaling() {
        let out = float_to_pcm16(&[-1.0, 0.0, 1.0, 0.5, -0.5]);
        assert_eq!(out, vec![-32768, 0, 32767, 16383, -16384]);
    }

    #[test]
    fn test_float_to_pcm16_clamps() {
        let out = float_to_pcm16(&[2.0, -3.5, f32::INFINITY, f32::NEG_INFINITY]);
        assert_eq!(out, vec![32767, -32768, 32767, -32768]);
    }

    #[test]
    fn test_float_to_pcm16_nan_is_silence() {
        assert_eq!(float_to_pcm16(&[f32::NAN]), vec![0]);
    }

    #[test]
    fn test_float_to_pcm16_preserves_length_and_range() {
        let input: Vec<f32> = (0..=2000).map(|i| -1.0 + i as f32 / 1000.0).collect();
        let out = float_to_pcm16(&input);
        assert_eq!(out.len(), input.len());
        assert_eq!(out[0], i16::MIN);
        assert_eq!(*out.last().unwrap(), i16::MAX);
        assert!(out.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_text_round_trip() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0],
            vec![0xff, 0x00, 0x7f],
            (0..=255u8).collect(),
        ];
        for bytes in cases {
            let text = bytes_to_text(&bytes);
            assert_eq!(text_to_bytes(&text).unwrap(), bytes);
        }
    }

    #[test]
    fn test_text_to_bytes_rejects_garbage() {
        let err = text_to_bytes("not*base64!").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn test_pcm16_to_audio_buffer_little_endian() {
        // 0x4000 = 16384 -> 0.5, 0x8000 = -32768 -> -1.0
        let buffer = pcm16_to_audio_buffer(&[0x00, 0x40, 0x00, 0x80], 24000).unwrap();
        assert_eq!(buffer.samples, vec![0.5, -1.0]);
        assert_eq!(buffer.sample_rate, 24000);
        assert_eq!(buffer.frames(), 2);
    }

    #[test]
    fn test_pcm16_to_audio_buffer_odd_length() {
        let err = pcm16_to_audio_buffer(&[1, 2, 3], 24000).unwrap_err();
        assert!(matches!(err, CodecError::MalformedAudio { len: 3 }));
    }

    #[test]
    fn test_buffer_duration() {
        let buffer = AudioBuffer::new(vec![0.0; 12000], 24000);
        assert!((buffer.duration() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_encode_block_mime_and_bytes() {
        let chunk = encode_block(&[0.0, 1.0], 16000);
        assert_eq!(chunk.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(chunk.bytes, vec![0x00, 0x00, 0xff, 0x7f]);
    }

    #[test]
    fn test_decode_payload_matches_encode() {
        let chunk = encode_block(&[-1.0, 0.0], 24000);
        let buffer = decode_payload(&chunk.to_text(), 24000).unwrap();
        assert_eq!(buffer.samples, vec![-1.0, 0.0]);
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
        assert!((rms(&[1.0, 0.0]) - (0.5f32).sqrt()).abs() < 1e-6);
    }
}
