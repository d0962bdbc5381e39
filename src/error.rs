//! Session-level error taxonomy
//!
//! Lower layers raise their own errors (`AudioError`, `TransportError`,
//! `CodecError`); the session folds them into [`SessionError`] and only ever
//! shows its `Display` text to the user.

use thiserror::Error;

use crate::audio::{AudioError, CodecError};
use crate::state_machine::MISSING_KEY_NOTICE;
use crate::streaming::TransportError;

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// No credential configured
    #[error("{}", MISSING_KEY_NOTICE)]
    Configuration,

    /// Microphone access denied or no microphone at all
    #[error("Microphone unavailable: {0}")]
    Permission(String),

    /// An audio device context failed to open
    #[error("Audio device error: {0}")]
    Device(String),

    /// Handshake or mid-session transport failure
    #[error("Connection Error: {0}")]
    Transport(String),

    /// Corrupt inbound audio (contained to one chunk)
    #[error("Malformed audio: {0}")]
    Codec(String),
}

impl SessionError {
    /// Category name used in the error history
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Configuration => "configuration",
            SessionError::Permission(_) => "permission",
            SessionError::Device(_) => "device",
            SessionError::Transport(_) => "transport",
            SessionError::Codec(_) => "codec",
        }
    }
}

impl From<AudioError> for SessionError {
    fn from(e: AudioError) -> Self {
        match e {
            AudioError::MicrophoneDenied(_) | AudioError::NoInputDevice => {
                SessionError::Permission(e.to_string())
            }
            other => SessionError::Device(other.to_string()),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::MissingApiKey => SessionError::Configuration,
            other => SessionError::Transport(other.to_string()),
        }
    }
}

impl From<CodecError> for SessionError {
    fn from(e: CodecError) -> Self {
        SessionError::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_message() {
        assert_eq!(SessionError::Configuration.to_string(), "API Key missing.");
    }

    #[test]
    fn test_audio_error_mapping() {
        let denied: SessionError = AudioError::MicrophoneDenied("blocked".to_string()).into();
        assert!(matches!(denied, SessionError::Permission(_)));
        assert!(denied.to_string().contains("blocked"));

        let absent: SessionError = AudioError::NoInputDevice.into();
        assert_eq!(absent.kind(), "permission");

        let speaker: SessionError = AudioError::NoOutputDevice.into();
        assert!(matches!(speaker, SessionError::Device(_)));
    }

    #[test]
    fn test_transport_error_mapping() {
        let err: SessionError = TransportError::ConnectionFailed("timeout".to_string()).into();
        assert!(err.to_string().starts_with("Connection Error:"));
        assert!(err.to_string().contains("timeout"));

        let missing: SessionError = TransportError::MissingApiKey.into();
        assert!(matches!(missing, SessionError::Configuration));
    }

    #[test]
    fn test_codec_error_mapping() {
        let err: SessionError = CodecError::MalformedAudio { len: 3 }.into();
        assert_eq!(err.kind(), "codec");
        assert!(err.to_string().contains("3 bytes"));
    }
}
