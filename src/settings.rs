use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::streaming::{DEFAULT_MODEL, DEFAULT_VOICE, LIVE_API_URL};

const APP_DIR_NAME: &str = "violet-voice";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Live model name (without the `models/` prefix).
    pub model: String,

    /// Prebuilt voice the model answers with.
    pub voice_name: String,

    /// WebSocket endpoint of the live API.
    pub endpoint: String,

    /// Samples per captured block at 16 kHz. Each block becomes one outbound chunk
    /// and one volume update.
    pub capture_block_size: usize,

    /// Give up on the WebSocket handshake after this long.
    pub connect_timeout_secs: u64,

    /// Give up waiting for `setupComplete` after this long.
    pub setup_timeout_secs: u64,

    /// Captured chunks allowed to queue ahead of the socket before new ones are dropped.
    pub outbound_queue_capacity: usize,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            endpoint: LIVE_API_URL.to_string(),
            capture_block_size: 4096,
            connect_timeout_secs: 10,
            setup_timeout_secs: 5,
            outbound_queue_capacity: 32,
        }
    }
}

pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> VoiceSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            VoiceSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> VoiceSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<VoiceSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                VoiceSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => VoiceSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            VoiceSettings::default()
        }
    }
}

pub fn save_settings(settings: &VoiceSettings) -> Result<(), String> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &VoiceSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a sibling temp file, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails when the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = VoiceSettings::default();
        assert_eq!(settings.model, "gemini-2.5-flash-native-audio-preview-12-2025");
        assert_eq!(settings.voice_name, "Kore");
        assert_eq!(settings.capture_block_size, 4096);
        assert!(settings.endpoint.starts_with("wss://"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = load_settings_from(&dir.path().join("nope.json"));
        assert_eq!(settings, VoiceSettings::default());
    }

    #[test]
    fn test_unparsable_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings_from(&path), VoiceSettings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"voice_name":"Puck"}"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.voice_name, "Puck");
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert_eq!(settings.setup_timeout_secs, 5);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);

        let settings = VoiceSettings {
            capture_block_size: 2048,
            outbound_queue_capacity: 4,
            ..VoiceSettings::default()
        };
        save_settings_to(&path, &settings).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_settings_from(&path), settings);

        // overwrite in place
        let updated = VoiceSettings {
            voice_name: "Aoede".to_string(),
            ..settings
        };
        save_settings_to(&path, &updated).unwrap();
        assert_eq!(load_settings_from(&path).voice_name, "Aoede");
    }
}
