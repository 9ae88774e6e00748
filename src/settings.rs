use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{CAPTURE_FRAME_SIZE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::live::{SessionConfig, LIVE_API_URL};
use crate::tools::{self, GeminiModels};

const SETTINGS_FILE_NAME: &str = "settings.json";
const CONFIG_DIR_NAME: &str = "duplex-voice";

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a friendly, concise voice assistant. \
Keep spoken answers short and conversational. When the user asks you to write something \
(text, lists, code), call generateContent. When the user asks for a picture, call \
generateImage. Briefly tell the user what you are doing while a tool runs. Politely \
refuse requests for harmful, hateful or explicit content and do not claim to be human.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// WebSocket endpoint of the Live API
    pub endpoint_url: String,

    /// Live model the duplex channel talks to
    pub model: String,

    /// Prebuilt voice for both the live session and the greeting
    pub voice_name: String,

    /// Behavioral policy sent as the session's system instruction
    pub system_instruction: String,

    /// Spoken once at session start when a greeting is requested
    pub greeting_text: String,

    pub content_model: String,
    pub image_model: String,
    pub speech_model: String,

    pub input_sample_rate: u32,
    pub output_sample_rate: u32,

    /// Samples per captured frame
    pub capture_frame_size: usize,

    /// How often the speaking flag is re-evaluated during playback
    pub speaking_poll_ms: u64,

    /// Playback counts as finished when the clock is this close to the cursor
    pub speaking_epsilon_ms: u64,

    pub connect_timeout_ms: u64,
    pub setup_timeout_ms: u64,

    /// Device names; `None` picks the system default
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            endpoint_url: LIVE_API_URL.to_string(),
            model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice_name: "Zephyr".to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            greeting_text: "Say cheerfully: Hi there! What would you like to create today?"
                .to_string(),
            content_model: "gemini-2.5-flash".to_string(),
            image_model: "gemini-2.5-flash-image".to_string(),
            speech_model: "gemini-2.5-flash-preview-tts".to_string(),
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            capture_frame_size: CAPTURE_FRAME_SIZE,
            speaking_poll_ms: 100,
            speaking_epsilon_ms: 50,
            connect_timeout_ms: 10_000,
            setup_timeout_ms: 10_000,
            input_device: None,
            output_device: None,
        }
    }
}

impl AppSettings {
    /// Channel configuration with the tool schema and behavioral policy
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.model.clone(),
            voice_name: self.voice_name.clone(),
            system_instruction: self.system_instruction.clone(),
            tools: tools::declarations(),
            output_transcription: true,
        }
    }

    pub fn gemini_models(&self) -> GeminiModels {
        GeminiModels {
            content: self.content_model.clone(),
            image: self.image_model.clone(),
            speech: self.speech_model.clone(),
            voice_name: self.voice_name.clone(),
        }
    }

    pub fn speaking_poll_interval(&self) -> Duration {
        Duration::from_millis(self.speaking_poll_ms.max(1))
    }

    pub fn speaking_epsilon_secs(&self) -> f64 {
        self.speaking_epsilon_ms as f64 / 1000.0
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }
}

/// Get the API key from the environment
pub fn get_api_key() -> Option<String> {
    ["GEMINI_API_KEY", "GOOGLE_API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|key| !key.is_empty())
}

pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(CONFIG_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> AppSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(settings: &AppSettings) -> Result<(), String> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists
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
