//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level Opal configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gemini: Option<GeminiConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Gemini API configuration: the single access credential plus model ids
/// for each mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeminiConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Live conversation model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_model: Option<String>,
    /// Video generation model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_model: Option<String>,
    /// Image editing model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_model: Option<String>,
    /// Search-grounded answering model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_model: Option<String>,

    /// Synthetic voice for live audio replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// System instruction for the live session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
}

impl GeminiConfig {
    /// Resolve the API key: check `api_key` first, then `api_key_env`,
    /// then the conventional `GEMINI_API_KEY` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| std::env::var("GEMINI_API_KEY").ok().filter(|v| !v.is_empty()))
    }
}

/// Audio pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Microphone capture rate handed to the live session (Hz).
    #[serde(default = "default_capture_rate")]
    pub capture_rate: u32,

    /// Sample rate of audio payloads coming back from the model (Hz).
    #[serde(default = "default_playback_rate")]
    pub playback_rate: u32,

    /// Number of bands the level meter renders.
    #[serde(default = "default_meter_bands")]
    pub meter_bands: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_rate: default_capture_rate(),
            playback_rate: default_playback_rate(),
            meter_bands: default_meter_bands(),
        }
    }
}

fn default_capture_rate() -> u32 {
    16_000
}

fn default_playback_rate() -> u32 {
    24_000
}

fn default_meter_bands() -> usize {
    16
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "opal_live=debug").
    #[serde(default)]
    pub filters: Vec<String>,
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::OpalError::Io)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::OpalError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Default config file path: `~/.opal/config.json`.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gemini(&self) -> GeminiConfig {
        self.gemini.clone().unwrap_or_default()
    }

    pub fn audio(&self) -> AudioConfig {
        self.audio.clone().unwrap_or_default()
    }

    pub fn live_model(&self) -> String {
        self.gemini
            .as_ref()
            .and_then(|g| g.live_model.clone())
            .unwrap_or_else(|| "gemini-2.0-flash-live-001".into())
    }

    pub fn video_model(&self) -> String {
        self.gemini
            .as_ref()
            .and_then(|g| g.video_model.clone())
            .unwrap_or_else(|| "veo-2.0-generate-001".into())
    }

    pub fn image_model(&self) -> String {
        self.gemini
            .as_ref()
            .and_then(|g| g.image_model.clone())
            .unwrap_or_else(|| "gemini-2.5-flash-image-preview".into())
    }

    pub fn search_model(&self) -> String {
        self.gemini
            .as_ref()
            .and_then(|g| g.search_model.clone())
            .unwrap_or_else(|| "gemini-2.5-flash".into())
    }

    pub fn voice(&self) -> String {
        self.gemini
            .as_ref()
            .and_then(|g| g.voice.clone())
            .unwrap_or_else(|| "Puck".into())
    }

    pub fn system_instruction(&self) -> String {
        self.gemini
            .as_ref()
            .and_then(|g| g.system_instruction.clone())
            .unwrap_or_else(|| {
                "You are a friendly, conversational assistant. Keep spoken replies brief.".into()
            })
    }

    /// Get a config value by dotted path (e.g. "gemini.voice").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Set a config value by dotted path.
    pub fn set_path(&mut self, path: &str, value: serde_json::Value) -> anyhow::Result<()> {
        let mut json = serde_json::to_value(&*self)
            .map_err(|e| anyhow::anyhow!("Config serialization error: {e}"))?;

        let segments: Vec<&str> = path.split('.').collect();
        if segments.is_empty() {
            return Err(anyhow::anyhow!("Empty path"));
        }

        let mut current = &mut json;
        for segment in &segments[..segments.len() - 1] {
            if current.get(segment).is_none() {
                current[segment] = serde_json::json!({});
            }
            current = current.get_mut(segment).unwrap();
        }

        let last = segments.last().unwrap();
        current[last] = value;

        *self = serde_json::from_value(json)
            .map_err(|e| anyhow::anyhow!("Config deserialization error: {e}"))?;
        Ok(())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.gemini().resolve_api_key().is_none() {
            warnings.push("No Gemini API key configured (gemini.api_key or GEMINI_API_KEY)".into());
        }

        let audio = self.audio();
        if audio.capture_rate == 0 || audio.playback_rate == 0 {
            errors.push("Audio sample rates cannot be 0".into());
        }
        if audio.meter_bands == 0 {
            errors.push("audio.meter_bands cannot be 0".into());
        }

        (warnings, errors)
    }
}

/// Base directory for Opal data: `~/.opal/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".opal")
}
