//! Session configuration
//!
//! Manages persistence of sampling settings and the override files
//! shipped alongside models.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::inference::GenerationParams;

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access data directory: {0}")]
    DataDir(String),
    #[error("Failed to read file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Settings applied to every new session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Repetition penalty (>= 1.0)
    pub repeat_penalty: f32,
    /// Repeated n-gram penalty (>= 1.0)
    pub ngram_penalty: f32,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Context window size
    pub context_size: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Directory where model directories are stored
    pub models_directory: PathBuf,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            ngram_penalty: 1.05,
            max_tokens: 2048,
            context_size: 4096,
            gpu_layers: 99, // Offload all layers to GPU by default
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
        }
    }
}

impl SessionSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        // Clamp temperature between 0.0 and 2.0
        self.temperature = self.temperature.clamp(0.0, 2.0);

        // Clamp top_p between 0.0 and 1.0
        self.top_p = self.top_p.clamp(0.0, 1.0);

        // Penalties below 1.0 would reward repetition
        self.repeat_penalty = self.repeat_penalty.clamp(1.0, 2.0);
        self.ngram_penalty = self.ngram_penalty.clamp(1.0, 2.0);

        // Ensure reasonable values for other parameters
        if self.top_k == 0 {
            self.top_k = 40;
        }

        if self.max_tokens == 0 {
            self.max_tokens = 2048;
        }

        if self.context_size == 0 {
            self.context_size = 4096;
        }
    }

    /// The generation parameters these settings describe
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repeat_penalty: self.repeat_penalty,
            ngram_penalty: self.ngram_penalty,
            seed: 0,
            max_context_size: self.context_size,
        }
    }
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("com", "OmniLink", "OmniLink")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| ConfigError::DataDir("Could not determine data directory".to_string()))
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, ConfigError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> SessionSettings {
    match load_settings_internal() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            SessionSettings::default()
        }
    }
}

/// Internal settings loading with error propagation
fn load_settings_internal() -> Result<SessionSettings, ConfigError> {
    let path = get_settings_path()?;

    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(SessionSettings::default());
    }

    let json = fs::read_to_string(&path)?;
    let mut settings: SessionSettings = serde_json::from_str(&json)?;

    // Validate loaded settings
    settings.validate();

    tracing::debug!("Loaded settings from disk");
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &SessionSettings) -> Result<(), ConfigError> {
    let path = get_settings_path()?;

    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to disk");
    Ok(())
}

/// Sampling overrides read from a model's config file.
///
/// Unknown keys are ignored so engine-specific config files with extra
/// fields still parse.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SamplingOverrides {
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub repeat_penalty: Option<f32>,
    pub ngram_penalty: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl SamplingOverrides {
    /// Read overrides from a JSON config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Merge these overrides over `params`
    pub fn apply(&self, params: &mut GenerationParams) {
        if let Some(v) = self.temperature {
            params.temperature = v;
        }
        if let Some(v) = self.top_k {
            params.top_k = v;
        }
        if let Some(v) = self.top_p {
            params.top_p = v;
        }
        if let Some(v) = self.repeat_penalty {
            params.repeat_penalty = v;
        }
        if let Some(v) = self.ngram_penalty {
            params.ngram_penalty = v;
        }
        if let Some(v) = self.max_tokens {
            params.max_tokens = v;
        }
        tracing::debug!("Applied sampling overrides from model config");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = SessionSettings::default();
        assert_eq!(settings.temperature, 0.7);
        assert_eq!(settings.top_p, 0.95);
        assert_eq!(settings.top_k, 40);
        assert_eq!(settings.max_tokens, 2048);
        assert_eq!(settings.gpu_layers, 99);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = SessionSettings::default();

        // Test temperature clamping
        settings.temperature = 5.0;
        settings.validate();
        assert_eq!(settings.temperature, 2.0);

        settings.temperature = -1.0;
        settings.validate();
        assert_eq!(settings.temperature, 0.0);

        // Test top_p clamping
        settings.top_p = 2.0;
        settings.validate();
        assert_eq!(settings.top_p, 1.0);

        // Penalties never drop below neutral
        settings.repeat_penalty = 0.5;
        settings.validate();
        assert_eq!(settings.repeat_penalty, 1.0);

        // Zeroed values fall back to defaults
        settings.top_k = 0;
        settings.max_tokens = 0;
        settings.validate();
        assert_eq!(settings.top_k, 40);
        assert_eq!(settings.max_tokens, 2048);
    }

    #[test]
    fn test_settings_serialization() {
        let settings = SessionSettings::default();

        let json = serde_json::to_string(&settings).unwrap();
        let deserialized: SessionSettings = serde_json::from_str(&json).unwrap();

        assert_eq!(settings.temperature, deserialized.temperature);
        assert_eq!(settings.top_p, deserialized.top_p);
        assert_eq!(settings.max_tokens, deserialized.max_tokens);
    }

    #[test]
    fn test_generation_params_reflect_settings() {
        let mut settings = SessionSettings::default();
        settings.temperature = 1.3;
        settings.context_size = 8192;

        let params = settings.generation_params();
        assert_eq!(params.temperature, 1.3);
        assert_eq!(params.max_context_size, 8192);
        assert_eq!(params.seed, 0);
    }

    #[test]
    fn test_overrides_ignore_unknown_keys() {
        let json = r#"{"temperature": 0.2, "hidden_size": 4096, "model_type": "qwen"}"#;
        let overrides: SamplingOverrides = serde_json::from_str(json).unwrap();
        assert_eq!(overrides.temperature, Some(0.2));
        assert_eq!(overrides.top_k, None);
    }

    #[test]
    fn test_overrides_apply_partially() {
        let overrides = SamplingOverrides {
            temperature: Some(0.1),
            max_tokens: Some(64),
            ..Default::default()
        };

        let mut params = GenerationParams::default();
        overrides.apply(&mut params);

        assert_eq!(params.temperature, 0.1);
        assert_eq!(params.max_tokens, 64);
        // Untouched fields keep their defaults
        assert_eq!(params.top_k, 40);
    }

    #[test]
    fn test_overrides_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(br#"{"top_p": 0.8}"#).unwrap();
        file.flush().unwrap();

        let overrides = SamplingOverrides::from_file(file.path()).unwrap();
        assert_eq!(overrides.top_p, Some(0.8));
    }

    #[test]
    fn test_overrides_from_corrupt_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(b"not json at all").unwrap();
        file.flush().unwrap();

        assert!(SamplingOverrides::from_file(file.path()).is_err());
    }
}
