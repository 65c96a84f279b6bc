//! Settings storage
//!
//! Manages persistence of user preferences and application settings.

use crate::storage::download::sanitize_local_filename;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_MODEL_URL: &str =
    "https://huggingface.co/Qwen/Qwen2.5-1.5B-Instruct-GGUF/resolve/main/qwen2.5-1.5b-instruct-q4_k_m.gguf";
pub const DEFAULT_MODEL_FILENAME: &str = "qwen2.5-1.5b-instruct-q4_k_m.gguf";

/// Settings file name under the data directory
pub const SETTINGS_FILE: &str = "settings.json";

const MAX_GPU_LAYERS: u32 = 999;

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Where the model file is downloaded from
    #[serde(default = "default_model_url")]
    pub model_url: String,
    /// Local file name of the model under the models directory
    #[serde(default = "default_model_filename")]
    pub model_filename: String,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Sampling seed (0 = random)
    #[serde(default)]
    pub seed: u32,
    /// Replaces the profiled thread count when set
    #[serde(default)]
    pub thread_override: Option<u32>,
    /// Model layers offloaded to the GPU (0 = CPU only). Needs a GPU build.
    #[serde(default)]
    pub gpu_layers: u32,
    /// Load the model at startup when the asset is ready
    #[serde(default = "default_auto_load")]
    pub auto_load_model: bool,
}

fn default_model_url() -> String {
    DEFAULT_MODEL_URL.to_string()
}

fn default_model_filename() -> String {
    DEFAULT_MODEL_FILENAME.to_string()
}

fn default_auto_load() -> bool {
    true
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model_url: default_model_url(),
            model_filename: default_model_filename(),
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            seed: 0,
            thread_override: None,
            gpu_layers: 0,
            auto_load_model: true,
        }
    }
}

impl AppSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges.
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.top_k == 0 {
            self.top_k = 40;
        }

        if let Some(threads) = self.thread_override {
            self.thread_override = Some(threads.clamp(1, 16));
        }

        self.gpu_layers = self.gpu_layers.min(MAX_GPU_LAYERS);

        let url = self.model_url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            tracing::warn!("Invalid model URL {:?}, using default", self.model_url);
            self.model_url = default_model_url();
        }

        match sanitize_local_filename(&self.model_filename) {
            Ok(name) => self.model_filename = name,
            Err(e) => {
                tracing::warn!("{}: {:?}, using default", e, self.model_filename);
                self.model_filename = default_model_filename();
            }
        }
    }
}

/// Load settings from a specific file, falling back to defaults
pub fn load_settings_from(path: &Path) -> AppSettings {
    match load_settings_internal(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            AppSettings::default()
        }
    }
}

/// Internal settings loading with error propagation
fn load_settings_internal(path: &Path) -> Result<AppSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(AppSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: AppSettings = serde_json::from_str(&json)?;

    // Validate loaded settings
    settings.validate();

    tracing::debug!("Loaded settings from disk");
    Ok(settings)
}

/// Write settings, creating the parent directory if needed
pub fn save_settings_to(settings: &AppSettings, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to disk");
    Ok(())
}
