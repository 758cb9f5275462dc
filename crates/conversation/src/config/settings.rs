use anyhow::Result;
use config::{Config, Environment, File};
use crabble_engine::{GenerationConfig, ModelCategory};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_CONFIG_FILE: &str = "config/crabble";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub generation: GenerationOverrides,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub events: EventConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    #[serde(default)]
    pub category: ModelCategory,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf, // tujuan file hasil download
    #[serde(default = "default_bundle_dir")]
    pub bundle_dir: PathBuf, // model yang ikut terpaket
    /// Full context window, prompt and output together.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Tokens held back for the response itself.
    #[serde(default = "default_decode_reserve")]
    pub decode_reserve: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            category: ModelCategory::default(),
            download_dir: default_download_dir(),
            bundle_dir: default_bundle_dir(),
            max_tokens: default_max_tokens(),
            decode_reserve: default_decode_reserve(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_bundle_dir() -> PathBuf {
    PathBuf::from("assets/models")
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_decode_reserve() -> u32 {
    256
}

/// Sampling values that replace the model category defaults when set.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq)]
pub struct GenerationOverrides {
    pub temperature: Option<f32>,
    pub top_k: Option<i32>,
    pub top_p: Option<f32>,
}

impl GenerationOverrides {
    pub fn apply(&self, base: GenerationConfig) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temperature.unwrap_or(base.temperature),
            top_k: self.top_k.unwrap_or(base.top_k),
            top_p: self.top_p.unwrap_or(base.top_p),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TokenConfig {
    /// Chat-template overhead charged per message in the transcript.
    #[serde(default = "default_control_tokens")]
    pub control_tokens_per_message: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            control_tokens_per_message: default_control_tokens(),
        }
    }
}

fn default_control_tokens() -> usize {
    3
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EventConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

fn default_capacity() -> usize {
    256
}

// Override with environment variables (prefix: CRABBLE)
// Example: CRABBLE_MODEL__MAX_TOKENS=2048
fn environment() -> Environment {
    Environment::with_prefix("CRABBLE")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// `file` is a config path without extension; defaults to `config/crabble`.
    pub fn load_from(file: Option<&str>) -> Result<Self> {
        // Load from environment first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name(file.unwrap_or(DEFAULT_CONFIG_FILE)).required(file.is_some()))
            .add_source(environment())
            .build()?;

        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.model.decode_reserve >= self.model.max_tokens {
            anyhow::bail!(
                "decode_reserve ({}) must be smaller than max_tokens ({})",
                self.model.decode_reserve,
                self.model.max_tokens
            );
        }

        if self.events.capacity == 0 {
            anyhow::bail!("events.capacity must be at least 1");
        }

        Ok(())
    }
}
