//! Model catalog and sampling configuration.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Models the app knows how to run on device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelCategory {
    #[default]
    Gemma3n,
}

/// Static description of a model asset and its sampling defaults.
#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub path_name: &'static str,
    pub path_extension: &'static str,
    pub display_name: &'static str,
    pub license_acknowledged_key: &'static str,
    pub license_url: Option<&'static str>,
    pub auth_required: bool,
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub ranges: SamplingRanges,
}

/// Accepted sampling values for one model category.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingRanges {
    pub temperature: RangeInclusive<f32>,
    pub top_k: RangeInclusive<i32>,
    pub top_p: RangeInclusive<f32>,
}

impl Default for SamplingRanges {
    fn default() -> Self {
        Self {
            temperature: 0.0..=2.0,
            top_k: 1..=200,
            top_p: 0.0..=1.0,
        }
    }
}

impl ModelCategory {
    pub const ALL: [ModelCategory; 1] = [ModelCategory::Gemma3n];

    pub fn metadata(&self) -> ModelMetadata {
        match self {
            ModelCategory::Gemma3n => ModelMetadata {
                path_name: "gemma-3n-E2B-it-int4",
                path_extension: "gguf",
                display_name: "Gemma 3n E2B",
                license_acknowledged_key: "gemma-license",
                license_url: Some("https://ai.google.dev/gemma/terms"),
                auth_required: true,
                temperature: 0.6,
                top_k: 50,
                top_p: 0.9,
                ranges: SamplingRanges::default(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        self.metadata().display_name
    }

    /// File name of the model asset, e.g. `gemma-3n-E2B-it-int4.gguf`.
    pub fn file_name(&self) -> String {
        let meta = self.metadata();
        format!("{}.{}", meta.path_name, meta.path_extension)
    }

    /// Sampling defaults for sessions created against this model.
    pub fn generation_config(&self) -> GenerationConfig {
        let meta = self.metadata();
        GenerationConfig {
            temperature: meta.temperature,
            top_k: meta.top_k,
            top_p: meta.top_p,
        }
    }
}

impl std::fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-session sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationConfig {
    /// 0.0 is greedy decoding, higher values sample more freely.
    pub temperature: f32,
    /// Only the K most likely tokens are considered.
    pub top_k: i32,
    /// Nucleus sampling cutoff on cumulative probability.
    pub top_p: f32,
}

impl GenerationConfig {
    pub fn validate(&self, ranges: &SamplingRanges) -> Result<()> {
        if !ranges.temperature.contains(&self.temperature) {
            return Err(EngineError::InvalidGenerationConfig(format!(
                "temperature {} outside {:?}",
                self.temperature, ranges.temperature
            )));
        }
        if !ranges.top_k.contains(&self.top_k) {
            return Err(EngineError::InvalidGenerationConfig(format!(
                "top_k {} outside {:?}",
                self.top_k, ranges.top_k
            )));
        }
        if !ranges.top_p.contains(&self.top_p) {
            return Err(EngineError::InvalidGenerationConfig(format!(
                "top_p {} outside {:?}",
                self.top_p, ranges.top_p
            )));
        }
        Ok(())
    }
}
