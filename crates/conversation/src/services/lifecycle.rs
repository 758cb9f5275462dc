//! Model loading and session creation.

use crate::config::settings::{GenerationOverrides, Settings};
use crate::services::streaming_session::StreamingSession;
use crate::services::token_budget::TokenBudgetEstimator;
use crate::utils::error::InferenceError;
use crabble_engine::metrics::RuntimeMetrics;
use crabble_engine::{InferenceBackend, LoadedModel, ModelCategory, ModelProvider};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct LifecycleOptions {
    pub max_tokens: u32,
    pub decode_reserve: u32,
    pub control_tokens_per_message: usize,
    pub generation: GenerationOverrides,
}

impl From<&Settings> for LifecycleOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            max_tokens: settings.model.max_tokens,
            decode_reserve: settings.model.decode_reserve,
            control_tokens_per_message: settings.tokens.control_tokens_per_message,
            generation: settings.generation,
        }
    }
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

/// Owns the loaded model and hands out sessions built on it.
pub struct SessionLifecycleManager {
    backend: Arc<dyn InferenceBackend>,
    provider: Arc<dyn ModelProvider>,
    options: LifecycleOptions,
    model: Option<Arc<dyn LoadedModel>>,
}

impl SessionLifecycleManager {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        provider: Arc<dyn ModelProvider>,
        options: LifecycleOptions,
    ) -> Self {
        Self {
            backend,
            provider,
            options,
            model: None,
        }
    }

    pub fn is_download_required(&self, category: ModelCategory) -> bool {
        self.provider.resolve_local_path(category).is_err()
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Loads the model for `category`, replacing the current one.
    /// A failed load leaves nothing loaded.
    pub async fn load_model(
        &mut self,
        category: ModelCategory,
    ) -> Result<Arc<dyn LoadedModel>, InferenceError> {
        self.unload();

        let path = self.provider.resolve_local_path(category)?;
        info!(model = %category, path = %path.display(), max_tokens = self.options.max_tokens, "loading model");

        let started = Instant::now();
        let model = self.backend.load_model(&path, self.options.max_tokens).await?;

        info!(
            model = %category,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );
        debug!("{}", RuntimeMetrics::capture());

        self.model = Some(model.clone());
        Ok(model)
    }

    pub fn unload(&mut self) {
        if self.model.take().is_some() {
            info!("model unloaded");
        }
    }

    /// Creates a fresh session on the loaded model.
    pub fn start_session(&self, category: ModelCategory) -> Result<StreamingSession, InferenceError> {
        let Some(model) = self.model.clone() else {
            warn!("session requested before a model was loaded");
            return Err(InferenceError::SessionNotInitialized);
        };

        let config = self.options.generation.apply(category.generation_config());
        let estimator = TokenBudgetEstimator::new(model.max_tokens() as usize, self.options.decode_reserve as usize)
            .with_control_tokens_per_message(self.options.control_tokens_per_message);

        StreamingSession::create(model, config, &category.metadata().ranges, estimator)
    }
}
