//! Crabble Engine - on-device LLM inference contracts
//!
//! This crate defines the narrow interface the conversation core consumes
//! (model loading, sessions, streaming, token counting), the model catalog,
//! and a llama.cpp backend behind the `llama` feature.

mod backend;
mod error;
mod model;
mod provider;

#[cfg(feature = "llama")]
mod llama_engine;

pub use backend::{ChatMessage, EngineSession, InferenceBackend, LoadedModel, ResponseStream};
pub use error::{EngineError, Result};
pub use model::{GenerationConfig, ModelCategory, ModelMetadata, SamplingRanges};
pub use provider::{LocalModelProvider, ModelProvider};

#[cfg(feature = "llama")]
pub use llama_engine::{GenerationResult, LlamaCppEngine, LlamaCppOptions};

// Metrics module for observability
pub mod metrics {
    use sysinfo::System;

    #[derive(Debug, Clone, Copy)]
    pub struct RuntimeMetrics {
        pub process_rss_mb: f64,
        pub total_mem_mb: f64,
        pub cpu_usage_percent: f32,
    }

    impl RuntimeMetrics {
        pub fn capture() -> Self {
            let mut sys = System::new_all();
            sys.refresh_all();
            let pid = sysinfo::get_current_pid().ok();
            let (rss_bytes, cpu) = if let Some(p) = pid.and_then(|pid| sys.process(pid)) {
                (p.memory(), p.cpu_usage())
            } else {
                (0, 0.0)
            };
            let total_bytes = sys.total_memory();
            Self {
                process_rss_mb: (rss_bytes as f64) / (1024.0 * 1024.0),
                total_mem_mb: (total_bytes as f64) / (1024.0 * 1024.0),
                cpu_usage_percent: cpu,
            }
        }
    }

    impl std::fmt::Display for RuntimeMetrics {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(
                f,
                "[memory] rss: {:.1} MB / {:.1} MB, cpu: {:.1}%",
                self.process_rss_mb, self.total_mem_mb, self.cpu_usage_percent
            )
        }
    }
}
