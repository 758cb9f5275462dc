use thiserror::Error;

/// Failures surfaced by an inference backend or by model asset resolution.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Model file not found: {0}")]
    ModelFileNotFound(String),

    #[error("Backend initialization failed: {0}")]
    BackendInit(String),

    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Model not loaded")]
    ModelNotLoaded,

    #[error("Session creation failed: {0}")]
    SessionCreation(String),

    #[error("Invalid generation config: {0}")]
    InvalidGenerationConfig(String),

    #[error("Query rejected: {0}")]
    QueryRejected(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Tokenization error: {0}")]
    Tokenization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
