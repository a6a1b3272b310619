//! Error types for HPC batching

use thiserror::Error;

/// Result type for batching operations
pub type HpcResult<T> = Result<T, HpcError>;

#[derive(Error, Debug)]
pub enum HpcError {
    /// Blocks cannot be partitioned with the requested constraints
    #[error("packing error: {0}")]
    Packing(String),

    /// Batch membership or dependency validation failed
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// No backend registered under this name
    #[error("no such scheduler backend: {0}")]
    NoSuchBackend(String),

    /// Submission, polling, or cancellation failed
    #[error("scheduler backend error: {0}")]
    Backend(String),

    /// Batch metadata persistence failed
    #[error("batch persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Engine(#[from] canary_engine::EngineError),
}

impl From<std::io::Error> for HpcError {
    fn from(err: std::io::Error) -> Self {
        HpcError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for HpcError {
    fn from(err: serde_json::Error) -> Self {
        HpcError::Persistence(err.to_string())
    }
}
