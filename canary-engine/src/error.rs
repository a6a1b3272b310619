//! Error types for the test-session engine

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Error types raised while building and running a test session
#[derive(Error, Debug)]
pub enum EngineError {
    /// A test file declared something the engine cannot expand
    #[error("invalid test spec {file}: {reason}")]
    InvalidSpec { file: String, reason: String },

    /// Expression (keyword, parameter, when) syntax error
    #[error("invalid expression {expr:?}: {reason}")]
    InvalidExpression { expr: String, reason: String },

    /// Two distinct cases hashed to the same id
    #[error("test case id collision: {id} ({a} and {b})")]
    IdCollision { id: String, a: String, b: String },

    /// The dependency graph contains a cycle
    #[error("dependency cycle detected through {0}")]
    DependencyCycle(String),

    /// Case not found in the catalog
    #[error("no such test case: {0}")]
    CaseNotFound(String),

    /// Invalid case state transition
    #[error("invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    /// Resource requirement can never be satisfied by the pool
    #[error("resource requirement unsatisfiable: {0}")]
    ResourceUnsatisfiable(String),

    /// Session directory cannot be created or read
    #[error("session error: {0}")]
    Session(String),

    /// Catalog or result persistence failed
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Child process management failed
    #[error("process error: {0}")]
    Process(String),

    /// Parser plugin failure
    #[error("parse error in {file}: {reason}")]
    Parse { file: String, reason: String },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}
