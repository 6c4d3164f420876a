use thiserror::Error;

/// Block-level errors
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Reference error: {0}")]
    ReferenceError(String),
    #[error("Execution error: {0}")]
    ExecutionError(String),
    #[error("Type error: {0}")]
    TypeError(String),
    #[error("Timeout: block execution exceeded time limit")]
    Timeout,
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for BlockError {
    fn from(e: serde_json::Error) -> Self {
        BlockError::SerializationError(e.to_string())
    }
}
