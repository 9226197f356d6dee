//! Error types for the load-gate engine.

use thiserror::Error;

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;

/// Primary error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    // === Configuration Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid threshold rule '{rule}': {message}")]
    ThresholdParse { rule: String, message: String },

    #[error("Invalid metric selector '{selector}': {message}")]
    SelectorParse { selector: String, message: String },

    // === Evaluation Errors ===
    #[error("Threshold '{rule}' on '{selector}' cannot be evaluated: {message}")]
    ThresholdEval {
        selector: String,
        rule: String,
        message: String,
    },

    // === Run Errors ===
    #[error("Setup failed: {0}")]
    SetupFailed(String),

    // === Infrastructure Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::InvalidConfig(format!("YAML error: {}", err))
    }
}
