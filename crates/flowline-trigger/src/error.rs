//! Error types for the trigger manager.

use thiserror::Error;

use flowline_pipeline::PipelineError;

/// Result type for trigger operations.
pub type Result<T> = std::result::Result<T, TriggerError>;

/// Errors raised while registering or firing triggers.
///
/// None of these stop the manager: a bad trigger is skipped and logged, and
/// a failed invocation is reported without affecting other registrations.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// A trigger step's payload can't be turned into a registration.
    #[error("Invalid {kind} trigger '{step}': {message}")]
    InvalidTrigger {
        kind: String,
        step: String,
        message: String,
    },

    /// Watch pattern failed to compile.
    #[error("Invalid glob pattern '{pattern}': {source}")]
    Glob {
        pattern: String,
        source: glob::PatternError,
    },

    /// File watcher could not be created or attached.
    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// Webhook listener failed to bind.
    #[error("Failed to bind webhook listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Loading or running the target pipeline failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl TriggerError {
    pub fn invalid(kind: &str, step: &str, message: impl Into<String>) -> Self {
        TriggerError::InvalidTrigger {
            kind: kind.to_string(),
            step: step.to_string(),
            message: message.into(),
        }
    }
}
