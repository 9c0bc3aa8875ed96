//! Error types for the pipeline engine.

use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while loading, compiling or running a pipeline.
///
/// A step whose handler reports failure is *not* an error: it is a
/// recoverable outcome eligible for `onFailure` branching. Everything in this
/// enum aborts the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Failed to read a pipeline document.
    #[error("Failed to read pipeline {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    /// Pipeline document is malformed.
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// A step payload lacks a field its intent requires.
    #[error("Intent '{intent}' is missing required field '{field}'")]
    MissingField { intent: String, field: String },

    /// A step payload field has the wrong shape.
    #[error("Intent '{intent}' has invalid field '{field}': {message}")]
    InvalidField {
        intent: String,
        field: String,
        message: String,
    },

    /// The requested start step does not exist in the document.
    #[error("Step not found: {0}")]
    StepNotFound(String),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Shorthand for a missing-field compilation error.
    pub fn missing(intent: &str, field: &str) -> Self {
        PipelineError::MissingField {
            intent: intent.to_string(),
            field: field.to_string(),
        }
    }

    /// Whether this error came from step compilation rather than loading.
    pub fn is_compilation(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingField { .. } | PipelineError::InvalidField { .. }
        )
    }
}
