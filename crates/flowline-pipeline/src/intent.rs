//! Pipeline documents and the intents they are made of.
//!
//! # Example document
//!
//! ```json
//! {
//!   "name": "release",
//!   "steps": [
//!     { "id": "branch", "intent": "system.setVar", "payload": { "name": "branch", "value": "main" } },
//!     { "id": "checkout", "intent": "git.checkout", "payload": { "branch": "${var:branch}" }, "onFailure": "report" },
//!     { "id": "build", "intent": "docker.build", "payload": { "tag": "app:latest" } },
//!     { "id": "report", "intent": "system.log", "payload": { "message": "checkout failed" } }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;

/// File suffix identifying pipeline documents.
pub const PIPELINE_FILE_SUFFIX: &str = ".intent.json";

/// A named action with a payload: one pipeline step or an ad hoc routed command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    /// Step identifier, addressable as a branch target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Intent name, e.g. `git.checkout` or `terminal.run`.
    pub intent: String,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Capability names to resolve. Absent means "use the intent name".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,

    /// Intent-specific payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,

    /// Preferred provider when several handle the same capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Preferred target when several handle the same capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Step id to jump to when this step fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,

    /// Execution metadata stamped by the runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<IntentMeta>,
}

/// Per-invocation metadata attached to a compiled intent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    /// Correlation id for one dispatch of this intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl Intent {
    /// Create an intent with no payload.
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            ..Default::default()
        }
    }

    /// Set the step id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the failure branch target.
    pub fn with_on_failure(mut self, target: impl Into<String>) -> Self {
        self.on_failure = Some(target.into());
        self
    }

    /// Set the preferred provider.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Set the preferred target.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set explicit capability names.
    pub fn with_capabilities<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Capability names this intent asks for.
    ///
    /// Falls back to the intent name itself so atomic intents work without an
    /// explicit `capabilities` array.
    pub fn capability_names(&self) -> Vec<&str> {
        match self.capabilities {
            Some(ref names) if !names.is_empty() => names.iter().map(String::as_str).collect(),
            _ => vec![self.intent.as_str()],
        }
    }

    /// Get a string field from the payload.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Label used in logs and events: the id if present, else the intent name.
    pub fn label(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.intent)
    }
}

/// A pipeline document: a named, ordered list of steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineFile {
    /// Pipeline name.
    pub name: String,

    /// Optional profile tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    /// Steps in execution order.
    #[serde(default)]
    pub steps: Vec<Intent>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl PipelineFile {
    /// Create a pipeline from steps.
    pub fn new(name: impl Into<String>, steps: Vec<Intent>) -> Self {
        Self {
            name: name.into(),
            profile: None,
            steps,
        }
    }

    /// Parse a pipeline document from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(json)
            .map_err(|e| PipelineError::InvalidPipeline(format!("JSON parse error: {}", e)))
    }

    /// Load a pipeline document from a file path.
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|e| PipelineError::ReadFile {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_json(&content)
    }

    /// Whether a path names a pipeline document.
    pub fn is_pipeline_path(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(PIPELINE_FILE_SUFFIX))
            .unwrap_or(false)
    }

    /// Index of the first step with the given id.
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id.as_deref() == Some(id))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl PipelineFile {
    /// Validate the document.
    ///
    /// Hard errors: empty name, a step with an empty intent name.
    /// Returned warnings: duplicate step ids (branch lookup takes the first
    /// match) and `onFailure` targets that don't exist (a failure there ends
    /// the run).
    pub fn validate(&self) -> Result<Vec<String>, PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::InvalidPipeline(
                "Pipeline name cannot be empty".into(),
            ));
        }

        let mut warnings = Vec::new();
        let mut seen_ids = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.intent.trim().is_empty() {
                return Err(PipelineError::InvalidPipeline(format!(
                    "Step {} has an empty intent",
                    i
                )));
            }
            if let Some(ref id) = step.id
                && !seen_ids.insert(id.as_str())
            {
                warnings.push(format!("Duplicate step id '{}' at step {}", id, i));
            }
        }

        for step in &self.steps {
            if let Some(ref target) = step.on_failure
                && self.step_index(target).is_none()
            {
                warnings.push(format!(
                    "Step '{}' branches to unknown step '{}'",
                    step.label(),
                    target
                ));
            }
        }

        Ok(warnings)
    }
}
