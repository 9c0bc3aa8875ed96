//! Dispatch seam between the runner and capability implementations.
//!
//! The registry resolves an intent to command names; a [`CommandDispatcher`]
//! turns a command name into an actual invocation. [`CommandTable`] is the
//! standard dispatcher: a name → [`CommandHandler`] map populated by provider
//! bootstrap code.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::intent::Intent;
use crate::registry::ResolutionSource;

/// Everything a handler needs to execute one resolved step.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    /// Run this step belongs to.
    pub run_id: String,
    /// Compiled intent, with `meta` stamped.
    pub intent: Intent,
    /// Command the capability resolved to.
    pub command: String,
    /// Payload after the capability's mapper (if any).
    pub payload: Value,
    /// How the command was found.
    pub source: ResolutionSource,
    /// Runner's working directory at dispatch time.
    pub cwd: PathBuf,
    pub dry_run: bool,
}

/// Result a handler reports back to the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub success: bool,
    /// Variables exported into the run's store on success.
    pub variables: BTreeMap<String, String>,
    /// Short human-readable detail, mostly for failures.
    pub message: Option<String>,
}

impl StepOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            variables: BTreeMap::new(),
            message: Some(message.into()),
        }
    }

    /// Export a variable into the run on success.
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

/// An executable capability implementation.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Execute one step. Failures are reported in the outcome, not as errors.
    async fn invoke(&self, invocation: &StepInvocation) -> StepOutcome;
}

/// Routes a resolved command to whatever executes it.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch(&self, invocation: &StepInvocation) -> StepOutcome;
}

/// Adapter turning an async closure into a [`CommandHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(StepInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = StepOutcome> + Send,
{
    async fn invoke(&self, invocation: &StepInvocation) -> StepOutcome {
        (self.0)(invocation.clone()).await
    }
}

/// Command name → handler table.
#[derive(Default)]
pub struct CommandTable {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a command name to a handler, replacing any previous binding.
    pub fn insert(&self, command: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.handlers.write().insert(command.into(), handler);
    }

    /// Bind a command name to an async closure.
    pub fn insert_fn<F, Fut>(&self, command: impl Into<String>, f: F)
    where
        F: Fn(StepInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepOutcome> + Send + 'static,
    {
        self.insert(command, Arc::new(FnHandler(f)));
    }

    pub fn get(&self, command: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.read().get(command).cloned()
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.read().contains_key(command)
    }

    /// Sorted command names.
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl CommandDispatcher for CommandTable {
    async fn dispatch(&self, invocation: &StepInvocation) -> StepOutcome {
        // Clone the Arc out so the lock isn't held across the await
        let Some(handler) = self.get(&invocation.command) else {
            if invocation.source == ResolutionSource::Fallback {
                warn!(
                    run_id = %invocation.run_id,
                    capability = %invocation.command,
                    "capability not registered"
                );
                return StepOutcome::failure(format!(
                    "Capability not found: {}",
                    invocation.command
                ));
            }
            warn!(
                run_id = %invocation.run_id,
                command = %invocation.command,
                "no handler bound for command"
            );
            return StepOutcome::failure(format!("Command not found: {}", invocation.command));
        };
        handler.invoke(invocation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation(command: &str, source: ResolutionSource) -> StepInvocation {
        StepInvocation {
            run_id: "r1".into(),
            intent: Intent::new(command),
            command: command.into(),
            payload: json!({"n": 1}),
            source,
            cwd: PathBuf::from("/tmp"),
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_bound_handler() {
        let table = CommandTable::new();
        table.insert_fn("echo", |inv: StepInvocation| async move {
            StepOutcome::success().with_variable("n", inv.payload["n"].to_string())
        });

        let out = table
            .dispatch(&invocation("echo", ResolutionSource::Registry))
            .await;
        assert!(out.success);
        assert_eq!(out.variables.get("n").map(String::as_str), Some("1"));
        assert!(table.contains("echo"));
        assert_eq!(table.commands(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_fallback_reports_capability_not_found() {
        let table = CommandTable::new();
        let out = table
            .dispatch(&invocation("nope", ResolutionSource::Fallback))
            .await;
        assert!(!out.success);
        assert!(out.message.unwrap().contains("Capability not found"));
    }

    #[tokio::test]
    async fn test_unbound_registry_command_fails() {
        let table = CommandTable::new();
        let out = table
            .dispatch(&invocation("ghost", ResolutionSource::Registry))
            .await;
        assert!(!out.success);
        assert!(out.message.unwrap().contains("Command not found"));
    }

    #[test]
    fn test_outcome_constructors() {
        assert!(StepOutcome::success().success);
        let failed = StepOutcome::failure("boom");
        assert!(!failed.success);
        assert_eq!(failed.message.as_deref(), Some("boom"));
    }
}
