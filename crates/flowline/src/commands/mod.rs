//! CLI command handlers.

pub mod check;
pub mod run;
pub mod serve;
pub mod triggers;

use std::path::PathBuf;
use std::sync::Arc;

use flowline_config::FlowlineConfig;
use flowline_pipeline::{CapabilityRegistry, EventBus, PipelineRunner, UserMapping};

use crate::builtin::{Builtins, ShellHandler};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration.
    pub config: FlowlineConfig,
    /// Directory the workspace root is resolved against.
    pub base: PathBuf,
    /// Resolved workspace root.
    pub workspace_root: PathBuf,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// Built-in capabilities, shared by every registry and runner handed out.
    pub builtins: Builtins,
}

impl Context {
    pub fn new(config: FlowlineConfig, base: PathBuf, json_output: bool, verbose: bool) -> Self {
        let workspace_root = config.workspace().resolve_root(&base);
        // Shell output would corrupt JSON lines on stdout
        let builtins = Builtins::new(ShellHandler::new(!json_output));
        Self {
            config,
            base,
            workspace_root,
            json_output,
            verbose,
            builtins,
        }
    }

    /// Registry with the built-in capabilities registered.
    pub fn registry(&self) -> Arc<CapabilityRegistry> {
        Arc::clone(&self.builtins.registry)
    }

    pub fn user_mappings(&self) -> Vec<UserMapping> {
        self.config.mappings.iter().map(UserMapping::from).collect()
    }

    /// A runner wired to the built-in handlers and the configured mappings.
    pub fn runner(&self, events: Arc<EventBus>) -> PipelineRunner {
        PipelineRunner::new(
            self.registry(),
            self.builtins.table.clone(),
            events,
            self.workspace_root.clone(),
        )
        .with_user_mappings(self.user_mappings())
    }
}
