//! Seam between trigger firings and pipeline execution.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use flowline_pipeline::{
    PipelineFile, PipelineRunner, RunOptions, RunOutcome, StartPoint, VariableStore,
};

use crate::error::Result;

/// One pipeline invocation requested by a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    /// Pipeline document to run.
    pub pipeline: PathBuf,
    pub start: StartPoint,
    /// Trigger variables seeded into the run.
    pub variables: VariableStore,
}

/// Runs pipelines on behalf of the trigger manager.
#[async_trait]
pub trait PipelineInvoker: Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<RunOutcome>;
}

/// [`PipelineInvoker`] backed by a [`PipelineRunner`]: loads the document
/// fresh from disk on every invocation.
pub struct RunnerInvoker {
    runner: Arc<PipelineRunner>,
    dry_run: bool,
}

impl RunnerInvoker {
    pub fn new(runner: Arc<PipelineRunner>) -> Self {
        Self {
            runner,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[async_trait]
impl PipelineInvoker for RunnerInvoker {
    async fn invoke(&self, request: InvocationRequest) -> Result<RunOutcome> {
        let pipeline = PipelineFile::from_file(&request.pipeline)?;
        debug!(pipeline = %pipeline.name, path = %request.pipeline.display(), "invoking pipeline");
        let options = RunOptions {
            start: request.start,
            variables: request.variables,
            dry_run: self.dry_run,
            cwd: None,
        };
        Ok(self.runner.run(&pipeline, options).await?)
    }
}
