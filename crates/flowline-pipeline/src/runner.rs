//! Pipeline runner: the per-run execution state machine.
//!
//! `Starting → Running ⇄ Paused → (Succeeded | Failed | Cancelled)`
//!
//! Steps run strictly in sequence. A handler reporting failure is recoverable
//! and may branch via `onFailure`; a compilation error aborts the run and is
//! returned to the caller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compiler::{apply_default_cwd, compile_step, resolve_template_variables};
use crate::control::RunHandle;
use crate::dispatch::{CommandDispatcher, StepInvocation};
use crate::error::{PipelineError, Result};
use crate::events::{EventBus, PipelineEvent, RunStatus};
use crate::intent::{Intent, IntentMeta, PipelineFile};
use crate::payload::{StepKind, TERMINAL_RUN};
use crate::registry::{CapabilityRegistry, UserMapping};
use crate::variables::VariableStore;

/// Where a run begins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StartPoint {
    #[default]
    Beginning,
    /// First step with this id.
    StepId(String),
    /// Zero-based step index.
    Index(usize),
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub start: StartPoint,
    /// Initial variables (e.g. trigger event fields).
    pub variables: VariableStore,
    pub dry_run: bool,
    /// Initial working directory. Defaults to the workspace root.
    pub cwd: Option<PathBuf>,
}

impl RunOptions {
    pub fn from_step(mut self, id: impl Into<String>) -> Self {
        self.start = StartPoint::StepId(id.into());
        self
    }

    pub fn with_variables(mut self, variables: VariableStore) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    /// Steps started, counting re-entries after a branch.
    pub steps_executed: usize,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// State owned by one run.
struct RunContext<'a> {
    handle: &'a RunHandle,
    variables: VariableStore,
    cwd: PathBuf,
    dry_run: bool,
}

/// Executes pipeline documents.
pub struct PipelineRunner {
    registry: Arc<CapabilityRegistry>,
    dispatcher: Arc<dyn CommandDispatcher>,
    events: Arc<EventBus>,
    workspace_root: PathBuf,
    user_mappings: Vec<UserMapping>,
    active: Mutex<HashMap<String, RunHandle>>,
    /// Most recently started run still in progress.
    current: Mutex<Option<RunHandle>>,
}

impl PipelineRunner {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        dispatcher: Arc<dyn CommandDispatcher>,
        events: Arc<EventBus>,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            events,
            workspace_root: workspace_root.into(),
            user_mappings: Vec::new(),
            active: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
        }
    }

    /// Install user capability overrides.
    pub fn with_user_mappings(mut self, mappings: Vec<UserMapping>) -> Self {
        self.user_mappings = mappings;
        self
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Control
    // ─────────────────────────────────────────────────────────────────────────

    /// Pause the most recently started run. No-op when nothing is running.
    pub fn pause(&self) -> bool {
        self.current().is_some_and(|h| h.pause())
    }

    /// Resume the most recently started run.
    pub fn resume(&self) -> bool {
        self.current().is_some_and(|h| h.resume())
    }

    /// Cancel the most recently started run.
    pub fn cancel(&self) -> bool {
        self.current().is_some_and(|h| h.cancel())
    }

    /// Handle of a specific active run.
    pub fn handle(&self, run_id: &str) -> Option<RunHandle> {
        self.active.lock().get(run_id).cloned()
    }

    /// Ids of all runs in progress.
    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn current(&self) -> Option<RunHandle> {
        self.current.lock().clone()
    }

    fn begin(&self, handle: &RunHandle) {
        self.active
            .lock()
            .insert(handle.run_id().to_string(), handle.clone());
        // A newer run takes over the global control surface
        *self.current.lock() = Some(handle.clone());
    }

    fn finish(&self, run_id: &str) {
        self.active.lock().remove(run_id);
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|h| h.run_id() == run_id) {
            *current = None;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a pipeline to completion.
    ///
    /// Returns `Ok` for success, handler failure and cancellation alike; the
    /// outcome's status tells them apart. `Err` means the run could not start
    /// (unknown start step) or a step failed to compile.
    pub async fn run(&self, pipeline: &PipelineFile, options: RunOptions) -> Result<RunOutcome> {
        let start = self.start_index(pipeline, &options.start)?;

        let run_id = Uuid::new_v4().to_string();
        let handle = RunHandle::new(run_id.clone(), Arc::clone(&self.events));
        self.begin(&handle);

        info!(run_id = %run_id, pipeline = %pipeline.name, start, "pipeline started");
        self.events
            .emit(PipelineEvent::pipeline_start(&run_id, pipeline));

        let mut ctx = RunContext {
            handle: &handle,
            variables: options.variables,
            cwd: options.cwd.unwrap_or_else(|| self.workspace_root.clone()),
            dry_run: options.dry_run,
        };

        let result = self.execute(pipeline, start, &mut ctx).await;
        self.finish(&run_id);

        let (status, steps_executed) = match result {
            Ok(done) => done,
            Err(e) => {
                warn!(run_id = %run_id, pipeline = %pipeline.name, error = %e, "pipeline aborted");
                self.events
                    .emit(PipelineEvent::pipeline_end(&run_id, RunStatus::Failure));
                return Err(e);
            }
        };

        info!(run_id = %run_id, pipeline = %pipeline.name, %status, steps_executed, "pipeline finished");
        self.events
            .emit(PipelineEvent::pipeline_end(&run_id, status));

        Ok(RunOutcome {
            run_id,
            status,
            steps_executed,
        })
    }

    fn start_index(&self, pipeline: &PipelineFile, start: &StartPoint) -> Result<usize> {
        match start {
            StartPoint::Beginning => Ok(0),
            StartPoint::StepId(id) => pipeline
                .step_index(id)
                .ok_or_else(|| PipelineError::StepNotFound(id.clone())),
            StartPoint::Index(i) if *i <= pipeline.steps.len() => Ok(*i),
            StartPoint::Index(i) => Err(PipelineError::StepNotFound(format!("#{}", i))),
        }
    }

    async fn execute(
        &self,
        pipeline: &PipelineFile,
        start: usize,
        ctx: &mut RunContext<'_>,
    ) -> Result<(RunStatus, usize)> {
        let run_id = ctx.handle.run_id().to_string();
        let mut executed = 0;
        let mut i = start;

        while i < pipeline.steps.len() {
            ctx.handle.wait_while_paused().await;
            if ctx.handle.is_cancelled() {
                return Ok((RunStatus::Cancelled, executed));
            }

            let step = &pipeline.steps[i];
            let success = self.execute_step(i, step, ctx).await?;
            executed += 1;

            if success {
                i += 1;
                continue;
            }

            match step.on_failure.as_deref() {
                Some(target) => match pipeline.step_index(target) {
                    Some(next) => {
                        debug!(run_id = %run_id, step = %step.label(), branch = target, "branching on failure");
                        i = next;
                    }
                    None => {
                        warn!(run_id = %run_id, step = %step.label(), branch = target, "failure branch target not found");
                        return Ok((RunStatus::Failure, executed));
                    }
                },
                None => return Ok((RunStatus::Failure, executed)),
            }
        }

        Ok((RunStatus::Success, executed))
    }

    /// Run one step. Returns the step's success flag.
    async fn execute_step(
        &self,
        index: usize,
        step: &Intent,
        ctx: &mut RunContext<'_>,
    ) -> Result<bool> {
        let run_id = ctx.handle.run_id().to_string();
        let step_id = step.id.as_deref();

        // Control flow sees variable-resolved payloads
        let resolved = Intent {
            payload: resolve_template_variables(&step.payload, &ctx.variables),
            ..step.clone()
        };
        let kind = StepKind::parse(&resolved)?;

        if kind.is_control_flow() {
            self.events
                .emit(PipelineEvent::step_start(&run_id, index, step_id, &step.intent));
            match kind {
                StepKind::SetCwd { path } => {
                    ctx.cwd = ctx.cwd.join(path);
                    debug!(run_id = %run_id, cwd = %ctx.cwd.display(), "working directory changed");
                }
                StepKind::SetVar { name, value } => {
                    debug!(run_id = %run_id, name = %name, "variable set");
                    ctx.variables.set(name, value);
                }
                _ => {}
            }
            self.events
                .emit(PipelineEvent::step_end(&run_id, index, step_id, true));
            return Ok(true);
        }

        let prepared = if step.intent == TERMINAL_RUN {
            Intent {
                payload: apply_default_cwd(&step.payload, &ctx.cwd),
                ..step.clone()
            }
        } else {
            step.clone()
        };
        let mut compiled = compile_step(&prepared, &ctx.variables, &ctx.cwd)?;
        let base_meta = compiled.meta.take().unwrap_or_default();
        compiled.meta = Some(IntentMeta {
            dry_run: Some(ctx.dry_run || base_meta.dry_run == Some(true)),
            trace_id: Some(Uuid::new_v4().to_string()),
            step_id: step.id.clone(),
            run_id: Some(run_id.clone()),
        });
        let dry_run = compiled.meta.as_ref().and_then(|m| m.dry_run) == Some(true);

        self.events
            .emit(PipelineEvent::step_start(&run_id, index, step_id, &compiled.intent));

        let resolutions = self.registry.resolve(&compiled, &self.user_mappings);
        let mut success = true;
        for resolution in &resolutions {
            let invocation = StepInvocation {
                run_id: run_id.clone(),
                intent: compiled.clone(),
                command: resolution.command.clone(),
                payload: resolution.payload_for(&compiled),
                source: resolution.source,
                cwd: ctx.cwd.clone(),
                dry_run,
            };

            let outcome = self.dispatcher.dispatch(&invocation).await;
            if !outcome.success {
                if resolution.is_fallback() {
                    warn!(
                        run_id = %run_id,
                        step = %step.label(),
                        capability = %resolution.capability,
                        "step failed on an unregistered capability"
                    );
                } else {
                    debug!(
                        run_id = %run_id,
                        step = %step.label(),
                        command = %resolution.command,
                        detail = outcome.message.as_deref().unwrap_or(""),
                        "handler reported failure"
                    );
                }
                success = false;
                break;
            }
            ctx.variables.extend(outcome.variables);
        }

        self.events
            .emit(PipelineEvent::step_end(&run_id, index, step_id, success));
        Ok(success)
    }
}
