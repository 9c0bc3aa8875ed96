//! Per-run pause/resume/cancel control.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::events::{EventBus, PipelineEvent};

/// Control flags of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunState {
    pub paused: bool,
    pub cancelled: bool,
}

/// Control surface for a single run.
///
/// Cloning yields another handle to the same run. Flags are observed by the
/// runner only at step boundaries; an in-flight handler is never interrupted.
#[derive(Clone)]
pub struct RunHandle {
    run_id: String,
    state: Arc<watch::Sender<RunState>>,
    events: Arc<EventBus>,
}

impl RunHandle {
    pub fn new(run_id: impl Into<String>, events: Arc<EventBus>) -> Self {
        let (tx, _rx) = watch::channel(RunState::default());
        Self {
            run_id: run_id.into(),
            state: Arc::new(tx),
            events,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().cancelled
    }

    /// Pause before the next step. No-op if already paused or cancelled.
    pub fn pause(&self) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if s.paused || s.cancelled {
                return false;
            }
            s.paused = true;
            true
        });
        if changed {
            info!(run_id = %self.run_id, "run paused");
            self.events.emit(PipelineEvent::pipeline_pause(&self.run_id));
        }
        changed
    }

    /// Resume a paused run. No-op if not paused.
    pub fn resume(&self) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if !s.paused {
                return false;
            }
            s.paused = false;
            true
        });
        if changed {
            info!(run_id = %self.run_id, "run resumed");
            self.events.emit(PipelineEvent::pipeline_resume(&self.run_id));
        }
        changed
    }

    /// Request cancellation. Wakes a paused run so it can observe the flag.
    pub fn cancel(&self) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if s.cancelled {
                return false;
            }
            s.cancelled = true;
            true
        });
        if changed {
            info!(run_id = %self.run_id, "run cancelled");
        }
        changed
    }

    /// Block while paused; returns as soon as the run is resumed or cancelled.
    pub async fn wait_while_paused(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in self, so the channel can't close here
        let _ = rx.wait_for(|s| !s.paused || s.cancelled).await;
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("state", &self.state())
            .finish()
    }
}
