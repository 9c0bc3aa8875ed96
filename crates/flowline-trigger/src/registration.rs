//! Live trigger registrations.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::definition::{ChangeKind, TriggerDefinition, TriggerKind, TriggerSpec};
use crate::state::{Cooldown, Debouncer};

/// Listing entry for a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerInfo {
    pub id: String,
    pub kind: TriggerKind,
    pub pipeline: PathBuf,
    pub step_id: Option<String>,
    /// Human-readable schedule / pattern / route.
    pub detail: String,
    pub cooldown_ms: u64,
}

impl From<&TriggerDefinition> for TriggerInfo {
    fn from(def: &TriggerDefinition) -> Self {
        Self {
            id: def.id(),
            kind: def.kind(),
            pipeline: def.pipeline.clone(),
            step_id: def.step_id.clone(),
            detail: def.spec.describe(),
            cooldown_ms: def.cooldown.as_millis() as u64,
        }
    }
}

/// A registered trigger and the state that rate-limits it.
///
/// Owns its timer and pending debounce tasks; [`dispose`](Self::dispose)
/// (or drop) aborts them.
pub struct TriggerRegistration {
    id: String,
    definition: TriggerDefinition,
    cooldown: Cooldown,
    debounce: Debouncer<(PathBuf, ChangeKind)>,
    timer: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl TriggerRegistration {
    pub fn new(definition: TriggerDefinition) -> Self {
        let debounce = match definition.spec {
            TriggerSpec::Watch(ref watch) => watch.debounce,
            _ => Duration::ZERO,
        };
        Self {
            id: definition.id(),
            cooldown: Cooldown::new(definition.cooldown),
            debounce: Debouncer::new(debounce),
            definition,
            timer: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TriggerKind {
        self.definition.kind()
    }

    pub fn definition(&self) -> &TriggerDefinition {
        &self.definition
    }

    pub fn cooldown(&self) -> &Cooldown {
        &self.cooldown
    }

    pub fn debounce(&self) -> &Debouncer<(PathBuf, ChangeKind)> {
        &self.debounce
    }

    /// Attach the interval task driving a cron trigger.
    pub fn set_timer(&self, task: JoinHandle<()>) {
        if self.is_disposed() {
            task.abort();
            return;
        }
        if let Some(old) = self.timer.lock().replace(task) {
            old.abort();
        }
    }

    /// Stop the timer and drop pending debounced firings.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.timer.lock().take() {
            task.abort();
        }
        self.debounce.cancel_all();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> TriggerInfo {
        TriggerInfo::from(&self.definition)
    }
}

impl Drop for TriggerRegistration {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for TriggerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRegistration")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
