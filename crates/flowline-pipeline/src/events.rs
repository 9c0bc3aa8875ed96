//! Pipeline lifecycle events and the synchronous bus that carries them.
//!
//! Subscribers are called inline on the emitting task; they must not block.
//! Emission is fire-and-forget: a subscriber cannot veto or delay a run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::intent::PipelineFile;

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
    Cancelled,
}

impl RunStatus {
    pub fn is_success(self) -> bool {
        self == RunStatus::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// A lifecycle event. Every variant carries the run id and a timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PipelineEvent {
    /// A run started. Carries the full document for history snapshots.
    #[serde(rename_all = "camelCase")]
    PipelineStart {
        run_id: String,
        timestamp: DateTime<Utc>,
        pipeline: PipelineFile,
    },
    #[serde(rename_all = "camelCase")]
    PipelineEnd {
        run_id: String,
        timestamp: DateTime<Utc>,
        success: bool,
        status: RunStatus,
    },
    #[serde(rename_all = "camelCase")]
    StepStart {
        run_id: String,
        timestamp: DateTime<Utc>,
        index: usize,
        step_id: Option<String>,
        intent: String,
    },
    #[serde(rename_all = "camelCase")]
    StepEnd {
        run_id: String,
        timestamp: DateTime<Utc>,
        index: usize,
        step_id: Option<String>,
        success: bool,
    },
    #[serde(rename_all = "camelCase")]
    PipelinePause {
        run_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    PipelineResume {
        run_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn pipeline_start(run_id: &str, pipeline: &PipelineFile) -> Self {
        Self::PipelineStart {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            pipeline: pipeline.clone(),
        }
    }

    pub fn pipeline_end(run_id: &str, status: RunStatus) -> Self {
        Self::PipelineEnd {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            success: status.is_success(),
            status,
        }
    }

    pub fn step_start(run_id: &str, index: usize, step_id: Option<&str>, intent: &str) -> Self {
        Self::StepStart {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            index,
            step_id: step_id.map(String::from),
            intent: intent.to_string(),
        }
    }

    pub fn step_end(run_id: &str, index: usize, step_id: Option<&str>, success: bool) -> Self {
        Self::StepEnd {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            index,
            step_id: step_id.map(String::from),
            success,
        }
    }

    pub fn pipeline_pause(run_id: &str) -> Self {
        Self::PipelinePause {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn pipeline_resume(run_id: &str) -> Self {
        Self::PipelineResume {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Run this event belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            Self::PipelineStart { run_id, .. }
            | Self::PipelineEnd { run_id, .. }
            | Self::StepStart { run_id, .. }
            | Self::StepEnd { run_id, .. }
            | Self::PipelinePause { run_id, .. }
            | Self::PipelineResume { run_id, .. } => run_id,
        }
    }

    /// Wire name of the event, e.g. `stepEnd`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PipelineStart { .. } => "pipelineStart",
            Self::PipelineEnd { .. } => "pipelineEnd",
            Self::StepStart { .. } => "stepStart",
            Self::StepEnd { .. } => "stepEnd",
            Self::PipelinePause { .. } => "pipelinePause",
            Self::PipelineResume { .. } => "pipelineResume",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus
// ─────────────────────────────────────────────────────────────────────────────

type Subscriber = Arc<dyn Fn(&PipelineEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Synchronous publish/subscribe channel for [`PipelineEvent`]s.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. It sees every event emitted after this call.
    pub fn subscribe<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(f)));
        id
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    /// Deliver an event to every subscriber, in subscription order.
    pub fn emit(&self, event: PipelineEvent) {
        // Snapshot so a subscriber may (un)subscribe without deadlocking
        let subs: Vec<Subscriber> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for sub in subs {
            sub(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_emit_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&seen);
        bus.subscribe(move |e| s1.lock().push(format!("a:{}", e.name())));
        let s2 = Arc::clone(&seen);
        bus.subscribe(move |e| s2.lock().push(format!("b:{}", e.name())));

        bus.emit(PipelineEvent::pipeline_pause("r"));
        assert_eq!(*seen.lock(), vec!["a:pipelinePause", "b:pipelinePause"]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let id = bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(PipelineEvent::pipeline_resume("r"));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(PipelineEvent::pipeline_resume("r"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = PipelineEvent::pipeline_end("run-1", RunStatus::Cancelled);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "pipelineEnd");
        assert_eq!(value["runId"], "run-1");
        assert_eq!(value["success"], false);
        assert_eq!(value["status"], "cancelled");
        assert!(value.get("timestamp").is_some());

        let step = PipelineEvent::step_end("run-1", 2, Some("build"), true);
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["stepId"], "build");
        assert_eq!(step.run_id(), "run-1");
    }
}
