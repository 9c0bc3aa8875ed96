//! Runtime triggers for Flowline pipelines.
//!
//! Pipelines declare triggers as `system.trigger.cron`, `system.trigger.watch`
//! or `system.trigger.webhook` steps. The [`TriggerManager`] scans the trigger
//! root for those steps and keeps one registration per trigger alive:
//!
//! ```text
//!  *.intent.json ──scan──▶ TriggerManager ──▶ cron:    interval task
//!        ▲                      │        ──▶ watch:   notify + debounce
//!        │ change → refresh     │        ──▶ webhook: shared axum listener
//!        └──────────────────────┘
//!                               │ cooldown ok
//!                               ▼
//!                       PipelineInvoker::invoke ──success──▶ onSuccessPipeline
//! ```
//!
//! Each firing runs the pipeline starting at the trigger step, with the
//! firing event exposed as `trigger_*` variables.

pub mod definition;
pub mod error;
pub mod invoker;
pub mod manager;
pub mod registration;
pub mod state;
pub mod webhook;

pub use definition::{
    ChangeKind, CronSpec, TriggerDefaults, TriggerDefinition, TriggerKind, TriggerSpec, WatchSpec,
    MAX_CRON_INTERVAL, WebhookSpec, chain_target, parse_cron_interval, scan_document,
};
pub use error::{Result, TriggerError};
pub use invoker::{InvocationRequest, PipelineInvoker, RunnerInvoker};
pub use manager::{TriggerManager, TriggerSettings, discover_pipelines, event_variables};
pub use registration::{TriggerInfo, TriggerRegistration};
pub use state::{Cooldown, Debouncer};
pub use webhook::{WebhookServer, WebhookState};
