//! Pipeline engine for Flowline.
//!
//! A pipeline is a JSON document listing steps (intents with payloads). This
//! crate loads those documents and executes them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   compile_step    ┌─────────────────────┐
//! │ PipelineFile │ ────────────────▶ │ IntentCompiler      │
//! └──────┬───────┘                   │ ${var:x}, git/docker│
//!        │ run()                     └─────────┬───────────┘
//!        ▼                                     │ compiled intent
//! ┌──────────────┐     resolve()     ┌─────────▼───────────┐
//! │PipelineRunner│ ────────────────▶ │ CapabilityRegistry  │
//! │ pause/cancel │                   │ user > registry >   │
//! │ onFailure    │                   │ fallback            │
//! └──────┬───────┘                   └─────────────────────┘
//!        │ dispatch()                ┌─────────────────────┐
//!        └─────────────────────────▶ │ CommandDispatcher   │
//!        │ emit()                    └─────────────────────┘
//!        ▼
//!   EventBus subscribers
//! ```

pub mod compiler;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod intent;
pub mod payload;
pub mod registry;
pub mod runner;
pub mod variables;

pub use compiler::{
    WORKSPACE_ROOT_PLACEHOLDER, apply_default_cwd, compile_step, resolve_string,
    resolve_template_variables, transform_to_terminal,
};
pub use control::{RunHandle, RunState};
pub use dispatch::{
    CommandDispatcher, CommandHandler, CommandTable, FnHandler, StepInvocation, StepOutcome,
};
pub use error::{PipelineError, Result};
pub use events::{EventBus, PipelineEvent, RunStatus, SubscriptionId};
pub use intent::{Intent, IntentMeta, PIPELINE_FILE_SUFFIX, PipelineFile};
pub use payload::{
    DockerCommand, GitCommand, SET_CWD, SET_VAR, StepKind, TERMINAL_RUN, TRIGGER_PREFIX,
};
pub use registry::{
    Capability, CapabilityEntries, CapabilityRecord, CapabilityRegistry, CapabilityType,
    Determinism, PayloadMapper, Registration, Resolution, ResolutionSource, UserMapping,
};
pub use runner::{PipelineRunner, RunOptions, RunOutcome, StartPoint};
pub use variables::{VariableStore, value_to_string};
