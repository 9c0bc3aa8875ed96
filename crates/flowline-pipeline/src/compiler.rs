//! Intent compiler: turns a raw step into an executable intent.
//!
//! Compilation runs immediately before dispatch and has two phases:
//!
//! 1. **Variable resolution**: `${var:name}` tokens anywhere in the payload
//!    are replaced with the run's variable values. Unknown names are left
//!    verbatim; they are not errors.
//! 2. **Lowering**: `git.*` and `docker.*` macros become `terminal.run` with
//!    a synthesized shell command and the runner's current directory.
//!
//! Order matters: variables may feed fields consumed by lowering
//! (e.g. `{"branch": "${var:branch}"}`).

use std::path::Path;

use serde_json::{Map, Value};

use crate::error::PipelineError;
use crate::intent::Intent;
use crate::payload::{StepKind, TERMINAL_RUN};
use crate::variables::VariableStore;

/// Placeholder meaning "the workspace root" in a `cwd` field.
pub const WORKSPACE_ROOT_PLACEHOLDER: &str = "${workspaceFolder}";

const TOKEN_OPEN: &str = "${var:";
const TOKEN_CLOSE: char = '}';

/// Resolve `${var:name}` tokens in a JSON value tree.
///
/// - Strings: tokens are replaced inline
/// - Objects/Arrays: values are resolved recursively (keys are untouched)
/// - Other types: returned unchanged
pub fn resolve_template_variables(input: &Value, store: &VariableStore) -> Value {
    match input {
        Value::String(s) => Value::String(resolve_string(s, store)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_template_variables(v, store))
                .collect(),
        ),
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (k, v) in map {
                resolved.insert(k.clone(), resolve_template_variables(v, store));
            }
            Value::Object(resolved)
        }
        other => other.clone(),
    }
}

/// Resolve `${var:name}` tokens in a single string.
pub fn resolve_string(s: &str, store: &VariableStore) -> String {
    let mut out = String::with_capacity(s.len());
    let mut remaining = s;

    while let Some(start) = remaining.find(TOKEN_OPEN) {
        let after_open = &remaining[start + TOKEN_OPEN.len()..];
        let Some(end) = after_open.find(TOKEN_CLOSE) else {
            // Unclosed token: keep the rest verbatim
            break;
        };

        out.push_str(&remaining[..start]);
        let name = after_open[..end].trim();
        match store.get(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(&remaining[start..start + TOKEN_OPEN.len() + end + 1]),
        }
        remaining = &after_open[end + 1..];
    }

    out.push_str(remaining);
    out
}

/// Lower `git.*`/`docker.*` macros to `terminal.run`.
///
/// Intents outside the known macro set are returned unchanged. A known macro
/// missing a required field fails with an error naming the field.
pub fn transform_to_terminal(intent: &Intent, cwd: &Path) -> Result<Intent, PipelineError> {
    let kind = StepKind::parse(intent)?;
    let Some(command) = kind.shell_command() else {
        return Ok(intent.clone());
    };

    let mut payload = Map::new();
    payload.insert("command".to_string(), Value::String(command));
    payload.insert(
        "cwd".to_string(),
        Value::String(cwd.to_string_lossy().into_owned()),
    );

    Ok(Intent {
        intent: TERMINAL_RUN.to_string(),
        payload: Value::Object(payload),
        // Capability names referred to the macro, not the terminal
        capabilities: None,
        ..intent.clone()
    })
}

/// Compile a step: resolve variables in its payload, then lower it.
pub fn compile_step(
    step: &Intent,
    store: &VariableStore,
    cwd: &Path,
) -> Result<Intent, PipelineError> {
    let resolved = Intent {
        payload: resolve_template_variables(&step.payload, store),
        ..step.clone()
    };
    transform_to_terminal(&resolved, cwd)
}

/// Fill in `payload.cwd` unless the caller set an explicit directory.
///
/// Unset, empty, `.` and the workspace-root placeholder are all replaced by
/// `cwd`. A non-object payload becomes `{ "cwd": cwd }`.
pub fn apply_default_cwd(payload: &Value, cwd: &Path) -> Value {
    let mut map = match payload {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    let needs_default = match map.get("cwd") {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => {
            let s = s.trim();
            s.is_empty() || s == "." || s == WORKSPACE_ROOT_PLACEHOLDER
        }
        Some(_) => false,
    };

    if needs_default {
        map.insert(
            "cwd".to_string(),
            Value::String(cwd.to_string_lossy().into_owned()),
        );
    }

    Value::Object(map)
}
