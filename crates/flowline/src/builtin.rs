//! Built-in command handlers: `terminal.run` and `system.log`.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use flowline_pipeline::{
    CapabilityRegistry, CommandHandler, CommandTable, Determinism, Registration, StepInvocation,
    StepOutcome, TERMINAL_RUN,
};

/// Provider name for the handlers in this module.
pub const BUILTIN_PROVIDER: &str = "builtin";

pub const SYSTEM_LOG: &str = "system.log";

/// The built-in capabilities and the table their handlers are bound in.
#[derive(Clone)]
pub struct Builtins {
    pub registry: Arc<CapabilityRegistry>,
    pub table: Arc<CommandTable>,
}

impl Builtins {
    pub fn new(shell: ShellHandler) -> Self {
        let registry = Arc::new(CapabilityRegistry::new());
        let table = Arc::new(CommandTable::new());
        register(&registry, &table, shell);
        Self { registry, table }
    }
}

impl fmt::Debug for Builtins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builtins").finish_non_exhaustive()
    }
}

/// Register the built-in capabilities and bind their handlers.
pub fn register(registry: &CapabilityRegistry, table: &CommandTable, shell: ShellHandler) {
    registry.register(
        Registration::names(BUILTIN_PROVIDER, TERMINAL_RUN, [TERMINAL_RUN])
            .with_determinism(Determinism::Deterministic),
    );
    registry.register(
        Registration::names(BUILTIN_PROVIDER, SYSTEM_LOG, [SYSTEM_LOG])
            .with_determinism(Determinism::Deterministic),
    );
    table.insert(TERMINAL_RUN, Arc::new(shell));
    table.insert(SYSTEM_LOG, Arc::new(LogHandler));
}

// ─────────────────────────────────────────────────────────────────────────────
// terminal.run
// ─────────────────────────────────────────────────────────────────────────────

/// Runs `payload.command` through `sh -c`.
///
/// Exports `terminal_output` (trimmed stdout) and `terminal_exit_code`.
/// Child output is always logged at debug; with `echo` it is also copied to
/// this process's stdout and stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellHandler {
    echo: bool,
}

impl ShellHandler {
    pub fn new(echo: bool) -> Self {
        Self { echo }
    }
}

#[async_trait]
impl CommandHandler for ShellHandler {
    async fn invoke(&self, invocation: &StepInvocation) -> StepOutcome {
        let Some(command) = invocation.payload.get("command").and_then(Value::as_str) else {
            return StepOutcome::failure("terminal.run requires a command");
        };
        let cwd = invocation
            .payload
            .get("cwd")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| invocation.cwd.clone());
        let step = invocation.intent.label();

        if invocation.dry_run {
            info!(run_id = %invocation.run_id, step, command, cwd = %cwd.display(), "dry run");
            return StepOutcome::success();
        }

        debug!(run_id = %invocation.run_id, step, command, cwd = %cwd.display(), "running");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!(step, error = %e, "failed to spawn shell");
                return StepOutcome::failure(format!("failed to spawn: {}", e));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            run_id = %invocation.run_id,
            step,
            stdout = %stdout.trim_end(),
            stderr = %stderr.trim_end(),
            "command output"
        );
        if self.echo {
            if !stdout.is_empty() {
                print!("{}", stdout);
            }
            if !stderr.is_empty() {
                eprint!("{}", stderr);
            }
        }

        let code = output.status.code();
        let code_str = code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into());
        if output.status.success() {
            StepOutcome::success()
                .with_variable("terminal_output", stdout.trim())
                .with_variable("terminal_exit_code", code_str)
        } else {
            StepOutcome::failure(format!("'{}' exited with {}", command, code_str))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// system.log
// ─────────────────────────────────────────────────────────────────────────────

/// Logs `payload.message` at `payload.level` (default `info`).
pub struct LogHandler;

#[async_trait]
impl CommandHandler for LogHandler {
    async fn invoke(&self, invocation: &StepInvocation) -> StepOutcome {
        let payload = &invocation.payload;
        let message = match payload.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => payload.to_string(),
        };
        let run_id = invocation.run_id.as_str();
        let step = invocation.intent.label();

        match payload.get("level").and_then(Value::as_str).unwrap_or("info") {
            "error" => error!(run_id, step, "{}", message),
            "warn" => warn!(run_id, step, "{}", message),
            "debug" => debug!(run_id, step, "{}", message),
            _ => info!(run_id, step, "{}", message),
        }
        StepOutcome::success()
    }
}
