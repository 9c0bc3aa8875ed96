//! Typed step payloads.
//!
//! A step's `payload` is free-form JSON whose shape depends on the intent
//! name. [`StepKind::parse`] turns an intent into a sum type with one variant
//! per intent the engine understands, validating required fields on the way.
//! Everything else is [`StepKind::Other`] and is dispatched untouched.

use serde_json::Value;

use crate::error::PipelineError;
use crate::intent::Intent;
use crate::variables::value_to_string;

/// Control-flow intent: change the runner's working directory.
pub const SET_CWD: &str = "system.setCwd";

/// Control-flow intent: assign a run variable.
pub const SET_VAR: &str = "system.setVar";

/// Primitive intent every git/docker macro lowers to.
pub const TERMINAL_RUN: &str = "terminal.run";

/// Prefix shared by trigger-declaring intents.
pub const TRIGGER_PREFIX: &str = "system.trigger.";

/// A step, classified by intent name with its payload decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// `system.setCwd { path }`
    SetCwd { path: String },
    /// `system.setVar { name, value }`
    SetVar { name: String, value: String },
    /// `terminal.run { command?, cwd? }`; the handler reports a missing command.
    TerminalRun {
        command: Option<String>,
        cwd: Option<String>,
    },
    /// A `git.*` macro.
    Git(GitCommand),
    /// A `docker.*` macro.
    Docker(DockerCommand),
    /// `system.trigger.<kind>`; carries the kind suffix.
    Trigger(String),
    /// Anything else, dispatched as-is.
    Other,
}

/// Git operations that lower to a shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitCommand {
    Checkout { branch: String, create: bool },
    Commit { message: String, amend: bool },
    Pull,
    Push,
    Clone { url: String, dir: Option<String> },
}

/// Docker operations that lower to a shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerCommand {
    Build { tag: String, path: Option<String> },
    Run { image: String, detach: bool },
}

impl StepKind {
    /// Classify an intent and decode its payload.
    ///
    /// Fails with [`PipelineError::MissingField`] when a control-flow intent
    /// or a macro lacks a required field.
    pub fn parse(intent: &Intent) -> Result<Self, PipelineError> {
        let name = intent.intent.as_str();
        let fields = Fields { intent };

        let kind = match name {
            SET_CWD => StepKind::SetCwd {
                path: fields.required_str("path")?,
            },
            SET_VAR => StepKind::SetVar {
                name: fields.required_str("name")?,
                value: intent
                    .payload
                    .get("value")
                    .map(value_to_string)
                    .unwrap_or_default(),
            },
            TERMINAL_RUN => StepKind::TerminalRun {
                command: fields.optional_str("command"),
                cwd: fields.optional_str("cwd"),
            },
            "git.checkout" => StepKind::Git(GitCommand::Checkout {
                branch: fields.required_str("branch")?,
                create: fields.optional_bool("create"),
            }),
            "git.commit" => StepKind::Git(GitCommand::Commit {
                message: fields.required_str("message")?,
                amend: fields.optional_bool("amend"),
            }),
            "git.pull" => StepKind::Git(GitCommand::Pull),
            "git.push" => StepKind::Git(GitCommand::Push),
            "git.clone" => StepKind::Git(GitCommand::Clone {
                url: fields.required_str("url")?,
                dir: fields.optional_str("dir"),
            }),
            "docker.build" => StepKind::Docker(DockerCommand::Build {
                tag: fields.required_str("tag")?,
                path: fields.optional_str("path"),
            }),
            "docker.run" => StepKind::Docker(DockerCommand::Run {
                image: fields.required_str("image")?,
                detach: fields.optional_bool("detach"),
            }),
            other => match other.strip_prefix(TRIGGER_PREFIX) {
                Some(kind) => StepKind::Trigger(kind.to_string()),
                None => StepKind::Other,
            },
        };

        Ok(kind)
    }

    /// Whether the runner handles this step itself instead of dispatching it.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            StepKind::SetCwd { .. } | StepKind::SetVar { .. } | StepKind::Trigger(_)
        )
    }

    /// The shell command a git/docker macro lowers to.
    pub fn shell_command(&self) -> Option<String> {
        match self {
            StepKind::Git(git) => Some(git.to_command_line()),
            StepKind::Docker(docker) => Some(docker.to_command_line()),
            _ => None,
        }
    }
}

impl GitCommand {
    /// Render as a shell command line.
    pub fn to_command_line(&self) -> String {
        match self {
            GitCommand::Checkout { branch, create } => {
                let flag = if *create { "-b " } else { "" };
                format!("git checkout {}{}", flag, branch)
            }
            GitCommand::Commit { message, amend } => {
                let flag = if *amend { "--amend " } else { "" };
                format!("git commit {}-m \"{}\"", flag, escape_double_quoted(message))
            }
            GitCommand::Pull => "git pull".to_string(),
            GitCommand::Push => "git push".to_string(),
            GitCommand::Clone { url, dir } => match dir {
                Some(dir) => format!("git clone {} {}", url, dir),
                None => format!("git clone {}", url),
            },
        }
    }
}

impl DockerCommand {
    /// Render as a shell command line.
    pub fn to_command_line(&self) -> String {
        match self {
            DockerCommand::Build { tag, path } => {
                format!("docker build -t {} {}", tag, path.as_deref().unwrap_or("."))
            }
            DockerCommand::Run { image, detach } => {
                let flag = if *detach { "-d " } else { "" };
                format!("docker run {}{}", flag, image)
            }
        }
    }
}

/// Escape text placed inside a double-quoted shell argument.
fn escape_double_quoted(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Field accessors over an intent's payload that report the intent by name.
struct Fields<'a> {
    intent: &'a Intent,
}

impl Fields<'_> {
    fn required_str(&self, name: &str) -> Result<String, PipelineError> {
        match self.intent.payload.get(name) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(PipelineError::missing(&self.intent.intent, name)),
        }
    }

    fn optional_str(&self, name: &str) -> Option<String> {
        self.intent
            .payload
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from)
    }

    fn optional_bool(&self, name: &str) -> bool {
        self.intent
            .payload
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
