//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [workspace]              # workspace root and trigger root
//! [runner]                 # pipeline runner defaults
//! [triggers]               # trigger manager and webhook listener
//! [logging]                # log level and file output
//! [[mappings]]             # user capability overrides
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default port for the shared webhook listener.
pub const DEFAULT_WEBHOOK_PORT: u16 = 7781;

/// Default bind host for the webhook listener.
pub const DEFAULT_WEBHOOK_HOST: &str = "127.0.0.1";

/// Default request header carrying a webhook secret.
pub const DEFAULT_SECRET_HEADER: &str = "x-flowline-secret";

/// Default maximum number of success-chained pipeline hops.
pub const DEFAULT_MAX_CHAIN_DEPTH: u32 = 4;

/// Default cooldown for cron and watch triggers, in milliseconds.
pub const DEFAULT_COOLDOWN_MS: u64 = 2500;

/// Default quiescence window for watch triggers, in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Default debounce applied to pipeline-document changes before a refresh.
pub const DEFAULT_REFRESH_DEBOUNCE_MS: u64 = 300;

/// Default trigger root, relative to the workspace root.
pub const DEFAULT_PIPELINES_DIR: &str = ".flowline";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowlineConfig {
    /// Workspace layout.
    pub workspace: Option<WorkspaceConfig>,

    /// Pipeline runner defaults.
    pub runner: Option<RunnerConfig>,

    /// Trigger manager configuration.
    pub triggers: Option<TriggersConfig>,

    /// Logging configuration.
    pub logging: Option<LoggingConfig>,

    /// User capability overrides. These always win over registry entries.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mappings: Vec<MappingConfig>,
}

impl FlowlineConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        let config: FlowlineConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections replace wholesale; mappings from `other` are appended after
    /// existing ones so that the more specific layer is consulted last.
    pub fn merge(&mut self, other: FlowlineConfig) {
        if other.workspace.is_some() {
            self.workspace = other.workspace;
        }

        if other.runner.is_some() {
            self.runner = other.runner;
        }

        if other.triggers.is_some() {
            self.triggers = other.triggers;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }

        self.mappings.extend(other.mappings);
    }

    /// Check values that parse but cannot be used.
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(ref triggers) = self.triggers
            && triggers.webhook_secret_header.trim().is_empty()
        {
            return Err(crate::ConfigError::InvalidValue {
                field: "triggers.webhook_secret_header".to_string(),
                message: "header name cannot be empty".to_string(),
            });
        }

        for (i, mapping) in self.mappings.iter().enumerate() {
            if mapping.capability.trim().is_empty() || mapping.command.trim().is_empty() {
                return Err(crate::ConfigError::InvalidValue {
                    field: format!("mappings[{}]", i),
                    message: "capability and command are required".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Workspace section, or defaults.
    pub fn workspace(&self) -> WorkspaceConfig {
        self.workspace.clone().unwrap_or_default()
    }

    /// Runner section, or defaults.
    pub fn runner(&self) -> RunnerConfig {
        self.runner.clone().unwrap_or_default()
    }

    /// Triggers section, or defaults.
    pub fn triggers(&self) -> TriggersConfig {
        self.triggers.clone().unwrap_or_default()
    }

    /// Logging section, or defaults.
    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Workspace Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Workspace layout section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Workspace root. Relative paths resolve against the process cwd.
    pub root: Option<PathBuf>,
    /// Directory scanned for pipeline documents, relative to the root.
    pub pipelines_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: None,
            pipelines_dir: PathBuf::from(DEFAULT_PIPELINES_DIR),
        }
    }
}

impl WorkspaceConfig {
    /// Resolve the workspace root against a base directory.
    pub fn resolve_root(&self, base: &Path) -> PathBuf {
        match self.root {
            Some(ref root) if root.is_absolute() => root.clone(),
            Some(ref root) => base.join(root),
            None => base.to_path_buf(),
        }
    }

    /// Resolve the trigger root against a workspace root.
    pub fn resolve_pipelines_dir(&self, root: &Path) -> PathBuf {
        if self.pipelines_dir.is_absolute() {
            self.pipelines_dir.clone()
        } else {
            root.join(&self.pipelines_dir)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Pipeline runner section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Mark every dispatched step as a dry run.
    pub dry_run: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Trigger Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Trigger manager section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggersConfig {
    /// Whether trigger steps are registered at all.
    pub enabled: bool,
    /// Host the webhook listener binds to.
    pub webhook_host: String,
    /// Port the webhook listener binds to (0 picks an ephemeral port).
    pub webhook_port: u16,
    /// Header compared against a webhook trigger's `secret`.
    pub webhook_secret_header: String,
    /// Maximum number of success-chained hops.
    pub max_chain_depth: u32,
    /// Cooldown applied to cron and watch triggers without `cooldownMs`.
    pub default_cooldown_ms: u64,
    /// Debounce applied to watch triggers without `debounceMs`.
    pub default_debounce_ms: u64,
    /// Quiet period before pipeline-document edits cause a refresh.
    pub refresh_debounce_ms: u64,
}

impl Default for TriggersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_host: DEFAULT_WEBHOOK_HOST.to_string(),
            webhook_port: DEFAULT_WEBHOOK_PORT,
            webhook_secret_header: DEFAULT_SECRET_HEADER.to_string(),
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
            default_cooldown_ms: DEFAULT_COOLDOWN_MS,
            default_debounce_ms: DEFAULT_DEBOUNCE_MS,
            refresh_debounce_ms: DEFAULT_REFRESH_DEBOUNCE_MS,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Console filter level (e.g. "info", "debug").
    pub level: String,
    /// Write a rotating JSON log file.
    pub file: bool,
    /// Directory for log files. Defaults to `<config dir>/logs`.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
            dir: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability Mappings
// ─────────────────────────────────────────────────────────────────────────────

/// A user override routing a capability name to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Capability name the override applies to.
    pub capability: String,
    /// Command executed instead of any registered handler.
    pub command: String,
    /// Provider this mapping answers for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Target this mapping answers for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// `internal` or `external`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_defaults() {
        let config = FlowlineConfig::from_toml("").unwrap();
        assert!(config.workspace.is_none());
        assert!(config.mappings.is_empty());

        let triggers = config.triggers();
        assert!(triggers.enabled);
        assert_eq!(triggers.webhook_port, DEFAULT_WEBHOOK_PORT);
        assert_eq!(triggers.max_chain_depth, 4);
        assert_eq!(triggers.default_cooldown_ms, 2500);
        assert_eq!(triggers.webhook_host, "127.0.0.1");
    }

    #[test]
    fn test_parse_full_config() {
        let config = FlowlineConfig::from_toml(
            r#"
[workspace]
root = "/srv/project"
pipelines_dir = "pipelines"

[runner]
dry_run = true

[triggers]
webhook_port = 9000
max_chain_depth = 2

[logging]
level = "debug"
file = false

[[mappings]]
capability = "deploy"
command = "terminal.run"
provider = "ops"

[[mappings]]
capability = "notify"
command = "system.log"
type = "internal"
"#,
        )
        .unwrap();

        let ws = config.workspace();
        assert_eq!(ws.root, Some(PathBuf::from("/srv/project")));
        assert_eq!(
            ws.resolve_pipelines_dir(Path::new("/srv/project")),
            PathBuf::from("/srv/project/pipelines")
        );
        assert!(config.runner().dry_run);

        let triggers = config.triggers();
        assert_eq!(triggers.webhook_port, 9000);
        assert_eq!(triggers.max_chain_depth, 2);
        // Unspecified fields keep their defaults
        assert_eq!(triggers.default_debounce_ms, DEFAULT_DEBOUNCE_MS);

        assert_eq!(config.logging().level, "debug");
        assert_eq!(config.mappings.len(), 2);
        assert_eq!(config.mappings[0].provider.as_deref(), Some("ops"));
        assert_eq!(config.mappings[1].kind.as_deref(), Some("internal"));
    }

    #[test]
    fn test_merge_overrides_sections_and_appends_mappings() {
        let mut base = FlowlineConfig::from_toml(
            r#"
[triggers]
webhook_port = 8000

[[mappings]]
capability = "a"
command = "cmd.a"
"#,
        )
        .unwrap();
        let overlay = FlowlineConfig::from_toml(
            r#"
[triggers]
webhook_port = 9000

[[mappings]]
capability = "b"
command = "cmd.b"
"#,
        )
        .unwrap();

        base.merge(overlay);
        assert_eq!(base.triggers().webhook_port, 9000);
        assert_eq!(base.mappings.len(), 2);
        assert_eq!(base.mappings[1].capability, "b");
    }

    #[test]
    fn test_merge_keeps_sections_missing_from_overlay() {
        let mut base = FlowlineConfig::from_toml("[runner]\ndry_run = true\n").unwrap();
        base.merge(FlowlineConfig::new());
        assert!(base.runner().dry_run);
    }

    #[test]
    fn test_invalid_mapping_rejected() {
        let err = FlowlineConfig::from_toml(
            r#"
[[mappings]]
capability = ""
command = "x"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, crate::ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_empty_secret_header_rejected() {
        let err = FlowlineConfig::from_toml("[triggers]\nwebhook_secret_header = \" \"\n")
            .unwrap_err();
        assert!(err.to_string().contains("webhook_secret_header"));
    }

    #[test]
    fn test_workspace_root_resolution() {
        let ws = WorkspaceConfig {
            root: Some(PathBuf::from("sub")),
            ..Default::default()
        };
        assert_eq!(ws.resolve_root(Path::new("/base")), PathBuf::from("/base/sub"));
        assert_eq!(
            WorkspaceConfig::default().resolve_root(Path::new("/base")),
            PathBuf::from("/base")
        );
    }

    #[test]
    fn test_roundtrip_toml() {
        let mut config = FlowlineConfig::new();
        config.triggers = Some(TriggersConfig {
            webhook_port: 1234,
            ..Default::default()
        });
        let text = config.to_toml().unwrap();
        let parsed = FlowlineConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.triggers().webhook_port, 1234);
    }
}
