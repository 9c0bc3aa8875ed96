//! Trigger definitions parsed from `system.trigger.*` steps.
//!
//! # Payload contract
//!
//! ```json
//! { "id": "nightly", "intent": "system.trigger.cron",
//!   "payload": { "cron": "0 */2 * * *", "cooldownMs": 1000, "onSuccessPipeline": "deploy.intent.json" } }
//! { "id": "on-save", "intent": "system.trigger.watch",
//!   "payload": { "glob": "src/**/*.rs", "events": ["create", "change"], "debounceMs": 250 } }
//! { "id": "hook", "intent": "system.trigger.webhook",
//!   "payload": { "path": "/build", "method": "POST", "secret": "s3cret" } }
//! ```
//!
//! Every kind also accepts `enabled` (default `true`) and `cooldownMs`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::http::Method;
use glob::{MatchOptions, Pattern};
use serde::Serialize;
use serde_json::Value;

use flowline_pipeline::{Intent, PipelineFile, StartPoint, TRIGGER_PREFIX};

use crate::error::{Result, TriggerError};

/// Kind of trigger, from the `system.trigger.<kind>` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Cron,
    Watch,
    Webhook,
}

impl TriggerKind {
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "cron" => Some(TriggerKind::Cron),
            "watch" => Some(TriggerKind::Watch),
            "webhook" => Some(TriggerKind::Webhook),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Cron => "cron",
            TriggerKind::Watch => "watch",
            TriggerKind::Webhook => "webhook",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File-system change kinds a watch trigger can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Change,
    Delete,
}

impl ChangeKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Some(ChangeKind::Create),
            "change" => Some(ChangeKind::Change),
            "delete" => Some(ChangeKind::Delete),
            _ => None,
        }
    }

    /// Map a raw notify event kind. Access and unclassified events map to nothing.
    pub fn from_event_kind(kind: &notify::EventKind) -> Option<Self> {
        use notify::EventKind;
        match kind {
            EventKind::Create(_) => Some(ChangeKind::Create),
            EventKind::Modify(_) => Some(ChangeKind::Change),
            EventKind::Remove(_) => Some(ChangeKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Change => "change",
            ChangeKind::Delete => "delete",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Specs
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed-interval timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    pub interval: Duration,
}

/// Glob-filtered file watch.
#[derive(Debug, Clone)]
pub struct WatchSpec {
    pub pattern: Pattern,
    pub events: Vec<ChangeKind>,
    pub debounce: Duration,
}

impl WatchSpec {
    /// Whether a change at `path` is relevant.
    ///
    /// Relative patterns match against the path relative to `root`; absolute
    /// patterns match the full path.
    pub fn matches(&self, path: &Path, kind: ChangeKind, root: &Path) -> bool {
        if !self.events.contains(&kind) {
            return false;
        }
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        if Path::new(self.pattern.as_str()).is_absolute() {
            return self.pattern.matches_path_with(path, options);
        }
        match path.strip_prefix(root) {
            Ok(relative) => self.pattern.matches_path_with(relative, options),
            Err(_) => false,
        }
    }
}

/// HTTP route on the shared webhook listener.
#[derive(Debug, Clone)]
pub struct WebhookSpec {
    pub path: String,
    pub method: Method,
    pub secret: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TriggerSpec {
    Cron(CronSpec),
    Watch(WatchSpec),
    Webhook(WebhookSpec),
}

impl TriggerSpec {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerSpec::Cron(_) => TriggerKind::Cron,
            TriggerSpec::Watch(_) => TriggerKind::Watch,
            TriggerSpec::Webhook(_) => TriggerKind::Webhook,
        }
    }

    /// One-line summary for listings.
    pub fn describe(&self) -> String {
        match self {
            TriggerSpec::Cron(c) => format!("every {}", format_interval(c.interval)),
            TriggerSpec::Watch(w) => {
                let events: Vec<&str> = w.events.iter().map(|e| e.as_str()).collect();
                format!("{} [{}]", w.pattern.as_str(), events.join(","))
            }
            TriggerSpec::Webhook(h) => format!("{} {}", h.method, h.path),
        }
    }
}

fn format_interval(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else {
        format!("{}ms", ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Definition
// ─────────────────────────────────────────────────────────────────────────────

/// Defaults applied when a trigger payload leaves a field unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerDefaults {
    /// Cooldown for cron and watch triggers. Webhooks default to none.
    pub cooldown: Duration,
    pub debounce: Duration,
}

impl Default for TriggerDefaults {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(flowline_config::DEFAULT_COOLDOWN_MS),
            debounce: Duration::from_millis(flowline_config::DEFAULT_DEBOUNCE_MS),
        }
    }
}

/// A trigger declared by one pipeline step.
#[derive(Debug, Clone)]
pub struct TriggerDefinition {
    /// Document declaring the trigger.
    pub pipeline: PathBuf,
    pub step_index: usize,
    pub step_id: Option<String>,
    pub spec: TriggerSpec,
    pub cooldown: Duration,
    /// Pipeline to run after a successful invocation.
    pub on_success_pipeline: Option<String>,
}

impl TriggerDefinition {
    /// Parse a step into a trigger definition.
    ///
    /// `Ok(None)` for steps that aren't triggers or are disabled.
    pub fn from_step(
        pipeline: &Path,
        step_index: usize,
        step: &Intent,
        defaults: &TriggerDefaults,
    ) -> Result<Option<Self>> {
        let Some(suffix) = step.intent.strip_prefix(TRIGGER_PREFIX) else {
            return Ok(None);
        };
        if !is_enabled(step) {
            return Ok(None);
        }

        let label = step.label().to_string();
        let kind = TriggerKind::from_suffix(suffix)
            .ok_or_else(|| TriggerError::invalid(suffix, &label, "unknown trigger kind"))?;
        let payload = &step.payload;

        let spec = match kind {
            TriggerKind::Cron => {
                let interval = parse_cron_interval(payload).ok_or_else(|| {
                    TriggerError::invalid("cron", &label, "missing or unsupported schedule")
                })?;
                TriggerSpec::Cron(CronSpec { interval })
            }
            TriggerKind::Watch => TriggerSpec::Watch(parse_watch(payload, &label, defaults)?),
            TriggerKind::Webhook => TriggerSpec::Webhook(parse_webhook(payload, &label)?),
        };

        let default_cooldown = match kind {
            TriggerKind::Webhook => Duration::ZERO,
            _ => defaults.cooldown,
        };
        let cooldown = millis(payload, "cooldownMs").unwrap_or(default_cooldown);

        Ok(Some(Self {
            pipeline: pipeline.to_path_buf(),
            step_index,
            step_id: step.id.clone(),
            spec,
            cooldown,
            on_success_pipeline: on_success_pipeline(step),
        }))
    }

    pub fn kind(&self) -> TriggerKind {
        self.spec.kind()
    }

    /// Stable identifier: document file name plus step id (or index).
    pub fn id(&self) -> String {
        let file = self
            .pipeline
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match self.step_id {
            Some(ref id) => format!("{}#{}", file, id),
            None => format!("{}#{}", file, self.step_index),
        }
    }

    /// Where an invocation of this trigger starts.
    pub fn start(&self) -> StartPoint {
        match self.step_id {
            Some(ref id) => StartPoint::StepId(id.clone()),
            None => StartPoint::Index(self.step_index),
        }
    }
}

/// Every trigger a document declares, plus a message per rejected step.
pub fn scan_document(
    path: &Path,
    pipeline: &PipelineFile,
    defaults: &TriggerDefaults,
) -> (Vec<TriggerDefinition>, Vec<String>) {
    let mut found = Vec::new();
    let mut rejected = Vec::new();
    for (i, step) in pipeline.steps.iter().enumerate() {
        match TriggerDefinition::from_step(path, i, step, defaults) {
            Ok(Some(def)) => found.push(def),
            Ok(None) => {}
            Err(e) => rejected.push(e.to_string()),
        }
    }
    (found, rejected)
}

/// `onSuccessPipeline` of the first enabled trigger step declaring one.
pub fn chain_target(pipeline: &PipelineFile) -> Option<String> {
    pipeline
        .steps
        .iter()
        .filter(|s| s.intent.starts_with(TRIGGER_PREFIX) && is_enabled(s))
        .find_map(on_success_pipeline)
}

fn is_enabled(step: &Intent) -> bool {
    step.payload.get("enabled").and_then(Value::as_bool) != Some(false)
}

fn on_success_pipeline(step: &Intent) -> Option<String> {
    step.payload_str("onSuccessPipeline")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Longest interval a cron trigger accepts.
pub const MAX_CRON_INTERVAL: Duration = Duration::from_secs(366 * 24 * 3600);

/// Interval for a cron payload.
///
/// Accepts `intervalMs`, `everyMinutes`, `everyHours`, or a `cron` string of
/// the form `*/N * * * *` (every N minutes) or `0 */N * * *` (every N hours;
/// a six-field variant with a trailing `*` is also accepted). Anything else
/// yields `None`, as does an interval that is zero or longer than
/// [`MAX_CRON_INTERVAL`].
pub fn parse_cron_interval(payload: &Value) -> Option<Duration> {
    if let Some(d) = millis(payload, "intervalMs").and_then(bounded_interval) {
        return Some(d);
    }
    if let Some(d) = positive(payload, "everyMinutes").and_then(|n| secs_f64(n * 60.0)) {
        return Some(d);
    }
    if let Some(d) = positive(payload, "everyHours").and_then(|n| secs_f64(n * 3600.0)) {
        return Some(d);
    }

    let expr = payload.get("cron").and_then(Value::as_str)?;
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let step_of = |field: &str| -> Option<u64> {
        field
            .strip_prefix("*/")
            .and_then(|n| n.parse::<u64>().ok())
            .filter(|n| *n > 0)
    };
    let all_wild = |rest: &[&str]| rest.iter().all(|f| *f == "*");

    match fields.as_slice() {
        [minute, rest @ ..] if rest.len() == 4 && all_wild(rest) => {
            step_of(minute)
                .and_then(|n| n.checked_mul(60))
                .and_then(|secs| bounded_interval(Duration::from_secs(secs)))
        }
        ["0", hour, rest @ ..] if (rest.len() == 3 || rest.len() == 4) && all_wild(rest) => {
            step_of(hour)
                .and_then(|n| n.checked_mul(3600))
                .and_then(|secs| bounded_interval(Duration::from_secs(secs)))
        }
        _ => None,
    }
}

fn parse_watch(payload: &Value, label: &str, defaults: &TriggerDefaults) -> Result<WatchSpec> {
    let text = payload
        .get("glob")
        .or_else(|| payload.get("pattern"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TriggerError::invalid("watch", label, "missing glob pattern"))?;
    let pattern = Pattern::new(text).map_err(|e| TriggerError::Glob {
        pattern: text.to_string(),
        source: e,
    })?;

    let names: Vec<&str> = match payload.get("events") {
        None | Some(Value::Null) => vec!["change"],
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        Some(_) => {
            return Err(TriggerError::invalid("watch", label, "events must be a list"));
        }
    };
    let mut events = Vec::new();
    for name in names {
        let kind = ChangeKind::parse(name).ok_or_else(|| {
            TriggerError::invalid("watch", label, format!("unknown change kind '{}'", name))
        })?;
        if !events.contains(&kind) {
            events.push(kind);
        }
    }
    if events.is_empty() {
        events.push(ChangeKind::Change);
    }

    Ok(WatchSpec {
        pattern,
        events,
        debounce: millis(payload, "debounceMs").unwrap_or(defaults.debounce),
    })
}

fn parse_webhook(payload: &Value, label: &str) -> Result<WebhookSpec> {
    let raw = payload
        .get("path")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TriggerError::invalid("webhook", label, "missing path"))?;
    if raw.contains(['?', '#']) || raw.chars().any(char::is_whitespace) {
        return Err(TriggerError::invalid(
            "webhook",
            label,
            format!("invalid path '{}'", raw),
        ));
    }
    let path = if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{}", raw)
    };

    let method = match payload.get("method").and_then(Value::as_str) {
        Some(m) => Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).map_err(|_| {
            TriggerError::invalid("webhook", label, format!("invalid method '{}'", m))
        })?,
        None => Method::POST,
    };

    let secret = payload
        .get("secret")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from);

    Ok(WebhookSpec {
        path,
        method,
        secret,
    })
}

fn positive(payload: &Value, field: &str) -> Option<f64> {
    payload
        .get(field)
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite() && *n > 0.0)
}

fn secs_f64(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok().and_then(bounded_interval)
}

fn bounded_interval(d: Duration) -> Option<Duration> {
    (!d.is_zero() && d <= MAX_CRON_INTERVAL).then_some(d)
}

fn millis(payload: &Value, field: &str) -> Option<Duration> {
    payload
        .get(field)
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite() && *n >= 0.0)
        .map(|n| Duration::from_millis(n.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cron(expr: &str) -> Option<Duration> {
        parse_cron_interval(&json!({ "cron": expr }))
    }

    fn define(intent: Intent) -> Result<Option<TriggerDefinition>> {
        TriggerDefinition::from_step(
            Path::new("/w/.flowline/a.intent.json"),
            0,
            &intent,
            &TriggerDefaults::default(),
        )
    }

    #[test]
    fn test_cron_minute_form() {
        assert_eq!(cron("*/5 * * * *"), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_cron_hour_forms() {
        assert_eq!(cron("0 */2 * * * *"), Some(Duration::from_secs(7200)));
        assert_eq!(cron("0 */3 * * *"), Some(Duration::from_secs(3 * 3600)));
    }

    #[test]
    fn test_cron_unsupported_forms() {
        assert_eq!(cron("30 4 * * *"), None);
        assert_eq!(cron("*/0 * * * *"), None);
        assert_eq!(cron("*/5 * * * 1"), None);
        assert_eq!(cron("every day"), None);
        assert_eq!(parse_cron_interval(&json!({})), None);
    }

    #[test]
    fn test_cron_rejects_out_of_range_intervals() {
        assert_eq!(parse_cron_interval(&json!({ "intervalMs": 0 })), None);
        assert_eq!(parse_cron_interval(&json!({ "intervalMs": 0.2 })), None);
        assert_eq!(parse_cron_interval(&json!({ "everyMinutes": 1e300 })), None);
        assert_eq!(parse_cron_interval(&json!({ "everyHours": 1e20 })), None);
        assert_eq!(cron(&format!("*/{} * * * *", u64::MAX)), None);
        assert_eq!(cron(&format!("0 */{} * * *", u64::MAX / 1000)), None);
        assert_eq!(cron("*/600000 * * * *"), None);
        assert_eq!(
            parse_cron_interval(&json!({ "everyHours": 24 * 366 })),
            Some(MAX_CRON_INTERVAL)
        );
    }

    #[test]
    fn test_zero_interval_falls_back_to_other_fields() {
        assert_eq!(
            parse_cron_interval(&json!({ "intervalMs": 0, "everyMinutes": 2 })),
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_interval_fields() {
        assert_eq!(
            parse_cron_interval(&json!({"intervalMs": 1500})),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            parse_cron_interval(&json!({"everyMinutes": 2})),
            Some(Duration::from_secs(120))
        );
        assert_eq!(
            parse_cron_interval(&json!({"everyHours": 1})),
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_non_trigger_and_disabled_steps() {
        assert!(define(Intent::new("terminal.run")).unwrap().is_none());
        let disabled = Intent::new("system.trigger.cron")
            .with_payload(json!({"everyMinutes": 1, "enabled": false}));
        assert!(define(disabled).unwrap().is_none());
    }

    #[test]
    fn test_unsupported_cron_is_rejected() {
        let step = Intent::new("system.trigger.cron").with_payload(json!({"cron": "30 4 * * *"}));
        assert!(define(step).is_err());
    }

    #[test]
    fn test_cooldown_defaults_by_kind() {
        let cron = define(
            Intent::new("system.trigger.cron")
                .with_id("c")
                .with_payload(json!({"everyMinutes": 1})),
        )
        .unwrap()
        .unwrap();
        assert_eq!(cron.cooldown, Duration::from_millis(2500));
        assert_eq!(cron.id(), "a.intent.json#c");
        assert_eq!(cron.start(), StartPoint::StepId("c".into()));

        let hook = define(Intent::new("system.trigger.webhook").with_payload(json!({"path": "x"})))
            .unwrap()
            .unwrap();
        assert_eq!(hook.cooldown, Duration::ZERO);
        assert_eq!(hook.start(), StartPoint::Index(0));

        let custom = define(
            Intent::new("system.trigger.watch").with_payload(json!({"glob": "*.rs", "cooldownMs": 10})),
        )
        .unwrap()
        .unwrap();
        assert_eq!(custom.cooldown, Duration::from_millis(10));
    }

    #[test]
    fn test_webhook_defaults() {
        let def = define(
            Intent::new("system.trigger.webhook").with_payload(json!({"path": "build", "secret": "s"})),
        )
        .unwrap()
        .unwrap();
        let TriggerSpec::Webhook(hook) = def.spec else {
            panic!("expected webhook");
        };
        assert_eq!(hook.path, "/build");
        assert_eq!(hook.method, Method::POST);
        assert_eq!(hook.secret.as_deref(), Some("s"));
    }

    #[test]
    fn test_webhook_rejects_bad_path() {
        for path in ["", "/a b", "/a?b=1"] {
            let step = Intent::new("system.trigger.webhook").with_payload(json!({ "path": path }));
            assert!(define(step).is_err(), "{path}");
        }
    }

    #[test]
    fn test_watch_matching() {
        let def = define(
            Intent::new("system.trigger.watch")
                .with_payload(json!({"glob": "src/**/*.rs", "events": ["create", "delete"]})),
        )
        .unwrap()
        .unwrap();
        let TriggerSpec::Watch(watch) = def.spec else {
            panic!("expected watch");
        };
        let root = Path::new("/w");
        assert_eq!(watch.debounce, Duration::from_millis(500));
        assert!(watch.matches(Path::new("/w/src/a/b.rs"), ChangeKind::Create, root));
        assert!(!watch.matches(Path::new("/w/src/a/b.rs"), ChangeKind::Change, root));
        assert!(!watch.matches(Path::new("/w/docs/b.rs"), ChangeKind::Create, root));
        assert!(!watch.matches(Path::new("/elsewhere/src/b.rs"), ChangeKind::Create, root));
    }

    #[test]
    fn test_watch_rejects_bad_input() {
        let bad_glob = Intent::new("system.trigger.watch").with_payload(json!({"glob": "a[" }));
        assert!(matches!(define(bad_glob), Err(TriggerError::Glob { .. })));

        let bad_kind =
            Intent::new("system.trigger.watch").with_payload(json!({"glob": "*", "events": ["rename"]}));
        assert!(define(bad_kind).is_err());

        let missing = Intent::new("system.trigger.watch").with_payload(json!({}));
        assert!(define(missing).is_err());
    }

    #[test]
    fn test_scan_document_keeps_going_after_bad_step() {
        let pipeline = PipelineFile::new(
            "p",
            vec![
                Intent::new("system.trigger.cron").with_payload(json!({"cron": "nope"})),
                Intent::new("system.trigger.bogus"),
                Intent::new("system.trigger.webhook").with_payload(json!({"path": "/ok"})),
                Intent::new("terminal.run"),
            ],
        );
        let (found, rejected) =
            scan_document(Path::new("p.intent.json"), &pipeline, &TriggerDefaults::default());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind(), TriggerKind::Webhook);
        assert_eq!(rejected.len(), 2);
    }

    #[test]
    fn test_chain_target_skips_disabled() {
        let pipeline = PipelineFile::new(
            "p",
            vec![
                Intent::new("system.trigger.cron")
                    .with_payload(json!({"enabled": false, "onSuccessPipeline": "x.intent.json"})),
                Intent::new("terminal.run").with_payload(json!({"onSuccessPipeline": "no"})),
                Intent::new("system.trigger.webhook")
                    .with_payload(json!({"path": "/h", "onSuccessPipeline": "b.intent.json"})),
            ],
        );
        assert_eq!(chain_target(&pipeline).as_deref(), Some("b.intent.json"));
    }
}
