//! Runtime trigger manager.
//!
//! Keeps timers, file watches and webhook routes in sync with the pipeline
//! documents on disk, and invokes pipelines when they fire.
//!
//! # Refresh
//!
//! [`TriggerManager::refresh`] disposes every registration, rescans the
//! trigger root and rebuilds everything, including the decision to start,
//! stop or rebind the webhook listener. Refreshes never overlap: one
//! requested while another is in flight sets a flag, and exactly one
//! follow-up refresh runs when the current one finishes.
//!
//! # Chaining
//!
//! After a successful trigger invocation, a trigger declaring
//! `onSuccessPipeline` starts that pipeline as a fresh run. The chained
//! pipeline's own first `onSuccessPipeline` continues the chain, with
//! `trigger_chain_depth` incremented, until `max_chain_depth` is reached.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::Router;
use axum::http::HeaderName;
use chrono::Utc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use flowline_config::{DEFAULT_SECRET_HEADER, FlowlineConfig};
use flowline_pipeline::{PipelineFile, StartPoint, VariableStore, value_to_string};

use crate::definition::{
    ChangeKind, TriggerDefaults, TriggerDefinition, TriggerKind, TriggerSpec, chain_target,
    scan_document,
};
use crate::error::Result;
use crate::invoker::{InvocationRequest, PipelineInvoker};
use crate::registration::{TriggerInfo, TriggerRegistration};
use crate::webhook::{self, FireFn, RouteTable, WebhookServer, WebhookState};

/// Trigger manager settings.
#[derive(Debug, Clone)]
pub struct TriggerSettings {
    /// Base for relative `onSuccessPipeline` references and watch globs.
    pub workspace_root: PathBuf,
    /// Directory scanned for `*.intent.json` documents.
    pub trigger_root: PathBuf,
    pub enabled: bool,
    pub webhook_host: String,
    /// `0` binds an ephemeral port.
    pub webhook_port: u16,
    pub secret_header: String,
    pub max_chain_depth: u32,
    pub defaults: TriggerDefaults,
    /// Quiet period before a document change triggers a refresh.
    pub refresh_debounce: Duration,
}

impl TriggerSettings {
    /// Defaults for a workspace, scanning `<root>/.flowline`.
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self::from_config(&FlowlineConfig::default(), &workspace_root.into())
    }

    /// Settings from a loaded config; `base` anchors a relative workspace root.
    pub fn from_config(config: &FlowlineConfig, base: &Path) -> Self {
        let workspace = config.workspace();
        let triggers = config.triggers();
        let root = workspace.resolve_root(base);
        Self {
            trigger_root: workspace.resolve_pipelines_dir(&root),
            workspace_root: root,
            enabled: triggers.enabled,
            webhook_host: triggers.webhook_host,
            webhook_port: triggers.webhook_port,
            secret_header: triggers.webhook_secret_header,
            max_chain_depth: triggers.max_chain_depth,
            defaults: TriggerDefaults {
                cooldown: Duration::from_millis(triggers.default_cooldown_ms),
                debounce: Duration::from_millis(triggers.default_debounce_ms),
            },
            refresh_debounce: Duration::from_millis(triggers.refresh_debounce_ms),
        }
    }

    pub fn with_trigger_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.trigger_root = root.into();
        self
    }

    pub fn with_webhook_port(mut self, port: u16) -> Self {
        self.webhook_port = port;
        self
    }
}

/// Every pipeline document under `root`, sorted.
pub fn discover_pipelines(root: &Path) -> Vec<PathBuf> {
    let Some(root_str) = root.to_str() else {
        warn!(path = %root.display(), "trigger root is not valid UTF-8");
        return Vec::new();
    };
    let pattern = format!(
        "{}/**/*{}",
        glob::Pattern::escape(root_str.trim_end_matches('/')),
        flowline_pipeline::PIPELINE_FILE_SUFFIX
    );
    let entries = match glob::glob(&pattern) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "invalid discovery pattern");
            return Vec::new();
        }
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(|entry| entry.ok()).collect();
    paths.sort();
    paths
}

/// Runtime variables for a trigger invocation.
///
/// Top-level primitive event fields become `trigger_<field>`; the whole event
/// is kept as JSON in `trigger_event`.
pub fn event_variables(kind: TriggerKind, step_id: Option<&str>, event: &Value) -> VariableStore {
    let mut vars = VariableStore::new();
    if let Value::Object(fields) = event {
        for (name, value) in fields {
            if matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
                vars.set(format!("trigger_{}", name), value_to_string(value));
            }
        }
    }
    vars.set("trigger_source", kind.as_str());
    vars.set("trigger_step_id", step_id.unwrap_or_default());
    vars.set("trigger_event", event.to_string());
    vars
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RefreshState {
    running: bool,
    pending: bool,
}

/// Clears the refresh flags if a pass unwinds, so later refreshes still run.
struct RefreshGuard<'a>(&'a Mutex<RefreshState>);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            *self.0.lock() = RefreshState::default();
        }
    }
}

/// Keeps the notify watcher alive; drop to stop watching.
struct FsWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Inner {
    settings: TriggerSettings,
    port: Mutex<u16>,
    invoker: Arc<dyn PipelineInvoker>,
    registrations: RwLock<Vec<Arc<TriggerRegistration>>>,
    routes: RouteTable,
    server: Mutex<Option<WebhookServer>>,
    refresh: Mutex<RefreshState>,
    refresh_timer: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<FsWatcher>>,
    stopped: AtomicBool,
}

/// Schedules pipeline invocations from cron, watch and webhook triggers.
pub struct TriggerManager {
    inner: Arc<Inner>,
}

impl TriggerManager {
    pub fn new(settings: TriggerSettings, invoker: Arc<dyn PipelineInvoker>) -> Self {
        Self {
            inner: Arc::new(Inner {
                port: Mutex::new(settings.webhook_port),
                settings,
                invoker,
                registrations: RwLock::new(Vec::new()),
                routes: Arc::new(RwLock::new(HashMap::new())),
                server: Mutex::new(None),
                refresh: Mutex::new(RefreshState::default()),
                refresh_timer: Mutex::new(None),
                watcher: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn settings(&self) -> &TriggerSettings {
        &self.inner.settings
    }

    /// Initial refresh, then watch the workspace for changes.
    pub async fn start(&self) -> Result<()> {
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.inner.refresh().await;
        if self.inner.settings.enabled {
            self.inner.start_watcher()?;
        }
        Ok(())
    }

    /// Rebuild every registration from the documents on disk.
    ///
    /// Returns immediately if a refresh is already running; that refresh is
    /// followed by exactly one more.
    pub async fn refresh(&self) {
        self.inner.refresh().await;
    }

    /// Current registrations.
    pub fn registrations(&self) -> Vec<TriggerInfo> {
        self.inner
            .registrations
            .read()
            .iter()
            .map(|r| r.info())
            .collect()
    }

    /// Address of the webhook listener, if one is bound.
    pub fn webhook_addr(&self) -> Option<SocketAddr> {
        self.inner.server.lock().as_ref().map(|s| s.addr())
    }

    /// Change the webhook port. Takes effect on the next refresh.
    pub fn set_webhook_port(&self, port: u16) {
        *self.inner.port.lock() = port;
    }

    /// The webhook router, sharing this manager's route table.
    pub fn router(&self) -> Router {
        self.inner.router()
    }

    /// Feed a file-system change, as the watcher does.
    pub fn notify_change(&self, path: &Path, kind: ChangeKind) {
        self.inner.handle_change(path, kind);
    }

    /// Fire a registration by id, subject to its cooldown.
    ///
    /// Returns the invocation task, or `None` if the id is unknown or the
    /// trigger is cooling down.
    pub fn fire(&self, id: &str, event: Value) -> Option<JoinHandle<()>> {
        let reg = self
            .inner
            .registrations
            .read()
            .iter()
            .find(|r| r.id() == id)
            .cloned()?;
        self.inner.fire_checked(&reg, event)
    }

    /// Dispose every registration, stop the listener and the watcher.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

impl Inner {
    // ── refresh ─────────────────────────────────────────────────────────────

    async fn refresh(self: &Arc<Self>) {
        if !self.begin_refresh() {
            debug!("refresh already running, deferring");
            return;
        }
        let _guard = RefreshGuard(&self.refresh);
        loop {
            self.refresh_once().await;
            if !self.end_refresh() {
                break;
            }
            debug!("running deferred refresh");
        }
    }

    fn begin_refresh(&self) -> bool {
        let mut state = self.refresh.lock();
        if state.running {
            state.pending = true;
            return false;
        }
        state.running = true;
        true
    }

    /// Finish a refresh pass; `true` if another was requested meanwhile.
    fn end_refresh(&self) -> bool {
        let mut state = self.refresh.lock();
        if state.pending {
            state.pending = false;
            return true;
        }
        state.running = false;
        false
    }

    async fn refresh_once(self: &Arc<Self>) {
        let old = std::mem::take(&mut *self.registrations.write());
        for reg in &old {
            reg.dispose();
        }
        self.routes.write().clear();
        drop(old);

        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut fresh = Vec::new();
        if self.settings.enabled {
            for path in discover_pipelines(&self.settings.trigger_root) {
                let pipeline = match PipelineFile::from_file(&path) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable pipeline");
                        continue;
                    }
                };
                let (found, rejected) = scan_document(&path, &pipeline, &self.settings.defaults);
                for message in rejected {
                    warn!(path = %path.display(), error = %message, "trigger not registered");
                }
                fresh.extend(
                    found
                        .into_iter()
                        .map(|def| Arc::new(TriggerRegistration::new(def))),
                );
            }
        }

        {
            let mut routes = self.routes.write();
            for reg in &fresh {
                if let TriggerSpec::Webhook(ref hook) = reg.definition().spec {
                    routes
                        .entry(hook.path.clone())
                        .or_default()
                        .push(Arc::clone(reg));
                }
            }
        }
        for reg in &fresh {
            if let TriggerSpec::Cron(ref cron) = reg.definition().spec {
                self.start_timer(reg, cron.interval);
            }
        }

        let count = fresh.len();
        *self.registrations.write() = fresh;
        let needs_listener = !self.routes.read().is_empty();
        self.sync_listener(needs_listener).await;

        info!(count, root = %self.settings.trigger_root.display(), "triggers refreshed");
    }

    /// Start, stop or rebind the webhook listener.
    async fn sync_listener(self: &Arc<Self>, needed: bool) {
        let port = *self.port.lock();
        let existing = self.server.lock().take();
        match (needed, existing) {
            (false, None) => {}
            (false, Some(server)) => server.stop().await,
            (true, Some(server)) if server.requested_port() == port => {
                *self.server.lock() = Some(server);
            }
            (true, existing) => {
                if let Some(server) = existing {
                    info!(port, "rebinding webhook listener");
                    server.stop().await;
                }
                match WebhookServer::bind(&self.settings.webhook_host, port, self.router()).await {
                    Ok(server) => *self.server.lock() = Some(server),
                    Err(e) => warn!(error = %e, "webhook listener unavailable"),
                }
            }
        }
    }

    fn router(self: &Arc<Self>) -> Router {
        let weak = Arc::downgrade(self);
        let fire: FireFn = Arc::new(move |reg: Arc<TriggerRegistration>, event: Value| {
            if let Some(inner) = weak.upgrade() {
                inner.spawn_invocation(reg.definition().clone(), event);
            }
        });
        let header = HeaderName::from_bytes(self.settings.secret_header.to_ascii_lowercase().as_bytes())
            .unwrap_or_else(|_| {
                warn!(header = %self.settings.secret_header, "invalid secret header name");
                HeaderName::from_static(DEFAULT_SECRET_HEADER)
            });
        webhook::router(WebhookState::new(Arc::clone(&self.routes), header, fire))
    }

    // ── timers and watches ──────────────────────────────────────────────────

    fn start_timer(self: &Arc<Self>, reg: &Arc<TriggerRegistration>, interval: Duration) {
        let inner = Arc::downgrade(self);
        let weak_reg = Arc::downgrade(reg);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let (Some(inner), Some(reg)) = (inner.upgrade(), weak_reg.upgrade()) else {
                    break;
                };
                let event = json!({
                    "source": "cron",
                    "intervalMs": interval.as_millis() as u64,
                    "timestamp": Utc::now().to_rfc3339(),
                });
                inner.fire_checked(&reg, event);
            }
        });
        reg.set_timer(task);
    }

    fn start_watcher(self: &Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!(error = %e, "file watcher error"),
            }
        })?;

        let root = &self.settings.workspace_root;
        watcher.watch(root, RecursiveMode::Recursive)?;
        let trigger_root = &self.settings.trigger_root;
        if !trigger_root.starts_with(root) && trigger_root.is_dir() {
            watcher.watch(trigger_root, RecursiveMode::Recursive)?;
        }

        let weak: Weak<Inner> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let Some(kind) = ChangeKind::from_event_kind(&event.kind) else {
                    continue;
                };
                for path in &event.paths {
                    inner.handle_change(path, kind);
                }
            }
        });

        info!(root = %root.display(), "watching workspace");
        *self.watcher.lock() = Some(FsWatcher {
            _watcher: watcher,
            task,
        });
        Ok(())
    }

    fn handle_change(self: &Arc<Self>, path: &Path, kind: ChangeKind) {
        if PipelineFile::is_pipeline_path(path) && path.starts_with(&self.settings.trigger_root) {
            debug!(path = %path.display(), "pipeline document changed");
            self.schedule_refresh();
        }

        let root = &self.settings.workspace_root;
        let watches: Vec<Arc<TriggerRegistration>> = self
            .registrations
            .read()
            .iter()
            .filter(|reg| match reg.definition().spec {
                TriggerSpec::Watch(ref watch) => watch.matches(path, kind, root),
                _ => false,
            })
            .cloned()
            .collect();

        for reg in watches {
            let pattern = match reg.definition().spec {
                TriggerSpec::Watch(ref watch) => watch.pattern.as_str().to_string(),
                _ => String::new(),
            };
            let event = json!({
                "source": "watch",
                "path": path.display().to_string(),
                "kind": kind.as_str(),
                "pattern": pattern,
            });
            let inner = Arc::downgrade(self);
            let weak_reg = Arc::downgrade(&reg);
            reg.debounce()
                .schedule((path.to_path_buf(), kind), async move {
                    if let (Some(inner), Some(reg)) = (inner.upgrade(), weak_reg.upgrade()) {
                        inner.fire_checked(&reg, event);
                    }
                });
        }
    }

    fn schedule_refresh(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.settings.refresh_debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                // Detached: a later reschedule must not abort a running refresh
                tokio::spawn(async move { inner.refresh().await });
            }
        });
        if let Some(previous) = self.refresh_timer.lock().replace(task) {
            previous.abort();
        }
    }

    // ── firing ──────────────────────────────────────────────────────────────

    fn fire_checked(
        self: &Arc<Self>,
        reg: &Arc<TriggerRegistration>,
        event: Value,
    ) -> Option<JoinHandle<()>> {
        if reg.is_disposed() {
            return None;
        }
        if !reg.cooldown().try_acquire() {
            debug!(trigger = %reg.id(), "trigger in cooldown");
            return None;
        }
        Some(self.spawn_invocation(reg.definition().clone(), event))
    }

    fn spawn_invocation(self: &Arc<Self>, definition: TriggerDefinition, event: Value) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.invoke_and_chain(definition, event).await })
    }

    async fn invoke_and_chain(&self, definition: TriggerDefinition, event: Value) {
        let trigger = definition.id();
        let mut variables = event_variables(definition.kind(), definition.step_id.as_deref(), &event);
        info!(trigger = %trigger, pipeline = %definition.pipeline.display(), "trigger fired");

        let request = InvocationRequest {
            pipeline: definition.pipeline.clone(),
            start: definition.start(),
            variables: variables.clone(),
        };
        match self.invoker.invoke(request).await {
            Ok(outcome) if outcome.is_success() => {}
            Ok(outcome) => {
                info!(trigger = %trigger, status = %outcome.status, "triggered run did not succeed");
                return;
            }
            Err(e) => {
                warn!(trigger = %trigger, error = %e, "triggered run failed to start");
                return;
            }
        }

        let Some(mut target) = definition.on_success_pipeline.clone() else {
            return;
        };
        let mut from = definition.pipeline.clone();
        let mut depth: u32 = 1;

        loop {
            if depth > self.settings.max_chain_depth {
                warn!(
                    trigger = %trigger,
                    max = self.settings.max_chain_depth,
                    "chain depth limit reached"
                );
                break;
            }

            let next = self.resolve_pipeline_ref(&target);
            variables.set("trigger_chain_from", from.display().to_string());
            variables.set("trigger_chain_depth", depth.to_string());
            info!(trigger = %trigger, pipeline = %next.display(), depth, "chaining pipeline");

            let request = InvocationRequest {
                pipeline: next.clone(),
                start: StartPoint::Beginning,
                variables: variables.clone(),
            };
            match self.invoker.invoke(request).await {
                Ok(outcome) if outcome.is_success() => {}
                Ok(_) => break,
                Err(e) => {
                    warn!(pipeline = %next.display(), error = %e, "chained run failed to start");
                    break;
                }
            }

            let follow = match PipelineFile::from_file(&next) {
                Ok(pipeline) => chain_target(&pipeline),
                Err(e) => {
                    warn!(pipeline = %next.display(), error = %e, "cannot read chained pipeline");
                    None
                }
            };
            let Some(follow) = follow else {
                break;
            };
            from = next;
            target = follow;
            depth += 1;
        }
    }

    fn resolve_pipeline_ref(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.settings.workspace_root.join(path)
        }
    }

    // ── shutdown ────────────────────────────────────────────────────────────

    async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(timer) = self.refresh_timer.lock().take() {
            timer.abort();
        }
        drop(self.watcher.lock().take());

        let old = std::mem::take(&mut *self.registrations.write());
        for reg in &old {
            reg.dispose();
        }
        self.routes.write().clear();
        drop(old);

        let server = self.server.lock().take();
        if let Some(server) = server {
            server.stop().await;
        }
        info!("trigger manager stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.refresh_timer.get_mut().take() {
            timer.abort();
        }
        if let Some(server) = self.server.get_mut().take() {
            server.signal_shutdown();
        }
    }
}
