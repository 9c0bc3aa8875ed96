//! Integration tests for TriggerManager: registration, firing, cooldown and
//! chaining, with a recording invoker standing in for the runner.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use tower::ServiceExt;

use flowline_pipeline::{RunOutcome, RunStatus, StartPoint};
use flowline_trigger::{
    ChangeKind, InvocationRequest, PipelineInvoker, TriggerKind, TriggerManager, TriggerSettings,
};

#[derive(Default)]
struct RecordingInvoker {
    requests: Mutex<Vec<InvocationRequest>>,
    fail: bool,
}

impl RecordingInvoker {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn count(&self) -> usize {
        self.requests.lock().len()
    }

    fn requests(&self) -> Vec<InvocationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl PipelineInvoker for RecordingInvoker {
    async fn invoke(&self, request: InvocationRequest) -> flowline_trigger::Result<RunOutcome> {
        self.requests.lock().push(request);
        Ok(RunOutcome {
            run_id: "test".into(),
            status: if self.fail {
                RunStatus::Failure
            } else {
                RunStatus::Success
            },
            steps_executed: 1,
        })
    }
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".flowline")).unwrap();
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write a pipeline document into the trigger root.
    fn pipeline(&self, name: &str, steps: serde_json::Value) -> PathBuf {
        let path = self.root().join(".flowline").join(name);
        let doc = json!({ "name": name, "steps": steps });
        std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
        path
    }

    fn settings(&self) -> TriggerSettings {
        TriggerSettings::new(self.root()).with_webhook_port(0)
    }

    fn manager(&self, invoker: Arc<RecordingInvoker>) -> TriggerManager {
        TriggerManager::new(self.settings(), invoker)
    }
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

/// Wait (real time) until the invoker has seen `n` requests.
async fn wait_for(invoker: &RecordingInvoker, n: usize) {
    for _ in 0..200 {
        if invoker.count() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} invocations, saw {}", n, invoker.count());
}

// ─────────────────────────────────────────────────────────────────────────────
// Registration
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_no_triggers_no_listener() {
    let ws = Workspace::new();
    ws.pipeline(
        "plain.intent.json",
        json!([{ "intent": "terminal.run", "payload": { "command": "true" } }]),
    );
    let manager = ws.manager(Arc::default());

    manager.refresh().await;

    assert!(manager.registrations().is_empty());
    assert!(manager.webhook_addr().is_none());
}

#[tokio::test]
async fn test_registers_each_kind_and_skips_invalid() {
    let ws = Workspace::new();
    ws.pipeline(
        "mixed.intent.json",
        json!([
            { "id": "tick", "intent": "system.trigger.cron", "payload": { "cron": "*/5 * * * *" } },
            { "id": "bad", "intent": "system.trigger.cron", "payload": { "cron": "5 4 * * 1" } },
            { "id": "save", "intent": "system.trigger.watch", "payload": { "glob": "src/**/*.rs" } },
            { "id": "off", "intent": "system.trigger.watch", "payload": { "glob": "*", "enabled": false } },
            { "id": "hook", "intent": "system.trigger.webhook", "payload": { "path": "/build" } },
        ]),
    );
    let manager = ws.manager(Arc::default());

    manager.refresh().await;

    let regs = manager.registrations();
    let kinds: Vec<TriggerKind> = regs.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![TriggerKind::Cron, TriggerKind::Watch, TriggerKind::Webhook]
    );
    assert_eq!(regs[0].id, "mixed.intent.json#tick");
    assert_eq!(regs[0].detail, "every 5m");
    assert_eq!(regs[2].cooldown_ms, 0);

    let addr = manager.webhook_addr().expect("listener bound");
    assert_ne!(addr.port(), 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_out_of_range_cron_is_skipped_and_refresh_continues() {
    let ws = Workspace::new();
    ws.pipeline(
        "a.intent.json",
        json!([
            { "id": "zero", "intent": "system.trigger.cron", "payload": { "intervalMs": 0 } },
            { "id": "huge", "intent": "system.trigger.cron", "payload": { "everyMinutes": 1e300 } },
            { "id": "wide", "intent": "system.trigger.cron", "payload": { "cron": "*/18446744073709551615 * * * *" } },
        ]),
    );
    ws.pipeline(
        "b.intent.json",
        json!([{ "id": "hook", "intent": "system.trigger.webhook", "payload": { "path": "/b" } }]),
    );
    let manager = ws.manager(Arc::default());

    manager.refresh().await;

    let regs = manager.registrations();
    assert_eq!(regs.len(), 1);
    assert_eq!(regs[0].id, "b.intent.json#hook");

    ws.pipeline(
        "b.intent.json",
        json!([{ "id": "tick", "intent": "system.trigger.cron", "payload": { "everyMinutes": 5 } }]),
    );
    manager.refresh().await;

    let regs = manager.registrations();
    assert_eq!(regs.len(), 1);
    assert_eq!(regs[0].kind, TriggerKind::Cron);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_disabled_registers_nothing() {
    let ws = Workspace::new();
    ws.pipeline(
        "a.intent.json",
        json!([{ "intent": "system.trigger.webhook", "payload": { "path": "/a" } }]),
    );
    let mut settings = ws.settings();
    settings.enabled = false;
    let manager = TriggerManager::new(settings, Arc::new(RecordingInvoker::default()));

    manager.refresh().await;

    assert!(manager.registrations().is_empty());
    assert!(manager.webhook_addr().is_none());
}

#[tokio::test]
async fn test_refresh_replaces_registrations_and_stops_listener() {
    let ws = Workspace::new();
    let doc = json!([{ "id": "hook", "intent": "system.trigger.webhook", "payload": { "path": "/a" } }]);
    ws.pipeline("a.intent.json", doc);
    let manager = ws.manager(Arc::default());

    manager.refresh().await;
    assert_eq!(manager.registrations().len(), 1);
    assert!(manager.webhook_addr().is_some());

    ws.pipeline(
        "a.intent.json",
        json!([{ "id": "tick", "intent": "system.trigger.cron", "payload": { "everyHours": 1 } }]),
    );
    manager.refresh().await;

    let regs = manager.registrations();
    assert_eq!(regs.len(), 1);
    assert_eq!(regs[0].kind, TriggerKind::Cron);
    assert!(manager.webhook_addr().is_none());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_refreshes_settle() {
    let ws = Workspace::new();
    ws.pipeline(
        "a.intent.json",
        json!([{ "id": "hook", "intent": "system.trigger.webhook", "payload": { "path": "/a" } }]),
    );
    let manager = ws.manager(Arc::default());

    tokio::join!(manager.refresh(), manager.refresh(), manager.refresh());

    assert_eq!(manager.registrations().len(), 1);
    assert!(manager.webhook_addr().is_some());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_port_change_rebinds_listener() {
    let ws = Workspace::new();
    ws.pipeline(
        "a.intent.json",
        json!([{ "id": "hook", "intent": "system.trigger.webhook", "payload": { "path": "/a" } }]),
    );
    let manager = ws.manager(Arc::default());
    manager.refresh().await;
    let first = manager.webhook_addr().unwrap();

    let free = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    manager.set_webhook_port(free);
    manager.refresh().await;

    let second = manager.webhook_addr().unwrap();
    assert_eq!(second.port(), free);
    assert_ne!(first, second);
    manager.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Webhooks
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_webhook_method_routing() {
    let ws = Workspace::new();
    ws.pipeline(
        "hooks.intent.json",
        json!([
            { "id": "post", "intent": "system.trigger.webhook", "payload": { "path": "/build", "method": "POST" } },
            { "id": "put", "intent": "system.trigger.webhook", "payload": { "path": "/build", "method": "PUT" } },
        ]),
    );
    let invoker = Arc::new(RecordingInvoker::default());
    let manager = ws.manager(Arc::clone(&invoker));
    manager.refresh().await;

    let res = manager
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/build?ref=main")
                .body(Body::from(r#"{"sha":"abc"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    wait_for(&invoker, 1).await;
    let req = &invoker.requests()[0];
    assert_eq!(req.start, StartPoint::StepId("post".into()));
    assert_eq!(req.variables.get("trigger_source"), Some("webhook"));
    assert_eq!(req.variables.get("trigger_method"), Some("POST"));
    assert_eq!(req.variables.get("trigger_query"), Some("ref=main"));
    assert!(req.variables.get("trigger_event").unwrap().contains("abc"));

    let res = manager.router().oneshot(request("GET", "/build")).await.unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);

    let res = manager.router().oneshot(request("POST", "/nope")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(invoker.count(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_webhook_secret() {
    let ws = Workspace::new();
    ws.pipeline(
        "hook.intent.json",
        json!([{ "id": "h", "intent": "system.trigger.webhook", "payload": { "path": "/deploy", "secret": "s3cret" } }]),
    );
    let invoker = Arc::new(RecordingInvoker::default());
    let manager = ws.manager(Arc::clone(&invoker));
    manager.refresh().await;

    let res = manager.router().oneshot(request("POST", "/deploy")).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = manager
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/deploy")
                .header("x-flowline-secret", "wrong!")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = manager
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/deploy")
                .header("x-flowline-secret", "s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    wait_for(&invoker, 1).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_webhook_cooldown_returns_429() {
    let ws = Workspace::new();
    ws.pipeline(
        "hook.intent.json",
        json!([{ "id": "h", "intent": "system.trigger.webhook", "payload": { "path": "/h", "cooldownMs": 60000 } }]),
    );
    let invoker = Arc::new(RecordingInvoker::default());
    let manager = ws.manager(Arc::clone(&invoker));
    manager.refresh().await;

    let first = manager.router().oneshot(request("POST", "/h")).await.unwrap();
    let second = manager.router().oneshot(request("POST", "/h")).await.unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

    wait_for(&invoker, 1).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_webhook_over_tcp() {
    let ws = Workspace::new();
    ws.pipeline(
        "hook.intent.json",
        json!([{ "id": "h", "intent": "system.trigger.webhook", "payload": { "path": "/tcp" } }]),
    );
    let invoker = Arc::new(RecordingInvoker::default());
    let manager = ws.manager(Arc::clone(&invoker));
    manager.refresh().await;
    let addr = manager.webhook_addr().unwrap();

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream
        .write_all(b"POST /tcp HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 202"), "{}", response);

    wait_for(&invoker, 1).await;
    manager.shutdown().await;
    assert!(manager.webhook_addr().is_none());
}

// ─────────────────────────────────────────────────────────────────────────────
// Cron and watch
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_cron_fires_on_interval() {
    let ws = Workspace::new();
    ws.pipeline(
        "tick.intent.json",
        json!([
            { "id": "tick", "intent": "system.trigger.cron", "payload": { "everyMinutes": 1 } },
            { "id": "work", "intent": "terminal.run", "payload": { "command": "true" } },
        ]),
    );
    let invoker = Arc::new(RecordingInvoker::default());
    let manager = ws.manager(Arc::clone(&invoker));
    manager.refresh().await;

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(invoker.count(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(invoker.count(), 1);
    let req = &invoker.requests()[0];
    assert_eq!(req.start, StartPoint::StepId("tick".into()));
    assert_eq!(req.variables.get("trigger_source"), Some("cron"));
    assert_eq!(req.variables.get("trigger_step_id"), Some("tick"));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(invoker.count(), 2);

    manager.shutdown().await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(invoker.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_watch_debounce_and_cooldown() {
    let ws = Workspace::new();
    ws.pipeline(
        "save.intent.json",
        json!([{
            "id": "save",
            "intent": "system.trigger.watch",
            "payload": { "glob": "src/**/*.rs", "events": ["change"], "debounceMs": 100 }
        }]),
    );
    let invoker = Arc::new(RecordingInvoker::default());
    let manager = ws.manager(Arc::clone(&invoker));
    manager.refresh().await;
    let file = ws.root().join("src/main.rs");

    // A burst coalesces into one firing
    for _ in 0..3 {
        manager.notify_change(&file, ChangeKind::Change);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(invoker.count(), 1);
    let req = &invoker.requests()[0];
    assert_eq!(req.variables.get("trigger_kind"), Some("change"));
    assert_eq!(
        req.variables.get("trigger_path"),
        Some(file.display().to_string().as_str())
    );

    // Second change lands inside the default 2.5s cooldown
    manager.notify_change(&file, ChangeKind::Change);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(invoker.count(), 1);

    // Unwatched kinds and paths never fire
    tokio::time::sleep(Duration::from_secs(3)).await;
    manager.notify_change(&file, ChangeKind::Delete);
    manager.notify_change(&ws.root().join("README.md"), ChangeKind::Change);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(invoker.count(), 1);

    manager.notify_change(&file, ChangeKind::Change);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(invoker.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_document_change_schedules_refresh() {
    let ws = Workspace::new();
    let invoker = Arc::new(RecordingInvoker::default());
    let manager = ws.manager(Arc::clone(&invoker));
    manager.refresh().await;
    assert!(manager.registrations().is_empty());

    let path = ws.pipeline(
        "new.intent.json",
        json!([{ "id": "tick", "intent": "system.trigger.cron", "payload": { "everyHours": 1 } }]),
    );
    manager.notify_change(&path, ChangeKind::Create);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(manager.registrations().len(), 1);
    manager.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Chaining
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chain_runs_next_pipeline_once() {
    let ws = Workspace::new();
    let a = ws.pipeline(
        "a.intent.json",
        json!([{
            "id": "tick",
            "intent": "system.trigger.cron",
            "payload": { "everyHours": 1, "onSuccessPipeline": ".flowline/b.intent.json" }
        }]),
    );
    let b = ws.pipeline(
        "b.intent.json",
        json!([{ "intent": "terminal.run", "payload": { "command": "true" } }]),
    );
    let invoker = Arc::new(RecordingInvoker::default());
    let manager = ws.manager(Arc::clone(&invoker));
    manager.refresh().await;

    let task = manager
        .fire("a.intent.json#tick", json!({ "source": "manual" }))
        .expect("trigger fires");
    task.await.unwrap();

    let requests = invoker.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].pipeline, a);
    assert_eq!(requests[0].variables.get("trigger_chain_depth"), None);
    assert_eq!(requests[1].pipeline, b);
    assert_eq!(requests[1].start, StartPoint::Beginning);
    assert_eq!(requests[1].variables.get("trigger_chain_depth"), Some("1"));
    assert_eq!(
        requests[1].variables.get("trigger_chain_from"),
        Some(a.display().to_string().as_str())
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn test_chain_cycle_stops_at_max_depth() {
    let ws = Workspace::new();
    for (name, next) in [("a.intent.json", "b.intent.json"), ("b.intent.json", "a.intent.json")] {
        ws.pipeline(
            name,
            json!([{
                "id": "tick",
                "intent": "system.trigger.cron",
                "payload": { "everyHours": 1, "onSuccessPipeline": format!(".flowline/{}", next) }
            }]),
        );
    }
    let invoker = Arc::new(RecordingInvoker::default());
    let manager = ws.manager(Arc::clone(&invoker));
    manager.refresh().await;

    manager
        .fire("a.intent.json#tick", json!({}))
        .unwrap()
        .await
        .unwrap();

    let depths: Vec<Option<String>> = invoker
        .requests()
        .iter()
        .map(|r| r.variables.get("trigger_chain_depth").map(str::to_string))
        .collect();
    assert_eq!(
        depths,
        vec![
            None,
            Some("1".into()),
            Some("2".into()),
            Some("3".into()),
            Some("4".into())
        ]
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_run_does_not_chain() {
    let ws = Workspace::new();
    ws.pipeline(
        "a.intent.json",
        json!([{
            "id": "tick",
            "intent": "system.trigger.cron",
            "payload": { "everyHours": 1, "onSuccessPipeline": ".flowline/b.intent.json" }
        }]),
    );
    ws.pipeline("b.intent.json", json!([]));
    let invoker = Arc::new(RecordingInvoker::failing());
    let manager = ws.manager(Arc::clone(&invoker));
    manager.refresh().await;

    manager
        .fire("a.intent.json#tick", json!({}))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(invoker.count(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_fire_respects_cooldown() {
    let ws = Workspace::new();
    ws.pipeline(
        "a.intent.json",
        json!([{ "id": "tick", "intent": "system.trigger.cron", "payload": { "everyHours": 1 } }]),
    );
    let manager = ws.manager(Arc::default());
    manager.refresh().await;

    assert!(manager.fire("a.intent.json#tick", json!({})).is_some());
    assert!(manager.fire("a.intent.json#tick", json!({})).is_none());
    assert!(manager.fire("missing#x", json!({})).is_none());
    manager.shutdown().await;
}
