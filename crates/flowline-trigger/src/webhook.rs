//! Shared webhook listener.
//!
//! One HTTP listener serves every webhook trigger. Routing is by exact path
//! through a table the manager rewrites on refresh; the axum router itself is
//! a single fallback handler and never changes.
//!
//! | outcome | status |
//! |---|---|
//! | at least one trigger fired | `202` |
//! | no trigger for the path | `404` |
//! | path known, method not | `405` |
//! | every candidate still cooling down | `429` |
//! | secret mismatch | `401` |

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use parking_lot::RwLock;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::definition::TriggerSpec;
use crate::error::{Result, TriggerError};
use crate::registration::TriggerRegistration;

/// Path → webhook registrations bound to it.
pub type RouteTable = Arc<RwLock<HashMap<String, Vec<Arc<TriggerRegistration>>>>>;

/// Starts an invocation for a registration that passed its checks.
pub type FireFn = Arc<dyn Fn(Arc<TriggerRegistration>, Value) + Send + Sync>;

/// Handler state.
#[derive(Clone)]
pub struct WebhookState {
    routes: RouteTable,
    secret_header: HeaderName,
    fire: FireFn,
}

impl WebhookState {
    pub fn new(routes: RouteTable, secret_header: HeaderName, fire: FireFn) -> Self {
        Self {
            routes,
            secret_header,
            fire,
        }
    }
}

/// Build the webhook router.
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .fallback(handle_webhook)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn reply(status: StatusCode, label: &str, fired: usize) -> Response {
    (status, Json(json!({ "status": label, "fired": fired }))).into_response()
}

async fn handle_webhook(
    State(state): State<WebhookState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path();
    let candidates = state.routes.read().get(path).cloned().unwrap_or_default();
    if candidates.is_empty() {
        return reply(StatusCode::NOT_FOUND, "not_found", 0);
    }

    let matching: Vec<Arc<TriggerRegistration>> = candidates
        .into_iter()
        .filter(|reg| match reg.definition().spec {
            TriggerSpec::Webhook(ref hook) => hook.method == method,
            _ => false,
        })
        .collect();
    if matching.is_empty() {
        debug!(path, %method, "webhook method not allowed");
        return reply(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", 0);
    }

    let provided = headers
        .get(&state.secret_header)
        .and_then(|v| v.to_str().ok());
    let event = json!({
        "source": "webhook",
        "path": path,
        "method": method.as_str(),
        "query": uri.query(),
        "body": parse_body(&body),
    });

    let mut fired = 0;
    let mut cooling = 0;
    for reg in matching {
        let TriggerSpec::Webhook(ref hook) = reg.definition().spec else {
            continue;
        };
        if let Some(ref expected) = hook.secret
            && !secret_matches(expected, provided)
        {
            warn!(trigger = %reg.id(), path, "webhook secret mismatch");
            continue;
        }
        if reg.is_disposed() {
            continue;
        }
        if !reg.cooldown().try_acquire() {
            debug!(trigger = %reg.id(), "webhook in cooldown");
            cooling += 1;
            continue;
        }
        (state.fire)(Arc::clone(&reg), event.clone());
        fired += 1;
    }

    if fired > 0 {
        reply(StatusCode::ACCEPTED, "accepted", fired)
    } else if cooling > 0 {
        reply(StatusCode::TOO_MANY_REQUESTS, "cooldown", 0)
    } else {
        reply(StatusCode::UNAUTHORIZED, "unauthorized", 0)
    }
}

/// JSON body if it parses, else the raw text; empty bodies are `null`.
fn parse_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Constant-time secret comparison.
fn secret_matches(expected: &str, provided: Option<&str>) -> bool {
    let Some(provided) = provided else {
        return false;
    };
    let a = expected.as_bytes();
    let b = provided.as_bytes();
    if a.len() != b.len() {
        let _ = a.ct_eq(a);
        return false;
    }
    a.ct_eq(b).into()
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener
// ─────────────────────────────────────────────────────────────────────────────

/// A bound, running webhook listener.
pub struct WebhookServer {
    addr: SocketAddr,
    requested_port: u16,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl WebhookServer {
    /// Bind `host:port` and start serving. Port `0` picks an ephemeral port.
    pub async fn bind(host: &str, port: u16, router: Router) -> Result<Self> {
        let bind_err = |source| TriggerError::Bind {
            addr: format!("{}:{}", host, port),
            source,
        };
        let listener = TcpListener::bind((host, port)).await.map_err(bind_err)?;
        let addr = listener.local_addr().map_err(bind_err)?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(%addr, error = %e, "webhook listener failed");
            }
        });

        info!(%addr, "webhook listener started");
        Ok(Self {
            addr,
            requested_port: port,
            shutdown,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Port the listener was asked for (may be `0`).
    pub fn requested_port(&self) -> u16 {
        self.requested_port
    }

    /// Ask the listener to stop without waiting for it.
    pub fn signal_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Close the socket, giving in-flight requests a moment to finish.
    pub async fn stop(self) {
        let Self {
            addr,
            shutdown,
            mut task,
            ..
        } = self;
        shutdown.cancel();
        if tokio::time::timeout(Duration::from_secs(2), &mut task)
            .await
            .is_err()
        {
            task.abort();
        }
        info!(%addr, "webhook listener stopped");
    }
}
