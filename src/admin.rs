//! Admin HTTP API — health checks, Prometheus metrics, status.
//!
//! Spawned as a background task when `admin_port` is configured.
//! Endpoints:
//!   GET /health  — 200 OK, for process supervisors
//!   GET /metrics — Prometheus exposition format
//!   GET /status  — JSON snapshot of pipeline, pool and cache state

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::request::AuthContext;

/// Shared state for admin endpoints.
#[derive(Clone)]
pub struct AdminState {
    pub ctx: Arc<AuthContext>,
}

/// Start the admin HTTP server on the given port.
pub async fn serve(state: AdminState, port: u16) {
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .with_state(state);

    let addr = format!("127.0.0.1:{port}");
    match TcpListener::bind(&addr).await {
        Ok(listener) => {
            info!(addr = %addr, "admin API");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "admin server error");
            }
        }
        Err(e) => {
            error!(addr = %addr, error = %e, "failed to bind admin port");
        }
    }
}

// ─── GET /health ─────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

// ─── GET /metrics ────────────────────────────────────────────────────────────

async fn metrics(State(state): State<AdminState>) -> Response {
    let m = &state.ctx.metrics;
    let mut out = String::with_capacity(2048);

    let counters: &[(&str, &str, u64)] = &[
        (
            "mauthd_connections_total",
            "Front-end connections accepted.",
            m.connections_total.load(Ordering::Relaxed),
        ),
        (
            "mauthd_auth_requests_total",
            "Authentication attempts started.",
            m.auth_requests.load(Ordering::Relaxed),
        ),
        (
            "mauthd_auth_successes_total",
            "Authentication attempts that succeeded.",
            m.auth_successes.load(Ordering::Relaxed),
        ),
        (
            "mauthd_auth_failures_total",
            "Authentication attempts that failed.",
            m.auth_failures.load(Ordering::Relaxed),
        ),
        (
            "mauthd_auth_internal_failures_total",
            "Attempts that failed on backend errors.",
            m.auth_internal_failures.load(Ordering::Relaxed),
        ),
        (
            "mauthd_auth_master_logins_total",
            "Master-user substitutions performed.",
            m.auth_master_logins.load(Ordering::Relaxed),
        ),
        (
            "mauthd_cache_hits_total",
            "Passdb cache hits.",
            m.cache_hits.load(Ordering::Relaxed),
        ),
        (
            "mauthd_cache_misses_total",
            "Passdb cache misses.",
            m.cache_misses.load(Ordering::Relaxed),
        ),
        (
            "mauthd_cache_expired_fallbacks_total",
            "Expired cache entries served during backend outages.",
            m.cache_expired_fallbacks.load(Ordering::Relaxed),
        ),
        (
            "mauthd_worker_requests_total",
            "Lookups dispatched to worker processes.",
            m.worker_requests.load(Ordering::Relaxed),
        ),
        (
            "mauthd_worker_creates_total",
            "Worker connections created.",
            m.worker_creates.load(Ordering::Relaxed),
        ),
        (
            "mauthd_worker_destroys_total",
            "Worker connections destroyed.",
            m.worker_destroys.load(Ordering::Relaxed),
        ),
        (
            "mauthd_worker_timeouts_total",
            "Worker lookups aborted on timeout.",
            m.worker_timeouts.load(Ordering::Relaxed),
        ),
    ];
    for (name, help, value) in counters {
        out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"));
    }

    out.push_str("# HELP mauthd_connections_active Currently connected front-ends.\n");
    out.push_str("# TYPE mauthd_connections_active gauge\n");
    out.push_str(&format!(
        "mauthd_connections_active {}\n",
        m.connections_active.load(Ordering::Relaxed)
    ));

    if let Some(workers) = &state.ctx.workers {
        let snap = workers.snapshot();
        out.push_str("# HELP mauthd_worker_connections Worker connections by state.\n");
        out.push_str("# TYPE mauthd_worker_connections gauge\n");
        out.push_str(&format!(
            "mauthd_worker_connections{{state=\"total\"}} {}\n",
            snap.total
        ));
        out.push_str(&format!(
            "mauthd_worker_connections{{state=\"idle\"}} {}\n",
            snap.idle
        ));
        out.push_str("# HELP mauthd_worker_queue_depth Requests waiting for a worker.\n");
        out.push_str("# TYPE mauthd_worker_queue_depth gauge\n");
        out.push_str(&format!("mauthd_worker_queue_depth {}\n", snap.queued));
    }

    if let Some(cache) = &state.ctx.cache {
        out.push_str("# HELP mauthd_cache_entries Current cache entries.\n");
        out.push_str("# TYPE mauthd_cache_entries gauge\n");
        out.push_str(&format!("mauthd_cache_entries {}\n", cache.len()));
        out.push_str("# HELP mauthd_cache_bytes Bytes used by cache entries.\n");
        out.push_str("# TYPE mauthd_cache_bytes gauge\n");
        out.push_str(&format!("mauthd_cache_bytes {}\n", cache.bytes_used()));
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        out,
    )
        .into_response()
}

// ─── GET /status ─────────────────────────────────────────────────────────────

async fn status(State(state): State<AdminState>) -> Response {
    let ctx = &state.ctx;
    let m = &ctx.metrics;

    let workers = ctx.workers.as_ref().map(|w| {
        let snap = w.snapshot();
        serde_json::json!({
            "total": snap.total,
            "idle": snap.idle,
            "queued": snap.queued,
        })
    });
    let cache = ctx.cache.as_ref().map(|c| {
        serde_json::json!({
            "entries": c.len(),
            "bytes": c.bytes_used(),
        })
    });

    let body = serde_json::json!({
        "connections_total": m.connections_total.load(Ordering::Relaxed),
        "connections_active": m.connections_active.load(Ordering::Relaxed),
        "auth": {
            "requests": m.auth_requests.load(Ordering::Relaxed),
            "successes": m.auth_successes.load(Ordering::Relaxed),
            "failures": m.auth_failures.load(Ordering::Relaxed),
            "internal_failures": m.auth_internal_failures.load(Ordering::Relaxed),
            "master_logins": m.auth_master_logins.load(Ordering::Relaxed),
        },
        "chains": {
            "passdbs": ctx.passdbs.len(),
            "masterdbs": ctx.masterdbs.len(),
            "userdbs": ctx.userdbs.len(),
        },
        "workers": workers,
        "cache": cache,
    });

    (
        StatusCode::OK,
        [("content-type", "application/json")],
        body.to_string(),
    )
        .into_response()
}
