// Diagnostic web endpoint: health, readiness, metrics, task and RPC traces.

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use prometheus::TEXT_FORMAT;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::environment::{RpcTracer, ThreadRegistry};
use crate::identity::ServiceIdentity;
use crate::metrics::MetricsRegistry;
use crate::readiness::Readiness;

/// Shared handles the diagnostic routes read from.
#[derive(Clone)]
pub struct DiagnosticState {
    pub identity: ServiceIdentity,
    pub started_at: DateTime<Utc>,
    pub metrics: Arc<MetricsRegistry>,
    pub readiness: Readiness,
    pub threads: Arc<ThreadRegistry>,
    pub rpc_trace: Arc<RpcTracer>,
}

pub fn create_diagnostic_router(state: DiagnosticState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/readyz", get(readiness))
        .route("/identity", get(identity))
        .route("/metrics", get(metrics))
        .route("/varz", get(varz))
        .route("/threadz", get(threadz))
        .route("/rpcz", get(rpcz))
        .route("/rpcz/reset", post(reset_rpcz))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check(State(state): State<DiagnosticState>) -> Json<Value> {
    let now = Utc::now();
    Json(serde_json::json!({
        "status": "healthy",
        "service_id": state.identity,
        "timestamp": now.to_rfc3339(),
        "uptime_seconds": (now - state.started_at).num_seconds(),
    }))
}

/// 200 once every enabled role is accepting RPCs, 503 before that.
async fn readiness(State(state): State<DiagnosticState>) -> (StatusCode, Json<Value>) {
    let snapshot = state.readiness.snapshot();
    let status = if snapshot.server_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(serde_json::json!(snapshot)))
}

async fn identity(State(state): State<DiagnosticState>) -> Json<Value> {
    Json(serde_json::json!({ "service_id": state.identity }))
}

/// Prometheus text exposition of every registered metric.
async fn metrics(State(state): State<DiagnosticState>) -> Response {
    match state.metrics.encode_text() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            tracing::warn!("Failed to export metrics: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn varz(State(state): State<DiagnosticState>) -> Json<Value> {
    Json(serde_json::json!(state.metrics.snapshot()))
}

async fn threadz(State(state): State<DiagnosticState>) -> Json<Value> {
    let tasks = state.threads.snapshot();
    Json(serde_json::json!({
        "tasks": tasks,
        "count": tasks.len(),
    }))
}

async fn rpcz(State(state): State<DiagnosticState>) -> Json<Value> {
    Json(serde_json::json!({ "methods": state.rpc_trace.summary() }))
}

async fn reset_rpcz(State(state): State<DiagnosticState>) -> Json<Value> {
    state.rpc_trace.reset();
    Json(serde_json::json!({ "status": "ok" }))
}
