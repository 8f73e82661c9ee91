//! HTTP surface of the worker.
//!
//! Two routes only: a liveness probe and the execution endpoint. The
//! endpoint accepts either a bare execution request or the queue-style
//! `{"input": ...}` envelope, and it always answers 200 with a
//! well-formed execution result; even an unparseable payload comes
//! back as a structured failure rather than a transport error.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use rexec_common::{ErrorInfo, ExecutionRequest, ExecutionResult};
use rexec_executor::RemoteExecutor;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

pub fn router(executor: Arc<RemoteExecutor>) -> Router {
    Router::new()
        .route("/ping", get(ping_handler))
        .route("/execute", post(execute_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(executor)
}

async fn ping_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn execute_handler(
    State(executor): State<Arc<RemoteExecutor>>,
    body: String,
) -> Json<ExecutionResult> {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(err) => {
            warn!(%err, "rejecting malformed execution request");
            return Json(ExecutionResult::failure(
                ErrorInfo {
                    kind: "ExecutionError".into(),
                    message: format!("malformed request: {err}"),
                    trace: String::new(),
                },
                String::new(),
            ));
        }
    };

    debug!(name = %request.name, "handling execution request");
    Json(executor.execute(request).await)
}

/// Unwraps the `{"input": ...}` envelope some queue frontends add, and
/// takes the payload as-is otherwise.
fn parse_request(body: &str) -> serde_json::Result<ExecutionRequest> {
    let mut payload: serde_json::Value = serde_json::from_str(body)?;
    let inner = match payload.get_mut("input") {
        Some(inner) => inner.take(),
        None => payload,
    };
    serde_json::from_value(inner)
}
