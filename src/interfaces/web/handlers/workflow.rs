use axum::{body::Bytes, extract::State};

use super::{ApiResponse, facade_error, ok, optional_json};
use crate::interfaces::web::AppState;

#[derive(serde::Deserialize, Default)]
pub struct RestartRequest {
    pub reason: Option<String>,
}

pub async fn start_workflow(State(state): State<AppState>) -> ApiResponse {
    match state.reconciler.start().await {
        Ok(outcome) => ok(serde_json::json!({ "success": true, "outcome": outcome })),
        Err(e) => facade_error(e),
    }
}

pub async fn stop_workflow(State(state): State<AppState>) -> ApiResponse {
    match state.reconciler.stop().await {
        Ok(()) => ok(serde_json::json!({ "success": true, "message": "Workflow stopped" })),
        Err(e) => facade_error(e),
    }
}

/// The body is optional: an empty POST restarts with the default reason.
pub async fn restart_workflow(State(state): State<AppState>, body: Bytes) -> ApiResponse {
    let request: RestartRequest = match optional_json(&body) {
        Ok(req) => req,
        Err(response) => return response,
    };

    match state.reconciler.restart(request.reason.as_deref()).await {
        Ok(()) => ok(serde_json::json!({ "success": true, "message": "Workflow restarted" })),
        Err(e) => facade_error(e),
    }
}
