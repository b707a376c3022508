use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
};

use super::{ApiResponse, bad_request, facade_error, ok, optional_json};
use crate::interfaces::web::AppState;

const DEFAULT_REPOSITORY_LIMIT: usize = 30;

#[derive(serde::Deserialize)]
pub struct RepositoriesQuery {
    pub limit: Option<usize>,
}

#[derive(serde::Deserialize, Default)]
pub struct CreateRepositoryRequest {
    pub name: Option<String>,
}

#[derive(serde::Deserialize, Default)]
pub struct PushWorkflowRequest {
    /// Workflow YAML; the built-in template when absent.
    pub content: Option<String>,
}

#[derive(serde::Deserialize)]
pub struct SelectRepositoryRequest {
    pub full_name: String,
}

pub async fn select_repository(
    State(state): State<AppState>,
    Json(payload): Json<SelectRepositoryRequest>,
) -> ApiResponse {
    match state.reconciler.select_repository(&payload.full_name).await {
        Ok(()) => ok(serde_json::json!({ "success": true, "repository": payload.full_name.trim() })),
        Err(e) => facade_error(e),
    }
}

pub async fn reset_counters(State(state): State<AppState>) -> ApiResponse {
    match state.reconciler.reset_counters().await {
        Ok(()) => ok(serde_json::json!({ "success": true, "message": "Counters reset" })),
        Err(e) => facade_error(e),
    }
}

pub async fn list_repositories(
    State(state): State<AppState>,
    Query(query): Query<RepositoriesQuery>,
) -> ApiResponse {
    let limit = query.limit.unwrap_or(DEFAULT_REPOSITORY_LIMIT);
    match state.reconciler.list_repositories(limit).await {
        Ok(repositories) => ok(serde_json::json!({ "success": true, "repositories": repositories })),
        Err(e) => facade_error(e),
    }
}

/// The body is optional: without a name one is generated.
pub async fn create_repository(State(state): State<AppState>, body: Bytes) -> ApiResponse {
    let request: CreateRepositoryRequest = match optional_json(&body) {
        Ok(req) => req,
        Err(response) => return response,
    };
    match state.reconciler.create_repository(request.name.as_deref()).await {
        Ok(full_name) => ok(serde_json::json!({ "success": true, "repository": full_name })),
        Err(e) => facade_error(e),
    }
}

pub async fn push_workflow(State(state): State<AppState>, body: Bytes) -> ApiResponse {
    let request: PushWorkflowRequest = match optional_json(&body) {
        Ok(req) => req,
        Err(response) => return response,
    };
    if request.content.as_deref().is_some_and(|c| c.trim().is_empty()) {
        return bad_request("Workflow content must not be empty");
    }
    match state.reconciler.push_workflow(request.content.as_deref()).await {
        Ok(path) => ok(serde_json::json!({ "success": true, "path": path })),
        Err(e) => facade_error(e),
    }
}
