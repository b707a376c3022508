use axum::{
    Json,
    extract::{Path, State},
};

use super::{ApiResponse, bad_request, facade_error, ok};
use crate::interfaces::web::AppState;

#[derive(serde::Deserialize)]
pub struct AddAccountRequest {
    pub token: String,
}

pub async fn list_accounts(State(state): State<AppState>) -> ApiResponse {
    let accounts = state.reconciler.list_accounts();
    ok(serde_json::json!({ "success": true, "accounts": accounts }))
}

pub async fn add_account(
    State(state): State<AppState>,
    Json(payload): Json<AddAccountRequest>,
) -> ApiResponse {
    if payload.token.trim().is_empty() {
        return bad_request("Token is required");
    }
    match state.reconciler.add_account(&payload.token).await {
        Ok(account) => ok(serde_json::json!({ "success": true, "account": account })),
        Err(e) => facade_error(e),
    }
}

pub async fn switch_account(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.reconciler.switch_account(&id).await {
        Ok(()) => ok(serde_json::json!({ "success": true, "message": format!("Active account is now {}", id) })),
        Err(e) => facade_error(e),
    }
}

pub async fn remove_account(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.reconciler.remove_account(&id).await {
        Ok(()) => ok(serde_json::json!({ "success": true, "message": "Account removed" })),
        Err(e) => facade_error(e),
    }
}
