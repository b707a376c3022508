use axum::{
    Json,
    extract::{Query, State},
};

use super::{ApiResponse, ok};
use crate::interfaces::web::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(serde::Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

pub async fn get_status(State(state): State<AppState>) -> ApiResponse {
    let status = state.reconciler.get_status();
    ok(serde_json::json!({ "success": true, "status": status }))
}

pub async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResponse {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let history = state.reconciler.get_history(limit);
    ok(serde_json::json!({ "success": true, "history": history }))
}
