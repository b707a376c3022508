pub mod accounts;
pub mod repository;
pub mod status;
pub mod workflow;

use axum::{Json, body::Bytes, http::StatusCode};
use serde::de::DeserializeOwned;

use crate::core::provider::ProviderError;
use crate::core::reconciler::FacadeError;
use crate::core::vault::VaultError;

pub type ApiResponse = (StatusCode, Json<serde_json::Value>);

pub fn ok(body: serde_json::Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

/// Map a facade failure onto an HTTP status and the usual `{success, error}` body.
pub fn facade_error(err: FacadeError) -> ApiResponse {
    let status = match &err {
        FacadeError::NotConfigured => StatusCode::CONFLICT,
        FacadeError::InvalidRepository(_) | FacadeError::InvalidName(_) => StatusCode::BAD_REQUEST,
        FacadeError::Vault(VaultError::InvalidToken(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        FacadeError::Vault(VaultError::NotFound(_)) => StatusCode::NOT_FOUND,
        FacadeError::Vault(VaultError::NoActiveAccount) => StatusCode::CONFLICT,
        FacadeError::Vault(VaultError::ProviderUnreachable(_)) => StatusCode::BAD_GATEWAY,
        FacadeError::Provider(ProviderError::NotFound(_)) => StatusCode::NOT_FOUND,
        FacadeError::Provider(ProviderError::Rejected(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        FacadeError::Provider(_) => StatusCode::BAD_GATEWAY,
        FacadeError::Vault(_) | FacadeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "success": false, "error": err.to_string() })),
    )
}

pub fn bad_request(message: impl Into<String>) -> ApiResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "success": false, "error": message.into() })),
    )
}

/// Parse an optional JSON body: an empty (or whitespace-only) body yields the default.
pub fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiResponse> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| bad_request(format!("Invalid request body: {}", e)))
}
