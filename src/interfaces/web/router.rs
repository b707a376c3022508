use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::auth;
use super::handlers::{accounts, repository, status, workflow};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    // Liveness check stays reachable without credentials
    let public_routes = Router::new()
        .route("/health", get(status::health))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    let authed_routes = Router::new()
        .route("/api/status", get(status::get_status))
        .route("/api/history", get(status::get_history))
        .route("/api/workflow/start", post(workflow::start_workflow))
        .route("/api/workflow/stop", post(workflow::stop_workflow))
        .route("/api/workflow/restart", post(workflow::restart_workflow))
        .route(
            "/api/accounts",
            get(accounts::list_accounts).post(accounts::add_account),
        )
        .route(
            "/api/accounts/{id}/activate",
            post(accounts::switch_account),
        )
        .route("/api/accounts/{id}", delete(accounts::remove_account))
        .route("/api/repository", post(repository::select_repository))
        .route(
            "/api/repositories",
            get(repository::list_repositories).post(repository::create_repository),
        )
        .route("/api/repository/workflow", post(repository::push_workflow))
        .route("/api/counters/reset", post(repository::reset_counters))
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state.clone());

    public_routes.merge(authed_routes)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}
