//! HTTP route table for cc-relay. The heavy lifting lives in
//! `ccrelay-core`; this crate wires handlers, catalog views, and the ingress
//! middleware chain onto an axum `Router`.

mod views;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Router, middleware};
use http::StatusCode;

use ccrelay_core::error::RelayError;
use ccrelay_core::handler::messages_handler;
use ccrelay_core::middleware as ingress;
use ccrelay_core::state::AppState;
use ccrelay_protocol::ErrorKind;

/// Build the complete route table. Middleware order on `/v1/messages`,
/// outermost first: request-id, logging, concurrency gate, max-body, auth.
/// Catalog and health routes skip the gate and auth but still carry request
/// ids and logging.
pub fn relay_router(state: Arc<AppState>) -> Router {
    let max_body = state.config().server.max_body_bytes;

    let messages = Router::new()
        .route(
            "/v1/messages",
            post(messages_handler).fallback(method_not_allowed),
        )
        .layer(middleware::from_fn_with_state(state.clone(), ingress::client_auth))
        .layer(middleware::from_fn_with_state(state.clone(), ingress::max_body))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ingress::concurrency_gate,
        ));

    let catalog = Router::new()
        .route("/v1/models", get(views::list_models))
        .route("/v1/providers", get(views::list_providers))
        .route("/health", get(views::health));

    Router::new()
        .merge(messages)
        .merge(catalog)
        .fallback(not_found)
        .layer(middleware::from_fn(ingress::request_logging))
        .layer(middleware::from_fn(ingress::request_id))
        .with_state(state)
}

async fn not_found() -> axum::response::Response {
    RelayError::new(
        StatusCode::NOT_FOUND,
        ErrorKind::InvalidRequestError,
        "not found",
    )
    .into_response()
}

async fn method_not_allowed() -> axum::response::Response {
    RelayError::new(
        StatusCode::METHOD_NOT_ALLOWED,
        ErrorKind::InvalidRequestError,
        "method not allowed",
    )
    .into_response()
}
