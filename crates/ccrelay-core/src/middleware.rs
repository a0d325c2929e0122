use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use axum::extract::{FromRequestParts, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::HeaderValue;
use http::request::Parts;
use tracing::info;
use uuid::Uuid;

use crate::error::RelayError;
use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Assign a fresh request id at the outermost layer. It rides on the request
/// headers for everything downstream and is always echoed back.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = Uuid::new_v4().to_string();
    let Ok(value) = HeaderValue::from_str(&id) else {
        return next.run(request).await;
    };
    request
        .headers_mut()
        .insert(REQUEST_ID_HEADER, value.clone());
    let mut response = next.run(request).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, value);
    response
}

pub async fn request_logging(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let trace_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    info!(
        event = "request_received",
        trace_id = %trace_id,
        method = %method,
        path = %path
    );

    let response = next.run(request).await;

    let elapsed = started.elapsed();
    info!(
        event = "request_completed",
        trace_id = %trace_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        bucket = timing_bucket(elapsed.as_millis())
    );
    response
}

fn timing_bucket(elapsed_ms: u128) -> &'static str {
    match elapsed_ms {
        0..=9 => "lt10ms",
        10..=99 => "lt100ms",
        100..=999 => "lt1s",
        1000..=9999 => "lt10s",
        _ => "ge10s",
    }
}

/// Global in-flight gate against the hot-reloadable `server.max_concurrent`.
/// Overflow answers 503 immediately, before any upstream work.
pub async fn concurrency_gate(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let limit = state.config().server.max_concurrent;
    let current = state.inflight.fetch_add(1, Ordering::AcqRel);
    let _guard = InflightGuard(state.clone());
    if current >= limit {
        return RelayError::busy("concurrency limit reached").into_response();
    }
    next.run(request).await
}

struct InflightGuard(Arc<AppState>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Reject bodies the declared length already proves oversized, and shape the
/// extractor's own limit rejection into the error envelope.
pub async fn max_body(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let limit = state.config().server.max_body_bytes;
    let declared = request
        .headers()
        .get(http::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.is_some_and(|length| length > limit) {
        return RelayError::invalid_request(format!("request body exceeds {limit} bytes"))
            .into_response();
    }

    let response = next.run(request).await;
    if response.status() == http::StatusCode::PAYLOAD_TOO_LARGE {
        return RelayError::invalid_request(format!("request body exceeds {limit} bytes"))
            .into_response();
    }
    response
}

/// Time spent in the client-auth layer, picked up by the dispatch log so the
/// per-phase durations cover the whole ingress chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthTiming(pub Option<Duration>);

impl<S> FromRequestParts<S> for AuthTiming
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<AuthTiming>()
            .copied()
            .unwrap_or_default())
    }
}

pub async fn client_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    if let Err(err) = state.auth().authenticate(request.headers()) {
        return err.into_response();
    }
    request
        .extensions_mut()
        .insert(AuthTiming(Some(started.elapsed())));
    next.run(request).await
}
