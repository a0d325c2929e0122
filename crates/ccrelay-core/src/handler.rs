use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use tracing::info;

use ccrelay_protocol::{MessagesRequest, RequestProbe};
use ccrelay_provider::{AcquireError, Credential, ProviderInfo};

use crate::auth::has_client_auth;
use crate::engine::UpstreamCall;
use crate::error::RelayError;
use crate::middleware::{AuthTiming, REQUEST_ID_HEADER};
use crate::routing::filter_candidates;
use crate::state::{AppState, Snapshot};
use crate::thinking::{SignatureTap, model_group, process_request};

const MESSAGES_PATH: &str = "/v1/messages";

/// The request dispatcher behind `POST /v1/messages`: probe the body, pick a
/// provider, pick a credential, rewrite, execute, decorate.
pub async fn messages_handler(
    State(state): State<Arc<AppState>>,
    auth_timing: AuthTiming,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let snapshot = state.snapshot();
    let trace_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    match dispatch(&state, &snapshot, &trace_id, auth_timing, &headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn dispatch(
    state: &Arc<AppState>,
    snapshot: &Snapshot,
    trace_id: &str,
    auth_timing: AuthTiming,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    let started = Instant::now();

    // Probe the body without consuming it: model, stream flag, thinking.
    let probe: RequestProbe = serde_json::from_slice(&body)
        .map_err(|err| RelayError::invalid_request(format!("request body is not valid JSON: {err}")))?;
    let debug_options = &snapshot.config.logging.debug_options;
    if debug_options.log_request_body {
        let shown = body.len().min(debug_options.max_body_log_size);
        info!(
            event = "request_body",
            trace_id = %trace_id,
            bytes = body.len(),
            body = %String::from_utf8_lossy(&body[..shown])
        );
    }
    let parsed: Option<MessagesRequest> = serde_json::from_slice(&body).ok();
    let thinking_continuation = parsed
        .as_ref()
        .is_some_and(MessagesRequest::has_thinking_continuation);

    // Candidate set from this request's snapshot of the live provider table.
    let (candidates, filter_outcome) = filter_candidates(
        &snapshot.providers,
        &snapshot.config.routing,
        probe.model.as_deref(),
        thinking_continuation,
    );
    let chosen = state.router.select(
        snapshot.config.routing.strategy,
        &candidates,
        &snapshot.pools,
    )?;
    let routed_at = Instant::now();

    // Transparent mode forwards the client's own credentials; otherwise one
    // credential is charged from the provider's pool.
    if probe.stream.unwrap_or(false) && !chosen.provider.supports_streaming() {
        return Err(RelayError::invalid_request(format!(
            "provider {} does not support streaming",
            chosen.name()
        )));
    }

    let transparent = chosen.provider.supports_transparent_auth() && has_client_auth(headers);
    let credential = if transparent {
        None
    } else {
        Some(acquire_credential(snapshot, &chosen)?)
    };
    let acquired_at = Instant::now();

    let model = probe.model.clone().unwrap_or_default();
    let group = model_group(&model).to_string();
    let signatures = state.signatures();

    // Thinking repair happens before any dialect transform so every provider
    // sees a body that already satisfies the signature protocol.
    let mut out_body = body;
    if thinking_continuation {
        if let Some(mut request) = parsed {
            let stats = process_request(&mut request, &signatures);
            if stats.dropped_blocks > 0 || stats.reordered_blocks > 0 {
                info!(
                    event = "thinking_repair",
                    trace_id = %trace_id,
                    dropped_blocks = stats.dropped_blocks,
                    reordered_blocks = stats.reordered_blocks
                );
            }
            out_body = serde_json::to_vec(&request)
                .map(Bytes::from)
                .map_err(|err| RelayError::internal(err.to_string()))?;
        }
    }

    let (final_body, target_url) = if chosen.provider.requires_transform() {
        let transformed = chosen
            .provider
            .transform_request(&out_body, MESSAGES_PATH)
            .map_err(|err| RelayError::invalid_request(err.to_string()))?;
        (transformed.body, transformed.target_url)
    } else {
        let out_body = rewrite_model(out_body, &chosen, &model)?;
        (
            out_body,
            format!("{}{}", chosen.provider.base_url(), MESSAGES_PATH),
        )
    };

    let mut out_headers = chosen.provider.forward_headers(headers);
    if transparent {
        if let Some(value) = headers.get(http::header::AUTHORIZATION) {
            out_headers.insert(http::header::AUTHORIZATION, value.clone());
        }
        if let Some(value) = headers.get("x-api-key") {
            out_headers.insert(
                http::header::HeaderName::from_static("x-api-key"),
                value.clone(),
            );
        }
    } else if let Some(credential) = &credential {
        chosen
            .provider
            .authenticate(&mut out_headers, credential.api_key());
    }

    let binding = snapshot
        .bindings
        .get(chosen.name())
        .cloned()
        .unwrap_or_default();
    let proxy = state.proxy_for(
        &chosen,
        &binding,
        Duration::from_millis(snapshot.config.server.timeout_ms),
    )?;

    let tap = (thinking_continuation || probe.thinking.is_some())
        .then(|| SignatureTap::new(group.clone(), signatures.clone()));
    let call = UpstreamCall {
        url: target_url,
        headers: out_headers,
        body: final_body,
        want_stream: probe.stream.unwrap_or(false),
        credential: credential.clone(),
        tap,
        model_group: group,
        signatures,
        trace_id: trace_id.to_string(),
    };
    let mut response = proxy.execute(call, state.health()).await;

    if debug_options.log_response_headers {
        info!(
            event = "response_headers",
            trace_id = %trace_id,
            status = response.status().as_u16(),
            headers = ?response.headers()
        );
    }
    info!(
        event = "dispatch",
        trace_id = %trace_id,
        provider = %chosen.name(),
        strategy = snapshot.config.routing.strategy.as_str(),
        model = %model,
        transparent = transparent,
        thinking_affinity = filter_outcome.thinking_affinity,
        degraded = filter_outcome.degraded,
        auth_us = auth_timing.0.unwrap_or_default().as_micros() as u64,
        route_us = routed_at.duration_since(started).as_micros() as u64,
        acquire_us = acquired_at.duration_since(routed_at).as_micros() as u64,
        // The engine returns once upstream headers arrive, so for streams
        // this is effectively time to first byte.
        upstream_ttfb_ms = acquired_at.elapsed().as_millis() as u64
    );

    if snapshot.config.routing.debug {
        apply_debug_headers(
            state,
            snapshot,
            &chosen,
            credential.as_deref(),
            filter_outcome.thinking_affinity,
            response.headers_mut(),
        );
    }
    Ok(response)
}

fn acquire_credential(
    snapshot: &Snapshot,
    chosen: &ProviderInfo,
) -> Result<Arc<Credential>, RelayError> {
    let Some(pool) = snapshot.pools.get(chosen.name()) else {
        return Err(RelayError::rate_limited(
            format!("provider {} has no credentials configured", chosen.name()),
            Duration::from_secs(60),
        ));
    };
    pool.acquire().map_err(|err| match err {
        AcquireError::AllKeysExhausted { retry_after } => {
            RelayError::rate_limited("all credentials exhausted", retry_after)
        }
    })
}

/// Apply the provider's model mapping to the body when it changes the name.
fn rewrite_model(body: Bytes, chosen: &ProviderInfo, model: &str) -> Result<Bytes, RelayError> {
    if model.is_empty() {
        return Ok(body);
    }
    let mapped = chosen.provider.map_model(model);
    if mapped == model {
        return Ok(body);
    }
    let mut document: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|err| RelayError::invalid_request(err.to_string()))?;
    if let Some(object) = document.as_object_mut() {
        object.insert("model".to_string(), serde_json::Value::String(mapped));
    }
    serde_json::to_vec(&document)
        .map(Bytes::from)
        .map_err(|err| RelayError::internal(err.to_string()))
}

fn apply_debug_headers(
    state: &Arc<AppState>,
    snapshot: &Snapshot,
    chosen: &ProviderInfo,
    credential: Option<&Credential>,
    thinking_affinity: bool,
    headers: &mut HeaderMap,
) {
    let mut set = |name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };
    set(
        "x-cc-relay-strategy",
        snapshot.config.routing.strategy.as_str().to_string(),
    );
    set("x-cc-relay-provider", chosen.name().to_string());
    set(
        "x-cc-relay-health",
        state.health().state(chosen.name()).as_str().to_string(),
    );
    set(
        "x-cc-relay-thinking-affinity",
        thinking_affinity.to_string(),
    );
    if let Some(credential) = credential {
        set("x-cc-relay-key-id", credential.id().to_string());
    }
    if let Some(pool) = snapshot.pools.get(chosen.name()) {
        let stats = pool.stats();
        set("x-cc-relay-keys-total", stats.total.to_string());
        set("x-cc-relay-keys-avail", stats.available.to_string());
    }
}
