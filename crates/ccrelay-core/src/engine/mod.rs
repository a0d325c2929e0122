//! Per-provider reverse-proxy engine: ships the rewritten request upstream,
//! samples rate-limit headers, reports outcomes to the health tracker, and
//! streams the response back with SSE semantics intact. One `ProviderProxy`
//! exists per `(provider, credential-binding)` and is cached by the state
//! layer until a hot-reload changes the binding.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use ccrelay_protocol::eventstream::{EventStreamDecoder, frame_to_sse};
use ccrelay_protocol::sse::SseParser;
use ccrelay_provider::{
    Credential, HealthTracker, Outcome, Provider, RateLimitUpdate, StreamingFormat,
};

use crate::error::RelayError;
use crate::thinking::{SignatureCache, SignatureTap, process_response_body};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EXHAUSTED_WINDOW: Duration = Duration::from_secs(60);
const BINARY_EVENT_STREAM: &str = "application/vnd.amazon.eventstream";
const SSE_CONTENT_TYPE: &str = "text/event-stream";

/// One fully rewritten upstream request, ready to execute.
pub struct UpstreamCall {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub want_stream: bool,
    pub credential: Option<Arc<Credential>>,
    /// Present when the response should run through the thinking
    /// post-processor (signature caching and `group#` tagging).
    pub tap: Option<SignatureTap>,
    pub model_group: String,
    pub signatures: Arc<SignatureCache>,
    pub trace_id: String,
}

pub struct ProviderProxy {
    provider: Arc<dyn Provider>,
    client: wreq::Client,
}

impl ProviderProxy {
    pub fn new(provider: Arc<dyn Provider>, request_timeout: Duration) -> Result<Self, RelayError> {
        let client = wreq::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .read_timeout(STREAM_IDLE_TIMEOUT)
            .build()
            .map_err(|err| RelayError::internal(format!("upstream client build failed: {err}")))?;
        Ok(Self { provider, client })
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Execute the call and translate the upstream's answer into a client
    /// response. Outcome reporting happens here, once, at header time;
    /// a request canceled before upstream headers reports nothing.
    pub async fn execute(&self, call: UpstreamCall, health: Arc<HealthTracker>) -> Response {
        let provider_name = self.provider.name().to_string();
        let started = Instant::now();
        info!(
            event = "upstream_request",
            trace_id = %call.trace_id,
            provider = %provider_name,
            url = %call.url,
            is_stream = call.want_stream
        );

        let mut builder = self.client.post(&call.url);
        for (name, value) in call.headers.iter() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        let result = builder.body(call.body.clone()).send().await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    event = "upstream_response",
                    trace_id = %call.trace_id,
                    provider = %provider_name,
                    status = "error",
                    elapsed_ms = started.elapsed().as_millis(),
                    error = %err
                );
                health.record_outcome(&provider_name, Outcome::TransientFailure);
                return RelayError::upstream_connect(err).into_response();
            }
        };

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let upstream_headers = convert_headers(response.headers());
        info!(
            event = "upstream_response",
            trace_id = %call.trace_id,
            provider = %provider_name,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis(),
            is_stream = call.want_stream
        );

        if let Some(credential) = &call.credential {
            // Reconciliation must never hold up forwarding.
            if let Some(update) = RateLimitUpdate::from_headers(&upstream_headers) {
                let credential = credential.clone();
                tokio::spawn(async move {
                    credential.update_from_upstream_headers(&update);
                });
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = parse_retry_after(&upstream_headers)
                    .unwrap_or(DEFAULT_EXHAUSTED_WINDOW);
                credential.mark_exhausted(retry_after);
            }
        }
        health.record_outcome(&provider_name, Outcome::from_status(status.as_u16()));

        let content_type = upstream_headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        // Only providers that advertise the binary framing get the adapter;
        // anyone else claiming that content type is forwarded buffered.
        let is_binary = self.provider.streaming_format() == StreamingFormat::BinaryEventStream
            && content_type.starts_with(BINARY_EVENT_STREAM);
        let is_sse = content_type.starts_with(SSE_CONTENT_TYPE);

        if status.is_success() && call.want_stream && (is_sse || is_binary) {
            return stream_response(status, response, is_binary, call.tap);
        }
        buffered_response(status, &upstream_headers, response, &call).await
    }
}

/// Non-streaming path: read the whole body, give the thinking post-processor
/// a chance to rewrite it, forward status and the headers that matter.
async fn buffered_response(
    status: StatusCode,
    upstream_headers: &HeaderMap,
    response: wreq::Response,
    call: &UpstreamCall,
) -> Response {
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => return RelayError::upstream_connect(err).into_response(),
    };
    let body = if status.is_success() {
        process_response_body(&body, &call.model_group, &call.signatures).unwrap_or(body)
    } else {
        body
    };

    let mut out = Response::new(Body::from(body));
    *out.status_mut() = status;
    if let Some(content_type) = upstream_headers.get(CONTENT_TYPE) {
        out.headers_mut().insert(CONTENT_TYPE, content_type.clone());
    } else {
        out.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    if let Some(retry_after) = upstream_headers.get(RETRY_AFTER) {
        out.headers_mut().insert(RETRY_AFTER, retry_after.clone());
    }
    out
}

/// Streaming path. The upstream body is bridged through a small channel so
/// every event reaches the client as it arrives; nothing is buffered beyond
/// the frame being assembled.
fn stream_response(
    status: StatusCode,
    response: wreq::Response,
    is_binary: bool,
    tap: Option<SignatureTap>,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(16);
    tokio::spawn(forward_stream(response, is_binary, tap, tx));

    let mut out = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *out.status_mut() = status;
    let headers = out.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(SSE_CONTENT_TYPE));
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    out
}

async fn forward_stream(
    response: wreq::Response,
    is_binary: bool,
    mut tap: Option<SignatureTap>,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
) {
    let mut stream = response.bytes_stream();
    let mut decoder = is_binary.then(EventStreamDecoder::new);
    // The SSE parser only runs when events must be inspected; otherwise
    // upstream bytes pass through verbatim, in arrival order.
    let mut parser = (!is_binary && tap.is_some()).then(SseParser::new);

    loop {
        let next = match tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                let _ = tx
                    .send(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "upstream stream idle",
                    )))
                    .await;
                return;
            }
        };
        let Some(item) = next else {
            break;
        };
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = tx.send(Err(io::Error::other(err.to_string()))).await;
                return;
            }
        };

        if let Some(decoder) = decoder.as_mut() {
            // A zero-byte read from the adapter means the upstream stalled;
            // failing here is what keeps a buggy peer from spinning us.
            if chunk.is_empty() {
                let _ = tx
                    .send(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "upstream stream closed",
                    )))
                    .await;
                return;
            }
            let frames = match decoder.push(&chunk) {
                Ok(frames) => frames,
                Err(err) => {
                    let _ = tx
                        .send(Err(io::Error::new(io::ErrorKind::InvalidData, err.to_string())))
                        .await;
                    return;
                }
            };
            for frame in frames {
                let Some(mut event) = frame_to_sse(&frame) else {
                    continue;
                };
                if let Some(tap) = tap.as_mut() {
                    if let Some(rewritten) = tap.on_event(&event) {
                        event = rewritten;
                    }
                }
                if tx.send(Ok(event.to_bytes())).await.is_err() {
                    return;
                }
            }
        } else if let Some(parser) = parser.as_mut() {
            for event in parser.push_bytes(&chunk) {
                let event = tap
                    .as_mut()
                    .and_then(|tap| tap.on_event(&event))
                    .unwrap_or(event);
                if tx.send(Ok(event.to_bytes())).await.is_err() {
                    return;
                }
            }
        } else if tx.send(Ok(chunk)).await.is_err() {
            return;
        }
    }

    // EOF: flush whatever the parser still holds.
    if let Some(parser) = parser.as_mut() {
        for event in parser.finish() {
            let event = tap
                .as_mut()
                .and_then(|tap| tap.on_event(&event))
                .unwrap_or(event);
            if tx.send(Ok(event.to_bytes())).await.is_err() {
                return;
            }
        }
    }
}

fn convert_headers(map: &wreq::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in map {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let seconds: u64 = value.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}
