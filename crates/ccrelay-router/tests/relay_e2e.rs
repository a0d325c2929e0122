//! End-to-end scenarios against a minimal in-process upstream speaking raw
//! HTTP/1.1 over a local socket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tower::util::ServiceExt;

use ccrelay_core::{AppState, Config};
use ccrelay_router::relay_router;

#[derive(Debug, Clone)]
struct CapturedRequest {
    path: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl CapturedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
enum MockResponse {
    Json {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: String,
    },
    Sse {
        events: Vec<(&'static str, String)>,
    },
    /// Arbitrary response bytes after a fixed head; connection closes after.
    Raw {
        head: &'static str,
        body: Vec<u8>,
    },
}

struct MockUpstream {
    base_url: String,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl MockUpstream {
    async fn start(response: MockResponse) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let captured: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = captured.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let response = response.clone();
                let sink = sink.clone();
                tokio::spawn(async move {
                    serve_connection(stream, response, sink).await;
                });
            }
        });

        Self { base_url, captured }
    }

    fn captured(&self) -> Vec<CapturedRequest> {
        self.captured.lock().unwrap().clone()
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    response: MockResponse,
    sink: Arc<Mutex<Vec<CapturedRequest>>>,
) {
    loop {
        let Some(request) = read_request(&mut stream).await else {
            return;
        };
        sink.lock().unwrap().push(request);
        match &response {
            MockResponse::Json {
                status,
                headers,
                body,
            } => {
                let mut head = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\n",
                    body.len()
                );
                for (name, value) in headers {
                    head.push_str(&format!("{name}: {value}\r\n"));
                }
                head.push_str("\r\n");
                if stream.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                if stream.write_all(body.as_bytes()).await.is_err() {
                    return;
                }
            }
            MockResponse::Sse { events } => {
                let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
                if stream.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                for (event, data) in events {
                    let frame = format!("event: {event}\ndata: {data}\n\n");
                    if stream.write_all(frame.as_bytes()).await.is_err() {
                        return;
                    }
                    stream.flush().await.ok();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                return;
            }
            MockResponse::Raw { head, body } => {
                if stream.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                stream.write_all(body).await.ok();
                return;
            }
        }
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<CapturedRequest> {
    let mut buffer = Vec::new();
    let head_end = loop {
        if let Some(pos) = find_head_end(&buffer) {
            break pos;
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let path = request_line.split_whitespace().nth(1)?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0);

    let mut body = buffer[head_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(CapturedRequest {
        path,
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn relay_config(base_url: &str, keys: &[&str], debug: bool) -> Config {
    let keys: Vec<String> = keys
        .iter()
        .map(|key| format!(r#"{{"api_key": "{key}", "rpm_limit": 10}}"#))
        .collect();
    Config::from_json(&format!(
        r#"{{
            "routing": {{"debug": {debug}}},
            "health": {{"failure_threshold": 1, "open_duration_ms": 60000}},
            "providers": [
                {{"name": "anthropic", "type": "anthropic", "base_url": "{base_url}",
                  "models": ["claude-sonnet-4"],
                  "pool": {{"strategy": "round_robin", "keys": [{}]}}}}
            ]
        }}"#,
        keys.join(",")
    ))
    .unwrap()
}

// No client auth headers: ingress auth is a no-op in these configs and the
// dispatcher must fall back to pool credentials rather than transparent mode.
fn messages_request(body: &str) -> Request<Body> {
    Request::post("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

const SIMPLE_BODY: &str = r#"{"model":"claude-sonnet-4","messages":[{"role":"user","content":"hi"}]}"#;

#[tokio::test(flavor = "multi_thread")]
async fn happy_non_streaming_round_trip() {
    let reply = r#"{"id":"msg_1","type":"message","role":"assistant","model":"claude-sonnet-4","content":[{"type":"text","text":"hi"}]}"#;
    let upstream = MockUpstream::start(MockResponse::Json {
        status: 200,
        headers: vec![],
        body: reply.to_string(),
    })
    .await;

    let state = AppState::new(relay_config(&upstream.base_url, &["sk-1"], false)).unwrap();
    let response = relay_router(state)
        .oneshot(messages_request(SIMPLE_BODY))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&body).unwrap(),
        serde_json::from_str::<serde_json::Value>(reply).unwrap()
    );

    let captured = upstream.captured();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].path, "/v1/messages");
    assert_eq!(captured[0].header("x-api-key"), Some("sk-1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_streaming_emits_all_events() {
    let events = vec![
        ("message_start", r#"{"type":"message_start","message":{}}"#.to_string()),
        (
            "content_block_start",
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#.to_string(),
        ),
        (
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#.to_string(),
        ),
        ("message_stop", r#"{"type":"message_stop"}"#.to_string()),
    ];
    let upstream = MockUpstream::start(MockResponse::Sse { events }).await;

    let state = AppState::new(relay_config(&upstream.base_url, &["sk-1"], false)).unwrap();
    let body = r#"{"model":"claude-sonnet-4","stream":true,"messages":[{"role":"user","content":"hi"}]}"#;
    let response = relay_router(state)
        .oneshot(messages_request(body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");

    let collected = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&collected);
    for name in [
        "message_start",
        "content_block_start",
        "content_block_delta",
        "message_stop",
    ] {
        assert!(text.contains(name), "missing {name} in {text}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn transparent_passthrough_forwards_client_bearer() {
    let upstream = MockUpstream::start(MockResponse::Json {
        status: 200,
        headers: vec![],
        body: r#"{"id":"msg_1","type":"message","role":"assistant","model":"m","content":[]}"#
            .to_string(),
    })
    .await;

    let state = AppState::new(relay_config(&upstream.base_url, &["sk-pool"], true)).unwrap();
    let request = Request::post("/v1/messages")
        .header("content-type", "application/json")
        .header("authorization", "Bearer sub_X")
        .body(Body::from(SIMPLE_BODY))
        .unwrap();
    let response = relay_router(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // Transparent mode: no pool credential involved.
    assert!(!response.headers().contains_key("x-cc-relay-key-id"));
    assert_eq!(
        response.headers().get("x-cc-relay-provider").unwrap(),
        "anthropic"
    );

    let captured = upstream.captured();
    assert_eq!(captured[0].header("authorization"), Some("Bearer sub_X"));
    assert_eq!(captured[0].header("x-api-key"), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn round_robin_alternates_pool_keys() {
    let upstream = MockUpstream::start(MockResponse::Json {
        status: 200,
        headers: vec![],
        body: r#"{"id":"msg_1","type":"message","role":"assistant","model":"m","content":[]}"#
            .to_string(),
    })
    .await;

    let state =
        AppState::new(relay_config(&upstream.base_url, &["key-1", "key-2"], false)).unwrap();
    let app = relay_router(state);
    for _ in 0..4 {
        let response = app
            .clone()
            .oneshot(messages_request(SIMPLE_BODY))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let captured = upstream.captured();
    assert_eq!(captured.len(), 4);
    let count = |key: &str| {
        captured
            .iter()
            .filter(|r| r.header("x-api-key") == Some(key))
            .count()
    };
    assert_eq!(count("key-1"), 2);
    assert_eq!(count("key-2"), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn upstream_429_marks_credential_exhausted() {
    let upstream = MockUpstream::start(MockResponse::Json {
        status: 429,
        headers: vec![("retry-after", "7".to_string())],
        body: r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow"}}"#
            .to_string(),
    })
    .await;

    let state = AppState::new(relay_config(&upstream.base_url, &["sk-1"], false)).unwrap();
    let pool = state.snapshot().pools.get("anthropic").unwrap().clone();
    let response = relay_router(state)
        .oneshot(messages_request(SIMPLE_BODY))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("retry-after").unwrap(), "7");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.stats().exhausted, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_upstream_is_502_and_trips_the_breaker() {
    // Reserve a port, then close it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let state = AppState::new(relay_config(&base_url, &["sk-1"], false)).unwrap();
    let app = relay_router(state.clone());
    let response = app
        .clone()
        .oneshot(messages_request(SIMPLE_BODY))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"]["type"], "api_error");
    assert!(
        value["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("upstream connection failed")
    );

    // failure_threshold is 1: the provider is now unhealthy.
    assert!(!state.health().is_healthy("anthropic"));
}

fn eventstream_frame(event_type: &str, inner: &str) -> Vec<u8> {
    use base64::Engine as _;
    let wrapped = serde_json::json!({
        "bytes": base64::engine::general_purpose::STANDARD.encode(inner)
    })
    .to_string();

    let mut headers = Vec::new();
    headers.push(":event-type".len() as u8);
    headers.extend_from_slice(b":event-type");
    headers.push(7u8);
    headers.extend_from_slice(&(event_type.len() as u16).to_be_bytes());
    headers.extend_from_slice(event_type.as_bytes());

    let total = 12 + headers.len() + wrapped.len() + 4;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&headers);
    out.extend_from_slice(wrapped.as_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out
}

#[tokio::test(flavor = "multi_thread")]
async fn bedrock_transform_and_binary_stream_normalization() {
    let mut body = eventstream_frame("chunk", r#"{"type":"message_start","message":{}}"#);
    body.extend_from_slice(&eventstream_frame("chunk", r#"{"type":"message_stop"}"#));
    let upstream = MockUpstream::start(MockResponse::Raw {
        head: "HTTP/1.1 200 OK\r\ncontent-type: application/vnd.amazon.eventstream\r\nconnection: close\r\n\r\n",
        body,
    })
    .await;

    let config = Config::from_json(&format!(
        r#"{{
            "providers": [
                {{"name": "bedrock", "type": "bedrock", "base_url": "{}",
                  "pool": {{"keys": [{{"api_key": "aws-key", "rpm_limit": 10}}]}}}}
            ]
        }}"#,
        upstream.base_url
    ))
    .unwrap();
    let state = AppState::new(config).unwrap();
    let request_body =
        r#"{"model":"claude-sonnet-4","stream":true,"messages":[{"role":"user","content":"hi"}]}"#;
    let response = relay_router(state)
        .oneshot(messages_request(request_body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let collected = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&collected);
    assert!(text.contains("event: message_start"), "got {text}");
    assert!(text.contains("event: message_stop"), "got {text}");

    // Transform moved the model into the URL and the auth into a bearer.
    let captured = upstream.captured();
    assert_eq!(
        captured[0].path,
        "/model/claude-sonnet-4/invoke-with-response-stream"
    );
    assert_eq!(captured[0].header("authorization"), Some("Bearer aws-key"));
    let shipped: serde_json::Value = serde_json::from_str(&captured[0].body).unwrap();
    assert!(shipped.get("model").is_none());
    assert!(shipped.get("stream").is_none());

    // The body shipped upstream carried an exact Content-Length.
    let declared: usize = captured[0].header("content-length").unwrap().parse().unwrap();
    assert_eq!(declared, captured[0].body.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrency_ceiling_answers_server_busy() {
    let config = Config::from_json(
        r#"{
            "server": {"max_concurrent": 0},
            "providers": [
                {"name": "anthropic", "type": "anthropic",
                 "pool": {"keys": [{"api_key": "sk", "rpm_limit": 10}]}}
            ]
        }"#,
    )
    .unwrap();
    let response = relay_router(AppState::new(config).unwrap())
        .oneshot(messages_request(SIMPLE_BODY))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"]["type"], "server_busy");
}
