use actix_web::body::MessageBody;
use actix_web::{test, web, App};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::post, Json, Router};
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use chat_relay::error::{
    MSG_CREDENTIAL_INVALID, MSG_CREDENTIAL_MISSING, MSG_QUOTA_EXCEEDED, MSG_UPSTREAM_UNAVAILABLE,
};
use chat_relay::gateway::{ModelGateway, OpenAiGateway, RetryingGateway, UpstreamSettings};
use chat_relay::models::StreamEvent;
use chat_relay::server::config_routes;
use chat_relay::util::{build_http_client, AppState};
use chat_relay::PERSONA_PROMPT;

const TEST_KEY: &str = "sk-test-0123456789";

#[derive(Clone, Debug)]
struct Recorded {
    authorization: Option<String>,
    payload: Value,
}

#[derive(Clone)]
struct CannedReply {
    status: StatusCode,
    content_type: &'static str,
    body: String,
}

impl CannedReply {
    fn json(status: StatusCode, body: Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    fn completion(text: &str) -> Self {
        Self::json(
            StatusCode::OK,
            json!({
                "id": "chatcmpl-test",
                "object": "chat.completion",
                "created": 1,
                "model": "gpt-3.5-turbo",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": text},
                    "finish_reason": "stop"
                }]
            }),
        )
    }

    fn sse(deltas: &[&str]) -> Self {
        let mut body = String::from(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        );
        for delta in deltas {
            let chunk = json!({
                "object": "chat.completion.chunk",
                "choices": [{"index": 0, "delta": {"content": delta}, "finish_reason": null}]
            });
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        let stop = json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]});
        body.push_str(&format!("data: {stop}\n\n"));
        body.push_str("data: [DONE]\n\n");
        Self {
            status: StatusCode::OK,
            content_type: "text/event-stream",
            body,
        }
    }
}

#[derive(Clone)]
struct UpstreamState {
    requests: Arc<AsyncMutex<Vec<Recorded>>>,
    reply: CannedReply,
}

async fn handle_chat(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.requests.lock().await.push(Recorded {
        authorization,
        payload,
    });
    let reply = state.reply.clone();
    (
        reply.status,
        [(header::CONTENT_TYPE, reply.content_type)],
        reply.body,
    )
        .into_response()
}

async fn stall() -> Response {
    tokio::time::sleep(Duration::from_secs(3600)).await;
    StatusCode::OK.into_response()
}

struct MockUpstream {
    base_url: String,
    requests: Arc<AsyncMutex<Vec<Recorded>>>,
    join: JoinHandle<()>,
}

impl MockUpstream {
    async fn start(reply: CannedReply) -> Self {
        let requests = Arc::new(AsyncMutex::new(Vec::new()));
        let state = UpstreamState {
            requests: requests.clone(),
            reply,
        };

        let app = Router::new()
            .route("/v1/chat/completions", post(handle_chat))
            .with_state(state);
        Self::serve(app, requests).await
    }

    /// Upstream that never answers.
    async fn stalled() -> Self {
        let app = Router::new().route("/v1/chat/completions", post(stall));
        Self::serve(app, Arc::new(AsyncMutex::new(Vec::new()))).await
    }

    /// Upstream that sends one SSE delta and then goes silent.
    async fn stalled_mid_stream(first_delta: &'static str) -> Self {
        let handler = move || async move {
            let chunk = json!({"choices": [{"index": 0, "delta": {"content": first_delta}}]});
            let first = Ok::<_, std::io::Error>(format!("data: {chunk}\n\n"));
            let body = stream::iter(vec![first]).chain(stream::pending());
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(body),
            )
                .into_response()
        };
        let app = Router::new().route("/v1/chat/completions", post(handler));
        Self::serve(app, Arc::new(AsyncMutex::new(Vec::new()))).await
    }

    async fn serve(app: Router, requests: Arc<AsyncMutex<Vec<Recorded>>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}/v1", addr);

        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("upstream server error");
        });

        Self {
            base_url,
            requests,
            join,
        }
    }

    async fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().await.clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.join.abort();
    }
}

fn settings(base_url: &str, api_key: Option<&str>) -> UpstreamSettings {
    UpstreamSettings {
        base_url: base_url.to_string(),
        api_key: api_key.map(str::to_string),
        model: "gpt-3.5-turbo".to_string(),
        request_timeout: Some(Duration::from_secs(5)),
    }
}

fn gateway(base_url: &str, api_key: Option<&str>) -> Arc<dyn ModelGateway> {
    Arc::new(OpenAiGateway::new(
        reqwest::Client::new(),
        settings(base_url, api_key),
    ))
}

macro_rules! relay_app {
    ($gateway:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::with_gateway($gateway)))
                .configure(config_routes),
        )
        .await
    };
}

fn chat_request(payload: Value) -> actix_web::test::TestRequest {
    test::TestRequest::post().uri("/api/chat").set_json(payload)
}

fn sse_events(body: &[u8]) -> Vec<StreamEvent> {
    std::str::from_utf8(body)
        .expect("utf8 body")
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| {
            let json = frame.strip_prefix("data: ").expect("data frame");
            serde_json::from_str(json).expect("stream event")
        })
        .collect()
}

#[actix_web::test]
async fn unary_call_forwards_persona_history_and_sampling() {
    let reply = CannedReply::completion("That sounds hard. Tell me more.");
    let upstream = MockUpstream::start(reply).await;
    let app = relay_app!(gateway(&upstream.base_url, Some(TEST_KEY)));

    let req = chat_request(json!({
        "message": "I feel anxious today",
        "history": [
            {"role": "user", "content": "Hi"},
            {"role": "assistant", "content": "Hello, how are you feeling?"}
        ]
    }))
    .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["message"], "That sounds hard. Tell me more.");
    assert_eq!(body["status"], "success");

    let requests = upstream.requests().await;
    assert_eq!(requests.len(), 1);
    let sent = &requests[0];
    assert_eq!(sent.authorization.as_deref(), Some("Bearer sk-test-0123456789"));

    let payload = &sent.payload;
    assert_eq!(payload["model"], "gpt-3.5-turbo");
    assert_eq!(payload["max_tokens"], 300);
    let temperature = payload["temperature"].as_f64().expect("temperature");
    assert!((temperature - 0.7).abs() < 1e-6);
    assert!(payload.get("stream").is_none());
    assert!(payload.get("presence_penalty").is_none());

    let messages = payload["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[0]["content"], PERSONA_PROMPT);
    assert_eq!(messages[1], json!({"role": "user", "content": "Hi"}));
    assert_eq!(
        messages[2],
        json!({"role": "assistant", "content": "Hello, how are you feeling?"})
    );
    assert_eq!(
        messages[3],
        json!({"role": "user", "content": "I feel anxious today"})
    );
}

#[actix_web::test]
async fn streaming_call_relays_upstream_deltas_as_sse() {
    let upstream = MockUpstream::start(CannedReply::sse(&["I'm ", "here ", "for you."])).await;
    let app = relay_app!(gateway(&upstream.base_url, Some(TEST_KEY)));

    let req = chat_request(json!({"message": "Can we talk?", "stream": true})).to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = test::read_body(resp).await;
    let events = sse_events(&body);
    assert_eq!(events.len(), 4);
    assert_eq!(events[0], StreamEvent::delta("I'm "));
    assert_eq!(events[1], StreamEvent::delta("here "));
    assert_eq!(events[2], StreamEvent::delta("for you."));

    let concatenated: String = events[..3].iter().map(|e| e.content.as_str()).collect();
    assert_eq!(events[3], StreamEvent::terminal(concatenated));

    let requests = upstream.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].payload["stream"], true);
}

#[actix_web::test]
async fn quota_rejection_maps_to_fixed_message() {
    let upstream = MockUpstream::start(CannedReply::json(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": {
            "message": "You exceeded your current quota for org-7f3a, please check your plan.",
            "type": "insufficient_quota",
            "code": "insufficient_quota"
        }}),
    ))
    .await;
    let app = relay_app!(gateway(&upstream.base_url, Some(TEST_KEY)));

    for stream in [false, true] {
        let req = chat_request(json!({"message": "hello", "stream": stream})).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 500);
        let raw = test::read_body(resp).await;
        let text = std::str::from_utf8(&raw).unwrap();
        assert!(!text.contains("org-7f3a"));
        let body: Value = serde_json::from_str(text).expect("json error body");
        assert_eq!(body["error"], MSG_QUOTA_EXCEEDED);
        assert_eq!(body["status"], "error");
    }
}

#[actix_web::test]
async fn rejected_key_maps_to_credential_invalid() {
    let upstream = MockUpstream::start(CannedReply::json(
        StatusCode::UNAUTHORIZED,
        json!({"error": {
            "message": "Incorrect API key provided: sk-test-****6789.",
            "type": "invalid_request_error",
            "code": "invalid_api_key"
        }}),
    ))
    .await;
    let app = relay_app!(gateway(&upstream.base_url, Some(TEST_KEY)));

    let req = chat_request(json!({"message": "hello"})).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 500);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], MSG_CREDENTIAL_INVALID);
}

#[actix_web::test]
async fn unreachable_upstream_is_unavailable() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
        probe.local_addr().expect("probe addr").port()
    };
    let base_url = format!("http://127.0.0.1:{port}/v1");
    let app = relay_app!(gateway(&base_url, Some(TEST_KEY)));

    for stream in [false, true] {
        let req = chat_request(json!({"message": "anyone there?", "stream": stream})).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 500);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], MSG_UPSTREAM_UNAVAILABLE);
    }
}

#[actix_web::test]
async fn missing_key_never_reaches_upstream() {
    let upstream = MockUpstream::start(CannedReply::completion("unused")).await;
    let app = relay_app!(gateway(&upstream.base_url, None));

    for stream in [false, true] {
        let req = chat_request(json!({"message": "hello", "stream": stream})).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 500);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], MSG_CREDENTIAL_MISSING);
    }
    assert!(upstream.requests().await.is_empty());
}

#[actix_web::test]
async fn retrying_gateway_retries_unavailable_unary_calls() {
    let upstream = MockUpstream::start(CannedReply::json(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({"error": {"message": "The server is overloaded", "type": "server_error"}}),
    ))
    .await;
    let inner = OpenAiGateway::new(
        reqwest::Client::new(),
        settings(&upstream.base_url, Some(TEST_KEY)),
    );
    let app = relay_app!(Arc::new(RetryingGateway::new(inner, 2)));

    let req = chat_request(json!({"message": "hello"})).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 500);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], MSG_UPSTREAM_UNAVAILABLE);
    assert_eq!(upstream.requests().await.len(), 3);

    let req = chat_request(json!({"message": "hello", "stream": true})).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 500);
    assert_eq!(upstream.requests().await.len(), 4);
}

#[actix_web::test]
async fn stalled_upstream_fails_instead_of_hanging() {
    let upstream = MockUpstream::stalled().await;
    // No total deadline: the client's read timeout alone must end the call.
    let mut unbounded = settings(&upstream.base_url, Some(TEST_KEY));
    unbounded.request_timeout = None;
    let client = build_http_client(Duration::from_millis(300));
    let app = relay_app!(Arc::new(OpenAiGateway::new(client, unbounded)));

    for stream in [false, true] {
        let req = chat_request(json!({"message": "hello?", "stream": stream})).to_request();
        let resp = tokio::time::timeout(Duration::from_secs(5), test::call_service(&app, req))
            .await
            .expect("relay answered a stalled upstream");
        assert_eq!(resp.status(), 500);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], MSG_UPSTREAM_UNAVAILABLE);
    }
}

#[actix_web::test]
async fn stream_stalling_mid_reply_ends_with_partial_terminal() {
    let upstream = MockUpstream::stalled_mid_stream("I am ").await;
    let client = build_http_client(Duration::from_millis(300));
    let gateway = OpenAiGateway::new(client, settings(&upstream.base_url, Some(TEST_KEY)));
    let app = relay_app!(Arc::new(gateway));

    let req = chat_request(json!({"message": "hello?", "stream": true})).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let mut body = resp.into_body();
    let mut frames = Vec::new();
    let mut errored = false;
    let drain = async {
        while let Some(item) = poll_fn(|cx| Pin::new(&mut body).poll_next(cx)).await {
            match item {
                Ok(bytes) => frames.extend_from_slice(&bytes),
                Err(_) => {
                    errored = true;
                    break;
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), drain)
        .await
        .expect("stream ended after the upstream went silent");

    assert!(errored, "transport must see the failure");
    let events = sse_events(&frames);
    assert_eq!(
        events,
        vec![StreamEvent::delta("I am "), StreamEvent::terminal("I am ")]
    );
}
