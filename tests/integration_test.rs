// Integration tests for the re-authentication engine
//
// These tests drive the engine through the control API and the public engine
// API, with a mockito server standing in for the authorization endpoint.

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use bytes::Bytes;
use clap::Parser;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use reauth_proxy::{
    auth::{EngineSettings, ReauthEngine},
    config::{CliArgs, Config},
    error::Result,
    http_client::{RefreshTransport, ReqwestTransport},
    log_buffer::LogBuffer,
    message::{Message, RawRequest, RawResponse},
    observer::BroadcastObserver,
    routes::{self, AppState},
    scope::ScopeRule,
};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

const API_URL: &str = "https://api.example.com/v1/items";

/// Create app state backed by a real reqwest transport
fn create_test_app_state(control_api_key: Option<&str>) -> AppState {
    let config = Config::from_args(
        CliArgs::try_parse_from(["reauth-proxy", "--refresh-debounce-ms", "50"])
            .expect("Failed to parse test args"),
    )
    .expect("Failed to build test config");

    let transport = Arc::new(ReqwestTransport::new(5, 10).expect("Failed to create HTTP client"));
    let engine = ReauthEngine::new(
        config.engine_settings().expect("Invalid test settings"),
        transport,
    )
    .expect("Failed to create engine");
    engine.add_scope_rule(ScopeRule::prefix("https://api.example.com/"));

    let events = Arc::new(BroadcastObserver::new(64));
    engine.subscribe(events.clone());

    AppState {
        control_api_key: control_api_key.map(str::to_string),
        engine,
        logs: LogBuffer::default(),
        events,
    }
}

fn create_test_app(state: AppState) -> Router {
    Router::new()
        .merge(routes::health_routes())
        .merge(routes::control_routes(state))
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Bytes) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body)
}

fn put_settings(body: Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri("/v1/settings")
        .header("content-type", "application/json")
        .header("x-api-key", "control-key")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn intercept_request(raw: &'static [u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/v1/intercept/request?url={}", API_URL))
        .header("x-api-key", "control-key")
        .body(Body::from(raw))
        .unwrap()
}

/// Wait (real time) until the engine holds a token
async fn wait_for_token(engine: &ReauthEngine) -> Option<String> {
    for _ in 0..100 {
        if let Some(token) = engine.token() {
            return Some(token);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

/// Transport answering with an incrementing token and counting calls
struct CountingTransport {
    calls: AtomicUsize,
}

impl CountingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RefreshTransport for CountingTransport {
    async fn send(&self, _request: &RawRequest) -> Result<RawResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RawResponse::from_parts(
            "HTTP/1.1 200 OK",
            &[],
            format!(r#"{{"access_token": "token-{}"}}"#, n).as_bytes(),
        ))
    }
}

fn counting_engine(transport: Arc<CountingTransport>) -> Arc<ReauthEngine> {
    let settings = EngineSettings {
        authorization_url: reqwest::Url::parse("https://auth.example.com/token").unwrap(),
        ..EngineSettings::default()
    };
    let engine = ReauthEngine::new(settings, transport).unwrap();
    engine.add_scope_rule(ScopeRule::prefix("https://api.example.com/"));
    engine
}

// ==================================================================================================
// End-to-end over HTTP
// ==================================================================================================

#[tokio::test]
async fn test_token_fetched_and_injected() {
    let mut server = mockito::Server::new_async().await;
    let token_mock = server
        .mock("GET", "/oauth/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "eyJ.fresh.token", "expires_in": 300}"#)
        .expect(1)
        .create_async()
        .await;

    let state = create_test_app_state(Some("control-key"));
    let app = create_test_app(state.clone());

    let (status, _) = call(
        &app,
        put_settings(json!({
            "authorization_url": format!("{}/oauth/token", server.url()),
            "listening": true,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let token = wait_for_token(&state.engine).await;
    assert_eq!(token.as_deref(), Some("eyJ.fresh.token"));
    token_mock.assert_async().await;

    let raw: &'static [u8] =
        b"POST /v1/items HTTP/1.1\r\nHost: api.example.com\r\nAuthorization: Bearer old\r\nContent-Type: application/octet-stream\r\n\r\n\x00\x01binary\r\n\r\nbody";
    let (status, body) = call(&app, intercept_request(raw)).await;
    assert_eq!(status, StatusCode::OK);

    let rewritten = RawRequest::parse(reqwest::Url::parse(API_URL).unwrap(), &body).unwrap();
    assert_eq!(rewritten.header("authorization"), Some("Bearer eyJ.fresh.token"));
    assert_eq!(
        rewritten.headers().iter().filter(|h| h.starts_with("Authorization:")).count(),
        1
    );
    // body bytes survive untouched, including embedded blank lines
    assert!(body.ends_with(b"\r\n\r\n\x00\x01binary\r\n\r\nbody"));
}

#[tokio::test]
async fn test_control_api_rejects_missing_key() {
    let app = create_test_app(create_test_app_state(Some("control-key")));

    let request = Request::builder()
        .uri("/v1/state")
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_refresh_without_token_in_response_keeps_old_token() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/oauth/token")
        .with_status(500)
        .with_body("upstream exploded")
        .create_async()
        .await;

    let state = create_test_app_state(None);
    state
        .engine
        .set_authorization_url(&format!("{}/oauth/token", server.url()))
        .unwrap();
    state.engine.set_manual_token("kept");

    state.engine.refresh_now().await.unwrap();
    assert_eq!(state.engine.token().as_deref(), Some("kept"));
}

#[tokio::test]
async fn test_header_name_change_stops_injection() {
    let state = create_test_app_state(Some("control-key"));
    let app = create_test_app(state.clone());
    state.engine.set_manual_token("tok");
    state.engine.set_listening(true);

    let raw: &'static [u8] = b"GET /v1/items HTTP/1.1\r\nHost: api.example.com\r\n\r\n";
    let (_, body) = call(&app, intercept_request(raw)).await;
    assert!(String::from_utf8_lossy(&body).contains("Authorization: Bearer tok\r\n"));

    let (_, body) = call(&app, put_settings(json!({ "header_name": "X-Api-Token" }))).await;
    let snapshot: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(snapshot["listening"], false);
    assert_eq!(snapshot["header"], Value::Null);
    assert_eq!(snapshot["token"], Value::Null);

    // not listening any more: the request passes through unchanged
    let (_, body) = call(&app, intercept_request(raw)).await;
    assert_eq!(&body[..], raw);
}

// ==================================================================================================
// Engine API
// ==================================================================================================

#[tokio::test(start_paused = true)]
async fn test_burst_of_triggers_sends_one_request() {
    let transport = CountingTransport::new();
    let engine = counting_engine(transport.clone());

    engine.set_listening(true);
    for _ in 0..5 {
        engine.request_refresh();
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.token().as_deref(), Some("token-1"));

    // a later trigger outside the window refreshes again
    engine.request_refresh();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.token().as_deref(), Some("token-2"));
}

#[tokio::test(start_paused = true)]
async fn test_manual_token_survives_refresh() {
    let transport = CountingTransport::new();
    let engine = counting_engine(transport.clone());

    engine.set_listening(true);
    engine.set_manual_token("X");
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.token().as_deref(), Some("X"));

    let request = RawRequest::parse(
        reqwest::Url::parse(API_URL).unwrap(),
        b"GET /v1/items HTTP/1.1\r\nHost: api.example.com\r\n\r\n",
    )
    .unwrap();
    match engine.process(Message::Request(request)) {
        Message::Request(request) => assert_eq!(request.header("Authorization"), Some("Bearer X")),
        other => panic!("unexpected message: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_listening_toggle_refetches() {
    let transport = CountingTransport::new();
    let engine = counting_engine(transport.clone());

    engine.set_listening(true);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(engine.token().as_deref(), Some("token-1"));

    engine.set_listening(false);
    assert!(engine.token().is_none());

    engine.set_listening(true);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(engine.token().as_deref(), Some("token-2"));
}

#[tokio::test]
async fn test_set_header_name_is_idempotent() {
    let engine = counting_engine(CountingTransport::new());
    engine.set_manual_token("tok");
    let header = engine.make_header();

    engine.set_header_name("Authorization").unwrap();
    assert_eq!(engine.header(), Some(header));
    assert_eq!(engine.token().as_deref(), Some("tok"));
}
