use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware::{self as axum_middleware},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use crate::auth::{parse_endpoint, EngineSnapshot, ParseOutcome, ReauthEngine};
use crate::error::{ReauthError, Result};
use crate::log_buffer::{LogBuffer, LogEntry, LogLevel};
use crate::message::{Message, RawRequest, RawResponse};
use crate::middleware;
use crate::observer::BroadcastObserver;
use crate::scope::{ScopeFilter, ScopeRule};

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub control_api_key: Option<String>,
    pub engine: Arc<ReauthEngine>,
    pub logs: LogBuffer,
    pub events: Arc<BroadcastObserver>,
}

/// Health check routes (no authentication required)
pub fn health_routes() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

/// Engine control and interception routes (require the control key)
pub fn control_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/state", get(state_handler))
        .route("/v1/settings", put(settings_handler))
        .route("/v1/token", post(manual_token_handler))
        .route("/v1/refresh", post(refresh_handler))
        .route("/v1/scope", get(list_scope_handler).post(add_scope_handler))
        .route("/v1/scope/check", get(check_scope_handler))
        .route(
            "/v1/scope/:index",
            put(update_scope_handler).delete(remove_scope_handler),
        )
        .route("/v1/intercept/request", post(intercept_request_handler))
        .route("/v1/intercept/response", post(intercept_response_handler))
        .route("/v1/context/scope", post(context_scope_handler))
        .route("/v1/context/auth-request", post(context_auth_request_handler))
        .route("/v1/context/token", post(context_token_handler))
        .route("/v1/logs", get(logs_handler).delete(clear_logs_handler))
        .route("/v1/logs/settings", put(log_settings_handler))
        .route("/v1/events", get(events_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::control_key_middleware,
        ))
        .with_state(state)
}

fn outcome_json(outcome: Option<&ParseOutcome>) -> Value {
    match outcome {
        Some(ParseOutcome::Parsed(token)) => json!({ "outcome": "parsed", "token": token }),
        Some(ParseOutcome::NotFound) => json!({ "outcome": "not_found" }),
        Some(ParseOutcome::SuppressedManual) => json!({ "outcome": "suppressed_manual" }),
        None => json!({ "outcome": "ignored" }),
    }
}

/// GET / - Simple health check
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Re-authentication engine is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

/// GET /v1/state - Engine snapshot for the state panel
async fn state_handler(State(state): State<AppState>) -> Json<EngineSnapshot> {
    Json(state.engine.snapshot())
}

/// Partial settings update; absent fields are left alone
#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub authorization_url: Option<String>,
    pub header_name: Option<String>,
    pub header_value_prefix: Option<String>,
    pub token_pattern: Option<String>,
    pub listening: Option<bool>,
    pub reauth_interval_secs: Option<u64>,
    pub refresh_debounce_ms: Option<u64>,
}

/// PUT /v1/settings - Apply setting changes in field order
///
/// Stops at the first invalid value; earlier fields stay applied.
async fn settings_handler(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<EngineSnapshot>> {
    tracing::info!("Request to /v1/settings");
    let engine = &state.engine;

    if let Some(url) = &update.authorization_url {
        engine.set_authorization_url(url)?;
    }
    if let Some(name) = &update.header_name {
        engine.set_header_name(name)?;
    }
    if let Some(prefix) = &update.header_value_prefix {
        engine.set_header_value_prefix(prefix);
    }
    if let Some(pattern) = &update.token_pattern {
        engine.set_token_pattern(pattern)?;
    }
    if let Some(secs) = update.reauth_interval_secs {
        engine.set_reauth_interval(Duration::from_secs(secs))?;
    }
    if let Some(ms) = update.refresh_debounce_ms {
        engine.set_refresh_debounce(Duration::from_millis(ms));
    }
    if let Some(listening) = update.listening {
        engine.set_listening(listening);
    }

    Ok(Json(engine.snapshot()))
}

#[derive(Debug, Deserialize)]
pub struct ManualToken {
    pub token: String,
}

/// POST /v1/token - Set the token manually
async fn manual_token_handler(
    State(state): State<AppState>,
    Json(body): Json<ManualToken>,
) -> Json<EngineSnapshot> {
    state.engine.set_manual_token(body.token);
    Json(state.engine.snapshot())
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshQuery {
    #[serde(default)]
    pub now: bool,
}

/// POST /v1/refresh - Request a token refresh
///
/// Debounced by default; `?now=true` sends the request immediately and reports
/// transport failures.
async fn refresh_handler(
    State(state): State<AppState>,
    Query(query): Query<RefreshQuery>,
) -> Result<Response> {
    if query.now {
        state.engine.refresh_now().await?;
        return Ok(Json(state.engine.snapshot()).into_response());
    }

    let stamp = state.engine.request_refresh();
    Ok((StatusCode::ACCEPTED, Json(json!({ "stamp": stamp }))).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct ScopeQuery {
    #[serde(default)]
    pub filter: ScopeFilter,
}

#[derive(Debug, Serialize)]
pub struct ScopeRow {
    pub index: usize,
    #[serde(flatten)]
    pub rule: ScopeRule,
}

fn scope_rows(engine: &ReauthEngine, filter: ScopeFilter) -> Vec<ScopeRow> {
    engine
        .scope_rules(filter)
        .into_iter()
        .map(|(index, rule)| ScopeRow { index, rule })
        .collect()
}

/// GET /v1/scope - List scope rules
async fn list_scope_handler(
    State(state): State<AppState>,
    Query(query): Query<ScopeQuery>,
) -> Json<Vec<ScopeRow>> {
    Json(scope_rows(&state.engine, query.filter))
}

/// POST /v1/scope - Append a scope rule
async fn add_scope_handler(
    State(state): State<AppState>,
    Json(rule): Json<ScopeRule>,
) -> (StatusCode, Json<Vec<ScopeRow>>) {
    tracing::debug!(pattern = %rule.pattern, "Adding scope rule");
    state.engine.add_scope_rule(rule);
    (
        StatusCode::CREATED,
        Json(scope_rows(&state.engine, ScopeFilter::Any)),
    )
}

/// PUT /v1/scope/:index - Replace a scope rule
async fn update_scope_handler(
    State(state): State<AppState>,
    Path(index): Path<usize>,
    Json(rule): Json<ScopeRule>,
) -> Result<Json<Vec<ScopeRow>>> {
    state.engine.update_scope_rule(index, rule)?;
    Ok(Json(scope_rows(&state.engine, ScopeFilter::Any)))
}

/// DELETE /v1/scope/:index - Remove a scope rule
async fn remove_scope_handler(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> Result<Json<ScopeRule>> {
    Ok(Json(state.engine.remove_scope_rule(index)?))
}

#[derive(Debug, Deserialize)]
pub struct UrlQuery {
    pub url: String,
}

/// GET /v1/scope/check?url= - Test a URL against the scope
async fn check_scope_handler(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> Result<Json<Value>> {
    let url = parse_endpoint(&query.url)?;
    Ok(Json(json!({
        "url": url.as_str(),
        "in_scope": state.engine.in_scope(&url),
    })))
}

/// POST /v1/intercept/request?url= - Hand a raw request to the engine
///
/// Responds with the (possibly rewritten) raw request.
async fn intercept_request_handler(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
    body: Bytes,
) -> Result<Bytes> {
    let url = parse_endpoint(&query.url)?;
    let request = RawRequest::parse(url, &body)?;

    match state.engine.process(Message::Request(request)) {
        Message::Request(request) => Ok(request.to_bytes()),
        Message::Response { response, .. } => Ok(response.as_bytes().clone()),
    }
}

/// POST /v1/intercept/response?url= - Hand a raw response to the engine
///
/// The response is passed back unchanged; the parse outcome is reported in the
/// `x-reauth-outcome` header.
async fn intercept_response_handler(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
    body: Bytes,
) -> Result<Response> {
    let url = parse_endpoint(&query.url)?;
    let response = RawResponse::new(body);

    let outcome = state.engine.handle_response(&url, &response);
    let label = match &outcome {
        Some(ParseOutcome::Parsed(_)) => "parsed",
        Some(ParseOutcome::NotFound) => "not_found",
        Some(ParseOutcome::SuppressedManual) => "suppressed_manual",
        None => "ignored",
    };

    Ok(([("x-reauth-outcome", label)], response.as_bytes().clone()).into_response())
}

/// A message the user picked in the host UI
#[derive(Debug, Deserialize)]
pub struct SelectedMessage {
    pub url: String,
    #[serde(default)]
    pub raw: String,
}

#[derive(Debug, Deserialize)]
pub struct Selection {
    pub messages: Vec<SelectedMessage>,
}

/// POST /v1/context/scope - Add selected URLs to the scope
async fn context_scope_handler(
    State(state): State<AppState>,
    Json(selection): Json<Selection>,
) -> Result<Json<Value>> {
    let urls = selection
        .messages
        .iter()
        .map(|message| parse_endpoint(&message.url))
        .collect::<Result<Vec<_>>>()?;

    let added = state.engine.add_selection_to_scope(&urls);
    Ok(Json(json!({ "added": added })))
}

/// POST /v1/context/auth-request - Use the selected request for refreshes
async fn context_auth_request_handler(
    State(state): State<AppState>,
    Json(selection): Json<Selection>,
) -> Result<Json<Value>> {
    let requests = selection
        .messages
        .iter()
        .map(|message| RawRequest::parse(parse_endpoint(&message.url)?, message.raw.as_bytes()))
        .collect::<Result<Vec<_>>>()?;

    if !state.engine.set_authorization_request_from_selection(requests) {
        return Err(ReauthError::ValidationError(
            "select exactly one request".to_string(),
        ));
    }
    Ok(Json(json!({ "authorization_url": state.engine.authorization_url().as_str() })))
}

/// POST /v1/context/token - Parse the token from the selected response
async fn context_token_handler(
    State(state): State<AppState>,
    Json(selection): Json<Selection>,
) -> Result<Json<Value>> {
    let responses: Vec<RawResponse> = selection
        .messages
        .into_iter()
        .map(|message| RawResponse::new(message.raw.into_bytes()))
        .collect();

    match state.engine.set_token_from_selection(&responses) {
        Some(outcome) => Ok(Json(outcome_json(Some(&outcome)))),
        None => Err(ReauthError::ValidationError(
            "select exactly one response".to_string(),
        )),
    }
}

/// GET /v1/logs - Engine log entries, oldest first
async fn logs_handler(State(state): State<AppState>) -> Json<Vec<LogEntry>> {
    Json(state.logs.entries())
}

/// DELETE /v1/logs - Clear the engine log
async fn clear_logs_handler(State(state): State<AppState>) -> StatusCode {
    state.logs.clear();
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct LogSettings {
    pub min_level: Option<LogLevel>,
    pub max_entries: Option<usize>,
}

/// PUT /v1/logs/settings - Change the engine log level or length
async fn log_settings_handler(
    State(state): State<AppState>,
    Json(settings): Json<LogSettings>,
) -> Json<Value> {
    if let Some(level) = settings.min_level {
        state.logs.set_min_level(level);
    }
    if let Some(max_entries) = settings.max_entries {
        state.logs.set_capacity(max_entries);
    }

    Json(json!({
        "min_level": state.logs.min_level(),
        "max_entries": state.logs.capacity(),
    }))
}

/// GET /v1/events - Server-sent stream of engine events
async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let receiver = state.events.subscribe();

    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => match Event::default().event("engine").json_data(&event) {
                    Ok(sse) => return Some((Ok::<_, Infallible>(sse), receiver)),
                    Err(e) => tracing::warn!("Failed to encode engine event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged, dropping events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Offline app state for handler and middleware tests
#[cfg(test)]
pub(crate) fn test_state(control_api_key: Option<&str>) -> AppState {
    use crate::config::{CliArgs, Config};
    use crate::http_client::RefreshTransport;
    use async_trait::async_trait;
    use clap::Parser;

    struct OfflineTransport;

    #[async_trait]
    impl RefreshTransport for OfflineTransport {
        async fn send(&self, _request: &RawRequest) -> Result<RawResponse> {
            Err(ReauthError::RefreshTransport("offline".to_string()))
        }
    }

    let config = Config::from_args(CliArgs::try_parse_from(["reauth-proxy"]).unwrap()).unwrap();
    let engine = ReauthEngine::new(config.engine_settings().unwrap(), Arc::new(OfflineTransport))
        .unwrap();
    let events = Arc::new(BroadcastObserver::new(64));
    engine.subscribe(events.clone());

    AppState {
        control_api_key: control_api_key.map(str::to_string),
        engine,
        logs: LogBuffer::default(),
        events,
    }
}
