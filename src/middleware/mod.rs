// Control key and CORS middleware

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use tower_http::cors::{Any, CorsLayer};

use crate::error::ReauthError;
use crate::routes::AppState;

/// Control key middleware
///
/// Accepts "Bearer {CONTROL_API_KEY}" in the Authorization header or the bare
/// key in x-api-key. Without a configured key every request passes.
pub async fn control_key_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ReauthError> {
    let Some(expected) = state.control_api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let bearer_ok = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|key| key == expected);

    let api_key_ok = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|key| key == expected);

    if bearer_ok || api_key_ok {
        return Ok(next.run(request).await);
    }

    let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    tracing::warn!(
        "[{}] Control API access with invalid or missing key: {} {}",
        request_id,
        request.method(),
        request.uri().path()
    );
    Err(ReauthError::AuthError(
        "Invalid or missing control API key".to_string(),
    ))
}

/// Create CORS middleware layer
///
/// Allows all origins, methods and headers so a browser UI can drive the API.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
