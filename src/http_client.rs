use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method};
use std::time::Duration;

use crate::error::{ReauthError, Result};
use crate::message::{RawRequest, RawResponse};

/// Headers the client manages itself when replaying a captured request
const SKIPPED_REPLAY_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    // responses must stay readable for token extraction
    "accept-encoding",
];

/// Outbound side of a refresh: send a request, hand back the response
#[async_trait]
pub trait RefreshTransport: Send + Sync {
    async fn send(&self, request: &RawRequest) -> Result<RawResponse>;
}

/// Refresh transport backed by a pooled reqwest client
///
/// Sends exactly once; retrying is left to the next refresh trigger.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: u64, request_timeout: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl RefreshTransport for ReqwestTransport {
    async fn send(&self, request: &RawRequest) -> Result<RawResponse> {
        let method = Method::from_bytes(request.method().as_bytes())
            .map_err(|e| ReauthError::MalformedMessage(format!("invalid method: {}", e)))?;
        let url = request.url().clone();

        tracing::debug!(method = %method, url = %url, "Sending refresh request");

        let mut builder = self.client.request(method, url.clone());
        for line in request.headers() {
            let Some((name, value)) = line.split_once(':') else {
                tracing::warn!(header = %line, "Skipping malformed header line");
                continue;
            };
            let name = name.trim();
            if SKIPPED_REPLAY_HEADERS
                .iter()
                .any(|skipped| name.eq_ignore_ascii_case(skipped))
            {
                continue;
            }
            builder = builder.header(name, value.trim());
        }
        if !request.body().is_empty() {
            builder = builder.body(request.body().clone());
        }

        let response = builder.send().await.map_err(|e| {
            let error_kind = if e.is_timeout() {
                "timeout"
            } else if e.is_connect() {
                "connection_failed"
            } else if e.is_request() {
                "request_error"
            } else {
                "unknown"
            };
            tracing::warn!(error_kind, error = %e, url = %url, "Refresh request error");
            ReauthError::RefreshTransport(format!("{} (kind: {})", e, error_kind))
        })?;

        let status = response.status();
        let status_line = format!(
            "{:?} {} {}",
            response.version(),
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        let headers: Vec<String> = response
            .headers()
            .iter()
            .map(|(name, value)| format!("{}: {}", name, String::from_utf8_lossy(value.as_bytes())))
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| ReauthError::RefreshTransport(format!("failed to read body: {}", e)))?;

        tracing::debug!(status = %status, bytes = body.len(), "Received refresh response");

        Ok(RawResponse::from_parts(status_line.trim_end(), &headers, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;

    fn request_to(server: &mockito::Server, raw: &[u8]) -> RawRequest {
        let url = Url::parse(&format!("{}/oauth/token", server.url())).unwrap();
        RawRequest::parse(url, raw).unwrap()
    }

    #[tokio::test]
    async fn test_replays_captured_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_header("x-client", "reauth")
            .match_body("grant_type=refresh_token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "fresh"}"#)
            .create_async()
            .await;

        let request = request_to(
            &server,
            b"POST /oauth/token HTTP/1.1\r\nHost: ignored\r\nX-Client: reauth\r\nContent-Length: 24\r\n\r\ngrant_type=refresh_token",
        );

        let transport = ReqwestTransport::new(5, 10).unwrap();
        let response = transport.send(&request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.status(), Some(200));
        assert!(response.text().contains(r#""access_token": "fresh""#));
        assert_eq!(response.header("content-type").as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_synthesized_get() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/oauth/token")
            .with_status(200)
            .with_body("token=abc")
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/oauth/token", server.url())).unwrap();
        let transport = ReqwestTransport::new(5, 10).unwrap();
        let response = transport.send(&RawRequest::get(url)).await.unwrap();

        mock.assert_async().await;
        assert!(response.text().ends_with("token=abc"));
    }

    #[tokio::test]
    async fn test_error_status_is_returned_not_failed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/oauth/token")
            .with_status(401)
            .with_body("expired")
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/oauth/token", server.url())).unwrap();
        let transport = ReqwestTransport::new(5, 10).unwrap();
        let response = transport.send(&RawRequest::get(url)).await.unwrap();
        assert_eq!(response.status(), Some(401));
    }

    #[tokio::test]
    async fn test_connection_failure_is_transport_error() {
        // nothing listens on port 9 locally
        let url = Url::parse("http://127.0.0.1:9/oauth/token").unwrap();
        let transport = ReqwestTransport::new(1, 2).unwrap();
        let result = transport.send(&RawRequest::get(url)).await;
        assert!(matches!(result, Err(ReauthError::RefreshTransport(_))));
    }
}
