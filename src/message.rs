// Raw HTTP message records handed over by the intercepting host
//
// The host owns the wire protocol; these types only split a message into its
// start line, header lines and body so header lines can be rewritten while the
// body bytes stay untouched.

use bytes::{Bytes, BytesMut};
use reqwest::Url;
use std::borrow::Cow;

use crate::error::{ReauthError, Result};

const CRLF: &str = "\r\n";

/// Split a raw message into (start line, header lines, body offset)
fn split_head(raw: &[u8]) -> Result<(String, Vec<String>, usize)> {
    if raw.is_empty() {
        return Err(ReauthError::MalformedMessage("empty message".to_string()));
    }

    // The head ends at whichever blank line comes first
    let crlf = find(raw, b"\r\n\r\n").map(|pos| (pos, pos + 4));
    let lf = find(raw, b"\n\n").map(|pos| (pos, pos + 2));
    let (head_end, body_offset) = match (crlf, lf) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => (raw.len(), raw.len()),
    };

    let head = String::from_utf8_lossy(&raw[..head_end]);
    let mut lines = head.lines().map(|line| line.trim_end_matches('\r').to_string());

    let start_line = lines
        .next()
        .filter(|line| !line.trim().is_empty())
        .ok_or_else(|| ReauthError::MalformedMessage("missing start line".to_string()))?;

    Ok((start_line, lines.collect(), body_offset))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn header_value<'a>(headers: &'a [String], name: &str) -> Option<&'a str> {
    headers.iter().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim_start())
    })
}

/// An intercepted (or captured) HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    url: Url,
    request_line: String,
    headers: Vec<String>,
    body: Bytes,
}

impl RawRequest {
    /// Parse raw request bytes; `url` is the endpoint resolved by the host
    pub fn parse(url: Url, raw: &[u8]) -> Result<Self> {
        let (request_line, headers, body_offset) = split_head(raw)?;

        Ok(Self {
            url,
            request_line,
            headers,
            body: Bytes::copy_from_slice(&raw[body_offset..]),
        })
    }

    /// Minimal GET to an endpoint, used when no request was captured
    pub fn get(url: Url) -> Self {
        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        let mut headers = Vec::new();
        if let Some(host) = url.host_str() {
            let host = match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            headers.push(format!("Host: {}", host));
        }

        Self {
            url,
            request_line: format!("GET {} HTTP/1.1", target),
            headers,
            body: Bytes::new(),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn request_line(&self) -> &str {
        &self.request_line
    }

    pub fn method(&self) -> &str {
        self.request_line.split_whitespace().next().unwrap_or("GET")
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// First header value with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Rebuild with a new header list; the body is kept verbatim
    pub fn with_headers(self, headers: Vec<String>) -> Self {
        Self { headers, ..self }
    }

    /// Drop every header line starting with `prefix`, then append `line`
    pub fn replace_header(self, prefix: &str, line: String) -> Self {
        let mut headers: Vec<String> = self
            .headers
            .iter()
            .filter(|header| !header.starts_with(prefix))
            .cloned()
            .collect();
        headers.push(line);
        self.with_headers(headers)
    }

    /// Serialize back to wire bytes
    pub fn to_bytes(&self) -> Bytes {
        build_message(&self.request_line, &self.headers, &self.body)
    }
}

/// A response seen by the host (or returned by the refresh transport)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    raw: Bytes,
}

impl RawResponse {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn from_parts(status_line: &str, headers: &[String], body: &[u8]) -> Self {
        Self {
            raw: build_message(status_line, headers, body),
        }
    }

    /// Entire message as text, the input for token extraction
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }

    /// Status code from the status line, if well formed
    pub fn status(&self) -> Option<u16> {
        let (status_line, _, _) = split_head(&self.raw).ok()?;
        status_line.split_whitespace().nth(1)?.parse().ok()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        let (_, headers, _) = split_head(&self.raw).ok()?;
        header_value(&headers, name).map(str::to_string)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }
}

/// Intercepted message in either direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(RawRequest),
    Response { url: Url, response: RawResponse },
}

impl Message {
    pub fn url(&self) -> &Url {
        match self {
            Message::Request(request) => request.url(),
            Message::Response { url, .. } => url,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }
}

fn build_message(start_line: &str, headers: &[String], body: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(start_line.as_bytes());
    buf.extend_from_slice(CRLF.as_bytes());
    for header in headers {
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());
    }
    buf.extend_from_slice(CRLF.as_bytes());
    buf.extend_from_slice(body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_parse_request() {
        let raw = b"POST /api/items HTTP/1.1\r\nHost: a.com\r\nContent-Type: application/json\r\n\r\n{\"a\":1}";
        let request = RawRequest::parse(url("https://a.com/api/items"), raw).unwrap();

        assert_eq!(request.method(), "POST");
        assert_eq!(request.request_line(), "POST /api/items HTTP/1.1");
        assert_eq!(request.headers().len(), 2);
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.body().as_ref(), b"{\"a\":1}");
    }

    #[test]
    fn test_parse_request_without_body() {
        let raw = b"GET / HTTP/1.1\r\nHost: a.com";
        let request = RawRequest::parse(url("https://a.com/"), raw).unwrap();
        assert_eq!(request.headers(), &["Host: a.com".to_string()]);
        assert!(request.body().is_empty());
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(matches!(
            RawRequest::parse(url("https://a.com/"), b""),
            Err(ReauthError::MalformedMessage(_))
        ));
        assert!(matches!(
            RawRequest::parse(url("https://a.com/"), b"\r\n\r\nbody"),
            Err(ReauthError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_replace_header_keeps_body_bytes() {
        let body: &[u8] = &[0x00, 0xff, 0x10, b'\r', b'\n', b'\r', b'\n', 0x7f];
        let mut raw = b"PUT /blob HTTP/1.1\r\nHost: a.com\r\nAuthorization: Bearer old\r\nX-Other: 1\r\n\r\n".to_vec();
        raw.extend_from_slice(body);

        let request = RawRequest::parse(url("https://a.com/blob"), &raw).unwrap();
        let request = request.replace_header("Authorization: Bearer ", "Authorization: Bearer new".to_string());

        assert_eq!(
            request.headers(),
            &[
                "Host: a.com".to_string(),
                "X-Other: 1".to_string(),
                "Authorization: Bearer new".to_string(),
            ]
        );
        assert_eq!(request.body().as_ref(), body);

        let rebuilt = request.to_bytes();
        assert!(rebuilt.ends_with(body));
        assert!(rebuilt.starts_with(b"PUT /blob HTTP/1.1\r\nHost: a.com\r\nX-Other: 1\r\n"));
    }

    #[test]
    fn test_lf_head_with_crlf_blank_line_in_body() {
        let raw = b"POST /x HTTP/1.1\nHost: a.com\nAuthorization: Bearer old\n\nline1\r\n\r\nline2";
        let request = RawRequest::parse(url("https://a.com/x"), raw).unwrap();

        assert_eq!(
            request.headers(),
            &["Host: a.com".to_string(), "Authorization: Bearer old".to_string()]
        );
        assert_eq!(request.body().as_ref(), b"line1\r\n\r\nline2");

        let request = request.replace_header("Authorization: Bearer ", "Authorization: Bearer new".to_string());
        assert_eq!(request.header("authorization"), Some("Bearer new"));
        assert!(request.to_bytes().ends_with(b"\r\n\r\nline1\r\n\r\nline2"));
    }

    #[test]
    fn test_crlf_head_with_lf_blank_line_in_body() {
        let raw = b"POST /x HTTP/1.1\r\nHost: a.com\r\n\r\na\n\nb";
        let request = RawRequest::parse(url("https://a.com/x"), raw).unwrap();
        assert_eq!(request.headers(), &["Host: a.com".to_string()]);
        assert_eq!(request.body().as_ref(), b"a\n\nb");
    }

    #[test]
    fn test_replace_header_only_matches_full_prefix() {
        let raw = b"GET / HTTP/1.1\r\nAuthorization: Basic abc\r\n\r\n";
        let request = RawRequest::parse(url("https://a.com/"), raw).unwrap();
        let request = request.replace_header("Authorization: Bearer ", "Authorization: Bearer t".to_string());

        assert_eq!(request.headers().len(), 2);
        assert_eq!(request.headers()[0], "Authorization: Basic abc");
    }

    #[test]
    fn test_synthesized_get() {
        let request = RawRequest::get(url("https://auth.a.com:8443/token?x=1"));
        assert_eq!(request.request_line(), "GET /token?x=1 HTTP/1.1");
        assert_eq!(request.header("host"), Some("auth.a.com:8443"));
        assert!(request.body().is_empty());

        let request = RawRequest::get(url("https://auth.a.com/token"));
        assert_eq!(request.header("Host"), Some("auth.a.com"));
    }

    #[test]
    fn test_response_accessors() {
        let response = RawResponse::from_parts(
            "HTTP/1.1 200 OK",
            &["Content-Type: application/json".to_string()],
            br#"{"access_token": "abc"}"#,
        );

        assert_eq!(response.status(), Some(200));
        assert_eq!(response.header("content-type").as_deref(), Some("application/json"));
        assert!(response.text().ends_with(r#"{"access_token": "abc"}"#));
    }

    #[test]
    fn test_message_url() {
        let request = RawRequest::get(url("https://a.com/x"));
        let message = Message::Request(request);
        assert!(message.is_request());
        assert_eq!(message.url().as_str(), "https://a.com/x");

        let message = Message::Response {
            url: url("https://a.com/y"),
            response: RawResponse::new("HTTP/1.1 204 No Content\r\n\r\n"),
        };
        assert!(!message.is_request());
        assert_eq!(message.url().path(), "/y");
    }
}
