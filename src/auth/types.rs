// Authentication types

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ReauthError, Result};
use crate::message::RawRequest;
use crate::url_compare::HostMatch;

/// Placeholder authorization endpoint; never refreshed against
pub const DEFAULT_AUTH_URL: &str = "https://domain.sld.tld:443/path";
pub const DEFAULT_HEADER_NAME: &str = "Authorization";
pub const DEFAULT_HEADER_VALUE_PREFIX: &str = "Bearer ";
pub const DEFAULT_TOKEN_REGEX: &str = r#""access_token":\s?"([^"]*)""#;
pub const DEFAULT_IS_LISTENING: bool = false;

/// Debounce window between a refresh request and the refresh itself
pub const DEFAULT_REFRESH_DEBOUNCE: Duration = Duration::from_secs(2);

/// Token age after which a fresh token is requested
pub const DEFAULT_REAUTH_INTERVAL: Duration = Duration::from_secs(300);
pub const MIN_REAUTH_INTERVAL: Duration = Duration::from_secs(5);

/// Where refresh requests are sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationSource {
    /// Full request template captured by the user
    Captured(RawRequest),

    /// Synthesized minimal GET to a configured endpoint
    Endpoint(Url),
}

impl AuthorizationSource {
    pub fn url(&self) -> &Url {
        match self {
            AuthorizationSource::Captured(request) => request.url(),
            AuthorizationSource::Endpoint(url) => url,
        }
    }

    /// Request to send for a refresh, `None` for the placeholder endpoint
    pub fn refresh_request(&self) -> Option<RawRequest> {
        match self {
            AuthorizationSource::Captured(request) => Some(request.clone()),
            AuthorizationSource::Endpoint(url) if url.as_str() == placeholder_url().as_str() => None,
            AuthorizationSource::Endpoint(url) => Some(RawRequest::get(url.clone())),
        }
    }

    pub fn is_captured(&self) -> bool {
        matches!(self, AuthorizationSource::Captured(_))
    }
}

/// User-editable settings with a status indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Setting {
    AuthorizationUrl,
    HeaderName,
    HeaderValuePrefix,
    TokenPattern,
    ReauthInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingStatus {
    Ok,
    Error,
}

/// Initial engine configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub authorization_url: Url,
    pub header_name: String,
    pub header_value_prefix: String,
    pub token_pattern: Regex,
    pub listening: bool,
    pub refresh_debounce: Duration,
    pub reauth_interval: Duration,
    pub host_match: HostMatch,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            authorization_url: placeholder_url(),
            header_name: DEFAULT_HEADER_NAME.to_string(),
            header_value_prefix: DEFAULT_HEADER_VALUE_PREFIX.to_string(),
            token_pattern: default_token_pattern(),
            listening: DEFAULT_IS_LISTENING,
            refresh_debounce: DEFAULT_REFRESH_DEBOUNCE,
            reauth_interval: DEFAULT_REAUTH_INTERVAL,
            host_match: HostMatch::Lenient,
        }
    }
}

/// The default authorization endpoint, parsed
pub fn placeholder_url() -> Url {
    Url::parse(DEFAULT_AUTH_URL).expect("placeholder URL is valid")
}

fn default_token_pattern() -> Regex {
    Regex::new(DEFAULT_TOKEN_REGEX).expect("default token regex is valid")
}

/// Parse an endpoint string; only absolute `http`/`https` URLs with a host
pub fn parse_endpoint(input: &str) -> Result<Url> {
    let malformed = |reason: String| ReauthError::MalformedEndpoint {
        input: input.to_string(),
        reason,
    };

    let url = Url::parse(input.trim()).map_err(|e| malformed(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(malformed(format!("unsupported scheme {:?}", url.scheme())));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(malformed("missing host".to_string()));
    }
    Ok(url)
}

/// Compile a token extraction expression; it must have capture group 1
pub fn compile_token_pattern(pattern: &str) -> Result<Regex> {
    let regex = Regex::new(pattern).map_err(|e| ReauthError::PatternCompile(e.to_string()))?;
    if regex.captures_len() < 2 {
        return Err(ReauthError::PatternCompile(format!(
            "pattern {:?} has no capture group for the token",
            pattern
        )));
    }
    Ok(regex)
}

/// Header names end at the first colon, so a colon can never be part of one
pub fn validate_header_name(name: &str) -> Result<()> {
    if name.contains(':') {
        return Err(ReauthError::InvalidHeaderName(format!(
            "{:?} cannot contain \":\"",
            name
        )));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(ReauthError::InvalidHeaderName(format!(
            "{:?} cannot contain whitespace",
            name
        )));
    }
    Ok(())
}

pub fn validate_reauth_interval(interval: Duration) -> Result<()> {
    if interval < MIN_REAUTH_INTERVAL {
        return Err(ReauthError::InvalidInterval(format!(
            "{}s is below the minimum of {}s",
            interval.as_secs(),
            MIN_REAUTH_INTERVAL.as_secs()
        )));
    }
    Ok(())
}
