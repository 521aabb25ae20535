use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;

use crate::auth::{
    compile_token_pattern, parse_endpoint, validate_header_name, validate_reauth_interval,
    EngineSettings, DEFAULT_AUTH_URL, DEFAULT_HEADER_NAME, DEFAULT_HEADER_VALUE_PREFIX,
    DEFAULT_TOKEN_REGEX,
};
use crate::log_buffer::LogLevel;
use crate::scope::ScopeRule;
use crate::url_compare::HostMatch;

/// JWT re-authentication engine for intercepting proxies
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Control API host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Control API port
    #[arg(short, long, env = "SERVER_PORT", default_value = "8090")]
    pub port: u16,

    /// Key required on control API calls (disabled when unset)
    #[arg(short = 'k', long, env = "CONTROL_API_KEY")]
    pub api_key: Option<String>,

    /// Authorization endpoint used for token refreshes
    #[arg(short = 'a', long, env = "AUTH_URL", default_value = DEFAULT_AUTH_URL)]
    pub auth_url: String,

    /// Name of the injected header
    #[arg(long, env = "HEADER_NAME", default_value = DEFAULT_HEADER_NAME)]
    pub header_name: String,

    /// Text between the header name and the token
    #[arg(long, env = "HEADER_VALUE_PREFIX", default_value = DEFAULT_HEADER_VALUE_PREFIX)]
    pub header_value_prefix: String,

    /// Token extraction regex, capture group 1 is the token
    #[arg(long, env = "TOKEN_REGEX", default_value = DEFAULT_TOKEN_REGEX)]
    pub token_regex: String,

    /// Start with header injection enabled
    #[arg(short, long, env = "LISTEN", default_value = "false")]
    pub listen: bool,

    /// Refresh debounce delay in milliseconds
    #[arg(long, env = "REFRESH_DEBOUNCE_MS", default_value = "2000")]
    pub refresh_debounce_ms: u64,

    /// Token age in seconds after which a new token is fetched
    #[arg(long, env = "REAUTH_INTERVAL", default_value = "300")]
    pub reauth_interval: u64,

    /// Initial exact-match scope URLs (comma separated)
    #[arg(long, env = "SCOPE_EXACT", value_delimiter = ',')]
    pub scope_exact: Vec<String>,

    /// Initial prefix-match scope URLs (comma separated)
    #[arg(long, env = "SCOPE_PREFIX", value_delimiter = ',')]
    pub scope_prefix: Vec<String>,

    /// Compare hosts even when one side has none
    #[arg(long, env = "STRICT_HOST", default_value = "false")]
    pub strict_host: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Minimum level kept in the engine log (debug, info, error)
    #[arg(long, env = "ENGINE_LOG_LEVEL", default_value = "info")]
    pub engine_log_level: String,

    /// Maximum number of engine log entries
    #[arg(long, env = "MAX_LOG_ENTRIES", default_value = "100000")]
    pub max_log_entries: usize,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "30")]
    pub http_connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Control API authentication
    pub control_api_key: Option<String>,

    // Engine settings
    pub auth_url: String,
    pub header_name: String,
    pub header_value_prefix: String,
    pub token_regex: String,
    pub listen: bool,
    pub refresh_debounce: Duration,
    pub reauth_interval: Duration,
    pub host_match: HostMatch,

    // Scope
    pub scope_exact: Vec<String>,
    pub scope_prefix: Vec<String>,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
    pub engine_log_level: LogLevel,
    pub max_log_entries: usize,
}

impl Config {
    /// Load configuration with priority: CLI > ENV (.env included) > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let engine_log_level = args
            .engine_log_level
            .parse::<LogLevel>()
            .map_err(anyhow::Error::msg)
            .context("Invalid ENGINE_LOG_LEVEL")?;

        Ok(Config {
            server_host: args.host,
            server_port: args.port,

            control_api_key: args.api_key.filter(|key| !key.trim().is_empty()),

            auth_url: args.auth_url,
            header_name: args.header_name,
            header_value_prefix: args.header_value_prefix,
            token_regex: args.token_regex,
            listen: args.listen,
            refresh_debounce: Duration::from_millis(args.refresh_debounce_ms),
            reauth_interval: Duration::from_secs(args.reauth_interval),
            host_match: if args.strict_host {
                HostMatch::Strict
            } else {
                HostMatch::Lenient
            },

            scope_exact: clean_list(args.scope_exact),
            scope_prefix: clean_list(args.scope_prefix),

            http_connect_timeout: args.http_connect_timeout,
            http_request_timeout: args.http_timeout,

            log_level: args.log_level,
            engine_log_level,
            max_log_entries: args.max_log_entries,
        })
    }

    /// Validate configuration with the same rules the engine setters use
    pub fn validate(&self) -> Result<()> {
        parse_endpoint(&self.auth_url).context("Invalid AUTH_URL")?;
        validate_header_name(&self.header_name).context("Invalid HEADER_NAME")?;
        compile_token_pattern(&self.token_regex).context("Invalid TOKEN_REGEX")?;
        validate_reauth_interval(self.reauth_interval).context("Invalid REAUTH_INTERVAL")?;

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        Ok(())
    }

    /// Initial engine settings
    pub fn engine_settings(&self) -> Result<EngineSettings> {
        Ok(EngineSettings {
            authorization_url: parse_endpoint(&self.auth_url).context("Invalid AUTH_URL")?,
            header_name: self.header_name.clone(),
            header_value_prefix: self.header_value_prefix.clone(),
            token_pattern: compile_token_pattern(&self.token_regex)
                .context("Invalid TOKEN_REGEX")?,
            listening: self.listen,
            refresh_debounce: self.refresh_debounce,
            reauth_interval: self.reauth_interval,
            host_match: self.host_match,
        })
    }

    /// Initial scope rules, exact matches first
    pub fn scope_rules(&self) -> Vec<ScopeRule> {
        self.scope_exact
            .iter()
            .map(ScopeRule::exact)
            .chain(self.scope_prefix.iter().map(ScopeRule::prefix))
            .collect()
    }
}

fn clean_list(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::MatchMode;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["reauth-proxy"];
        argv.extend_from_slice(extra);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_args(args(&[])).unwrap();

        assert_eq!(config.auth_url, DEFAULT_AUTH_URL);
        assert_eq!(config.header_name, "Authorization");
        assert_eq!(config.header_value_prefix, "Bearer ");
        assert_eq!(config.refresh_debounce, Duration::from_secs(2));
        assert_eq!(config.reauth_interval, Duration::from_secs(300));
        assert_eq!(config.engine_log_level, LogLevel::Info);
        assert_eq!(config.max_log_entries, 100_000);
        assert_eq!(config.host_match, HostMatch::Lenient);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scope_lists() {
        let config = Config::from_args(args(&[
            "--scope-exact",
            "https://api.example.com/a, ,https://api.example.com/b",
            "--scope-prefix",
            "https://api.example.com/v2/",
        ]))
        .unwrap();

        let rules = config.scope_rules();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].pattern, "https://api.example.com/a");
        assert_eq!(rules[1].mode, MatchMode::Exact);
        assert_eq!(rules[2].mode, MatchMode::Prefix);
    }

    #[test]
    fn test_strict_host_flag() {
        let config = Config::from_args(args(&["--strict-host"])).unwrap();
        assert_eq!(config.host_match, HostMatch::Strict);
    }

    #[test]
    fn test_blank_api_key_disables_control_auth() {
        let config = Config::from_args(args(&["--api-key", "  "])).unwrap();
        assert!(config.control_api_key.is_none());

        let config = Config::from_args(args(&["-k", "secret"])).unwrap();
        assert_eq!(config.control_api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_invalid_engine_log_level() {
        assert!(Config::from_args(args(&["--engine-log-level", "verbose"])).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config::from_args(args(&["--token-regex", "no-group"])).unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_args(args(&["--header-name", "X:Bad"])).unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_args(args(&["--reauth-interval", "2"])).unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_args(args(&["--auth-url", "nope"])).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_settings() {
        let config = Config::from_args(args(&[
            "--auth-url",
            "https://auth.example.com/token",
            "--listen",
            "--refresh-debounce-ms",
            "500",
        ]))
        .unwrap();

        let settings = config.engine_settings().unwrap();
        assert_eq!(settings.authorization_url.as_str(), "https://auth.example.com/token");
        assert!(settings.listening);
        assert_eq!(settings.refresh_debounce, Duration::from_millis(500));
        assert_eq!(settings.token_pattern.as_str(), DEFAULT_TOKEN_REGEX);
    }
}
