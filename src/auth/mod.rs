// Re-authentication module
// Token lifecycle, debounced refresh and header injection

mod countdown;
mod manager;
mod refresh;
mod selection;
mod token;
mod types;

pub use countdown::{format_elapsed, Countdown, TIMER_STOPPED};
pub use manager::{EngineSnapshot, ReauthEngine};
pub use refresh::RefreshScheduler;
pub use token::{header_prefix, ParseOutcome, TokenState, TokenStatus, NO_TOKEN};
pub use types::{
    compile_token_pattern, parse_endpoint, placeholder_url, validate_header_name,
    validate_reauth_interval, AuthorizationSource, EngineSettings, Setting, SettingStatus,
    DEFAULT_AUTH_URL, DEFAULT_HEADER_NAME, DEFAULT_HEADER_VALUE_PREFIX, DEFAULT_IS_LISTENING,
    DEFAULT_REAUTH_INTERVAL, DEFAULT_REFRESH_DEBOUNCE, DEFAULT_TOKEN_REGEX, MIN_REAUTH_INTERVAL,
};
