use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Url;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::countdown::{format_elapsed, Countdown};
use super::refresh::RefreshScheduler;
use super::token::{header_prefix, ParseOutcome, TokenState, TokenStatus};
use super::types::{
    compile_token_pattern, parse_endpoint, validate_header_name, validate_reauth_interval,
    AuthorizationSource, EngineSettings, Setting, SettingStatus,
};
use crate::error::Result;
use crate::http_client::RefreshTransport;
use crate::message::{Message, RawRequest, RawResponse};
use crate::observer::{EngineEvent, EngineObserver};
use crate::scope::{ScopeFilter, ScopeMatcher, ScopeRule};
use crate::url_compare::{same_with, HostMatch};

/// How often the token age is checked against the reauthentication interval
const COUNTDOWN_TICK: Duration = Duration::from_millis(500);

/// Everything guarded by the engine lock
struct EngineState {
    source: AuthorizationSource,
    header_name: String,
    header_value_prefix: String,
    token_pattern: Regex,
    listening: bool,
    token: TokenState,
    scope: ScopeMatcher,
    countdown: Countdown,
    reauth_interval: Duration,
    statuses: BTreeMap<Setting, SettingStatus>,
}

/// A mutation in progress: the locked state plus side effects to run once
/// the lock is released
struct Transition<'a> {
    state: &'a mut EngineState,
    events: Vec<EngineEvent>,
    refresh: bool,
}

impl<'a> Transition<'a> {
    fn new(state: &'a mut EngineState) -> Self {
        Self {
            state,
            events: Vec::new(),
            refresh: false,
        }
    }

    fn set_listening(&mut self, listening: bool) {
        if self.state.listening == listening {
            return;
        }

        self.state.listening = listening;
        self.events.push(EngineEvent::ListeningChanged { listening });

        if listening {
            self.refresh = true;
        } else {
            self.invalidate_token();
        }
    }

    /// Drop the token; this always stops header injection
    fn invalidate_token(&mut self) {
        if self.state.listening {
            self.state.listening = false;
            self.events
                .push(EngineEvent::ListeningChanged { listening: false });
        }

        self.state.countdown.stop();
        self.state.token.invalidate_token();
        self.events.push(EngineEvent::TokenChanged {
            token: None,
            set_manually: false,
        });
        self.events.push(EngineEvent::HeaderChanged { header: None });
    }

    fn invalidate_header(&mut self, stop_listening: bool) {
        if stop_listening {
            self.set_listening(false);
        }

        self.state.token.invalidate_header();
        self.events.push(EngineEvent::HeaderChanged { header: None });
    }

    /// Forget the captured request and everything derived from it
    fn invalidate_cached_request(&mut self) {
        self.set_listening(false);

        let url = self.state.source.url().clone();
        self.state.source = AuthorizationSource::Endpoint(url);

        self.invalidate_token();
    }

    /// Notify about a freshly stored token and restart the countdown
    fn token_updated(&mut self, now: DateTime<Utc>) {
        self.events.push(EngineEvent::TokenChanged {
            token: self.state.token.token().map(str::to_string),
            set_manually: self.state.token.is_set_manually(),
        });
        self.events.push(EngineEvent::HeaderChanged { header: None });

        if self.state.listening && self.state.token.has_token() {
            self.state.countdown.start(now);
        } else {
            self.state.countdown.stop();
        }
    }

    /// Memoized header line, built on first use
    fn header(&mut self) -> String {
        let state = &mut *self.state;
        let (header, built) = state
            .token
            .header(&state.header_name, &state.header_value_prefix);
        let header = header.to_string();

        if built {
            self.events.push(EngineEvent::HeaderChanged {
                header: Some(header.clone()),
            });
        }
        header
    }

    fn set_status(&mut self, setting: Setting, status: SettingStatus) {
        if self.state.statuses.insert(setting, status) != Some(status) {
            self.events
                .push(EngineEvent::SettingStatusChanged { setting, status });
        }
    }

    fn parse_response(&mut self, response: &RawResponse, from_context_menu: bool) -> ParseOutcome {
        let text = response.text();
        let state = &mut *self.state;
        let outcome = state
            .token
            .parse_from_response(&state.token_pattern, &text, from_context_menu);

        match &outcome {
            ParseOutcome::Parsed(token) => {
                tracing::info!(
                    "Parsed token \"{}\" from response to authorization URL",
                    token
                );
                self.token_updated(Utc::now());
            }
            ParseOutcome::NotFound => {
                tracing::info!("Failed to parse token from response to authorization URL");
            }
            ParseOutcome::SuppressedManual => {
                tracing::debug!("Token set manually, ignoring auth response");
            }
        }

        outcome
    }
}

/// Read-only view of the engine for the UI layer
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub authorization_url: String,
    pub captured_request: bool,
    pub header_name: String,
    pub header_value_prefix: String,
    pub token_pattern: String,
    pub listening: bool,
    pub token: Option<String>,
    pub token_status: TokenStatus,
    pub header: Option<String>,
    pub token_time_active: String,
    pub reauth_interval_secs: u64,
    pub refresh_debounce_ms: u64,
    pub refresh_stamp: u64,
    pub scope_rules: usize,
    pub statuses: BTreeMap<Setting, SettingStatus>,
}

/// Re-authentication engine
///
/// Single entry point for intercepted messages and configuration changes.
/// All state lives behind one mutex, so every mutation is linearizable; the
/// interception path never waits on the network. Observers are notified after
/// the lock is released.
pub struct ReauthEngine {
    /// Token, scope and settings
    state: Mutex<EngineState>,

    /// Debounces refreshes
    scheduler: RefreshScheduler,

    /// Sends refresh requests
    transport: Arc<dyn RefreshTransport>,

    /// UI subscribers
    observers: RwLock<Vec<Arc<dyn EngineObserver>>>,

    /// Host comparison policy for endpoint equivalence
    host_match: HostMatch,

    /// Countdown ticker, present between start and shutdown
    ticker: Mutex<Option<JoinHandle<()>>>,

    /// Handle to ourselves for deferred work
    this: Weak<ReauthEngine>,
}

impl ReauthEngine {
    /// Create an engine bound to the current tokio runtime
    pub fn new(settings: EngineSettings, transport: Arc<dyn RefreshTransport>) -> Result<Arc<Self>> {
        validate_header_name(&settings.header_name)?;
        validate_reauth_interval(settings.reauth_interval)?;
        let scheduler = RefreshScheduler::new(settings.refresh_debounce)?;

        let state = EngineState {
            source: AuthorizationSource::Endpoint(settings.authorization_url),
            header_name: settings.header_name,
            header_value_prefix: settings.header_value_prefix,
            token_pattern: settings.token_pattern,
            listening: false,
            token: TokenState::new(),
            scope: ScopeMatcher::new(),
            countdown: Countdown::new(),
            reauth_interval: settings.reauth_interval,
            statuses: BTreeMap::new(),
        };

        let engine = Arc::new_cyclic(|this| Self {
            state: Mutex::new(state),
            scheduler,
            transport,
            observers: RwLock::new(Vec::new()),
            host_match: settings.host_match,
            ticker: Mutex::new(None),
            this: this.clone(),
        });

        if settings.listening {
            engine.set_listening(true);
        }

        Ok(engine)
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a mutation under the lock, then notify and schedule outside it
    fn transition<R>(&self, f: impl FnOnce(&mut Transition<'_>) -> R) -> R {
        let (result, events, refresh) = {
            let mut guard = self.lock();
            let mut tx = Transition::new(&mut guard);
            let result = f(&mut tx);
            (result, tx.events, tx.refresh)
        };

        self.notify(&events);
        if refresh {
            self.request_refresh();
        }
        result
    }

    fn notify(&self, events: &[EngineEvent]) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
        for event in events {
            for observer in observers.iter() {
                observer.on_event(event);
            }
        }
    }

    /// Register a UI subscriber
    pub fn subscribe(&self, observer: Arc<dyn EngineObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    // === Lifecycle ===

    /// Start the reauthentication countdown ticker
    pub fn start(&self) {
        let this = self.this.clone();
        let task = self.scheduler.runtime().spawn(async move {
            let mut interval = tokio::time::interval(COUNTDOWN_TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(engine) = this.upgrade() else {
                    break;
                };
                engine.tick(Utc::now());
            }
        });

        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = ticker.replace(task) {
            previous.abort();
        }
        tracing::info!("Re-authentication engine started");
    }

    /// Stop the ticker and turn pending refreshes into no-ops
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        let task = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        tracing::info!("Re-authentication engine stopped");
    }

    /// Check the token age; requests one refresh per token once it is due
    pub fn tick(&self, now: DateTime<Utc>) -> bool {
        self.transition(|tx| {
            let interval = tx.state.reauth_interval;
            let set_manually = tx.state.token.is_set_manually();
            let due = tx.state.countdown.take_due(now, interval, set_manually);
            if due {
                tracing::debug!(
                    interval_secs = interval.as_secs(),
                    "Token reached reauthentication interval"
                );
                tx.refresh = true;
            }
            due
        })
    }

    // === Interception ===

    /// Per-message entry point; requests may come back rewritten
    pub fn process(&self, message: Message) -> Message {
        match message {
            Message::Request(request) => Message::Request(self.handle_request(request)),
            Message::Response { url, response } => {
                self.handle_response(&url, &response);
                Message::Response { url, response }
            }
        }
    }

    /// Inject the header into an in-scope request when a token is cached
    pub fn handle_request(&self, request: RawRequest) -> RawRequest {
        let host_match = self.host_match;
        self.transition(|tx| {
            if !tx.state.listening {
                return request;
            }

            let url = request.url().clone();
            if same_with(&url, tx.state.source.url(), host_match) {
                return request;
            }

            if tx.state.token.has_token() && tx.state.scope.in_scope(&url) {
                tracing::debug!("URL: {} matches scope, adding header", url);
                let prefix = header_prefix(&tx.state.header_name, &tx.state.header_value_prefix);
                let header = tx.header();
                request.replace_header(&prefix, header)
            } else {
                tracing::debug!("Request URL: {} does not match scope, ignoring", url);
                request
            }
        })
    }

    /// Parse the token out of a response from the authorization endpoint
    pub fn handle_response(&self, url: &Url, response: &RawResponse) -> Option<ParseOutcome> {
        let host_match = self.host_match;
        self.transition(|tx| {
            if !tx.state.listening || !same_with(url, tx.state.source.url(), host_match) {
                return None;
            }

            tracing::debug!(
                "Request URL: {} matches authorization URL: {}, attempting to parse token from response",
                url,
                tx.state.source.url()
            );
            Some(tx.parse_response(response, false))
        })
    }

    /// Parse a token from a response regardless of its URL
    ///
    /// `from_context_menu` lets an explicitly chosen response replace a
    /// manually set token.
    pub fn process_auth_response(&self, response: &RawResponse, from_context_menu: bool) -> ParseOutcome {
        self.transition(|tx| tx.parse_response(response, from_context_menu))
    }

    // === Refresh ===

    /// Schedule a debounced refresh; returns the captured stamp
    pub fn request_refresh(&self) -> u64 {
        let this = self.this.clone();
        let stamp = self.scheduler.request_refresh(move || async move {
            match this.upgrade() {
                Some(engine) => engine.refresh_now().await,
                None => Ok(()),
            }
        });

        self.notify(&[EngineEvent::RefreshScheduled { stamp }]);
        stamp
    }

    /// Send the authorization request now and feed the response back in
    pub async fn refresh_now(&self) -> Result<()> {
        let request = self.lock().source.refresh_request();
        let Some(request) = request else {
            tracing::debug!("Authorization URL is still the placeholder, not refreshing");
            return Ok(());
        };

        let response = self.transport.send(&request).await?;

        if self.is_listening() {
            self.handle_response(request.url(), &response);
        } else {
            // nothing else would see this response while not listening
            self.process_auth_response(&response, false);
        }
        Ok(())
    }

    /// Current refresh stamp
    pub fn refresh_stamp(&self) -> u64 {
        self.scheduler.stamp()
    }

    // === Setters ===

    /// Set the authorization endpoint; blank input is ignored
    ///
    /// An equivalent endpoint is a no-op, unless a captured request is active:
    /// then the capture is dropped in favour of a plain GET to the endpoint.
    pub fn set_authorization_url(&self, input: &str) -> Result<()> {
        if input.trim().is_empty() {
            return Ok(());
        }

        let url = match parse_endpoint(input) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!("Failed to set Authorization URL: {} - {}", input, e);
                self.transition(|tx| tx.set_status(Setting::AuthorizationUrl, SettingStatus::Error));
                return Err(e);
            }
        };

        let host_match = self.host_match;
        self.transition(|tx| {
            tx.set_status(Setting::AuthorizationUrl, SettingStatus::Ok);

            if !tx.state.source.is_captured() && same_with(tx.state.source.url(), &url, host_match) {
                return;
            }

            tx.invalidate_cached_request();
            tx.state.source = AuthorizationSource::Endpoint(url.clone());
            tx.events.push(EngineEvent::AuthorizationUrlChanged {
                url: url.to_string(),
            });
            tracing::debug!("Set new Authorization URL: {}", url);
            tx.refresh = true;
        });
        Ok(())
    }

    /// Use a captured request as the refresh template
    ///
    /// Always invalidates: the same URL may carry different headers or body.
    pub fn set_authorization_request(&self, request: RawRequest) {
        self.transition(|tx| {
            tx.invalidate_cached_request();

            let url = request.url().to_string();
            tx.state.token.clear_manual();
            tx.state.source = AuthorizationSource::Captured(request);
            tx.events.push(EngineEvent::AuthorizationUrlChanged { url });
            tracing::debug!("Set new Authorization Request");
            tx.refresh = true;
        });
    }

    /// Set the injected header's name; blank input is ignored
    pub fn set_header_name(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Ok(());
        }

        if let Err(e) = validate_header_name(name) {
            tracing::error!("Failed to set header name: {}", e);
            self.transition(|tx| tx.set_status(Setting::HeaderName, SettingStatus::Error));
            return Err(e);
        }

        self.transition(|tx| {
            tx.set_status(Setting::HeaderName, SettingStatus::Ok);
            if tx.state.header_name == name {
                return;
            }

            tx.invalidate_header(true);
            tx.state.header_name = name.to_string();
            tracing::debug!("Set new Header Name: {}", name);
        });
        Ok(())
    }

    /// Set the text placed between `"{name}: "` and the token
    pub fn set_header_value_prefix(&self, prefix: &str) {
        if !prefix.ends_with(' ') {
            tracing::info!("Header value prefix does not end with a space, this might be a mistake");
        }

        self.transition(|tx| {
            tx.set_status(Setting::HeaderValuePrefix, SettingStatus::Ok);
            if tx.state.header_value_prefix == prefix {
                return;
            }

            tx.invalidate_header(true);
            tx.state.header_value_prefix = prefix.to_string();
            tracing::debug!("Set new Header Value Prefix: {}", prefix);
        });
    }

    /// Set the token extraction expression; the old one stays on error
    pub fn set_token_pattern(&self, pattern: &str) -> Result<()> {
        let regex = match compile_token_pattern(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                tracing::error!("Failed to set new Token Regex: {} - {}", pattern, e);
                self.transition(|tx| tx.set_status(Setting::TokenPattern, SettingStatus::Error));
                return Err(e);
            }
        };

        self.transition(|tx| {
            tx.set_status(Setting::TokenPattern, SettingStatus::Ok);
            if tx.state.token_pattern.as_str() == regex.as_str() {
                return;
            }

            tx.invalidate_token();
            tx.state.token_pattern = regex;
            tracing::debug!("Set new Token Regex: {}", pattern);
        });
        Ok(())
    }

    /// Turn header injection on (and fetch a token) or off (and drop it)
    pub fn set_listening(&self, listening: bool) {
        self.transition(|tx| {
            tx.set_listening(listening);
            tracing::debug!("Set listening = {}", listening);
        });
    }

    /// Store a user supplied token; it wins over parsed tokens until cleared
    pub fn set_manual_token(&self, token: impl Into<String>) {
        let token = token.into();
        self.transition(|tx| {
            tracing::debug!("Token set manually: token = \"{}\"", token);
            tx.state.token.set_manual(token);
            tx.token_updated(Utc::now());
        });
    }

    /// Token age after which a new token is requested
    pub fn set_reauth_interval(&self, interval: Duration) -> Result<()> {
        if let Err(e) = validate_reauth_interval(interval) {
            tracing::error!("Failed to set reauthentication interval: {}", e);
            self.transition(|tx| tx.set_status(Setting::ReauthInterval, SettingStatus::Error));
            return Err(e);
        }

        self.transition(|tx| {
            tx.set_status(Setting::ReauthInterval, SettingStatus::Ok);
            tx.state.reauth_interval = interval;
            tracing::debug!("Set delay = {}", interval.as_secs());
        });
        Ok(())
    }

    pub fn set_refresh_debounce(&self, delay: Duration) {
        self.scheduler.set_delay(delay);
    }

    // === Getters ===

    pub fn token(&self) -> Option<String> {
        self.lock().token.token().map(str::to_string)
    }

    /// Header text as last built, if any
    pub fn header(&self) -> Option<String> {
        self.lock().token.cached_header().map(str::to_string)
    }

    /// Build (or reuse) the header line from the current settings
    pub fn make_header(&self) -> String {
        self.transition(|tx| tx.header())
    }

    pub fn is_listening(&self) -> bool {
        self.lock().listening
    }

    pub fn is_token_set_manually(&self) -> bool {
        self.lock().token.is_set_manually()
    }

    pub fn authorization_url(&self) -> Url {
        self.lock().source.url().clone()
    }

    pub fn has_captured_request(&self) -> bool {
        self.lock().source.is_captured()
    }

    pub fn status(&self, setting: Setting) -> Option<SettingStatus> {
        self.lock().statuses.get(&setting).copied()
    }

    /// Age of the current token while the countdown runs
    pub fn token_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.lock().countdown.elapsed(now)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let now = Utc::now();
        let state = self.lock();
        EngineSnapshot {
            authorization_url: state.source.url().to_string(),
            captured_request: state.source.is_captured(),
            header_name: state.header_name.clone(),
            header_value_prefix: state.header_value_prefix.clone(),
            token_pattern: state.token_pattern.as_str().to_string(),
            listening: state.listening,
            token: state.token.token().map(str::to_string),
            token_status: state.token.status(),
            header: state.token.cached_header().map(str::to_string),
            token_time_active: format_elapsed(state.countdown.elapsed(now)),
            reauth_interval_secs: state.reauth_interval.as_secs(),
            refresh_debounce_ms: self.scheduler.delay().as_millis() as u64,
            refresh_stamp: self.scheduler.stamp(),
            scope_rules: state.scope.len(),
            statuses: state.statuses.clone(),
        }
    }

    // === Scope ===

    pub fn in_scope(&self, url: &Url) -> bool {
        self.lock().scope.in_scope(url)
    }

    pub fn scope_contains(&self, url: &Url) -> bool {
        self.lock().scope.contains(url)
    }

    /// Add the URL as an enabled exact rule
    pub fn add_to_scope(&self, url: &Url) {
        self.lock().scope.add(url);
    }

    /// Add the URL unless a rule with that exact pattern exists
    pub fn add_to_scope_if_absent(&self, url: &Url) -> bool {
        self.lock().scope.add_if_absent(url)
    }

    pub fn add_scope_rule(&self, rule: ScopeRule) {
        self.lock().scope.push(rule);
    }

    pub fn update_scope_rule(&self, index: usize, rule: ScopeRule) -> Result<()> {
        self.lock().scope.update(index, rule)
    }

    pub fn remove_scope_rule(&self, index: usize) -> Result<ScopeRule> {
        self.lock().scope.remove(index)
    }

    pub fn scope_rules(&self, filter: ScopeFilter) -> Vec<(usize, ScopeRule)> {
        self.lock().scope.filtered(filter)
    }
}

impl Drop for ReauthEngine {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        if let Some(task) = self
            .ticker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
