// Token state machine
//
// Empty -> Cached(token)        on a successful parse
// Empty -> CachedManual(token)  on a manual set
// CachedManual ignores parses unless the manual flag is cleared first.

use regex::Regex;
use serde::Serialize;

/// Fallback used when a header is built without a cached token
pub const NO_TOKEN: &str = "<no token>";

/// Conceptual state, derived from the fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Empty,
    Cached,
    CachedManual,
}

/// Result of running the extraction pattern over a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Parsed(String),
    NotFound,
    /// A manual token is active and the parse was not a manual override
    SuppressedManual,
}

/// The current token and its lazily derived header line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenState {
    token: Option<String>,
    header: Option<String>,
    set_manually: bool,
}

impl TokenState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Memoized header, if one has been built since the last invalidation
    pub fn cached_header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    pub fn is_set_manually(&self) -> bool {
        self.set_manually
    }

    pub fn status(&self) -> TokenStatus {
        match (&self.token, self.set_manually) {
            (None, _) => TokenStatus::Empty,
            (Some(_), false) => TokenStatus::Cached,
            (Some(_), true) => TokenStatus::CachedManual,
        }
    }

    /// Extract capture group 1 of the first match in `text`
    ///
    /// `from_context_menu` clears the manual flag before parsing, so an
    /// explicit user choice of response overrides a manual token.
    pub fn parse_from_response(
        &mut self,
        pattern: &Regex,
        text: &str,
        from_context_menu: bool,
    ) -> ParseOutcome {
        if from_context_menu {
            self.set_manually = false;
        }

        if self.set_manually {
            return ParseOutcome::SuppressedManual;
        }

        let token = pattern
            .captures(text)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string());

        match token {
            Some(token) => {
                self.header = None;
                self.token = Some(token.clone());
                ParseOutcome::Parsed(token)
            }
            None => ParseOutcome::NotFound,
        }
    }

    /// Overwrite the token with a user supplied value
    pub fn set_manual(&mut self, token: String) {
        self.header = None;
        self.token = Some(token);
        self.set_manually = true;
    }

    /// Drop the token and the header; the manual flag goes with it
    pub fn invalidate_token(&mut self) {
        self.token = None;
        self.header = None;
        self.set_manually = false;
    }

    /// Drop only the derived header (header name or prefix changed)
    pub fn invalidate_header(&mut self) {
        self.header = None;
    }

    /// Clear the manual flag without touching the token
    pub fn clear_manual(&mut self) {
        self.set_manually = false;
    }

    /// Return the memoized header, building it on first use
    ///
    /// Returns the header and whether it was freshly built.
    pub fn header(&mut self, header_name: &str, value_prefix: &str) -> (&str, bool) {
        let built = self.header.is_none();
        let token = self.token.as_deref().unwrap_or(NO_TOKEN);
        let header = self
            .header
            .get_or_insert_with(|| format!("{}{}", header_prefix(header_name, value_prefix), token));
        (header.as_str(), built)
    }
}

/// `"{name}: {prefix}"`, the start of every header line this engine owns
pub fn header_prefix(header_name: &str, value_prefix: &str) -> String {
    format!("{}: {}", header_name, value_prefix)
}
