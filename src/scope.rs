// Scope matching
// Ordered user-declared rules deciding which requests receive the injected header

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{ReauthError, Result};

/// How a rule's pattern is compared against a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Full string equality
    Exact,
    /// String prefix test
    Prefix,
}

/// A single scope row
///
/// Patterns are compared against the normalised URL string (lower-case host,
/// default port dropped, `/` for an empty path). Rows added through
/// [`ScopeMatcher`] are normalised the same way when they parse as URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRule {
    pub enabled: bool,
    pub mode: MatchMode,
    pub pattern: String,
}

impl ScopeRule {
    /// Enabled exact-match rule
    pub fn exact(pattern: impl Into<String>) -> Self {
        Self {
            enabled: true,
            mode: MatchMode::Exact,
            pattern: pattern.into(),
        }
    }

    /// Enabled prefix-match rule
    pub fn prefix(pattern: impl Into<String>) -> Self {
        Self {
            enabled: true,
            mode: MatchMode::Prefix,
            pattern: pattern.into(),
        }
    }

    /// Rewrite the pattern into the form URLs are compared in
    ///
    /// Patterns that do not parse as `http`/`https` URLs are kept verbatim. A
    /// prefix without a path keeps matching host-only prefixes.
    pub fn normalized(mut self) -> Self {
        let Ok(url) = Url::parse(self.pattern.trim()) else {
            return self;
        };
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return self;
        }

        let has_path = self
            .pattern
            .split_once("://")
            .map_or(false, |(_, rest)| rest.contains('/'));
        let mut pattern = url.as_str().to_string();
        if self.mode == MatchMode::Prefix && !has_path && pattern.ends_with('/') {
            pattern.pop();
        }
        self.pattern = pattern;
        self
    }

    /// Whether this rule matches the URL string, ignoring `enabled`
    pub fn matches(&self, url: &str) -> bool {
        match self.mode {
            MatchMode::Exact => url == self.pattern,
            MatchMode::Prefix => url.starts_with(&self.pattern),
        }
    }
}

/// Filter over the enabled column when listing rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeFilter {
    #[default]
    Any,
    Active,
    Deactivated,
}

impl ScopeFilter {
    pub fn accepts(&self, rule: &ScopeRule) -> bool {
        match self {
            ScopeFilter::Any => true,
            ScopeFilter::Active => rule.enabled,
            ScopeFilter::Deactivated => !rule.enabled,
        }
    }
}

/// Ordered collection of scope rules
///
/// Rules are evaluated on every call; there is no match cache since rows are
/// edited interactively and must take effect immediately.
#[derive(Debug, Clone, Default)]
pub struct ScopeMatcher {
    rules: Vec<ScopeRule>,
}

impl ScopeMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff at least one enabled rule matches
    pub fn in_scope(&self, url: &Url) -> bool {
        self.in_scope_str(url.as_str())
    }

    pub fn in_scope_str(&self, url: &str) -> bool {
        self.rules.iter().any(|rule| rule.enabled && rule.matches(url))
    }

    /// Exact pattern membership, regardless of mode or enabled state
    pub fn contains(&self, url: &Url) -> bool {
        self.rules.iter().any(|rule| rule.pattern == url.as_str())
    }

    /// Append an enabled exact rule for the URL
    pub fn add(&mut self, url: &Url) {
        self.push(ScopeRule::exact(url.as_str()));
    }

    /// Append the URL unless a rule with the same pattern already exists
    pub fn add_if_absent(&mut self, url: &Url) -> bool {
        if self.contains(url) {
            return false;
        }
        self.add(url);
        true
    }

    pub fn push(&mut self, rule: ScopeRule) {
        let rule = rule.normalized();
        tracing::debug!(pattern = %rule.pattern, mode = ?rule.mode, "Added scope rule");
        self.rules.push(rule);
    }

    pub fn update(&mut self, index: usize, rule: ScopeRule) -> Result<()> {
        let slot = self
            .rules
            .get_mut(index)
            .ok_or(ReauthError::ScopeRuleNotFound(index))?;
        *slot = rule.normalized();
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<ScopeRule> {
        if index >= self.rules.len() {
            return Err(ReauthError::ScopeRuleNotFound(index));
        }
        Ok(self.rules.remove(index))
    }

    pub fn rules(&self) -> &[ScopeRule] {
        &self.rules
    }

    /// Rows passing the filter, paired with their index
    pub fn filtered(&self, filter: ScopeFilter) -> Vec<(usize, ScopeRule)> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| filter.accepts(rule))
            .map(|(index, rule)| (index, rule.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
