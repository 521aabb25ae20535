// Endpoint equivalence
// Decides whether two URLs address the same authorization target

use reqwest::Url;
use serde::{Deserialize, Serialize};

/// How host names are compared when deciding endpoint equivalence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostMatch {
    /// A missing host on either side is treated as a match (default)
    #[default]
    Lenient,

    /// Hosts must be present on both sides and equal, or absent on both
    Strict,
}

/// Effective port: the explicit port, or the scheme's registered default
pub fn effective_port(url: &Url) -> Option<u16> {
    url.port_or_known_default()
}

/// Compare two URLs for "same logical endpoint" using lenient host matching
///
/// Checks, in order, stopping at the first mismatch:
/// - effective port
/// - path (case-sensitive, no normalization beyond URL parsing)
/// - host (skipped if either side has no host)
/// - scheme
pub fn same(a: &Url, b: &Url) -> bool {
    same_with(a, b, HostMatch::Lenient)
}

/// Compare two URLs for "same logical endpoint" with an explicit host policy
pub fn same_with(a: &Url, b: &Url, host_match: HostMatch) -> bool {
    if effective_port(a) != effective_port(b) {
        return false;
    }

    if a.path() != b.path() {
        return false;
    }

    match (a.host_str(), b.host_str()) {
        (Some(a_host), Some(b_host)) if a_host != b_host => return false,
        (Some(_), None) | (None, Some(_)) if host_match == HostMatch::Strict => return false,
        _ => {}
    }

    a.scheme() == b.scheme()
}
