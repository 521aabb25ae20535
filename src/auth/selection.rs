// Actions on messages the user picked in the host UI

use reqwest::Url;

use super::manager::ReauthEngine;
use super::token::ParseOutcome;
use crate::message::{RawRequest, RawResponse};

impl ReauthEngine {
    /// Add every selected URL that is not already an exact rule
    ///
    /// Returns the number of rules added.
    pub fn add_selection_to_scope<'a>(&self, urls: impl IntoIterator<Item = &'a Url>) -> usize {
        let mut added = 0;
        for url in urls {
            if self.add_to_scope_if_absent(url) {
                tracing::debug!("Added {} to scope", url);
                added += 1;
            }
        }
        added
    }

    /// Use the selected request as the refresh template
    ///
    /// Only a single selected message is accepted.
    pub fn set_authorization_request_from_selection(&self, mut selected: Vec<RawRequest>) -> bool {
        if selected.len() != 1 {
            tracing::debug!(
                selected = selected.len(),
                "Select exactly one request to use as authorization request"
            );
            return false;
        }

        if let Some(request) = selected.pop() {
            self.set_authorization_request(request);
        }
        true
    }

    /// Take the token from the selected response, even over a manual token
    pub fn set_token_from_selection(&self, selected: &[RawResponse]) -> Option<ParseOutcome> {
        match selected {
            [response] => Some(self.process_auth_response(response, true)),
            _ => {
                tracing::debug!(
                    selected = selected.len(),
                    "Select exactly one response to parse a token from"
                );
                None
            }
        }
    }
}
