// src/rules/resp.rs

//! Response-side cachability and TTL: status-code map, header blacklist and
//! content-type refinement.

use crate::rules::{DEFAULT_TTL, RuleSet};
use http::{HeaderMap, StatusCode};
use std::time::Duration;

impl RuleSet {
    /// Decides whether a response is cachable and for how long.
    pub fn is_resp_cachable(&self, status: StatusCode, headers: &HeaderMap) -> Option<Duration> {
        let (ttl, ok, last) = self.status_code_ttl(status);
        if !ok {
            return None;
        }
        if last {
            return Some(ttl);
        }

        if !self.is_valid_resp_header(headers) {
            return None;
        }

        if let Some(ttl) = self.content_type_ttl(ttl, headers) {
            return Some(ttl);
        }

        // By default, we cache the result.
        Some(ttl)
    }

    /// Looks up the status code in the configured TTL map. The third value
    /// marks a terminal decision: only a 200 may be refined further.
    fn status_code_ttl(&self, status: StatusCode) -> (Duration, bool, bool) {
        if self.status_code_ttl.is_empty() {
            return (DEFAULT_TTL, true, false);
        }

        match self.status_code_ttl.get(&status.as_u16()) {
            Some(&ttl) if status == StatusCode::OK => (ttl, true, false),
            Some(&ttl) => (ttl, true, true),
            // The status code is not in the list of cachable content.
            None => (DEFAULT_TTL, false, true),
        }
    }

    fn is_valid_resp_header(&self, headers: &HeaderMap) -> bool {
        if self.resp_headers_blacklist.is_empty() {
            return true;
        }

        for (name, needles) in &self.resp_headers_blacklist {
            let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            if needles.iter().any(|s| value.contains(s)) {
                return false;
            }
        }
        true
    }

    fn content_type_ttl(&self, ttl: Duration, headers: &HeaderMap) -> Option<Duration> {
        let content_type = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())?;

        if self.content_type_ttl.is_empty() {
            return None;
        }

        for (needle, extra) in &self.content_type_ttl {
            if content_type.contains(needle) {
                return Some(ttl + *extra);
            }
        }
        None
    }
}
