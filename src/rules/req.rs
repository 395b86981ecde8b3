// src/rules/req.rs

//! Request-side cachability: method gate plus path, header and cookie
//! blacklists.

use crate::rules::RuleSet;
use http::{Method, Request};

impl RuleSet {
    /// Decides whether a request may be answered from cache. The second
    /// value is the refresh flag: a cookie-blacklist hit instructs the
    /// caller to evict every device variant of this URL.
    pub fn is_req_cachable<B>(&self, req: &Request<B>) -> (bool, bool) {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return (false, false);
        }

        let path = req.uri().path();

        if self.no_req_ext.iter().any(|v| path.ends_with(v)) {
            return (false, false);
        }
        if self.no_req_path_contains.iter().any(|v| path.contains(v)) {
            return (false, false);
        }
        if self.no_req_path_prefix.iter().any(|v| path.starts_with(v)) {
            return (false, false);
        }
        if self.no_req_path_suffix.iter().any(|v| path.ends_with(v)) {
            return (false, false);
        }
        if !self.is_req_cachable_headers(req) {
            return (false, false);
        }
        if !self.is_req_cachable_cookies(req) {
            // This flag makes the caller drop the current URL from the cache.
            return (false, true);
        }

        (true, false)
    }

    fn is_req_cachable_headers<B>(&self, req: &Request<B>) -> bool {
        for (name, needle) in &self.no_req_headers {
            let found = req
                .headers()
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.contains(needle));
            if found {
                return false;
            }
        }
        true
    }

    fn is_req_cachable_cookies<B>(&self, req: &Request<B>) -> bool {
        if self.no_req_cookie_contains.is_empty() {
            return true;
        }
        for cookie in req.headers().get_all(http::header::COOKIE) {
            let Ok(raw) = cookie.to_str() else { continue };
            for pair in raw.split(';') {
                let name = pair.split('=').next().unwrap_or("").trim();
                if self.no_req_cookie_contains.iter().any(|v| name.contains(v)) {
                    return false;
                }
            }
        }
        true
    }
}
