// src/rules/mod.rs

//! The cache-rules evaluator: a read-mostly predicate over requests and
//! responses deciding cachability and TTL, with optional per-host overrides.

mod req;
mod resp;

use crate::core::ProxyError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub(crate) const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// One set of request/response predicates. TTL maps are written as humantime
/// strings in the rules file and converted by [`RuleSet::parse`] at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    // Request related blacklists.
    pub no_req_ext: Vec<String>,
    pub no_req_path_prefix: Vec<String>,
    pub no_req_path_suffix: Vec<String>,
    pub no_req_path_contains: Vec<String>,
    pub no_req_cookie_contains: Vec<String>,
    pub no_req_headers: HashMap<String, String>,

    // Headers that condition the cache, blacklist.
    pub resp_headers_blacklist: HashMap<String, Vec<String>>,

    pub resp_content_type_ttl: HashMap<String, String>,
    pub resp_status_code_ttl: HashMap<String, String>,

    /// Filled by [`RuleSet::parse`] from `resp_content_type_ttl`.
    #[serde(skip)]
    pub content_type_ttl: HashMap<String, Duration>,
    /// Filled by [`RuleSet::parse`] from `resp_status_code_ttl`.
    #[serde(skip)]
    pub status_code_ttl: HashMap<u16, Duration>,
}

impl RuleSet {
    /// Converts the string TTL maps into their Duration form. Invalid
    /// durations are fatal; status codes below 100 are ignored.
    pub fn parse(&mut self) -> Result<(), ProxyError> {
        self.status_code_ttl = HashMap::new();
        for (k, v) in &self.resp_status_code_ttl {
            let code: u16 = k.parse().unwrap_or(0);
            if code < 100 {
                continue;
            }
            let ttl = humantime::parse_duration(v).map_err(|err| {
                ProxyError::Config(format!("resp_status_code_ttl {code}: {err}"))
            })?;
            self.status_code_ttl.insert(code, ttl);
        }

        self.content_type_ttl = HashMap::new();
        for (k, v) in &self.resp_content_type_ttl {
            let ttl = humantime::parse_duration(v)
                .map_err(|err| ProxyError::Config(format!("resp_content_type_ttl {k}: {err}")))?;
            self.content_type_ttl.insert(k.clone(), ttl);
        }

        Ok(())
    }
}

/// The full rule structure: global rules plus per-host overrides, consulted
/// only when the global rules deemed the request cachable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Rules {
    #[serde(flatten)]
    pub rules: RuleSet,
    pub domain: HashMap<String, RuleSet>,
}

impl Rules {
    /// Loads and validates a rules file. Failures here abort startup.
    pub fn from_file(path: &Path) -> Result<Self, ProxyError> {
        let raw = std::fs::read_to_string(path)?;
        let mut rules: Rules = toml::from_str(&raw)?;
        rules.parse()?;
        Ok(rules)
    }

    pub fn parse(&mut self) -> Result<(), ProxyError> {
        self.rules.parse()?;
        for ruleset in self.domain.values_mut() {
            ruleset.parse()?;
        }
        Ok(())
    }

    /// The override rule set for a host, if one is configured.
    pub fn domain_rules(&self, host: &str) -> Option<&RuleSet> {
        self.domain.get(host)
    }
}
