// src/config.rs

//! Manages proxy configuration: loading, parsing and validation.

use crate::core::ProxyError;
use crate::lsm::LsmConfig;
use serde::Deserialize;
use std::path::Path;

/// Top-level server configuration, decoded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plaintext listen addresses.
    pub listen: Vec<String>,
    /// TLS listen addresses; certificates come from `certs.pem`.
    pub listen_tls: Vec<String>,
    /// Bind one SO_REUSEPORT listener per CPU.
    pub reuse: bool,
    pub debug: bool,
    /// Prometheus exporter port; 0 disables the exporter.
    pub metrics_port: u16,
    /// Unix socket path for the JSON access-log publisher; empty disables it.
    pub log_socket: String,
    pub certs: CertsConfig,
    pub handler: HandlerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: vec!["0.0.0.0:8080".to_string()],
            listen_tls: vec![],
            reuse: false,
            debug: false,
            metrics_port: default_metrics_port(),
            log_socket: String::new(),
            certs: CertsConfig::default(),
            handler: HandlerConfig::default(),
        }
    }
}

/// Certificate configuration. Only `pem` is acted on here (the TLS listener
/// key material); the ACME/etcd fields belong to the external cert provider
/// and are decoded for it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CertsConfig {
    pub ca: String,
    pub email: String,
    /// `cert.pem:key.pem` pairs for the TLS listeners.
    pub pem: Vec<String>,
    pub etcd_endpoints: Vec<String>,
    pub alt_http_port: u16,
    pub alt_tls_alpn_port: u16,
}

/// Configuration of the cache-aware HTTP handler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    pub backend_host: String,
    pub backend_port: u16,
    pub backend_tls_host: String,
    pub backend_tls_port: u16,
    /// Coalesce concurrent misses for one fingerprint into one backend call.
    pub backend_once: bool,
    /// Host suffix stripped before forwarding, replaced by the backend port.
    pub domain_suffix: String,
    /// Per-IP requests per second towards the backend.
    pub rate_limit: u32,
    pub req_remove_headers: Vec<String>,
    pub resp_remove_headers: Vec<String>,
    /// Response headers copied into the request log record.
    pub custom_tags: Vec<String>,
    pub debug: bool,
    pub cache: LsmConfig,
}

pub(crate) fn default_rate_limit() -> u32 {
    8
}

fn default_metrics_port() -> u16 {
    2112
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            backend_host: "127.0.0.1".to_string(),
            backend_port: 8081,
            backend_tls_host: String::new(),
            backend_tls_port: 0,
            backend_once: false,
            domain_suffix: String::new(),
            rate_limit: default_rate_limit(),
            req_remove_headers: vec![],
            resp_remove_headers: vec![],
            custom_tags: vec![],
            debug: false,
            cache: LsmConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration. Any error here is fatal: the
    /// proxy must not open listeners with a half-understood config.
    pub fn from_file(path: &Path) -> Result<Self, ProxyError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<(), ProxyError> {
        if self.listen.is_empty() && self.listen_tls.is_empty() {
            return Err(ProxyError::Config(
                "no listen or listen_tls addresses configured".into(),
            ));
        }
        if !self.listen_tls.is_empty() && self.certs.pem.is_empty() {
            return Err(ProxyError::Config(
                "listen_tls configured without certs.pem".into(),
            ));
        }
        if self.handler.backend_host.is_empty() {
            return Err(ProxyError::Config("handler.backend_host is empty".into()));
        }
        if self.handler.rate_limit == 0 {
            self.handler.rate_limit = default_rate_limit();
        }
        for pair in &self.certs.pem {
            if !pair.contains(':') {
                return Err(ProxyError::Config(format!(
                    "certs.pem entry '{pair}' is not a cert:key pair"
                )));
            }
        }
        Ok(())
    }
}
