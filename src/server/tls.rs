// src/server/tls.rs

//! Builds the rustls server configuration from the configured PEM pairs.

use crate::config::CertsConfig;
use crate::core::ProxyError;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use tracing::warn;

/// Loads `cert.pem:key.pem` pairs into a server config. Certificate
/// acquisition itself (ACME etc.) belongs to the external cert provider;
/// this only consumes whatever it wrote to disk.
pub fn server_config(certs: &CertsConfig) -> Result<ServerConfig, ProxyError> {
    let pair = certs
        .pem
        .first()
        .ok_or_else(|| ProxyError::Config("listen_tls configured without certs.pem".into()))?;
    if certs.pem.len() > 1 {
        warn!("only the first certs.pem pair is served; SNI routing is the cert provider's job");
    }

    let (cert_path, key_path) = pair
        .split_once(':')
        .ok_or_else(|| ProxyError::Config(format!("certs.pem entry '{pair}' is not cert:key")))?;

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| ProxyError::Config(format!("tls config: {err}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|err| ProxyError::Config(format!("certs {path}: {err}")))?;
    if certs.is_empty() {
        return Err(ProxyError::Config(format!("no certificates in {path}")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| ProxyError::Config(format!("key {path}: {err}")))?
        .ok_or_else(|| ProxyError::Config(format!("no private key in {path}")))
}
