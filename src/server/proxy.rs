// src/server/proxy.rs

//! The reverse proxy leg: backend URL construction, header rewriting,
//! response admission into the cache and transport error absorption.

use crate::config::HandlerConfig;
use crate::rules::Rules;
use crate::server::body::{ItemBody, ProxyBody, full_body};
use crate::server::handler::Handler;
use bytes::Bytes;
use futures::TryStreamExt;
use http::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, HOST, LAST_MODIFIED, RANGE, TRANSFER_ENCODING,
    UPGRADE,
};
use http::{HeaderMap, Request, Response, StatusCode, Version};
use http_body_util::{BodyDataStream, BodyExt, StreamBody};
use hyper::body::Incoming;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Headers never forwarded back to clients.
const PRIVATE_HEADERS: &[&str] = &["Set-Cache", "Proxy-Authenticate", "WWW-Authenticate"];

/// Hop-by-hop request headers dropped before dispatch.
const KEEP_ALIVE: http::HeaderName = http::HeaderName::from_static("keep-alive");
const HOP_HEADERS: [http::HeaderName; 4] = [CONNECTION, KEEP_ALIVE, TRANSFER_ENCODING, UPGRADE];

/// The result of one backend round trip.
pub struct ProxyOutcome {
    pub resp: Response<ProxyBody>,
    pub rate_limited: bool,
}

pub(crate) fn text_response(status: StatusCode, msg: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(Bytes::copy_from_slice(msg.as_bytes())));
    *resp.status_mut() = status;
    resp
}

impl Handler {
    /// Forwards a request to the backend. When `cachable` and the response
    /// rules agree, the response body is admitted to the cache and served
    /// from the admitted copy; otherwise it streams straight through.
    /// Transport failures become a 502, never a dropped connection.
    pub(crate) async fn reverse_proxy(
        &self,
        cachable: bool,
        key: u64,
        req: Request<Incoming>,
        cfg: &HandlerConfig,
        rules: &Rules,
        client_ip: IpAddr,
        tls: bool,
    ) -> ProxyOutcome {
        // Rate limit control to protect the backend.
        if !self.limiter.allow(client_ip) {
            return ProxyOutcome {
                resp: text_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests"),
                rate_limited: true,
            };
        }

        let (parts, body) = req.into_parts();
        let backend_url = build_backend_url(cfg, &parts.uri, tls);

        let mut out_headers = parts.headers.clone();
        for h in HOP_HEADERS {
            out_headers.remove(&h);
        }
        if cachable {
            for h in &cfg.req_remove_headers {
                out_headers.remove(h.as_str());
            }
            out_headers.insert(ACCEPT_ENCODING, http::HeaderValue::from_static("gzip"));
            // The cache always fetches the full body.
            out_headers.remove(RANGE);
        }
        if let Some(host) = backend_host_header(cfg, &out_headers) {
            match host.parse() {
                Ok(v) => {
                    out_headers.insert(HOST, v);
                }
                Err(_) => {
                    out_headers.remove(HOST);
                }
            }
        }

        let method = parts.method.clone();
        let outcome = self
            .client
            .request(method, backend_url.as_str())
            .headers(out_headers)
            .body(reqwest::Body::wrap_stream(BodyDataStream::new(body)))
            .send()
            .await;

        let resp = match outcome {
            Ok(resp) => resp,
            Err(err) => {
                if cfg.debug {
                    warn!("httpsrv/proxy error {}: {err}", backend_url);
                } else {
                    debug!("httpsrv/proxy error {}: {err}", backend_url);
                }
                return ProxyOutcome {
                    resp: text_response(StatusCode::BAD_GATEWAY, "Backend error response"),
                    rate_limited: false,
                };
            }
        };

        let status = resp.status();
        let mut headers = resp.headers().clone();
        scrub_response_headers(&mut headers, cfg, parts.version, status);

        let ttl = if cachable {
            rules.rules.is_resp_cachable(status, &headers)
        } else {
            None
        };

        let resp = match ttl {
            Some(ttl) => self.admit_and_serve(key, status, headers, resp, ttl).await,
            None => stream_through(status, headers, resp),
        };
        ProxyOutcome {
            resp,
            rate_limited: false,
        }
    }

    /// Copies the backend response into a memory item, admits it under
    /// `key`, and serves the request from the admitted bytes.
    async fn admit_and_serve(
        &self,
        key: u64,
        status: StatusCode,
        headers: HeaderMap,
        resp: reqwest::Response,
        ttl: std::time::Duration,
    ) -> Response<ProxyBody> {
        let hint = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0usize);

        let mut item = self.cache.new_item(hint);
        item.status_code = status;
        item.header = headers.clone();

        let mut resp = resp;
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(err) = item.write(&chunk) {
                        warn!("httpsrv/proxy cache admit: {err}");
                        return text_response(StatusCode::BAD_GATEWAY, "Backend error response");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!("httpsrv/proxy body read: {err}");
                    return text_response(StatusCode::BAD_GATEWAY, "Backend error response");
                }
            }
        }

        let len = item.len() as u64;
        let cached = self.cache.set(key, item, ttl).await;

        // Serve this request from the bytes just admitted. The reference is
        // guarded like any cache read, but does not count as a hit.
        cached.incr_in_use();
        let mut out = Response::new(ItemBody::new(cached, 0, len).boxed());
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        out.headers_mut().insert(
            CONTENT_LENGTH,
            http::HeaderValue::from(len),
        );
        out
    }
}

/// Builds the outbound request URL for the configured backend.
fn build_backend_url(cfg: &HandlerConfig, uri: &http::Uri, tls: bool) -> String {
    let path = uri.path();
    let mut url = if tls && !cfg.backend_tls_host.is_empty() {
        format!(
            "https://{}:{}{}",
            cfg.backend_tls_host, cfg.backend_tls_port, path
        )
    } else {
        format!("http://{}:{}{}", cfg.backend_host, cfg.backend_port, path)
    };
    if let Some(q) = uri.query() {
        url.push('?');
        url.push_str(q);
    }
    url
}

/// The outbound Host header: when the inbound host carries the configured
/// domain suffix, it is stripped and the backend port appended.
fn backend_host_header(cfg: &HandlerConfig, headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(HOST)?.to_str().ok()?;
    let host = match raw.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) => h,
        _ => raw,
    };
    if host.ends_with(&cfg.domain_suffix) {
        let stripped = &host[..host.len() - cfg.domain_suffix.len()];
        return Some(format!("{}:{}", stripped, cfg.backend_port));
    }
    None
}

fn scrub_response_headers(
    headers: &mut HeaderMap,
    cfg: &HandlerConfig,
    version: Version,
    status: StatusCode,
) {
    for h in PRIVATE_HEADERS {
        headers.remove(*h);
    }
    for h in &cfg.resp_remove_headers {
        headers.remove(h.as_str());
    }
    for h in HOP_HEADERS {
        headers.remove(&h);
    }

    // Close connection on redirects, but only towards HTTP/1.x clients.
    if version <= Version::HTTP_11
        && matches!(
            status,
            StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT
        )
    {
        headers.insert(CONNECTION, http::HeaderValue::from_static("close"));
    }

    let stamp = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S %z").to_string();
    if let Ok(v) = stamp.parse() {
        headers.insert(LAST_MODIFIED, v);
    }
}

/// Streams a non-cachable backend response straight to the client.
fn stream_through(
    status: StatusCode,
    headers: HeaderMap,
    resp: reqwest::Response,
) -> Response<ProxyBody> {
    let stream = resp
        .bytes_stream()
        .map_ok(http_body::Frame::data)
        .map_err(std::io::Error::other);
    let body = BodyExt::boxed_unsync(StreamBody::new(stream));

    let mut out = Response::new(body);
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}
