// src/server/handler.rs

//! The HTTP entry point: fingerprinting, cache lookup with range replay,
//! backend-once coalescing and reverse proxy orchestration.

use crate::config::HandlerConfig;
use crate::core::ProxyError;
use crate::lsm::Lsm;
use crate::rules::Rules;
use crate::server::body::{ItemBody, ProxyBody};
use crate::server::coalesce::{Coalesce, GroupRole};
use crate::server::device::DEVICE_CLASSES;
use crate::server::httplog::{InstrumentedBody, Publisher, RequestLog};
use crate::server::proxy::text_response;
use crate::server::range::{LIMIT_RANGE, parse_range};
use crate::server::ratelimit::RateLimiter;
use http::header::{ACCEPT_RANGES, AGE, CONTENT_LENGTH, CONTENT_RANGE, RANGE, SERVER};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use hyper::body::Incoming;
use parking_lot::RwLock;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use xxhash_rust::xxh64::xxh64;

/// How long a coalesced request waits for the elected fetcher.
const INFLIGHT_TIMEOUT: Duration = Duration::from_secs(60);

/// The cache-aware request handler shared by every listener.
pub struct Handler {
    cfg: RwLock<Arc<HandlerConfig>>,
    rules: RwLock<Arc<Rules>>,
    pub(crate) cache: Arc<Lsm>,
    pub(crate) limiter: RateLimiter,
    pub(crate) client: reqwest::Client,
    inflight: Coalesce,
    publisher: Publisher,
}

impl Handler {
    pub fn new(cfg: HandlerConfig, rules: Rules) -> Result<Arc<Self>, ProxyError> {
        let cache = Lsm::new(cfg.cache.clone())?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| ProxyError::Internal(err.to_string()))?;

        let limiter = RateLimiter::new(if cfg.rate_limit == 0 {
            crate::config::default_rate_limit()
        } else {
            cfg.rate_limit
        });

        Ok(Arc::new(Self {
            cfg: RwLock::new(Arc::new(cfg)),
            rules: RwLock::new(Arc::new(rules)),
            cache,
            limiter,
            client,
            inflight: Coalesce::default(),
            publisher: Publisher::new(),
        }))
    }

    /// Swaps in a new configuration and rules; in-flight requests keep the
    /// snapshot they started with.
    pub fn reload(&self, cfg: HandlerConfig, rules: Rules) {
        self.cache.reload(cfg.cache.clone());
        *self.cfg.write() = Arc::new(cfg);
        *self.rules.write() = Arc::new(rules);
    }

    pub fn cache(&self) -> &Arc<Lsm> {
        &self.cache
    }

    /// The JSON access-log fan-out external shippers subscribe to.
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Serves one request end to end.
    pub async fn serve(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
        tls: bool,
    ) -> Result<Response<InstrumentedBody>, Infallible> {
        let cfg = self.cfg.read().clone();
        let rules = self.rules.read().clone();

        let mut rlog = RequestLog::new(&req, peer, tls);
        let range_header = req
            .headers()
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let key_str = rlog.key_str();
        let key = xxh64(key_str.as_bytes(), 0);

        let (mut cachable, mut refresh) = rules.rules.is_req_cachable(&req);
        if cachable && let Some(host_rules) = rules.domain_rules(&rlog.host) {
            // The per-host rules override the global decision.
            let decision = host_rules.is_req_cachable(&req);
            cachable = decision.0;
            refresh = decision.1;
        }

        let mut resp = if !cachable {
            if refresh {
                // Evict every device variant of this URL.
                for device in 0..DEVICE_CLASSES {
                    self.cache
                        .delete(xxh64(rlog.key_str_device(device).as_bytes(), 0));
                }
            }
            let outcome = self
                .reverse_proxy(false, key, req, &cfg, &rules, peer.ip(), tls)
                .await;
            rlog.rate_limit = outcome.rate_limited;
            outcome.resp
        } else if let Some(resp) = self.respond_from_cache(key, range_header.as_deref()) {
            rlog.hit = true;
            resp
        } else if !cfg.backend_once {
            let outcome = self
                .reverse_proxy(true, key, req, &cfg, &rules, peer.ip(), tls)
                .await;
            rlog.rate_limit = outcome.rate_limited;
            outcome.resp
        } else {
            self.clone()
                .backend_once(
                    key,
                    &key_str,
                    range_header.as_deref(),
                    req,
                    &cfg,
                    &rules,
                    &mut rlog,
                    peer.ip(),
                    tls,
                )
                .await
        };

        rlog.custom_tags = cfg
            .custom_tags
            .iter()
            .map(|name| {
                resp.headers()
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();
        for name in &cfg.resp_remove_headers {
            resp.headers_mut().remove(name.as_str());
        }
        rlog.status_code = resp.status().as_u16();

        let publisher = self.publisher.clone();
        Ok(resp.map(move |body| InstrumentedBody::new(body, rlog, publisher)))
    }

    /// Answers from cache when possible. A `Some` return is a finished
    /// response, including 416s for unsatisfiable ranges; `None` means miss.
    pub(crate) fn respond_from_cache(
        &self,
        key: u64,
        range_header: Option<&str>,
    ) -> Option<Response<ProxyBody>> {
        let (item, expired) = self.cache.get(key).ok()?;

        // A torn header read means the backing segment is going away.
        let Some(headers) = item.header() else {
            item.done();
            return None;
        };

        let mut out_headers = HeaderMap::new();
        for name in headers.keys() {
            let mut joined: Vec<u8> = Vec::new();
            for (i, value) in headers.get_all(name).iter().enumerate() {
                if i > 0 {
                    joined.extend_from_slice(b", ");
                }
                joined.extend_from_slice(value.as_bytes());
            }
            if let Ok(value) = HeaderValue::from_bytes(&joined) {
                out_headers.insert(name.clone(), value);
            }
        }

        if expired {
            out_headers.insert("x-expired", HeaderValue::from_static("true"));
        }
        out_headers.insert(ACCEPT_RANGES, HeaderValue::from_static("none"));
        out_headers.insert(SERVER, HeaderValue::from_static("elinproxy"));
        out_headers.insert(AGE, HeaderValue::from(item.hit()));

        let total = item.len();
        let ranges = match range_header {
            Some(s) => match parse_range(s, LIMIT_RANGE, total as i64) {
                Ok(r) => r,
                Err(err) => {
                    item.done();
                    return Some(range_not_satisfiable(&err));
                }
            },
            None => None,
        };

        let Some(ranges) = ranges.filter(|_| item.status_code() == StatusCode::OK) else {
            // Ranges only replay against complete 200 bodies.
            let status = item.status_code();
            out_headers.insert(CONTENT_LENGTH, HeaderValue::from(total as u64));
            let mut resp = Response::new(ItemBody::new(item, 0, total as u64).boxed());
            *resp.status_mut() = status;
            *resp.headers_mut() = out_headers;
            return Some(resp);
        };

        // Only the first range is served.
        match item.valid_range(ranges[0].start, ranges[0].length) {
            Err(err) => {
                item.done();
                Some(range_not_satisfiable(&err))
            }
            Ok((from, to, length)) => {
                out_headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
                let content_range = format!("bytes {}-{}/{}", from, to - 1, total);
                if let Ok(v) = HeaderValue::from_str(&content_range) {
                    out_headers.insert(CONTENT_RANGE, v);
                }
                out_headers.insert(CONTENT_LENGTH, HeaderValue::from(length as u64));

                let mut resp = Response::new(ItemBody::new(item, from as u64, to as u64).boxed());
                *resp.status_mut() = StatusCode::PARTIAL_CONTENT;
                *resp.headers_mut() = out_headers;
                Some(resp)
            }
        }
    }

    /// Backend-once: concurrent misses for one fingerprint coalesce into a
    /// single backend fetch. Followers wait for the elected fetcher, retry
    /// the cache, and fall through to their own fetch when the coalesced
    /// response turned out uncachable.
    #[allow(clippy::too_many_arguments)]
    async fn backend_once(
        self: Arc<Self>,
        key: u64,
        key_str: &str,
        range_header: Option<&str>,
        req: Request<Incoming>,
        cfg: &Arc<HandlerConfig>,
        rules: &Arc<Rules>,
        rlog: &mut RequestLog,
        client_ip: IpAddr,
        tls: bool,
    ) -> Response<ProxyBody> {
        match self.inflight.join(key_str) {
            GroupRole::Follower(waiter) => {
                match tokio::time::timeout(INFLIGHT_TIMEOUT, waiter).await {
                    Ok(()) => {
                        if let Some(resp) = self.respond_from_cache(key, range_header) {
                            rlog.hit = true;
                            return resp;
                        }
                        // The coalesced response was not stored; it was not
                        // cachable after all. Fetch for ourselves.
                        let outcome = self
                            .reverse_proxy(true, key, req, cfg, rules, client_ip, tls)
                            .await;
                        rlog.rate_limit = outcome.rate_limited;
                        outcome.resp
                    }
                    Err(_) => {
                        warn!("httpsrv/handler backend-once wait timeout: {}", rlog.url);
                        text_response(StatusCode::BAD_GATEWAY, "RFC 7231, 6.6.3")
                    }
                }
            }
            GroupRole::Leader(tx) => {
                // Run the fetch detached so the admit finishes even if this
                // client goes away mid-flight.
                let this = self.clone();
                let cfg = cfg.clone();
                let rules = rules.clone();
                let mut task = tokio::spawn(async move {
                    this.reverse_proxy(true, key, req, &cfg, &rules, client_ip, tls)
                        .await
                });

                match tokio::time::timeout(INFLIGHT_TIMEOUT, &mut task).await {
                    Ok(Ok(outcome)) => {
                        self.inflight.forget(key_str);
                        let _ = tx.send(());
                        rlog.rate_limit = outcome.rate_limited;
                        outcome.resp
                    }
                    Ok(Err(err)) => {
                        self.inflight.forget(key_str);
                        drop(tx);
                        error!("httpsrv/handler backend-once fetch failed: {err}");
                        text_response(StatusCode::BAD_GATEWAY, "Backend error response")
                    }
                    Err(_) => {
                        // Forget the group so new requests are not stuck
                        // behind a slow fetch, then give it one more window.
                        warn!("httpsrv/handler backend-once timeout: {}", rlog.url);
                        self.inflight.forget(key_str);
                        match tokio::time::timeout(INFLIGHT_TIMEOUT, &mut task).await {
                            Ok(Ok(outcome)) => {
                                let _ = tx.send(());
                                debug!(
                                    "httpsrv/handler backend-once completed after timeout: {}",
                                    rlog.url
                                );
                                rlog.rate_limit = outcome.rate_limited;
                                outcome.resp
                            }
                            Ok(Err(err)) => {
                                error!("httpsrv/handler backend-once fetch failed: {err}");
                                text_response(StatusCode::BAD_GATEWAY, "Backend error response")
                            }
                            Err(_) => {
                                warn!(
                                    "httpsrv/handler backend-once still pending after second timeout: {}",
                                    rlog.url
                                );
                                text_response(StatusCode::BAD_GATEWAY, "RFC 7231, 6.6.3")
                            }
                        }
                    }
                }
            }
        }
    }
}

fn range_not_satisfiable(err: &ProxyError) -> Response<ProxyBody> {
    let body = format!("ERROR 416 // RFC 7233, 4.4\n{err}");
    text_response(StatusCode::RANGE_NOT_SATISFIABLE, &body)
}
