// src/server/httplog.rs

//! Per-request log records: the fingerprint source string, response
//! instrumentation (first byte, byte count), the metrics fold-in and the
//! JSON publisher external shippers subscribe to.

use crate::core::metrics;
use crate::server::body::ProxyBody;
use crate::server::device::device_class;
use bytes::Bytes;
use chrono::Utc;
use http::Request;
use http_body::{Body, Frame, SizeHint};
use serde::Serialize;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::info;

const PUBLISHER_CAPACITY: usize = 1024;

/// One completed-request record. Serialized to JSON on the publisher
/// channel; also the source of every handler metric observation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestLog {
    pub time: String,
    #[serde(rename = "ClientIP")]
    pub client_ip: String,
    pub proto: String,
    #[serde(rename = "TLS")]
    pub tls: bool,
    pub method: String,
    pub status_code: u16,
    pub schema: String,
    pub host: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub user_agent: String,
    pub cookies: usize,
    #[serde(rename = "RespTTFMS")]
    pub resp_ttfb_ms: f64,
    #[serde(rename = "RespTimeMS")]
    pub resp_time_ms: f64,
    pub req_bytes: i64,
    pub resp_bytes: u64,
    #[serde(rename = "HIT")]
    pub hit: bool,
    pub rate_limit: bool,
    pub device: usize,
    pub custom_tags: Vec<String>,

    #[serde(skip)]
    pub start: Instant,
}

impl RequestLog {
    pub fn new<B>(req: &Request<B>, peer: SocketAddr, tls: bool) -> Self {
        let raw_host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let host = match raw_host.rsplit_once(':') {
            Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) => h.to_string(),
            _ => raw_host.clone(),
        };

        let user_agent = req
            .headers()
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let cookies = req
            .headers()
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|raw| raw.split(';').filter(|p| !p.trim().is_empty()).count())
            .sum();

        let schema = if tls { "https" } else { "http" }.to_string();
        let mut url = format!("{}://{}{}", schema, raw_host, req.uri().path());
        if let Some(q) = req.uri().query() {
            url.push('?');
            url.push_str(q);
        }

        let req_bytes = req
            .headers()
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Self {
            time: Utc::now().to_rfc3339(),
            client_ip: peer.ip().to_string(),
            proto: format!("{:?}", req.version()),
            tls,
            method: req.method().to_string(),
            status_code: 0,
            schema,
            host,
            url,
            device: device_class(&user_agent),
            user_agent,
            cookies,
            resp_ttfb_ms: 0.0,
            resp_time_ms: 0.0,
            req_bytes,
            resp_bytes: 0,
            hit: false,
            rate_limit: false,
            custom_tags: vec![],
            start: Instant::now(),
        }
    }

    /// The unique string each URL variant hashes from. This is the key of
    /// the cache engine; changing its shape invalidates every entry.
    pub fn key_str(&self) -> String {
        self.key_str_device(self.device)
    }

    /// The key string this URL would have on another device class.
    pub fn key_str_device(&self, device: usize) -> String {
        format!("{}{}{}", device, self.method, self.url)
    }

    fn labels(&self) -> [String; 5] {
        [
            self.rate_limit.to_string(),
            self.hit.to_string(),
            self.status_code.to_string(),
            self.method.clone(),
            self.schema.clone(),
        ]
    }

    fn save(&self) {
        let labels = self.labels();
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        metrics::RESPONSE_CODE.with_label_values(&labels).inc();
        metrics::RESPONSE_TTFB
            .with_label_values(&labels)
            .observe(self.resp_ttfb_ms);
        metrics::RESPONSE_TIME
            .with_label_values(&labels)
            .observe(self.resp_time_ms);
        metrics::RESPONSE_SIZE
            .with_label_values(&labels)
            .inc_by(self.resp_bytes as f64);
    }
}

/// Broadcast fan-out of completed request records, one JSON object each.
/// Lagging subscribers lose records; publishing never blocks a request.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: broadcast::Sender<String>,
}

impl Publisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(PUBLISHER_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    fn publish(&self, log: &RequestLog) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        if let Ok(line) = serde_json::to_string(log) {
            let _ = self.tx.send(line);
        }
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a response body to count bytes and record the time to first byte.
/// The record is finished and published when the body is dropped, which
/// covers both complete writes and client disconnects.
pub struct InstrumentedBody {
    inner: ProxyBody,
    log: Option<RequestLog>,
    publisher: Publisher,
    bytes: u64,
    ttfb_ms: Option<f64>,
}

impl InstrumentedBody {
    pub fn new(inner: ProxyBody, log: RequestLog, publisher: Publisher) -> Self {
        Self {
            inner,
            log: Some(log),
            publisher,
            bytes: 0,
            ttfb_ms: None,
        }
    }
}

impl Body for InstrumentedBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &polled
            && let Some(data) = frame.data_ref()
        {
            if this.bytes == 0
                && let Some(log) = &this.log
            {
                this.ttfb_ms = Some(log.start.elapsed().as_secs_f64() * 1000.0);
            }
            this.bytes += data.len() as u64;
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for InstrumentedBody {
    fn drop(&mut self) {
        let Some(mut log) = self.log.take() else {
            return;
        };
        log.resp_bytes = self.bytes;
        log.resp_ttfb_ms = self.ttfb_ms.unwrap_or(0.0);
        log.resp_time_ms = log.start.elapsed().as_secs_f64() * 1000.0;
        log.save();
        self.publisher.publish(&log);
        info!(
            target: "elinproxy::access",
            "{} {} {} {} hit={} ratelimit={} {:.3}ms {}b \"{}\"",
            log.client_ip,
            log.method,
            log.url,
            log.status_code,
            log.hit,
            log.rate_limit,
            log.resp_time_ms,
            log.resp_bytes,
            log.user_agent
        );
    }
}
