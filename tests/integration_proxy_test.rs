//! End-to-end tests: a stub origin, a real listener, and reqwest as the
//! client, exercising the cache hit/miss, range replay, coalescing and
//! rate-limit flows over real sockets.

use bytes::Bytes;
use elinproxy::config::HandlerConfig;
use elinproxy::lsm::LsmConfig;
use elinproxy::rules::Rules;
use elinproxy::server::Handler;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A stub origin: counts requests, answers fixed bodies, optionally slow.
async fn spawn_backend(delay: Duration, hits: Arc<AtomicUsize>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let hits = hits.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let path = req.uri().path().to_string();
                        let resp = match path.as_str() {
                            "/a" => Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "text/plain")
                                .header("content-length", "5")
                                .body(Full::new(Bytes::from_static(b"hello")))
                                .unwrap(),
                            "/b" => Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "application/octet-stream")
                                .body(Full::new(Bytes::from(pattern(10_240))))
                                .unwrap(),
                            "/c" => {
                                tokio::time::sleep(delay).await;
                                Response::builder()
                                    .status(StatusCode::OK)
                                    .header("content-type", "text/plain")
                                    .body(Full::new(Bytes::from_static(b"slow body from c")))
                                    .unwrap()
                            }
                            _ => Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Full::new(Bytes::from_static(b"not found")))
                                .unwrap(),
                        };
                        Ok::<_, Infallible>(resp)
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    addr
}

/// Serves the handler on an ephemeral port the way the real listener does.
async fn spawn_proxy(handler: Arc<Handler>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { handler.serve(req, peer, false).await }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    addr
}

fn handler_config(
    backend: SocketAddr,
    backend_once: bool,
    rate_limit: u32,
    dir: &std::path::Path,
) -> HandlerConfig {
    HandlerConfig {
        backend_host: "127.0.0.1".to_string(),
        backend_port: backend.port(),
        backend_once,
        rate_limit,
        cache: LsmConfig {
            min_lsm_ttl: Duration::from_secs(3600),
            extra_ttl: Duration::from_secs(10),
            dir: dir.to_path_buf(),
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_cold_miss_then_hit() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend(Duration::ZERO, hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let handler =
        Handler::new(handler_config(backend, false, 1000, dir.path()), Rules::default()).unwrap();
    let proxy = spawn_proxy(handler).await;

    let client = reqwest::Client::new();

    let first = client
        .get(format!("http://{proxy}/a"))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    assert!(first.headers().get("age").is_none());
    assert_eq!(first.text().await.unwrap(), "hello");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let second = client
        .get(format!("http://{proxy}/a"))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(second.headers().get("server").unwrap(), "elinproxy");
    assert_eq!(second.headers().get("age").unwrap(), "1");
    assert_eq!(second.headers().get("accept-ranges").unwrap(), "none");
    assert_eq!(second.text().await.unwrap(), "hello");

    // The second response never reached the origin.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_range_replay_from_cache() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend(Duration::ZERO, hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let handler =
        Handler::new(handler_config(backend, false, 1000, dir.path()), Rules::default()).unwrap();
    let proxy = spawn_proxy(handler).await;

    let client = reqwest::Client::new();
    let body = pattern(10_240);

    // Admit the full body first.
    let full = client
        .get(format!("http://{proxy}/b"))
        .send()
        .await
        .unwrap();
    assert_eq!(full.bytes().await.unwrap(), body);

    let ranged = client
        .get(format!("http://{proxy}/b"))
        .header("range", "bytes=100-199")
        .send()
        .await
        .unwrap();
    assert_eq!(ranged.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(ranged.headers().get("content-length").unwrap(), "100");
    assert_eq!(
        ranged.headers().get("content-range").unwrap(),
        "bytes 100-199/10240"
    );
    assert_eq!(ranged.headers().get("accept-ranges").unwrap(), "bytes");
    assert_eq!(ranged.bytes().await.unwrap(), &body[100..200]);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unparseable_range_is_416() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend(Duration::ZERO, hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let handler =
        Handler::new(handler_config(backend, false, 1000, dir.path()), Rules::default()).unwrap();
    let proxy = spawn_proxy(handler).await;

    let client = reqwest::Client::new();
    client
        .get(format!("http://{proxy}/b"))
        .send()
        .await
        .unwrap();

    let bad = client
        .get(format!("http://{proxy}/b"))
        .header("range", "bytes=abc-def")
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn test_backend_once_coalesces_concurrent_misses() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend(Duration::from_secs(2), hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let handler =
        Handler::new(handler_config(backend, true, 1000, dir.path()), Rules::default()).unwrap();
    let proxy = spawn_proxy(handler).await;

    let client = reqwest::Client::new();
    let mut requests = Vec::new();
    for _ in 0..50 {
        let client = client.clone();
        let url = format!("http://{proxy}/c");
        requests.push(tokio::spawn(async move {
            let resp = client.get(url).send().await.unwrap();
            let status = resp.status();
            (status, resp.bytes().await.unwrap())
        }));
    }

    let mut bodies = Vec::new();
    for request in requests {
        let (status, body) = request.await.unwrap();
        assert_eq!(status, 200);
        bodies.push(body);
    }

    assert!(bodies.windows(2).all(|w| w[0] == w[1]));
    // The slow origin saw exactly one request.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rate_limit_surfaces_429() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend(Duration::ZERO, hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let handler =
        Handler::new(handler_config(backend, false, 2, dir.path()), Rules::default()).unwrap();
    let proxy = spawn_proxy(handler).await;

    let client = reqwest::Client::new();
    let mut passed = 0;
    let mut limited = 0;
    for _ in 0..10 {
        // POST is never cachable, so every request goes to the backend gate.
        let resp = client
            .post(format!("http://{proxy}/a"))
            .send()
            .await
            .unwrap();
        match resp.status() {
            StatusCode::TOO_MANY_REQUESTS => limited += 1,
            _ => passed += 1,
        }
    }

    assert_eq!(passed, 2);
    assert_eq!(limited, 8);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_non_cachable_method_streams_through() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend(Duration::ZERO, hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let handler =
        Handler::new(handler_config(backend, false, 1000, dir.path()), Rules::default()).unwrap();
    let proxy = spawn_proxy(handler).await;

    let client = reqwest::Client::new();
    for _ in 0..3 {
        let resp = client
            .post(format!("http://{proxy}/a"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "hello");
    }
    // No caching for POSTs: every request reached the origin.
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_refresh_cookie_evicts_cached_variants() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend(Duration::ZERO, hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let mut rules = Rules::default();
    rules.rules.no_req_cookie_contains = vec!["session".to_string()];
    let handler = Handler::new(handler_config(backend, false, 1000, dir.path()), rules).unwrap();
    let proxy = spawn_proxy(handler).await;

    let client = reqwest::Client::new();

    // Admit, then verify the hit.
    client
        .get(format!("http://{proxy}/a"))
        .send()
        .await
        .unwrap();
    let cached = client
        .get(format!("http://{proxy}/a"))
        .send()
        .await
        .unwrap();
    assert_eq!(cached.headers().get("server").unwrap(), "elinproxy");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // A blacklisted cookie bypasses the cache and evicts every variant.
    let refresh = client
        .get(format!("http://{proxy}/a"))
        .header("cookie", "session=abc")
        .send()
        .await
        .unwrap();
    assert_eq!(refresh.status(), 200);
    assert!(refresh.headers().get("server").is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // The plain request is a miss again.
    let after = client
        .get(format!("http://{proxy}/a"))
        .send()
        .await
        .unwrap();
    assert_eq!(after.status(), 200);
    assert!(after.headers().get("server").is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_backend_down_is_502() {
    let dir = tempfile::tempdir().unwrap();
    // Point at a port nothing listens on.
    let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let handler =
        Handler::new(handler_config(dead, false, 1000, dir.path()), Rules::default()).unwrap();
    let proxy = spawn_proxy(handler).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{proxy}/a"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(resp.text().await.unwrap(), "Backend error response");
}
