use elinproxy::server::httplog::RequestLog;
use http::Request;
use std::net::SocketAddr;

fn request(ua: &str) -> Request<()> {
    Request::builder()
        .method("GET")
        .uri("/some/path?x=1")
        .header("host", "example.com:8080")
        .header("user-agent", ua)
        .header("cookie", "a=1; b=2")
        .body(())
        .unwrap()
}

fn peer() -> SocketAddr {
    "192.0.2.1:4711".parse().unwrap()
}

#[test]
fn test_key_str_combines_device_method_and_url() {
    let log = RequestLog::new(&request("Mozilla/5.0 (X11; Linux x86_64)"), peer(), false);
    assert_eq!(log.device, 1);
    assert_eq!(log.key_str(), "1GEThttp://example.com:8080/some/path?x=1");

    // Every variant shares the tail and differs only in the class prefix.
    for device in 0..5 {
        assert_eq!(
            log.key_str_device(device),
            format!("{device}GEThttp://example.com:8080/some/path?x=1")
        );
    }
}

#[test]
fn test_request_facts_are_captured() {
    let log = RequestLog::new(&request("curl/8.0"), peer(), false);
    assert_eq!(log.client_ip, "192.0.2.1");
    assert_eq!(log.host, "example.com");
    assert_eq!(log.method, "GET");
    assert_eq!(log.cookies, 2);
    assert_eq!(log.schema, "http");
    assert!(!log.tls);
}

#[test]
fn test_tls_switches_schema() {
    let log = RequestLog::new(&request("curl/8.0"), peer(), true);
    assert_eq!(log.schema, "https");
    assert!(log.url.starts_with("https://example.com:8080/"));
    assert!(log.tls);
}

#[test]
fn test_json_record_field_names() {
    let log = RequestLog::new(&request("curl/8.0"), peer(), false);
    let value = serde_json::to_value(&log).unwrap();
    let obj = value.as_object().unwrap();
    for field in ["Time", "ClientIP", "URL", "RespTTFMS", "RespTimeMS", "HIT", "RateLimit"] {
        assert!(obj.contains_key(field), "missing field {field}");
    }
}
