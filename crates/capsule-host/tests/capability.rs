//! Guest-side view of the capability host functions.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener};
use std::thread;

use capsule_common::{Capability, CapabilityConfig, RuntimeConfig};
use capsule_core::{Engine, HostApi, Job, ModuleRef, RegisterOptions};
use capsule_host::{OutboundClient, default_api, default_api_with_client};

const CANONICAL: &[u8] = br#"{"code":1,"message":"capability is not enabled"}"#;

/// Calls `fetch_url` and returns the FFI result, whatever its sign.
const FETCH: &str = r#"
    (module
        (import "env" "fetch_url" (func $fetch (param i32 i32 i32 i32 i32) (result i32)))
        (import "env" "get_ffi_result" (func $get (param i32) (result i32)))
        (import "env" "return_result" (func $ret (param i32 i32) (result i32)))
        (memory (export "memory") 1)
        (data (i32.const 0) "https://example.com/")
        (func (export "run_e")
            (local $n i32)
            (local.set $n (call $fetch (i32.const 0) (i32.const 0) (i32.const 20) (i32.const 0) (i32.const 0)))
            (if (i32.lt_s (local.get $n) (i32.const 0))
                (then (local.set $n (i32.sub (i32.const 0) (local.get $n)))))
            (drop (call $get (i32.const 1024)))
            (drop (call $ret (i32.const 1024) (local.get $n)))))
"#;

/// Calls `graphql_query` and returns the FFI result.
const GRAPHQL: &str = r#"
    (module
        (import "env" "graphql_query" (func $query (param i32 i32 i32 i32) (result i32)))
        (import "env" "get_ffi_result" (func $get (param i32) (result i32)))
        (import "env" "return_result" (func $ret (param i32 i32) (result i32)))
        (memory (export "memory") 1)
        (data (i32.const 0) "https://example.com/graphql{ viewer }")
        (func (export "run_e")
            (local $n i32)
            (local.set $n (call $query (i32.const 0) (i32.const 27) (i32.const 27) (i32.const 10)))
            (if (i32.lt_s (local.get $n) (i32.const 0))
                (then (local.set $n (i32.sub (i32.const 0) (local.get $n)))))
            (drop (call $get (i32.const 1024)))
            (drop (call $ret (i32.const 1024) (local.get $n)))))
"#;

/// Logs at info and returns "logged" when the call succeeded.
const LOG: &str = r#"
    (module
        (import "env" "log_msg" (func $log (param i32 i32 i32) (result i32)))
        (import "env" "return_result" (func $ret (param i32 i32) (result i32)))
        (memory (export "memory") 1)
        (data (i32.const 0) "hello from the guest")
        (data (i32.const 100) "loggedrefused")
        (func (export "run_e")
            (if (i32.eqz (call $log (i32.const 3) (i32.const 0) (i32.const 20)))
                (then (drop (call $ret (i32.const 100) (i32.const 6))))
                (else (drop (call $ret (i32.const 106) (i32.const 7)))))))
"#;

/// Fetches `url` from `run_e` and returns the FFI result.
fn fetch_guest(url: &str) -> String {
    format!(
        r#"
        (module
            (import "env" "fetch_url" (func $fetch (param i32 i32 i32 i32 i32) (result i32)))
            (import "env" "get_ffi_result" (func $get (param i32) (result i32)))
            (import "env" "return_result" (func $ret (param i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "{url}")
            (func (export "run_e")
                (local $n i32)
                (local.set $n (call $fetch (i32.const 0) (i32.const 0) (i32.const {len}) (i32.const 0) (i32.const 0)))
                (if (i32.lt_s (local.get $n) (i32.const 0))
                    (then (local.set $n (i32.sub (i32.const 0) (local.get $n)))))
                (drop (call $get (i32.const 1024)))
                (drop (call $ret (i32.const 1024) (local.get $n)))))
        "#,
        len = url.len()
    )
}

/// Fetches `url` once from `_start`; every run returns what it got.
fn fetch_on_start_guest(url: &str) -> String {
    format!(
        r#"
        (module
            (import "env" "fetch_url" (func $fetch (param i32 i32 i32 i32 i32) (result i32)))
            (import "env" "get_ffi_result" (func $get (param i32) (result i32)))
            (import "env" "return_result" (func $ret (param i32 i32) (result i32)))
            (memory (export "memory") 1)
            (global $len (mut i32) (i32.const 0))
            (data (i32.const 0) "{url}")
            (func (export "_start")
                (global.set $len (call $fetch (i32.const 0) (i32.const 0) (i32.const {len}) (i32.const 0) (i32.const 0)))
                (if (i32.lt_s (global.get $len) (i32.const 0))
                    (then (global.set $len (i32.sub (i32.const 0) (global.get $len)))))
                (drop (call $get (i32.const 1024))))
            (func (export "run_e")
                (drop (call $ret (i32.const 1024) (global.get $len)))))
        "#,
        len = url.len()
    )
}

/// Answers every connection on `ip` with `respond(path)` and closes it.
fn serve(ip: &str, respond: impl Fn(&str) -> Vec<u8> + Send + 'static) -> SocketAddr {
    let listener = TcpListener::bind((ip, 0)).unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { return };
            let mut reader = BufReader::new(&stream);
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).is_err() {
                continue;
            }
            let mut header = String::new();
            while reader.read_line(&mut header).is_ok_and(|n| n > 2) {
                header.clear();
            }

            let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
            let _ = stream.write_all(&respond(&path));
        }
    });
    addr
}

fn response(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {status}\r\nConnection: close\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

fn ok(body: &[u8]) -> Vec<u8> {
    let length = body.len().to_string();
    response("200 OK", &[("Content-Length", length.as_str())], body)
}

/// HTTP allowed to reach the loopback test servers on 127.0.0.1 only.
fn loopback_capabilities() -> CapabilityConfig {
    let mut capabilities = CapabilityConfig::default();
    capabilities.http.allowed_domains = vec!["127.0.0.1".into()];
    capabilities.http.block_private_addresses = false;
    capabilities
}

fn engine(api: HostApi) -> Engine {
    Engine::from_config(&RuntimeConfig::default(), api).unwrap()
}

async fn run(capabilities: CapabilityConfig, src: &str) -> Vec<u8> {
    run_with(default_api(capabilities).unwrap(), src).await
}

async fn run_with(api: HostApi, src: &str) -> Vec<u8> {
    let engine = engine(api);
    let module_ref = ModuleRef::new("guest", "1.0.0", wat::parse_str(src).unwrap());
    engine
        .register("guest", module_ref, RegisterOptions::default())
        .unwrap();

    engine
        .execute(Job::new("guest", b"".to_vec()))
        .then()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_disabled_http_returns_canonical_payload() {
    let capabilities = CapabilityConfig::default().with(Capability::Http, false);
    assert_eq!(run(capabilities, FETCH).await, CANONICAL);
}

#[tokio::test]
async fn test_disabled_graphql_returns_canonical_payload() {
    let capabilities = CapabilityConfig::default().with(Capability::GraphQL, false);
    assert_eq!(run(capabilities, GRAPHQL).await, CANONICAL);
}

#[tokio::test]
async fn test_blocked_destination_is_reported_to_guest() {
    let mut capabilities = CapabilityConfig::default();
    capabilities.http.allowed_domains = vec!["api.internal.dev".into()];

    let output = run(capabilities, FETCH).await;
    let payload: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(payload["code"], 403);
}

#[tokio::test]
async fn test_logger_enabled_and_disabled() {
    assert_eq!(run(CapabilityConfig::default(), LOG).await, b"logged");

    let quiet = CapabilityConfig::default().with(Capability::Logger, false);
    assert_eq!(run(quiet, LOG).await, b"refused");
}

async fn pre_warm_with_fetching_start() {
    let addr = serve("127.0.0.1", |_| ok(b"warmed up"));
    let src = fetch_on_start_guest(&format!("http://{addr}/config"));

    let engine = engine(default_api(loopback_capabilities()).unwrap());
    let module_ref = ModuleRef::new("warm", "1.0.0", wat::parse_str(src).unwrap());
    engine
        .register("warm", module_ref, RegisterOptions::default().with_pre_warm(true))
        .unwrap();

    let output = engine
        .execute(Job::new("warm", b"".to_vec()))
        .then()
        .await
        .unwrap();
    assert_eq!(output, b"warmed up");
}

#[tokio::test]
async fn test_pre_warm_fetch_on_current_thread_runtime() {
    pre_warm_with_fetching_start().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pre_warm_fetch_on_multi_thread_runtime() {
    pre_warm_with_fetching_start().await;
}

#[tokio::test]
async fn test_redirect_within_allowed_host_is_followed() {
    let addr = serve("127.0.0.1", |path| match path {
        "/final" => ok(b"landed"),
        _ => response("302 Found", &[("Location", "/final"), ("Content-Length", "0")], b""),
    });

    let output = run(loopback_capabilities(), &fetch_guest(&format!("http://{addr}/start"))).await;
    assert_eq!(output, b"landed");
}

#[tokio::test]
async fn test_redirect_to_disallowed_host_is_refused() {
    let hidden = serve("127.0.0.2", |_| ok(b"secret"));
    let location = format!("http://{hidden}/secret");
    let front = serve("127.0.0.1", move |_| {
        response(
            "302 Found",
            &[("Location", location.as_str()), ("Content-Length", "0")],
            b"",
        )
    });

    let output = run(loopback_capabilities(), &fetch_guest(&format!("http://{front}/"))).await;
    let payload: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(payload["code"], 403);
    assert!(!String::from_utf8_lossy(&output).contains("secret"));
}

#[tokio::test]
async fn test_oversized_response_is_refused() {
    let addr = serve("127.0.0.1", |path| {
        let body = vec![b'x'; 64 * 1024];
        match path {
            "/declared" => ok(&body),
            _ => response("200 OK", &[], &body),
        }
    });
    let api = || {
        let client = OutboundClient::new().unwrap().with_max_response_bytes(1024);
        default_api_with_client(loopback_capabilities(), client)
    };

    for path in ["/declared", "/streamed"] {
        let output = run_with(api(), &fetch_guest(&format!("http://{addr}{path}"))).await;
        let payload: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(payload["code"], 400, "{path}");
        assert!(
            payload["message"].as_str().unwrap().contains("1024 byte limit"),
            "{path}"
        );
    }
}

#[tokio::test]
async fn test_response_within_limit_is_returned() {
    let addr = serve("127.0.0.1", |_| response("200 OK", &[], b"small enough"));
    let client = OutboundClient::new().unwrap().with_max_response_bytes(1024);

    let output = run_with(
        default_api_with_client(loopback_capabilities(), client),
        &fetch_guest(&format!("http://{addr}/")),
    )
    .await;
    assert_eq!(output, b"small enough");
}
