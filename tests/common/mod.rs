//! Shared fixtures for integration tests: guest modules in WAT, tracing
//! setup, manager builders and a minimal HTTP responder.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wasmhive::{ContainerManager, ManagerConfig, StaticModuleSource};

// =============================================================================
// Guest Modules
// =============================================================================

/// Stateful counter with assorted helper exports.
pub const COUNTER_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (global $count (mut i32) (i32.const 0))
  (func (export "increment") (param $by i32) (result i32)
    global.get $count
    local.get $by
    i32.add
    global.set $count
    global.get $count)
  (func (export "get") (result i32)
    global.get $count)
  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add)
  (func (export "fs_read") (result i32) i32.const 1)
  (func (export "net_fetch") (result i32) i32.const 1)
  (func (export "fail") unreachable)
  (func (export "spin") (loop $l br $l)))
"#;

/// Starts with zero pages and grows one page per `grow` call.
pub const GROW_WAT: &str = r#"
(module
  (memory (export "memory") 0)
  (func (export "grow") (result i32)
    i32.const 1
    memory.grow)
  (func (export "size") (result i32)
    memory.size))
"#;

/// Imports `env.abort`; used for import whitelist checks.
pub const IMPORTS_WAT: &str = r#"
(module
  (import "env" "abort" (func $abort (param i32 i32 i32 i32)))
  (memory (export "memory") 1)
  (func (export "run") (result i32) i32.const 7))
"#;

/// Uses the memory supplied as `env.memory` and the math table.
pub const ENV_MEMORY_WAT: &str = r#"
(module
  (import "env" "memory" (memory 1))
  (import "env" "Math.sqrt" (func $sqrt (param f64) (result f64)))
  (func (export "store") (param i32)
    i32.const 0
    local.get 0
    i32.store)
  (func (export "load") (result i32)
    i32.const 0
    i32.load)
  (func (export "root") (param f64) (result f64)
    local.get 0
    call $sqrt))
"#;

/// Exercises the `host` namespace.
pub const HOST_IMPORTS_WAT: &str = r#"
(module
  (import "host" "sha256" (func $sha (param i32 i32 i32)))
  (import "host" "env_get" (func $env_get (param i32 i32 i32 i32) (result i32)))
  (import "host" "buffer_fill" (func $fill (param i32 i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "abc")
  (data (i32.const 16) "GREETING")
  (func (export "hash_first_byte") (result i32)
    i32.const 0
    i32.const 3
    i32.const 64
    call $sha
    i32.const 64
    i32.load8_u)
  (func (export "greeting_len") (result i32)
    i32.const 16
    i32.const 8
    i32.const 128
    i32.const 64
    call $env_get)
  (func (export "fill_and_read") (result i32)
    i32.const 256
    i32.const 9
    i32.const 4
    call $fill
    i32.const 259
    i32.load8_u))
"#;

/// Exercises the `wasmtime` engine profile namespace.
pub const ENGINE_WAT: &str = r#"
(module
  (import "wasmtime" "fuel_remaining" (func $fuel (result i64)))
  (import "wasmtime" "budget_ms" (func $budget (result i64)))
  (func (export "fuel") (result i64) call $fuel)
  (func (export "budget") (result i64) call $budget)
  (func (export "spin") (loop $l br $l)))
"#;

/// Busy-waits on the `host` clock for the given number of milliseconds.
pub const BUSY_WAT: &str = r#"
(module
  (import "host" "now_ms" (func $now (result f64)))
  (func (export "busy") (param $ms f64)
    (local $until f64)
    call $now
    local.get $ms
    f64.add
    local.set $until
    (loop $wait
      call $now
      local.get $until
      f64.lt
      br_if $wait)))
"#;

/// Exits through WASI `proc_exit(0)`.
pub const WASI_EXIT_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
  (memory (export "memory") 1)
  (func (export "quit")
    i32.const 0
    call $exit))
"#;

/// No memory at all.
pub const ANSWER_WAT: &str = r#"
(module
  (func (export "answer") (result i32) i32.const 42))
"#;

// =============================================================================
// Setup Helpers
// =============================================================================

/// Installs a test-writer tracing subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Source preloaded with every fixture module under its short name.
pub fn fixture_source() -> Arc<StaticModuleSource> {
    Arc::new(
        StaticModuleSource::new()
            .with_module("counter", COUNTER_WAT)
            .with_module("grow", GROW_WAT)
            .with_module("imports", IMPORTS_WAT)
            .with_module("env_memory", ENV_MEMORY_WAT)
            .with_module("host_imports", HOST_IMPORTS_WAT)
            .with_module("engine", ENGINE_WAT)
            .with_module("answer", ANSWER_WAT)
            .with_module("broken", "(module (func (export \"x\")"),
    )
}

/// Manager config suited to tests: metrics disabled unless asked for.
pub fn test_config(max_containers: usize) -> ManagerConfig {
    ManagerConfig {
        max_containers,
        enable_metrics: false,
        ..ManagerConfig::default()
    }
}

/// Manager backed by [`fixture_source`].
pub fn test_manager(max_containers: usize) -> ContainerManager {
    init_tracing();
    ContainerManager::with_source(test_config(max_containers), fixture_source())
        .expect("manager should build")
}

// =============================================================================
// HTTP Responder
// =============================================================================

/// One request as seen by [`HttpResponder`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

/// Minimal HTTP/1.1 server answering every request with a fixed response.
pub struct HttpResponder {
    pub url: String,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl HttpResponder {
    /// Serves `status` with `body` to every connection.
    pub async fn start(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self::start_with_delay(status, body, Duration::ZERO).await
    }

    /// Like [`HttpResponder::start`], waiting `delay` before responding.
    pub async fn start_with_delay(status: u16, body: impl Into<Vec<u8>>, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let body = Arc::new(body.into());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let body = body.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let Some(request) = read_request(&mut stream).await else {
                        return;
                    };
                    recorded.lock().push(request);
                    tokio::time::sleep(delay).await;
                    let head = format!(
                        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
                        status,
                        reason(status),
                        body.len()
                    );
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(&body).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self {
            url: format!("http://{}", addr),
            requests,
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Status",
    }
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
    Some(RecordedRequest { method, path, body })
}
