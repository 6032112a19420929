//! Shared helpers: fake engine scripts and raw HTTP requests
#![allow(dead_code)]

use enginegate::config::SidecarConfig;
use enginegate::supervisor::SupervisorEvent;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

/// Reads its config, optionally appends it to `$DUMP`, reports readiness on
/// `$ENGINE_PORT` (or a pid-derived port) and then keeps consuming stdin.
pub const READY_ENGINE: &str = r#"#!/bin/sh
read -r config
if [ -n "$DUMP" ]; then printf '%s\n' "$config" >> "$DUMP"; fi
port=${ENGINE_PORT:-$((20000 + $$ % 20000))}
echo 'booting engine'
echo '{"level":"debug","msg":"loading schema"}'
echo '{"level":"info","msg":"Started HTTP server.","address":"127.0.0.1:'"$port"'"}'
while read -r line; do
  if [ -n "$DUMP" ]; then printf '%s\n' "$line" >> "$DUMP"; fi
done
"#;

/// Never reports readiness
pub const SILENT_ENGINE: &str = r#"#!/bin/sh
read -r config
exec sleep 30
"#;

/// Reports readiness only the first time it runs (tracked through `$MARKER`)
pub const ONCE_READY_ENGINE: &str = r#"#!/bin/sh
read -r config
if [ -e "$MARKER" ]; then exec sleep 30; fi
touch "$MARKER"
echo '{"level":"info","msg":"Started HTTP server.","address":"127.0.0.1:'"$((20000 + $$ % 20000))"'"}'
exec sleep 30
"#;

/// Rejects its configuration
pub const REJECTING_ENGINE: &str = r#"#!/bin/sh
echo '{"level":"fatal","msg":"invalid configuration"}'
exit 78
"#;

/// Write an executable script into `dir`
pub fn write_engine(dir: &Path, script: &str) -> PathBuf {
    let path = dir.join("engineproxy");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Sidecar config running `script` for a host on `backend_port`
pub fn sidecar(dir: &Path, script: &str, backend_port: u16) -> SidecarConfig {
    let mut config = SidecarConfig::for_backend(backend_port)
        .with_binary(write_engine(dir, script))
        .with_startup_timeout_ms(10_000);
    config.config_reissue_delay_ms = 50;
    config.shutdown_grace_period_secs = 2;
    config
}

pub fn env(pairs: &[(&str, String)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Wait for the first event matching `pred`
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<SupervisorEvent>,
    pred: F,
) -> SupervisorEvent
where
    F: Fn(&SupervisorEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for supervisor event")
}

/// Poll a file until it has `count` lines
pub async fn wait_for_lines(path: &Path, count: usize) -> Vec<String> {
    let start = std::time::Instant::now();
    loop {
        let lines: Vec<String> = std::fs::read_to_string(path)
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default();
        if lines.len() >= count || start.elapsed() > Duration::from_secs(10) {
            return lines;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Send a raw HTTP/1.1 request and return the full response text
pub async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\nContent-Length: {}\r\n",
        method,
        path,
        port,
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    request.push_str(body);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

/// Port from an `http://host:port` URI
pub fn uri_port(uri: &str) -> u16 {
    uri.rsplit_once(':').unwrap().1.parse().unwrap()
}
