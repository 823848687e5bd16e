// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use logqueue::config::{Config, DestinationDriver};
use logqueue::Engine;
use std::net::SocketAddr;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

/// Payload size giving 1444-byte records (8-byte record header).
pub const PAYLOAD_LEN: usize = 1436;

const WAIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Queue directory plus a file destination that stays down until
/// [`TestEnv::bring_destination_up`] creates its parent directory.
pub struct TestEnv {
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.dir.path().join("queues")
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.path().join("out").join("destination.log")
    }

    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.source.port = 0;
        config.window.log_iw_size = 1000;
        config.window.max_connections = 10;
        config.disk_buffer.dir = self.queue_dir();
        config.disk_buffer.capacity_bytes = 1024 * 1024;
        config.destination.driver = DestinationDriver::File {
            path: self.output_path(),
        };
        config.destination.time_reopen = Duration::from_millis(100);
        config
    }

    pub fn bring_destination_up(&self) {
        std::fs::create_dir_all(self.dir.path().join("out")).unwrap();
    }

    pub fn delivered(&self) -> Vec<String> {
        match std::fs::read_to_string(self.output_path()) {
            Ok(content) => content.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn wait_delivered(&self, n: usize) -> Vec<String> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let delivered = self.delivered();
            if delivered.len() >= n {
                return delivered;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {n} deliveries, got {}",
                delivered.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Message `i`, padded to [`PAYLOAD_LEN`] bytes.
pub fn payload(i: usize) -> String {
    let prefix = format!("message-{i:08}-");
    format!("{prefix}{}", "x".repeat(PAYLOAD_LEN - prefix.len()))
}

pub fn payloads(range: Range<usize>) -> Vec<String> {
    range.map(payload).collect()
}

/// Writes one line per message and keeps the connection open.
pub async fn send_lines(addr: SocketAddr, range: Range<usize>) -> TcpStream {
    let mut stream = timeout(Duration::from_secs(2), TcpStream::connect(addr))
        .await
        .unwrap()
        .unwrap();
    let mut buf = Vec::with_capacity(range.len() * (PAYLOAD_LEN + 1));
    for i in range {
        buf.extend_from_slice(payload(i).as_bytes());
        buf.push(b'\n');
    }
    stream.write_all(&buf).await.unwrap();
    stream.flush().await.unwrap();
    stream
}

/// Waits until the active queue holds `n` messages.
pub async fn wait_queue_len(engine: &Engine, n: u64) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let len = engine.snapshot().await.unwrap().len();
        if len == n {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {n} queued messages, got {len}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Waits until the active queue's flow-control window holds `n` messages.
pub async fn wait_window_len(engine: &Engine, n: usize) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let len = engine.snapshot().await.unwrap().window;
        if len == n {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {n} messages in the window, got {len}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Value of a `{path, abandoned}` queue metric.
pub fn queue_metric(engine: &Engine, name: &str, path: &Path, abandoned: bool) -> Option<f64> {
    let path = path.display().to_string();
    let abandoned = if abandoned { "true" } else { "false" };
    engine
        .stats()
        .sample_sum(name, &[("path", path.as_str()), ("abandoned", abandoned)])
}

/// Send an HTTP request over TCP and return the response
pub async fn send_tcp_request(
    port: u16,
    uri: &str,
    method: &str,
    headers: &[(&str, &str)],
    body: Option<Vec<u8>>,
) -> Result<Response<hyper::body::Incoming>, Box<dyn std::error::Error>> {
    let stream = timeout(
        Duration::from_secs(2),
        TcpStream::connect(format!("127.0.0.1:{}", port)),
    )
    .await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut request_builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("Host", "localhost");
    for (name, value) in headers {
        request_builder = request_builder.header(*name, *value);
    }

    let body = body.map(Bytes::from).unwrap_or_default();
    let request = request_builder.body(Full::new(body))?;
    let response = timeout(Duration::from_secs(2), sender.send_request(request)).await??;
    Ok(response)
}
