// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::helpers::{payload, payloads, send_lines, wait_window_len, TestEnv};
use logqueue::stats::{INPUT_EVENTS, INPUT_WINDOW_AVAILABLE, INPUT_WINDOW_CAPACITY};
use logqueue::Engine;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn window_sample(engine: &Engine, name: &str) -> Option<f64> {
    engine.stats().sample_sum(name, &[("connection", "0")])
}

#[tokio::test]
async fn test_static_window_is_split_across_max_connections() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.disk_buffer.front_cache_size = 0;
    let engine = Engine::start(config).await.unwrap();

    // 724 records fill the disk, the next 99 wait in the flow-control window.
    let mut conn = send_lines(engine.source_addr().unwrap(), 0..823).await;
    wait_window_len(&engine, 99).await;
    assert_eq!(window_sample(&engine, INPUT_WINDOW_CAPACITY), Some(100.0));
    assert_eq!(window_sample(&engine, INPUT_WINDOW_AVAILABLE), Some(1.0));

    conn.write_all(format!("{}\n", payload(823)).as_bytes())
        .await
        .unwrap();
    wait_window_len(&engine, 100).await;
    assert_eq!(window_sample(&engine, INPUT_WINDOW_AVAILABLE), Some(0.0));
    assert_eq!(engine.stats().sample_sum(INPUT_EVENTS, &[]), Some(824.0));

    env.bring_destination_up();
    assert_eq!(env.wait_delivered(824).await, payloads(0..824));
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_connections_over_the_limit_are_rejected() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.window.log_iw_size = 200;
    config.window.max_connections = 2;
    let engine = Engine::start(config).await.unwrap();
    let addr = engine.source_addr().unwrap();

    let _first = send_lines(addr, 0..1).await;
    let _second = send_lines(addr, 1..2).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while engine.allocator().unwrap().live_connections() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "connections not admitted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut rejected = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), rejected.read(&mut buf))
        .await
        .expect("rejected connection was not closed");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(engine.allocator().unwrap().live_connections(), 2);

    engine.stop().await.unwrap();
}
