// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::helpers::{
    payloads, queue_metric, send_lines, wait_queue_len, wait_window_len, TestEnv,
};
use logqueue::qdisk;
use logqueue::stats::{
    DISK_QUEUE_ALLOCATED, DISK_QUEUE_CAPACITY, DISK_QUEUE_EVENTS, DISK_QUEUE_LOAD_ATTEMPTS,
    DISK_QUEUE_MEMORY, DISK_QUEUE_PROCESSED, DISK_QUEUE_SAVE_ATTEMPTS, DISK_QUEUE_USAGE,
    INPUT_WINDOW_AVAILABLE, INPUT_WINDOW_CAPACITY, OUTPUT_EVENTS,
};
use logqueue::Engine;

#[tokio::test]
async fn test_non_reliable_disk_buffer_fills_and_drains() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.disk_buffer.front_cache_size = 500;
    let engine = Engine::start(config).await.unwrap();

    let _conn = send_lines(engine.source_addr().unwrap(), 0..1224).await;
    wait_queue_len(&engine, 1224).await;

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.front_cache, 500);
    assert_eq!(snapshot.disk, 724);
    let path = snapshot.path.clone();
    assert_eq!(queue_metric(&engine, DISK_QUEUE_ALLOCATED, &path, false), Some(1_048_576.0));
    assert_eq!(queue_metric(&engine, DISK_QUEUE_USAGE, &path, false), Some(1_044_480.0));
    assert_eq!(queue_metric(&engine, DISK_QUEUE_CAPACITY, &path, false), Some(1_044_480.0));
    assert_eq!(queue_metric(&engine, DISK_QUEUE_EVENTS, &path, false), Some(1224.0));
    assert_eq!(queue_metric(&engine, DISK_QUEUE_PROCESSED, &path, false), Some(1224.0));
    assert_eq!(queue_metric(&engine, DISK_QUEUE_MEMORY, &path, false), Some(764_000.0));
    assert_eq!(qdisk::inspect(&path).unwrap().number_of_messages, 724);
    assert_eq!(
        engine.stats().sample_sum(OUTPUT_EVENTS, &[("result", "queued")]),
        Some(1224.0)
    );
    assert_eq!(
        engine.stats().sample_sum(OUTPUT_EVENTS, &[("result", "delivered")]),
        Some(0.0)
    );

    env.bring_destination_up();
    let delivered = env.wait_delivered(1224).await;
    assert_eq!(delivered, payloads(0..1224));
    wait_queue_len(&engine, 0).await;

    assert_eq!(queue_metric(&engine, DISK_QUEUE_USAGE, &path, false), Some(0.0));
    assert_eq!(queue_metric(&engine, DISK_QUEUE_ALLOCATED, &path, false), Some(1_048_576.0));
    assert_eq!(queue_metric(&engine, DISK_QUEUE_MEMORY, &path, false), Some(0.0));
    assert_eq!(queue_metric(&engine, DISK_QUEUE_PROCESSED, &path, false), Some(1224.0));
    assert_eq!(qdisk::inspect(&path).unwrap().number_of_messages, 0);
    assert_eq!(
        engine.stats().sample_sum(OUTPUT_EVENTS, &[("result", "delivered")]),
        Some(1224.0)
    );
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_flow_control_suspends_source_when_every_tier_is_full() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.disk_buffer.front_cache_size = 500;
    let engine = Engine::start(config).await.unwrap();

    // 500 front cache, 724 disk, 100 window slots, one message held back.
    let _conn = send_lines(engine.source_addr().unwrap(), 0..1325).await;
    wait_window_len(&engine, 100).await;

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.disk, 724);
    assert_eq!(snapshot.len(), 1324);
    let connection = [("connection", "0")];
    let stats = engine.stats();
    assert_eq!(stats.sample_sum(INPUT_WINDOW_AVAILABLE, &connection), Some(0.0));
    assert_eq!(stats.sample_sum(INPUT_WINDOW_CAPACITY, &connection), Some(100.0));
    assert_eq!(engine.allocator().unwrap().live_connections(), 1);
    assert_eq!(qdisk::inspect(&snapshot.path).unwrap().number_of_messages, 724);
    assert_eq!(stats.sample_sum(DISK_QUEUE_PROCESSED, &[]), Some(1324.0));
    assert_eq!(stats.sample_sum(DISK_QUEUE_MEMORY, &[]), Some(600.0 * 1528.0));
    assert_eq!(
        engine.stats().sample_sum(OUTPUT_EVENTS, &[("result", "dropped")]),
        Some(0.0)
    );

    env.bring_destination_up();
    let delivered = env.wait_delivered(1325).await;
    assert_eq!(delivered, payloads(0..1325));
    wait_queue_len(&engine, 0).await;
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_without_flow_control_overflow_is_dropped() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.flow_control = false;
    config.disk_buffer.front_cache_size = 10;
    let engine = Engine::start(config).await.unwrap();

    let _conn = send_lines(engine.source_addr().unwrap(), 0..744).await;
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(20);
    while engine.stats().sample_sum(OUTPUT_EVENTS, &[("result", "dropped")]) != Some(10.0) {
        assert!(tokio::time::Instant::now() < deadline, "messages were not dropped");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    assert_eq!(engine.snapshot().await.unwrap().len(), 734);
    assert_eq!(engine.stats().sample_sum(DISK_QUEUE_PROCESSED, &[]), Some(744.0));

    env.bring_destination_up();
    assert_eq!(env.wait_delivered(734).await, payloads(0..734));
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_and_start_preserves_buffered_messages() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.disk_buffer.front_cache_size = 100;

    let engine = Engine::start(config.clone()).await.unwrap();
    let conn = send_lines(engine.source_addr().unwrap(), 0..350).await;
    wait_queue_len(&engine, 350).await;
    let path = engine.snapshot().await.unwrap().path;
    drop(conn);
    engine.stop().await.unwrap();

    assert_eq!(qdisk::inspect(&path).unwrap().number_of_messages, 350);

    let engine = Engine::start(config).await.unwrap();
    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.path, path);
    assert_eq!(snapshot.len(), 350);
    assert_eq!(snapshot.front_cache, 100);
    assert_eq!(queue_metric(&engine, DISK_QUEUE_EVENTS, &path, false), Some(350.0));
    assert_eq!(engine.stats().sample_sum(DISK_QUEUE_LOAD_ATTEMPTS, &[]), Some(1.0));

    env.bring_destination_up();
    assert_eq!(env.wait_delivered(350).await, payloads(0..350));
    wait_queue_len(&engine, 0).await;
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_reliable_disk_buffer_bypasses_front_cache() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.disk_buffer.reliable = true;
    let engine = Engine::start(config).await.unwrap();

    let _conn = send_lines(engine.source_addr().unwrap(), 0..50).await;
    wait_queue_len(&engine, 50).await;
    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.front_cache, 0);
    assert_eq!(snapshot.disk, 50);
    assert!(snapshot.path.ends_with("syslog-ng-00000.rqf"));

    engine.stop().await.unwrap();
    assert_eq!(qdisk::inspect(&snapshot.path).unwrap().number_of_messages, 50);
}

#[tokio::test]
async fn test_save_attempts_are_counted_on_stop() {
    let env = TestEnv::new();
    let config = env.config();
    let engine = Engine::start(config.clone()).await.unwrap();
    assert_eq!(engine.stats().sample_sum(DISK_QUEUE_SAVE_ATTEMPTS, &[]), Some(0.0));
    let stats = std::sync::Arc::clone(engine.stats());
    engine.stop().await.unwrap();
    assert_eq!(stats.sample_sum(DISK_QUEUE_SAVE_ATTEMPTS, &[]), Some(1.0));
}
