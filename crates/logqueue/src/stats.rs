// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metrics surface shared by every component of the engine.
//!
//! A single [`StatsRegistry`] is created by the engine and passed by `Arc` to
//! the queues, the window allocator and the sources. Values are exposed in the
//! Prometheus text format and can be queried back with [`StatsRegistry::sample`],
//! which is how operators and tests read them.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub const DISK_QUEUE_PROCESSED: &str = "syslogng_disk_queue_processed_events_total";
pub const DISK_QUEUE_ALLOCATED: &str = "syslogng_disk_queue_disk_allocated_bytes";
pub const DISK_QUEUE_USAGE: &str = "syslogng_disk_queue_disk_usage_bytes";
pub const DISK_QUEUE_EVENTS: &str = "syslogng_disk_queue_events";
pub const DISK_QUEUE_MEMORY: &str = "syslogng_disk_queue_memory_usage_bytes";
pub const DISK_QUEUE_CAPACITY: &str = "syslogng_disk_queue_capacity_bytes";
pub const DISK_QUEUE_LOAD_ATTEMPTS: &str = "syslogng_disk_queue_load_attempts_total";
pub const DISK_QUEUE_SAVE_ATTEMPTS: &str = "syslogng_disk_queue_save_attempts_total";
pub const OUTPUT_EVENTS: &str = "syslogng_output_events_total";
pub const INPUT_EVENTS: &str = "syslogng_input_events_total";
pub const INPUT_WINDOW_AVAILABLE: &str = "syslogng_input_window_available";
pub const INPUT_WINDOW_CAPACITY: &str = "syslogng_input_window_capacity";

const QUEUE_LABELS: &[&str] = &["path", "abandoned"];

/// One series returned by [`StatsRegistry::sample`].
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

pub struct StatsRegistry {
    registry: Registry,
    processed: IntCounterVec,
    disk_allocated: IntGaugeVec,
    disk_usage: IntGaugeVec,
    events: IntGaugeVec,
    memory_usage: IntGaugeVec,
    capacity: IntGaugeVec,
    output_events: IntGaugeVec,
    input_events: IntCounter,
    window_available: IntGaugeVec,
    window_capacity: IntGaugeVec,
    load_attempts: IntCounter,
    save_attempts: IntCounter,
}

impl StatsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let processed = IntCounterVec::new(
            Opts::new(DISK_QUEUE_PROCESSED, "Messages accepted by the disk queue"),
            QUEUE_LABELS,
        )?;
        let disk_allocated = IntGaugeVec::new(
            Opts::new(DISK_QUEUE_ALLOCATED, "Bytes allocated by the queue file"),
            QUEUE_LABELS,
        )?;
        let disk_usage = IntGaugeVec::new(
            Opts::new(DISK_QUEUE_USAGE, "Bytes used by records in the queue file"),
            QUEUE_LABELS,
        )?;
        let events = IntGaugeVec::new(
            Opts::new(DISK_QUEUE_EVENTS, "Messages held by the queue"),
            QUEUE_LABELS,
        )?;
        let memory_usage = IntGaugeVec::new(
            Opts::new(DISK_QUEUE_MEMORY, "Bytes held by the in-memory tiers"),
            QUEUE_LABELS,
        )?;
        let capacity = IntGaugeVec::new(
            Opts::new(DISK_QUEUE_CAPACITY, "Usable bytes of the queue file"),
            QUEUE_LABELS,
        )?;
        let output_events = IntGaugeVec::new(
            Opts::new(OUTPUT_EVENTS, "Messages by delivery result"),
            &["id", "result"],
        )?;
        let input_events = IntCounter::new(INPUT_EVENTS, "Messages received by sources")?;
        let window_available = IntGaugeVec::new(
            Opts::new(INPUT_WINDOW_AVAILABLE, "Free input window slots"),
            &["connection"],
        )?;
        let window_capacity = IntGaugeVec::new(
            Opts::new(INPUT_WINDOW_CAPACITY, "Input window capacity"),
            &["connection"],
        )?;
        let load_attempts =
            IntCounter::new(DISK_QUEUE_LOAD_ATTEMPTS, "Queue file load attempts")?;
        let save_attempts =
            IntCounter::new(DISK_QUEUE_SAVE_ATTEMPTS, "Queue file save attempts")?;

        registry.register(Box::new(processed.clone()))?;
        registry.register(Box::new(disk_allocated.clone()))?;
        registry.register(Box::new(disk_usage.clone()))?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(memory_usage.clone()))?;
        registry.register(Box::new(capacity.clone()))?;
        registry.register(Box::new(output_events.clone()))?;
        registry.register(Box::new(input_events.clone()))?;
        registry.register(Box::new(window_available.clone()))?;
        registry.register(Box::new(window_capacity.clone()))?;
        registry.register(Box::new(load_attempts.clone()))?;
        registry.register(Box::new(save_attempts.clone()))?;

        Ok(Self {
            registry,
            processed,
            disk_allocated,
            disk_usage,
            events,
            memory_usage,
            capacity,
            output_events,
            input_events,
            window_available,
            window_capacity,
            load_attempts,
            save_attempts,
        })
    }

    /// Series of one queue file, labelled `{path, abandoned}`.
    pub fn queue(self: &Arc<Self>, path: &str, abandoned: bool) -> QueueStats {
        QueueStats::new(Arc::clone(self), path.to_string(), abandoned)
    }

    /// Delivery counters of one destination.
    pub fn output(&self, id: &str) -> OutputStats {
        OutputStats {
            delivered: self.output_events.with_label_values(&[id, "delivered"]),
            queued: self.output_events.with_label_values(&[id, "queued"]),
            dropped: self.output_events.with_label_values(&[id, "dropped"]),
        }
    }

    pub fn input_event(&self) {
        self.input_events.inc();
    }

    pub fn load_attempt(&self) {
        self.load_attempts.inc();
    }

    pub fn save_attempt(&self) {
        self.save_attempts.inc();
    }

    pub fn set_window(&self, connection: u64, available: usize, capacity: usize) {
        let label = connection.to_string();
        self.window_available
            .with_label_values(&[label.as_str()])
            .set(to_i64(available as u64));
        self.window_capacity
            .with_label_values(&[label.as_str()])
            .set(to_i64(capacity as u64));
    }

    pub fn remove_window(&self, connection: u64) {
        let label = connection.to_string();
        let _ = self.window_available.remove_label_values(&[label.as_str()]);
        let _ = self.window_capacity.remove_label_values(&[label.as_str()]);
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Returns every series of `name` whose labels contain all of `labels`.
    ///
    /// An unknown name, or a vector metric that has no series yet, yields an
    /// empty list rather than zero.
    pub fn sample(&self, name: &str, labels: &[(&str, &str)]) -> Vec<Sample> {
        let text = match self.render() {
            Ok(text) => text,
            Err(e) => {
                debug!("Failed to render metrics: {e}");
                return Vec::new();
            }
        };
        text.lines()
            .filter(|line| !line.starts_with('#'))
            .filter_map(parse_sample_line)
            .filter(|(series, _)| series == name)
            .map(|(_, sample)| sample)
            .filter(|sample| {
                labels
                    .iter()
                    .all(|(key, value)| sample.labels.get(*key).map(String::as_str) == Some(*value))
            })
            .collect()
    }

    /// Sum of every matching series, `None` when nothing matches.
    pub fn sample_sum(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let samples = self.sample(name, labels);
        if samples.is_empty() {
            None
        } else {
            Some(samples.iter().map(|s| s.value).sum())
        }
    }
}

/// Gauges and counters of one queue file.
pub struct QueueStats {
    stats: Arc<StatsRegistry>,
    path: String,
    abandoned: bool,
    processed: IntCounter,
    allocated: IntGauge,
    usage: IntGauge,
    events: IntGauge,
    memory: IntGauge,
    capacity: IntGauge,
}

/// Values published by a queue after each operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    pub allocated_bytes: u64,
    pub usage_bytes: u64,
    pub events: u64,
    pub memory_bytes: u64,
    pub capacity_bytes: u64,
}

impl QueueStats {
    fn new(stats: Arc<StatsRegistry>, path: String, abandoned: bool) -> Self {
        let flag = abandoned_label(abandoned);
        let labels = [path.as_str(), flag];
        Self {
            processed: stats.processed.with_label_values(&labels),
            allocated: stats.disk_allocated.with_label_values(&labels),
            usage: stats.disk_usage.with_label_values(&labels),
            events: stats.events.with_label_values(&labels),
            memory: stats.memory_usage.with_label_values(&labels),
            capacity: stats.capacity.with_label_values(&labels),
            stats,
            path,
            abandoned,
        }
    }

    pub fn processed_inc(&self) {
        self.processed.inc();
    }

    pub fn processed(&self) -> u64 {
        self.processed.get()
    }

    pub fn update(&self, metrics: &QueueMetrics) {
        self.allocated.set(to_i64(metrics.allocated_bytes));
        self.usage.set(to_i64(metrics.usage_bytes));
        self.events.set(to_i64(metrics.events));
        self.memory.set(to_i64(metrics.memory_bytes));
        self.capacity.set(to_i64(metrics.capacity_bytes));
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// Moves every series of this queue under `abandoned="true"`.
    pub fn mark_abandoned(&mut self) {
        if self.abandoned {
            return;
        }
        let moved = QueueStats::new(Arc::clone(&self.stats), self.path.clone(), true);
        moved.processed.inc_by(self.processed.get());
        moved.allocated.set(self.allocated.get());
        moved.usage.set(self.usage.get());
        moved.events.set(self.events.get());
        moved.memory.set(self.memory.get());
        moved.capacity.set(self.capacity.get());
        self.remove();
        *self = moved;
    }

    /// Drops every series of this queue from the registry.
    pub fn remove(&self) {
        let labels = [self.path.as_str(), abandoned_label(self.abandoned)];
        let _ = self.stats.processed.remove_label_values(&labels);
        let _ = self.stats.disk_allocated.remove_label_values(&labels);
        let _ = self.stats.disk_usage.remove_label_values(&labels);
        let _ = self.stats.events.remove_label_values(&labels);
        let _ = self.stats.memory_usage.remove_label_values(&labels);
        let _ = self.stats.capacity.remove_label_values(&labels);
    }
}

/// `syslogng_output_events_total` series of one destination.
#[derive(Clone)]
pub struct OutputStats {
    delivered: IntGauge,
    queued: IntGauge,
    dropped: IntGauge,
}

impl OutputStats {
    pub fn delivered_inc(&self) {
        self.delivered.inc();
    }

    pub fn dropped_inc(&self) {
        self.dropped.inc();
    }

    pub fn dropped_add(&self, n: u64) {
        self.dropped.add(to_i64(n));
    }

    pub fn queued_add(&self, n: u64) {
        self.queued.add(to_i64(n));
    }

    pub fn queued_sub(&self, n: u64) {
        self.queued.sub(to_i64(n));
    }

    pub fn delivered(&self) -> i64 {
        self.delivered.get()
    }

    pub fn queued(&self) -> i64 {
        self.queued.get()
    }

    pub fn dropped(&self) -> i64 {
        self.dropped.get()
    }
}

fn abandoned_label(abandoned: bool) -> &'static str {
    if abandoned {
        "true"
    } else {
        "false"
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Parses `name{k="v",...} value` or `name value`.
fn parse_sample_line(line: &str) -> Option<(String, Sample)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let name_end = line.find(|c: char| c == '{' || c.is_whitespace())?;
    let name = line[..name_end].to_string();
    let mut labels = BTreeMap::new();
    let mut rest = &line[name_end..];

    if let Some(body) = rest.strip_prefix('{') {
        let mut chars = body.char_indices();
        let mut key = String::new();
        let mut value = String::new();
        let mut in_value = false;
        let mut escaped = false;
        let mut closed_at = None;
        while let Some((idx, c)) = chars.next() {
            if in_value {
                match (escaped, c) {
                    (true, 'n') => {
                        value.push('\n');
                        escaped = false;
                    }
                    (true, other) => {
                        value.push(other);
                        escaped = false;
                    }
                    (false, '\\') => escaped = true,
                    (false, '"') => {
                        labels.insert(std::mem::take(&mut key), std::mem::take(&mut value));
                        in_value = false;
                    }
                    (false, other) => value.push(other),
                }
                continue;
            }
            match c {
                '=' => {
                    if let Some((_, '"')) = chars.next() {
                        in_value = true;
                    } else {
                        return None;
                    }
                }
                ',' | ' ' => {}
                '}' => {
                    closed_at = Some(idx);
                    break;
                }
                other => key.push(other),
            }
        }
        rest = &body[closed_at? + 1..];
    }

    let value = rest.split_whitespace().next()?.parse::<f64>().ok()?;
    Some((name, Sample { labels, value }))
}
