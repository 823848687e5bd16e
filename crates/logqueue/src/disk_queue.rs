// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tiered destination queue: front cache, queue file and flow-control window.
//!
//! Messages are delivered oldest-first across the three tiers. A message only
//! goes to the front cache while the queue file and the window are empty, and
//! only to the queue file while the window is empty, so a tier never holds
//! messages newer than the tier behind it.
//!
//! Messages handed to the destination stay in a backlog until they are acked
//! or rewound.

use crate::config::DiskBufferConfig;
use crate::errors::QueueFileError;
use crate::flow_window::{FlowControlWindow, WindowFull};
use crate::front_cache::{CachePush, FrontCache};
use crate::message::LogMessage;
use crate::qdisk::{QueueFile, QueueFileId, SavedTiers};
use crate::stats::{OutputStats, QueueMetrics, QueueStats, StatsRegistry};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Result of [`DiskQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Dropped,
}

/// Point-in-time view of a queue, used by the engine and by tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub path: PathBuf,
    pub id: QueueFileId,
    pub front_cache: usize,
    pub disk: u64,
    pub window: usize,
    pub backlog: usize,
    pub metrics: QueueMetrics,
}

impl QueueSnapshot {
    /// Messages buffered in the three tiers. The backlog is not included.
    pub fn len(&self) -> u64 {
        self.front_cache as u64 + self.disk + self.window as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct DiskQueue {
    file: QueueFile,
    front_cache: FrontCache,
    window: FlowControlWindow,
    backlog: VecDeque<LogMessage>,
    flow_control: bool,
    registry: Arc<StatsRegistry>,
    stats: QueueStats,
    output: OutputStats,
}

impl std::fmt::Debug for DiskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskQueue")
            .field("file", &self.file)
            .field("front_cache", &self.front_cache.len())
            .field("window", &self.window.len())
            .field("backlog", &self.backlog.len())
            .field("flow_control", &self.flow_control)
            .finish()
    }
}

impl DiskQueue {
    /// Opens the queue file at `path`, restoring what a previous run saved in it.
    ///
    /// An unreadable file is replaced by an empty one.
    pub fn open(
        path: &Path,
        id: QueueFileId,
        options: &DiskBufferConfig,
        flow_control: bool,
        registry: Arc<StatsRegistry>,
        output: OutputStats,
    ) -> Result<Self, QueueFileError> {
        registry.load_attempt();

        let opened = QueueFile::open(
            path,
            id,
            options.capacity_bytes,
            options.reliable,
            options.prealloc,
        );
        let (file, saved) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "Error loading disk-buffer file, starting with an empty queue"
                );
                let file = QueueFile::create(
                    path,
                    id,
                    options.capacity_bytes,
                    options.reliable,
                    options.prealloc,
                )?;
                (file, SavedTiers::default())
            }
        };

        let stats = registry.queue(&path.display().to_string(), id.abandoned);
        let mut queue = Self {
            file,
            front_cache: FrontCache::new(options.front_cache_size),
            window: FlowControlWindow::new(options.flow_control_window_size),
            backlog: VecDeque::new(),
            flow_control,
            registry,
            stats,
            output,
        };
        queue.restore(saved);

        let restored = queue.len();
        if restored > 0 {
            info!(
                path = %path.display(),
                messages = restored,
                "Disk-buffer file loaded"
            );
        }
        queue.output.queued_add(restored);
        queue.publish();
        Ok(queue)
    }

    fn restore(&mut self, saved: SavedTiers) {
        for payload in saved.front_cache.into_iter().rev() {
            self.front_cache.push_front(LogMessage::new(payload));
        }
        for payload in saved.window.into_iter().rev() {
            self.window.push_front(LogMessage::new(payload));
        }
    }

    pub fn id(&self) -> QueueFileId {
        self.file.id()
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn is_abandoned(&self) -> bool {
        self.file.id().abandoned
    }

    pub fn is_reliable(&self) -> bool {
        self.file.is_reliable()
    }

    /// Messages buffered in the three tiers.
    pub fn len(&self) -> u64 {
        self.front_cache.len() as u64 + self.file.len() + self.window.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Nothing buffered and nothing in flight.
    pub fn is_drained(&self) -> bool {
        self.is_empty() && self.backlog.is_empty()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            path: self.file.path().to_path_buf(),
            id: self.file.id(),
            front_cache: self.front_cache.len(),
            disk: self.file.len(),
            window: self.window.len(),
            backlog: self.backlog.len(),
            metrics: self.metrics(),
        }
    }

    /// Queues a message.
    ///
    /// Messages stored in the front cache or the queue file are acked right
    /// away. Messages buffered in the flow-control window keep their window
    /// slot until they are moved to disk or delivered.
    pub fn push(&mut self, msg: LogMessage) -> PushOutcome {
        let mut msg = msg;
        if self.is_abandoned() {
            return self.drop_message(msg);
        }

        if self.front_cache_open() {
            msg.ack();
            match self.front_cache.push(msg) {
                CachePush::Accepted => return self.accepted(),
                CachePush::Overflow(back) => msg = back,
            }
        }

        if self.window.is_empty() && self.write_disk(&msg) {
            msg.ack();
            return self.accepted();
        }

        if self.flow_control {
            match self.window.buffer(msg) {
                Ok(()) => return self.accepted(),
                Err(WindowFull(back)) => msg = back,
            }
        }

        self.drop_message(msg)
    }

    /// Takes the oldest message and keeps it in the backlog until it is acked.
    pub fn pop_head(&mut self) -> Option<Bytes> {
        let msg = match self.front_cache.pop_oldest() {
            Some(msg) => Some(msg),
            None => match self.read_disk() {
                Some(payload) => Some(LogMessage::new(payload)),
                None => self.window.pop_oldest(),
            },
        }?;

        let payload = msg.payload().clone();
        self.backlog.push_back(msg);
        self.move_messages();
        self.publish();
        Some(payload)
    }

    /// Marks the `n` oldest backlog messages delivered.
    pub fn ack_backlog(&mut self, n: usize) {
        let acked = self.take_backlog(n);
        for _ in 0..acked {
            self.output.delivered_inc();
        }
        self.output.queued_sub(acked);
        self.publish();
    }

    /// Drops the `n` oldest backlog messages after a permanent delivery failure.
    pub fn drop_backlog(&mut self, n: usize) {
        let dropped = self.take_backlog(n);
        self.output.dropped_add(dropped);
        self.output.queued_sub(dropped);
        self.publish();
    }

    /// Puts every backlog message back at the head, in their original order.
    pub fn rewind_backlog(&mut self) {
        if self.backlog.is_empty() {
            return;
        }
        debug!(
            path = %self.file.path().display(),
            messages = self.backlog.len(),
            "Rewinding backlog"
        );
        while let Some(msg) = self.backlog.pop_back() {
            self.front_cache.push_front(msg);
        }
        self.publish();
    }

    /// Stops accepting new messages. The queue keeps draining.
    pub fn abandon(&mut self) {
        if self.is_abandoned() {
            return;
        }
        info!(path = %self.file.path().display(), "Abandoning disk-buffer file");
        self.file.abandon();
        self.stats.mark_abandoned();
        self.publish();
    }

    /// Writes the in-memory tiers and the rewound backlog into the queue file.
    ///
    /// Returns the number of messages the file holds afterwards. On success the
    /// memory tiers are emptied and the queue must be reopened from its file to
    /// continue. On failure the queue is left as it was.
    pub fn save(&mut self) -> Result<u64, QueueFileError> {
        self.rewind_backlog();
        self.registry.save_attempt();

        let saved = self.len();
        let front_cache: Vec<Bytes> = self.front_cache.iter().map(|m| m.payload().clone()).collect();
        let window: Vec<Bytes> = self.window.iter().map(|m| m.payload().clone()).collect();
        self.file.save_tiers(
            front_cache.iter().map(|p| p.as_ref()),
            window.iter().map(|p| p.as_ref()),
        )?;
        self.front_cache.drain().for_each(drop);
        self.window.drain().for_each(drop);
        self.output.queued_sub(saved);

        debug!(
            path = %self.file.path().display(),
            messages = saved,
            front_cache = front_cache.len(),
            window = window.len(),
            "Disk-buffer file saved"
        );
        Ok(saved)
    }

    /// Deletes the queue file and its metrics. Only valid once drained.
    pub fn remove(self) -> Result<(), QueueFileError> {
        let path = self.file.path().to_path_buf();
        info!(path = %path.display(), "Disk-buffer file fully drained, removing");
        self.stats.remove();
        drop(self.file);
        fs::remove_file(&path).map_err(|e| QueueFileError::io(&path, e))
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            allocated_bytes: self.file.allocated_bytes(),
            usage_bytes: self.file.usage_bytes(),
            events: self.len(),
            memory_bytes: (self.front_cache.memory_bytes() + self.window.memory_bytes()) as u64,
            capacity_bytes: self.file.max_usable_bytes(),
        }
    }

    fn front_cache_open(&self) -> bool {
        !self.file.is_reliable()
            && self.file.is_empty()
            && self.window.is_empty()
            && !self.front_cache.is_full()
    }

    fn accepted(&mut self) -> PushOutcome {
        self.stats.processed_inc();
        self.output.queued_add(1);
        self.publish();
        PushOutcome::Queued
    }

    fn drop_message(&mut self, msg: LogMessage) -> PushOutcome {
        debug!(
            path = %self.file.path().display(),
            len = msg.len(),
            "Destination queue full, dropping message"
        );
        drop(msg);
        self.stats.processed_inc();
        self.output.dropped_inc();
        self.publish();
        PushOutcome::Dropped
    }

    fn take_backlog(&mut self, n: usize) -> u64 {
        let n = n.min(self.backlog.len());
        self.backlog.drain(..n);
        n as u64
    }

    fn write_disk(&mut self, msg: &LogMessage) -> bool {
        if !self.file.has_space() {
            return false;
        }
        match self.file.write(msg.payload()) {
            Ok(written) => written,
            Err(e) => {
                error!(
                    path = %self.file.path().display(),
                    error = %e,
                    "Error writing disk-buffer file"
                );
                false
            }
        }
    }

    fn read_disk(&mut self) -> Option<Bytes> {
        match self.file.read_oldest() {
            Ok(payload) => payload,
            Err(e) => {
                let lost = self.file.len();
                error!(
                    path = %self.file.path().display(),
                    error = %e,
                    lost,
                    "Error reading disk-buffer file, dropping its contents"
                );
                if let Err(e) = self.file.reset() {
                    error!(path = %self.file.path().display(), error = %e, "Error resetting disk-buffer file");
                }
                self.output.dropped_add(lost);
                self.output.queued_sub(lost);
                None
            }
        }
    }

    /// Refills the front cache from disk, then moves window messages forward.
    fn move_messages(&mut self) {
        if !self.file.is_reliable() {
            while !self.front_cache.is_full() {
                let Some(payload) = self.read_disk() else {
                    break;
                };
                self.front_cache.append(LogMessage::new(payload));
            }
        }

        while let Some(mut msg) = self.window.pop_oldest() {
            if self.front_cache_open_for_window() {
                msg.ack();
                self.front_cache.append(msg);
                continue;
            }
            if self.write_disk(&msg) {
                msg.ack();
                continue;
            }
            self.window.push_front(msg);
            break;
        }
    }

    fn front_cache_open_for_window(&self) -> bool {
        !self.file.is_reliable() && self.file.is_empty() && !self.front_cache.is_full()
    }

    fn publish(&self) {
        self.stats.update(&self.metrics());
    }
}
