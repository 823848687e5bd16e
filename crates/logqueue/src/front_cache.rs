// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::message::LogMessage;
use std::collections::VecDeque;

/// Result of [`FrontCache::push`].
#[derive(Debug)]
pub enum CachePush {
    Accepted,
    /// The cache is full; the message is handed back to be spilled to disk.
    Overflow(LogMessage),
}

/// Bounded in-memory FIFO in front of the queue file.
#[derive(Debug)]
pub struct FrontCache {
    items: VecDeque<LogMessage>,
    capacity: usize,
    bytes: usize,
}

impl FrontCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            bytes: 0,
        }
    }

    pub fn push(&mut self, msg: LogMessage) -> CachePush {
        if self.is_full() {
            return CachePush::Overflow(msg);
        }
        self.bytes += msg.memory_size();
        self.items.push_back(msg);
        CachePush::Accepted
    }

    pub fn pop_oldest(&mut self) -> Option<LogMessage> {
        let msg = self.items.pop_front()?;
        self.bytes -= msg.memory_size();
        Some(msg)
    }

    /// Appends regardless of the capacity. Used when messages move forward
    /// from the queue file or the window.
    pub fn append(&mut self, msg: LogMessage) {
        self.bytes += msg.memory_size();
        self.items.push_back(msg);
    }

    /// Puts a message back at the head, ignoring the capacity. Used when a
    /// delivery is rewound.
    pub fn push_front(&mut self, msg: LogMessage) {
        self.bytes += msg.memory_size();
        self.items.push_front(msg);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = LogMessage> + '_ {
        self.bytes = 0;
        self.items.drain(..)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogMessage> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn memory_bytes(&self) -> usize {
        self.bytes
    }
}
