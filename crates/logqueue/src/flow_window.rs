// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::message::LogMessage;
use std::collections::VecDeque;

/// Returned by [`FlowControlWindow::buffer`] with the rejected message.
#[derive(Debug)]
pub struct WindowFull(pub LogMessage);

/// In-memory overflow behind the queue file, used only on flow-controlled paths.
///
/// Messages here still hold their source window slot. The window is therefore
/// bounded by the input windows of the sources feeding it; `limit` is an
/// additional hard ceiling.
#[derive(Debug, Default)]
pub struct FlowControlWindow {
    items: VecDeque<LogMessage>,
    limit: Option<usize>,
    bytes: usize,
}

impl FlowControlWindow {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            limit,
            bytes: 0,
        }
    }

    pub fn buffer(&mut self, msg: LogMessage) -> Result<(), WindowFull> {
        if self.is_full() {
            return Err(WindowFull(msg));
        }
        self.bytes += msg.memory_size();
        self.items.push_back(msg);
        Ok(())
    }

    pub fn pop_oldest(&mut self) -> Option<LogMessage> {
        let msg = self.items.pop_front()?;
        self.bytes -= msg.memory_size();
        Some(msg)
    }

    /// Restores a message taken by [`FlowControlWindow::pop_oldest`] that could not be moved.
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
        self.limit.is_some_and(|limit| self.items.len() >= limit)
    }

    pub fn memory_bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MESSAGE_MEMORY_OVERHEAD;

    #[test]
    fn test_unbounded_window_accepts() {
        let mut window = FlowControlWindow::new(None);
        for i in 0..1000 {
            assert!(window.buffer(LogMessage::new(format!("{i}"))).is_ok());
        }
        assert_eq!(window.len(), 1000);
        assert!(!window.is_full());
    }

    #[test]
    fn test_limit_rejects() {
        let mut window = FlowControlWindow::new(Some(1));
        assert!(window.buffer(LogMessage::new("a")).is_ok());
        let WindowFull(msg) = window.buffer(LogMessage::new("b")).unwrap_err();
        assert_eq!(msg.payload().as_ref(), b"b");
        assert_eq!(window.memory_bytes(), 1 + MESSAGE_MEMORY_OVERHEAD);
    }

    #[test]
    fn test_push_front_restores_order() {
        let mut window = FlowControlWindow::new(None);
        window.buffer(LogMessage::new("a")).unwrap();
        window.buffer(LogMessage::new("b")).unwrap();
        let head = window.pop_oldest().unwrap();
        window.push_front(head);
        let order: Vec<_> = window.drain().map(|m| m.into_payload()).collect();
        assert_eq!(order, vec!["a", "b"]);
        assert_eq!(window.memory_bytes(), 0);
    }
}
