// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::MESSAGE_MEMORY_OVERHEAD;
use crate::window::WindowHandle;
use bytes::Bytes;
use std::fmt;

/// A single log message travelling from a source to a destination.
///
/// Messages admitted under flow control carry an [`AckToken`]. The token holds
/// one slot of the source connection's input window and gives it back when it
/// is dropped, so acknowledging a message is the same as dropping its token.
pub struct LogMessage {
    payload: Bytes,
    ack: Option<AckToken>,
}

impl LogMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ack: None,
        }
    }

    pub fn with_ack(payload: impl Into<Bytes>, token: AckToken) -> Self {
        Self {
            payload: payload.into(),
            ack: Some(token),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Memory accounted for this message while it is buffered.
    pub fn memory_size(&self) -> usize {
        self.payload.len() + MESSAGE_MEMORY_OVERHEAD
    }

    /// True while the message still holds a window slot of its source.
    pub fn is_pending_ack(&self) -> bool {
        self.ack.is_some()
    }

    /// Acknowledges the message to its source. Calling it twice is a no-op.
    pub fn ack(&mut self) {
        self.ack.take();
    }

    /// Acknowledges the message and returns its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl fmt::Debug for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogMessage")
            .field("len", &self.payload.len())
            .field("pending_ack", &self.ack.is_some())
            .finish()
    }
}

/// One reserved input window slot. Released on drop.
pub struct AckToken {
    window: WindowHandle,
}

impl AckToken {
    pub fn new(window: WindowHandle) -> Self {
        Self { window }
    }
}

impl Drop for AckToken {
    fn drop(&mut self) {
        self.window.release(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;
    use crate::stats::StatsRegistry;
    use crate::window::WindowAllocator;
    use std::sync::Arc;

    fn allocator() -> WindowAllocator {
        let config = WindowConfig {
            log_iw_size: 1000,
            max_connections: 10,
            ..Default::default()
        };
        WindowAllocator::new(&config, Arc::new(StatsRegistry::new().unwrap()))
    }

    #[test]
    fn test_ack_releases_window_slot() {
        let allocator = allocator();
        let handle = allocator.admit("127.0.0.1:50000").unwrap();
        assert!(handle.consume(1));
        assert_eq!(handle.available(), 99);

        let mut msg = LogMessage::with_ack("hello", AckToken::new(handle.clone()));
        assert!(msg.is_pending_ack());
        msg.ack();
        assert!(!msg.is_pending_ack());
        assert_eq!(handle.available(), 100);

        msg.ack();
        assert_eq!(handle.available(), 100);
    }

    #[test]
    fn test_into_payload_releases_window_slot() {
        let allocator = allocator();
        let handle = allocator.admit("127.0.0.1:50001").unwrap();
        assert!(handle.consume(1));

        let msg = LogMessage::with_ack("payload", AckToken::new(handle.clone()));
        let payload = msg.into_payload();
        assert_eq!(payload, Bytes::from_static(b"payload"));
        assert_eq!(handle.in_use(), 0);
    }

    #[test]
    fn test_plain_message_has_no_ack() {
        let msg = LogMessage::new(Bytes::from_static(b"x"));
        assert!(!msg.is_pending_ack());
        assert_eq!(msg.len(), 1);
    }

    #[test]
    fn test_memory_size_includes_overhead() {
        let msg = LogMessage::new(vec![b'x'; 1436]);
        assert_eq!(msg.memory_size(), 1528);
    }
}
