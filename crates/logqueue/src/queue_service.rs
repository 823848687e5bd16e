// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::disk_queue::{DiskQueue, PushOutcome, QueueSnapshot};
use crate::errors::EngineError;
use crate::message::LogMessage;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error};

#[derive(Debug)]
pub enum QueueCommand {
    Push(LogMessage),
    PopHead(oneshot::Sender<Option<Bytes>>),
    AckBacklog(usize),
    DropBacklog(usize),
    RewindBacklog,
    Snapshot(oneshot::Sender<QueueSnapshot>),
    Shutdown,
}

/// How a [`QueueService`] ended.
#[derive(Debug)]
pub enum ServiceExit {
    /// Shut down; the queue is handed back to be saved or abandoned.
    Stopped(DiskQueue),
    /// The queue was abandoned, fully drained and its file deleted.
    Removed,
}

/// Cloneable handle to the single task that owns a [`DiskQueue`].
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueCommand>,
    available: Arc<Notify>,
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl QueueHandle {
    /// Queues a message. Hands the message back when the service has stopped,
    /// so the caller can retry on the handle that replaced it.
    pub fn push(&self, msg: LogMessage) -> Result<(), LogMessage> {
        match self.tx.send(QueueCommand::Push(msg)) {
            Err(mpsc::error::SendError(QueueCommand::Push(msg))) => Err(msg),
            _ => Ok(()),
        }
    }

    pub async fn pop_head(&self) -> Result<Option<Bytes>, EngineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(QueueCommand::PopHead(response_tx))?;
        response_rx.await.map_err(|_| EngineError::ServiceStopped)
    }

    pub fn ack_backlog(&self, n: usize) -> Result<(), EngineError> {
        self.send(QueueCommand::AckBacklog(n))
    }

    pub fn drop_backlog(&self, n: usize) -> Result<(), EngineError> {
        self.send(QueueCommand::DropBacklog(n))
    }

    pub fn rewind_backlog(&self) -> Result<(), EngineError> {
        self.send(QueueCommand::RewindBacklog)
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, EngineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(QueueCommand::Snapshot(response_tx))?;
        response_rx.await.map_err(|_| EngineError::ServiceStopped)
    }

    pub fn shutdown(&self) -> Result<(), EngineError> {
        self.send(QueueCommand::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves after the next push, or immediately if one happened since the
    /// last call.
    pub async fn notified(&self) {
        self.available.notified().await;
    }

    fn send(&self, command: QueueCommand) -> Result<(), EngineError> {
        self.tx
            .send(command)
            .map_err(|_| EngineError::ServiceStopped)
    }
}

pub struct QueueService {
    queue: DiskQueue,
    rx: mpsc::UnboundedReceiver<QueueCommand>,
    available: Arc<Notify>,
}

impl QueueService {
    pub fn new(queue: DiskQueue) -> (Self, QueueHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let available = Arc::new(Notify::new());
        let service = Self {
            queue,
            rx,
            available: Arc::clone(&available),
        };
        (service, QueueHandle { tx, available })
    }

    pub async fn run(mut self) -> ServiceExit {
        debug!(path = %self.queue.path().display(), "Queue service started");

        if !self.queue.is_empty() {
            self.available.notify_one();
        }
        if self.removable() {
            return self.finish_removed();
        }

        while let Some(command) = self.rx.recv().await {
            match command {
                QueueCommand::Shutdown => {
                    debug!(path = %self.queue.path().display(), "Queue service shutting down");
                    self.rx.close();
                    while let Ok(pending) = self.rx.try_recv() {
                        self.apply(pending);
                    }
                    break;
                }
                other => self.apply(other),
            }
            if self.removable() {
                return self.finish_removed();
            }
        }

        self.wake_all();
        debug!(path = %self.queue.path().display(), "Queue service stopped");
        ServiceExit::Stopped(self.queue)
    }

    fn apply(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Push(msg) => {
                if self.queue.push(msg) == PushOutcome::Queued {
                    self.available.notify_one();
                }
            }
            QueueCommand::PopHead(response_tx) => {
                let head = self.queue.pop_head();
                if let Err(Some(_)) = response_tx.send(head) {
                    debug!("Pop response dropped, message stays in the backlog");
                }
            }
            QueueCommand::AckBacklog(n) => self.queue.ack_backlog(n),
            QueueCommand::DropBacklog(n) => self.queue.drop_backlog(n),
            QueueCommand::RewindBacklog => {
                self.queue.rewind_backlog();
                self.available.notify_one();
            }
            QueueCommand::Snapshot(response_tx) => {
                if response_tx.send(self.queue.snapshot()).is_err() {
                    error!("Failed to send snapshot response - receiver dropped");
                }
            }
            QueueCommand::Shutdown => {}
        }
    }

    fn removable(&self) -> bool {
        self.queue.is_abandoned() && self.queue.is_drained()
    }

    fn finish_removed(mut self) -> ServiceExit {
        self.rx.close();
        self.wake_all();
        if let Err(e) = self.queue.remove() {
            error!(error = %e, "Failed to remove drained disk-buffer file");
        }
        ServiceExit::Removed
    }

    fn wake_all(&self) {
        self.available.notify_waiters();
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskBufferConfig;
    use crate::qdisk::QueueFileId;
    use crate::stats::StatsRegistry;
    use tempfile::TempDir;

    fn queue(dir: &TempDir, abandoned: bool) -> DiskQueue {
        let registry = Arc::new(StatsRegistry::new().expect("registry"));
        let id = QueueFileId::new(0);
        let options = DiskBufferConfig {
            front_cache_size: 2,
            ..Default::default()
        };
        let mut queue = DiskQueue::open(
            &dir.path().join(id.file_name(false)),
            id,
            &options,
            false,
            Arc::clone(&registry),
            registry.output("file,/tmp/out"),
        )
        .expect("open queue");
        if abandoned {
            queue.abandon();
        }
        queue
    }

    #[tokio::test]
    async fn test_push_pop_ack() {
        let dir = TempDir::new().unwrap();
        let (service, handle) = QueueService::new(queue(&dir, false));
        let task = tokio::spawn(service.run());

        for payload in ["a", "b", "c"] {
            handle.push(LogMessage::new(payload)).unwrap();
        }
        handle.notified().await;
        assert_eq!(handle.pop_head().await.unwrap().unwrap(), "a");
        handle.ack_backlog(1).unwrap();
        assert_eq!(handle.pop_head().await.unwrap().unwrap(), "b");
        handle.rewind_backlog().unwrap();
        assert_eq!(handle.pop_head().await.unwrap().unwrap(), "b");

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.backlog, 1);

        handle.shutdown().unwrap();
        let ServiceExit::Stopped(queue) = task.await.unwrap() else {
            panic!("expected the queue back");
        };
        assert_eq!(queue.backlog_len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_pushes_are_applied_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let (service, handle) = QueueService::new(queue(&dir, false));
        handle.push(LogMessage::new("before")).unwrap();
        handle.shutdown().unwrap();
        handle.push(LogMessage::new("after")).unwrap();

        let ServiceExit::Stopped(queue) = service.run().await else {
            panic!("expected the queue back");
        };
        assert_eq!(queue.len(), 2);

        let rejected = handle.push(LogMessage::new("late")).unwrap_err();
        assert_eq!(rejected.payload().as_ref(), b"late");
        assert!(matches!(
            handle.pop_head().await,
            Err(EngineError::ServiceStopped)
        ));
    }

    #[tokio::test]
    async fn test_abandoned_queue_is_removed_once_drained() {
        let dir = TempDir::new().unwrap();
        let mut queue = queue(&dir, false);
        queue.push(LogMessage::new("last"));
        queue.abandon();
        let path = queue.path().to_path_buf();

        let (service, handle) = QueueService::new(queue);
        let task = tokio::spawn(service.run());
        assert_eq!(handle.pop_head().await.unwrap().unwrap(), "last");
        handle.ack_backlog(1).unwrap();

        assert!(matches!(task.await.unwrap(), ServiceExit::Removed));
        assert!(!path.exists());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_empty_abandoned_queue_is_removed_immediately() {
        let dir = TempDir::new().unwrap();
        let (service, _handle) = QueueService::new(queue(&dir, true));
        assert!(matches!(service.run().await, ServiceExit::Removed));
    }
}
