// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destination liveness: connects to the destination, drains the queue while it
//! is up and waits `time_reopen` between attempts while it is down.

use crate::destination::{DeliveryResult, Destination};
use crate::errors::EngineError;
use crate::queue_service::QueueHandle;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Down,
    Up,
}

pub struct Coordinator {
    destination: Box<dyn Destination>,
    queue: QueueHandle,
    time_reopen: Duration,
    cancel: CancellationToken,
    state: watch::Sender<Liveness>,
}

impl Coordinator {
    pub fn new(
        destination: Box<dyn Destination>,
        queue: QueueHandle,
        time_reopen: Duration,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<Liveness>) {
        let (state, state_rx) = watch::channel(Liveness::Down);
        let coordinator = Self {
            destination,
            queue,
            time_reopen,
            cancel,
            state,
        };
        (coordinator, state_rx)
    }

    pub async fn run(mut self) {
        let id = self.destination.id();
        debug!(destination = %id, "Coordinator started");

        while !self.cancel.is_cancelled() {
            let connected = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.destination.connect() => result,
            };
            if let Err(e) = connected {
                warn!(
                    destination = %id,
                    error = %e,
                    time_reopen = ?self.time_reopen,
                    "Destination is down, retrying after time_reopen"
                );
                if !self.wait_reopen().await {
                    break;
                }
                continue;
            }

            info!(destination = %id, "Destination is up");
            self.state.send_replace(Liveness::Up);

            match self.drain(&id).await {
                Drain::Failed => {
                    self.destination.disconnect().await;
                    self.state.send_replace(Liveness::Down);
                    if !self.wait_reopen().await {
                        break;
                    }
                }
                Drain::Finished => break,
            }
        }

        self.destination.disconnect().await;
        self.state.send_replace(Liveness::Down);
        debug!(destination = %id, "Coordinator stopped");
    }

    /// Delivers until a temporary failure, cancellation or the queue stops.
    async fn drain(&mut self, id: &str) -> Drain {
        loop {
            let head = tokio::select! {
                () = self.cancel.cancelled() => return Drain::Finished,
                head = self.queue.pop_head() => head,
            };
            let payload = match head {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    tokio::select! {
                        () = self.cancel.cancelled() => return Drain::Finished,
                        () = self.queue.notified() => {}
                    }
                    continue;
                }
                Err(EngineError::ServiceStopped) => return Drain::Finished,
                Err(e) => {
                    error!(destination = %id, error = %e, "Failed to read from queue");
                    return Drain::Finished;
                }
            };

            let result = tokio::select! {
                () = self.cancel.cancelled() => return Drain::Finished,
                result = self.destination.deliver(&payload) => result,
            };
            let sent = match result {
                DeliveryResult::Ok => self.queue.ack_backlog(1),
                DeliveryResult::TemporaryFailure(reason) => {
                    warn!(
                        destination = %id,
                        reason = %reason,
                        time_reopen = ?self.time_reopen,
                        "Destination is down, retrying after time_reopen"
                    );
                    if self.queue.rewind_backlog().is_err() {
                        return Drain::Finished;
                    }
                    return Drain::Failed;
                }
                DeliveryResult::PermanentFailure(reason) => {
                    error!(destination = %id, reason = %reason, "Destination rejected message, dropping it");
                    self.queue.drop_backlog(1)
                }
            };
            if sent.is_err() {
                return Drain::Finished;
            }
        }
    }

    /// Sleeps `time_reopen`. Returns false when cancelled.
    async fn wait_reopen(&self) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(self.time_reopen) => true,
        }
    }
}

enum Drain {
    Failed,
    Finished,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskBufferConfig;
    use crate::disk_queue::DiskQueue;
    use crate::message::LogMessage;
    use crate::qdisk::QueueFileId;
    use crate::queue_service::{QueueService, ServiceExit};
    use crate::stats::StatsRegistry;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Scripted {
        connects: Arc<Mutex<VecDeque<bool>>>,
        results: Arc<Mutex<VecDeque<DeliveryResult>>>,
        delivered: Arc<Mutex<Vec<Bytes>>>,
    }

    #[async_trait]
    impl Destination for Scripted {
        fn id(&self) -> String {
            "scripted".to_string()
        }

        async fn connect(&mut self) -> std::io::Result<()> {
            let ok = self.connects.lock().unwrap().pop_front().unwrap_or(true);
            if ok {
                Ok(())
            } else {
                Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"))
            }
        }

        async fn deliver(&mut self, payload: &Bytes) -> DeliveryResult {
            let result = self
                .results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(DeliveryResult::Ok);
            if result == DeliveryResult::Ok {
                self.delivered.lock().unwrap().push(payload.clone());
            }
            result
        }

        async fn disconnect(&mut self) {}
    }

    fn service(dir: &TempDir, registry: &Arc<StatsRegistry>) -> (QueueService, QueueHandle) {
        let id = QueueFileId::new(0);
        let queue = DiskQueue::open(
            &dir.path().join(id.file_name(false)),
            id,
            &DiskBufferConfig::default(),
            false,
            Arc::clone(registry),
            registry.output("scripted"),
        )
        .unwrap();
        QueueService::new(queue)
    }

    async fn wait_delivered(destination: &Scripted, n: usize) {
        for _ in 0..500 {
            if destination.delivered.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {n} deliveries");
    }

    #[tokio::test]
    async fn test_delivers_after_destination_comes_up() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(StatsRegistry::new().unwrap());
        let (service, handle) = service(&dir, &registry);
        let service_task = tokio::spawn(service.run());

        for i in 0..5 {
            handle.push(LogMessage::new(format!("msg-{i}"))).unwrap();
        }

        let destination = Scripted::default();
        destination
            .connects
            .lock()
            .unwrap()
            .extend([false, false, true]);
        let cancel = CancellationToken::new();
        let (coordinator, mut state) = Coordinator::new(
            Box::new(destination.clone()),
            handle.clone(),
            Duration::from_millis(20),
            cancel.clone(),
        );
        let coordinator_task = tokio::spawn(coordinator.run());

        state.wait_for(|s| *s == Liveness::Up).await.unwrap();
        wait_delivered(&destination, 5).await;
        let delivered: Vec<String> = destination
            .delivered
            .lock()
            .unwrap()
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();
        assert_eq!(delivered, vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);

        cancel.cancel();
        coordinator_task.await.unwrap();
        handle.shutdown().unwrap();
        assert!(matches!(service_task.await.unwrap(), ServiceExit::Stopped(_)));
        assert_eq!(registry.output("scripted").delivered(), 5);
        assert_eq!(registry.output("scripted").queued(), 0);
    }

    #[tokio::test]
    async fn test_temporary_failure_retries_same_message() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(StatsRegistry::new().unwrap());
        let (service, handle) = service(&dir, &registry);
        let service_task = tokio::spawn(service.run());
        handle.push(LogMessage::new("first")).unwrap();
        handle.push(LogMessage::new("second")).unwrap();

        let destination = Scripted::default();
        destination.results.lock().unwrap().extend([
            DeliveryResult::TemporaryFailure("connection reset".to_string()),
            DeliveryResult::Ok,
            DeliveryResult::PermanentFailure("rejected".to_string()),
        ]);
        let cancel = CancellationToken::new();
        let (coordinator, _state) = Coordinator::new(
            Box::new(destination.clone()),
            handle.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        );
        let coordinator_task = tokio::spawn(coordinator.run());

        wait_delivered(&destination, 1).await;
        for _ in 0..500 {
            if registry.output("scripted").dropped() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(destination.delivered.lock().unwrap()[0], "first");
        let output = registry.output("scripted");
        assert_eq!(output.delivered(), 1);
        assert_eq!(output.dropped(), 1);
        assert_eq!(output.queued(), 0);

        cancel.cancel();
        coordinator_task.await.unwrap();
        handle.shutdown().unwrap();
        service_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_queue_stops() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(StatsRegistry::new().unwrap());
        let (service, handle) = service(&dir, &registry);
        let service_task = tokio::spawn(service.run());

        let (coordinator, _state) = Coordinator::new(
            Box::new(Scripted::default()),
            handle.clone(),
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        let coordinator_task = tokio::spawn(coordinator.run());

        handle.shutdown().unwrap();
        service_task.await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), coordinator_task)
            .await
            .expect("coordinator did not stop")
            .unwrap();
    }
}
