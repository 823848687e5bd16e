// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Newline-delimited TCP source.
//!
//! Every connection is admitted by the [`WindowAllocator`] and takes one window
//! slot per message. When no slot is left the connection is not read from
//! until a slot is released.

use crate::constants::MAX_LINE_LENGTH;
use crate::errors::EngineError;
use crate::message::{AckToken, LogMessage};
use crate::queue_service::QueueHandle;
use crate::stats::StatsRegistry;
use crate::window::{WindowAllocator, WindowHandle};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Pushes messages to whichever queue is current. The engine swaps the queue
/// on reload; a push that lands on a stopped queue is retried on the new one.
#[derive(Clone, Debug)]
pub struct Ingress {
    queue: watch::Receiver<QueueHandle>,
}

impl Ingress {
    pub fn new(queue: watch::Receiver<QueueHandle>) -> Self {
        Self { queue }
    }

    /// Hands the message back if the engine is gone.
    pub async fn push(&mut self, msg: LogMessage) -> Result<(), LogMessage> {
        let mut msg = msg;
        loop {
            let handle = self.queue.borrow_and_update().clone();
            match handle.push(msg) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    msg = back;
                    if self.queue.changed().await.is_err() {
                        return Err(msg);
                    }
                }
            }
        }
    }
}

pub struct TcpSource {
    listener: TcpListener,
    allocator: WindowAllocator,
    ingress: Ingress,
    stats: Arc<StatsRegistry>,
    cancel: CancellationToken,
}

impl TcpSource {
    pub async fn bind(
        address: &str,
        allocator: WindowAllocator,
        ingress: Ingress,
        stats: Arc<StatsRegistry>,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| EngineError::Bind {
                address: address.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            allocator,
            ingress,
            stats,
            cancel,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        debug!(address = ?self.listener.local_addr().ok(), "TCP source started");
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let (stream, peer) = tokio::select! {
                () = self.cancel.cancelled() => break,
                con_res = self.listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("TCP source accept error: {e}");
                        continue;
                    }
                    Ok(accepted) => accepted,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Connection handler panicked: {:?}", e);
                        }
                    }
                    continue;
                },
            };

            let window = match self.allocator.admit(&peer.to_string()) {
                Ok(window) => window,
                Err(rejected) => {
                    warn!(
                        peer = %peer,
                        max_connections = rejected.max_connections,
                        "Number of allowed concurrent connections reached, rejecting connection"
                    );
                    drop(stream);
                    continue;
                }
            };

            joinset.spawn(read_connection(
                stream,
                peer,
                window,
                self.ingress.clone(),
                Arc::clone(&self.stats),
                self.cancel.clone(),
            ));
        }

        while joinset.join_next().await.is_some() {}
        debug!("TCP source stopped");
    }
}

async fn read_connection(
    stream: TcpStream,
    peer: SocketAddr,
    window: WindowHandle,
    mut ingress: Ingress,
    stats: Arc<StatsRegistry>,
    cancel: CancellationToken,
) {
    debug!(connection = window.id(), peer = %peer, "Connection accepted");
    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(1024);

    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_LINE_LENGTH as u64);
        let read = tokio::select! {
            () = cancel.cancelled() => break,
            read = limited.read_until(b'\n', &mut line) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection = window.id(), peer = %peer, "Connection read error: {e}");
                break;
            }
        }

        let payload = trim_line_ending(&line);
        if payload.is_empty() {
            continue;
        }
        stats.input_event();

        if !reserve_slot(&window, &cancel).await {
            break;
        }
        let msg = LogMessage::with_ack(
            Bytes::copy_from_slice(payload),
            AckToken::new(window.clone()),
        );
        if ingress.push(msg).await.is_err() {
            break;
        }
    }

    window.close();
    debug!(connection = window.id(), peer = %peer, "Connection closed");
}

/// Takes one window slot, waiting while the source is suspended.
/// Returns false when cancelled or closed.
pub(crate) async fn reserve_slot(window: &WindowHandle, cancel: &CancellationToken) -> bool {
    loop {
        if window.consume(1) {
            return true;
        }
        if window.is_closed() {
            return false;
        }
        tokio::select! {
            () = cancel.cancelled() => return false,
            () = window.wait_for_window() => {}
        }
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiskBufferConfig, WindowConfig};
    use crate::disk_queue::DiskQueue;
    use crate::qdisk::QueueFileId;
    use crate::queue_service::{QueueService, ServiceExit};
    use crate::stats::INPUT_EVENTS;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_trim_line_ending() {
        assert_eq!(trim_line_ending(b"abc\n"), b"abc");
        assert_eq!(trim_line_ending(b"abc\r\n"), b"abc");
        assert_eq!(trim_line_ending(b"abc"), b"abc");
        assert_eq!(trim_line_ending(b"\n"), b"");
    }

    fn open_queue(dir: &TempDir, stats: &Arc<StatsRegistry>) -> DiskQueue {
        let id = QueueFileId::new(0);
        DiskQueue::open(
            &dir.path().join(id.file_name(false)),
            id,
            &DiskBufferConfig::default(),
            true,
            Arc::clone(stats),
            stats.output("test"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_ingress_retries_on_replaced_queue() {
        let dir = TempDir::new().unwrap();
        let stats = Arc::new(StatsRegistry::new().unwrap());
        let (old_service, old_handle) = QueueService::new(open_queue(&dir, &stats));
        old_handle.shutdown().unwrap();
        let ServiceExit::Stopped(queue) = old_service.run().await else {
            panic!("expected the queue back");
        };

        let (tx, rx) = watch::channel(old_handle);
        let mut ingress = Ingress::new(rx);

        let (new_service, new_handle) = QueueService::new(queue);
        let task = tokio::spawn(new_service.run());
        let pushed = tokio::spawn(async move { ingress.push(LogMessage::new("moved")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(new_handle.clone()).unwrap();

        assert!(pushed.await.unwrap().is_ok());
        new_handle.notified().await;
        assert_eq!(new_handle.pop_head().await.unwrap().unwrap(), "moved");
        new_handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_lines_are_queued_and_connections_limited() {
        let dir = TempDir::new().unwrap();
        let stats = Arc::new(StatsRegistry::new().unwrap());
        let (service, handle) = QueueService::new(open_queue(&dir, &stats));
        let service_task = tokio::spawn(service.run());
        let (_tx, rx) = watch::channel(handle.clone());

        let allocator = WindowAllocator::new(
            &WindowConfig {
                log_iw_size: 100,
                max_connections: 1,
                ..Default::default()
            },
            Arc::clone(&stats),
        );
        let cancel = CancellationToken::new();
        let source = TcpSource::bind(
            "127.0.0.1:0",
            allocator.clone(),
            Ingress::new(rx),
            Arc::clone(&stats),
            cancel.clone(),
        )
        .await
        .unwrap();
        let address = source.local_addr().unwrap();
        let source_task = tokio::spawn(source.run());

        let mut client = TcpStream::connect(address).await.unwrap();
        client.write_all(b"one\r\ntwo\n\nthree\n").await.unwrap();
        client.flush().await.unwrap();

        for _ in 0..500 {
            if handle.snapshot().await.unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.snapshot().await.unwrap().len(), 3);
        assert_eq!(stats.sample_sum(INPUT_EVENTS, &[]), Some(3.0));
        assert_eq!(allocator.live_connections(), 1);

        // A second connection is over the limit and gets closed.
        let mut rejected = TcpStream::connect(address).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), rejected.read(&mut buf))
            .await
            .expect("rejected connection was not closed");
        assert!(matches!(read, Ok(0) | Err(_)));

        cancel.cancel();
        source_task.await.unwrap();
        handle.shutdown().unwrap();
        service_task.await.unwrap();
    }
}
