// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::{DestinationConfig, DestinationDriver};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::debug;

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Ok,
    /// The destination is unavailable. The message is retried after `time_reopen`.
    TemporaryFailure(String),
    /// The destination refused this message. It is dropped and counted.
    PermanentFailure(String),
}

#[async_trait]
pub trait Destination: Send + Sync {
    /// Identity of the destination, used as the `id` label of its output metrics.
    fn id(&self) -> String;

    /// Opens the connection. An error keeps the destination down.
    async fn connect(&mut self) -> std::io::Result<()>;

    /// Sends one message. Only called after a successful [`Destination::connect`].
    async fn deliver(&mut self, payload: &Bytes) -> DeliveryResult;

    async fn disconnect(&mut self);
}

/// Builds the driver selected by the configuration.
pub fn from_config(config: &DestinationConfig) -> Box<dyn Destination> {
    match &config.driver {
        DestinationDriver::Tcp { address } => Box::new(TcpDestination::new(address.clone())),
        DestinationDriver::File { path } => Box::new(FileDestination::new(path.clone())),
    }
}

/// Writes each message as one newline-terminated line over TCP.
#[derive(Debug)]
pub struct TcpDestination {
    address: String,
    stream: Option<BufWriter<TcpStream>>,
}

impl TcpDestination {
    pub fn new(address: String) -> Self {
        Self {
            address,
            stream: None,
        }
    }
}

#[async_trait]
impl Destination for TcpDestination {
    fn id(&self) -> String {
        format!("tcp,{}", self.address)
    }

    async fn connect(&mut self) -> std::io::Result<()> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        debug!(address = %self.address, "Destination connected");
        self.stream = Some(BufWriter::new(stream));
        Ok(())
    }

    async fn deliver(&mut self, payload: &Bytes) -> DeliveryResult {
        let Some(stream) = self.stream.as_mut() else {
            return DeliveryResult::TemporaryFailure("not connected".to_string());
        };
        let written = async {
            stream.write_all(payload).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await
        }
        .await;
        match written {
            Ok(()) => DeliveryResult::Ok,
            Err(e) => {
                self.stream = None;
                DeliveryResult::TemporaryFailure(e.to_string())
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

/// Appends each message as one line to a file.
#[derive(Debug)]
pub struct FileDestination {
    path: PathBuf,
    file: Option<File>,
}

impl FileDestination {
    pub fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }
}

#[async_trait]
impl Destination for FileDestination {
    fn id(&self) -> String {
        format!("file,{}", self.path.display())
    }

    async fn connect(&mut self) -> std::io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.file = Some(file);
        Ok(())
    }

    async fn deliver(&mut self, payload: &Bytes) -> DeliveryResult {
        let Some(file) = self.file.as_mut() else {
            return DeliveryResult::TemporaryFailure("file not open".to_string());
        };
        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.push(b'\n');
        match file.write_all(&line).await {
            Ok(()) => DeliveryResult::Ok,
            Err(e) => {
                self.file = None;
                DeliveryResult::TemporaryFailure(e.to_string())
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
    }
}
