// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors raised while building or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid size '{0}'")]
    InvalidSize(String),

    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by a single queue file.
#[derive(Debug, thiserror::Error)]
pub enum QueueFileError {
    #[error("I/O error on queue file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Queue file {0} has an invalid magic")]
    BadMagic(PathBuf),

    #[error("Queue file {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u8 },

    #[error("Queue file {0} is truncated")]
    Truncated(PathBuf),

    #[error("Queue file {path} has a corrupt record at offset {offset}")]
    CorruptRecord { path: PathBuf, offset: u64 },

    #[error("Queue file {0} is read-only")]
    ReadOnly(PathBuf),
}

impl QueueFileError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by the running engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    QueueFile(#[from] QueueFileError),

    #[error("Queue service is not running")]
    ServiceStopped,

    #[error("Failed to access persist state {path}: {reason}")]
    Persist { path: PathBuf, reason: String },

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Engine not running")]
    NotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::InvalidConfig("log_iw_size must be greater than 0".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: log_iw_size must be greater than 0"
        );
    }

    #[test]
    fn test_engine_error_wraps_config_error() {
        let error: EngineError = ConfigError::InvalidSize("12XB".to_string()).into();
        assert_eq!(error.to_string(), "Invalid size '12XB'");
    }

    #[test]
    fn test_queue_file_error_keeps_path() {
        let error = QueueFileError::CorruptRecord {
            path: PathBuf::from("/tmp/syslog-ng-00000.qf"),
            offset: 4096,
        };
        let display = error.to_string();
        assert!(display.contains("syslog-ng-00000.qf"));
        assert!(display.contains("4096"));
    }
}
