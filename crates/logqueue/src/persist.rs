// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Records which queue file belongs to which destination, and with which
//! options it was created. Kept as `logqueue.persist` next to the queue files.

use crate::config::{DestinationConfig, DiskBufferConfig};
use crate::constants::PERSIST_FILE_NAME;
use crate::errors::EngineError;
use crate::qdisk::QueueFileId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

const PERSIST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    /// Destination identity, e.g. `tcp,127.0.0.1:514`.
    pub identity: String,
    pub file_name: String,
    pub sequence: u32,
    pub abandoned: bool,
    pub options: DiskBufferConfig,
    pub destination: DestinationConfig,
}

impl QueueRecord {
    pub fn id(&self) -> QueueFileId {
        QueueFileId {
            sequence: self.sequence,
            abandoned: self.abandoned,
        }
    }

    pub fn path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistState {
    pub version: u32,
    pub queues: Vec<QueueRecord>,
}

impl Default for PersistState {
    fn default() -> Self {
        Self {
            version: PERSIST_VERSION,
            queues: Vec::new(),
        }
    }
}

impl PersistState {
    pub fn file_path(dir: &Path) -> PathBuf {
        dir.join(PERSIST_FILE_NAME)
    }

    /// Loads the state kept in `dir`. A missing or unreadable file yields an
    /// empty state.
    pub fn load(dir: &Path) -> Self {
        let path = Self::file_path(dir);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read persist file");
                return Self::default();
            }
        };
        match serde_json::from_str::<Self>(&content) {
            Ok(state) => {
                debug!(path = %path.display(), queues = state.queues.len(), "Persist file loaded");
                state
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to parse persist file");
                Self::default()
            }
        }
    }

    /// Writes the state to a temporary file and renames it over the old one.
    pub fn save(&self, dir: &Path) -> Result<(), EngineError> {
        let path = Self::file_path(dir);
        let persist_error = |reason: String| EngineError::Persist {
            path: path.clone(),
            reason,
        };

        fs::create_dir_all(dir).map_err(|e| persist_error(e.to_string()))?;
        let content =
            serde_json::to_string_pretty(self).map_err(|e| persist_error(e.to_string()))?;
        let tmp = path.with_extension("persist.tmp");
        fs::write(&tmp, content).map_err(|e| persist_error(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| persist_error(e.to_string()))?;
        Ok(())
    }

    /// The queue currently receiving messages for `identity`.
    pub fn active(&self, identity: &str) -> Option<&QueueRecord> {
        self.queues
            .iter()
            .find(|q| !q.abandoned && q.identity == identity)
    }

    pub fn abandoned(&self) -> impl Iterator<Item = &QueueRecord> {
        self.queues.iter().filter(|q| q.abandoned)
    }

    /// Inserts `record`, replacing any record for the same file.
    pub fn upsert(&mut self, record: QueueRecord) {
        self.remove(&record.file_name);
        self.queues.push(record);
    }

    pub fn remove(&mut self, file_name: &str) {
        self.queues.retain(|q| q.file_name != file_name);
    }

    /// Marks the active queue of `identity` abandoned.
    pub fn abandon(&mut self, identity: &str) {
        for queue in self
            .queues
            .iter_mut()
            .filter(|q| !q.abandoned && q.identity == identity)
        {
            queue.abandoned = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(sequence: u32, identity: &str) -> QueueRecord {
        let id = QueueFileId::new(sequence);
        QueueRecord {
            identity: identity.to_string(),
            file_name: id.file_name(false),
            sequence,
            abandoned: false,
            options: DiskBufferConfig::default(),
            destination: DestinationConfig::default(),
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert_eq!(PersistState::load(dir.path()), PersistState::default());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(PersistState::file_path(dir.path()), "{not json").unwrap();
        assert!(PersistState::load(dir.path()).queues.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut state = PersistState::default();
        state.upsert(record(0, "tcp,127.0.0.1:514"));
        state.abandon("tcp,127.0.0.1:514");
        state.upsert(record(1, "tcp,127.0.0.1:514"));
        state.save(dir.path()).unwrap();

        let loaded = PersistState::load(dir.path());
        assert_eq!(loaded, state);
        let active = loaded.active("tcp,127.0.0.1:514").unwrap();
        assert_eq!(active.file_name, "syslog-ng-00001.qf");
        assert_eq!(active.id(), QueueFileId::new(1));
        let abandoned: Vec<_> = loaded.abandoned().map(|q| q.sequence).collect();
        assert_eq!(abandoned, vec![0]);
        assert!(loaded.active("tcp,10.0.0.1:514").is_none());
    }

    #[test]
    fn test_upsert_replaces_same_file() {
        let mut state = PersistState::default();
        state.upsert(record(0, "a"));
        let mut changed = record(0, "a");
        changed.abandoned = true;
        state.upsert(changed);
        assert_eq!(state.queues.len(), 1);
        assert!(state.queues[0].abandoned);
        state.remove("syslog-ng-00000.qf");
        assert!(state.queues.is_empty());
    }
}
