//! Run checkpointing.
//!
//! While a run is active the dispatcher periodically persists a small
//! record of where it is. The record is the only state expected to outlive
//! the process: on normal completion it is removed, after a crash or kill
//! it stays behind so the run can be resumed from the last dispatched line.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint is available")]
    NoCheckpoint,
    #[error("checkpoint store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Exactly one record exists at a time; each save overwrites the last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// The most recently dispatched command line.
    pub last_line: String,
    /// RFC 3339 wall-clock time of the save.
    pub timestamp: String,
    /// Identifier of the command source the run was loaded from.
    pub source: String,
    /// Monotonically increasing count of dispatched commands this run.
    pub dispatched: u64,
}

impl CheckpointRecord {
    pub fn new(last_line: impl Into<String>, source: impl Into<String>, dispatched: u64) -> Self {
        Self {
            last_line: last_line.into(),
            timestamp: chrono::Local::now().to_rfc3339(),
            source: source.into(),
            dispatched,
        }
    }
}

/// Storage backend for the single checkpoint record.
///
/// A file-backed store is used in production; the in-memory store backs
/// tests that must not touch the filesystem.
pub trait CheckpointStore: Send + Sync {
    /// Persist the record, replacing any prior one.
    fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;
    /// Retrieve the stored record, failing with [`CheckpointError::NoCheckpoint`]
    /// if none exists.
    fn load(&self) -> Result<CheckpointRecord, CheckpointError>;
    /// Remove the record. A no-op when none exists.
    fn clear(&self) -> Result<(), CheckpointError>;
}

/// JSON record at a fixed path. Saves go through a sibling temp file and a
/// rename so a crash mid-write cannot leave a truncated record.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let json = serde_json::to_string_pretty(record)?;
        let temp = self.temp_path();
        std::fs::write(&temp, json)?;
        std::fs::rename(&temp, &self.path)?;
        tracing::trace!("checkpoint saved: {:?}", record.last_line);
        Ok(())
    }

    fn load(&self) -> Result<CheckpointRecord, CheckpointError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NoCheckpoint);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&text)?)
    }

    fn clear(&self) -> Result<(), CheckpointError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for deterministic round-trip testing.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    record: Mutex<Option<CheckpointRecord>>,
    saves: std::sync::atomic::AtomicU64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of saves ever made; lets tests assert checkpoint cadence.
    pub fn save_count(&self) -> u64 {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        *self.record.lock().expect("checkpoint mutex poisoned") = Some(record.clone());
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> Result<CheckpointRecord, CheckpointError> {
        self.record
            .lock()
            .expect("checkpoint mutex poisoned")
            .clone()
            .ok_or(CheckpointError::NoCheckpoint)
    }

    fn clear(&self) -> Result<(), CheckpointError> {
        *self.record.lock().expect("checkpoint mutex poisoned") = None;
        Ok(())
    }
}
