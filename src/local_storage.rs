//! Local state storage
//!
//! Keeps the current uptime cycle and a short history of rewards in a JSON
//! file under the data directory. Writes go to a temp file in the same
//! directory which is then renamed over the target, so a crash never leaves a
//! half-written file behind.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{Reward, UptimeCycle};

/// Rewards kept in the history
pub const REWARD_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupted state file {path}: {source}")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub reward: Reward,
    pub cycle_started_at: i64,
    pub reported_at: i64,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UptimeState {
    #[serde(default)]
    pub cycle: Option<UptimeCycle>,
    #[serde(default)]
    pub rewards: Vec<RewardRecord>,
}

impl UptimeState {
    /// Append a reward, dropping the oldest beyond the history limit
    pub fn push_reward(&mut self, record: RewardRecord) {
        self.rewards.push(record);
        if self.rewards.len() > REWARD_HISTORY_LIMIT {
            let excess = self.rewards.len() - REWARD_HISTORY_LIMIT;
            self.rewards.drain(..excess);
        }
    }
}

pub trait UptimeStore: Send + Sync {
    fn load(&self) -> Result<UptimeState, StorageError>;
    fn save(&self, state: &UptimeState) -> Result<(), StorageError>;
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct FileUptimeStore {
    path: PathBuf,
}

impl FileUptimeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl UptimeStore for FileUptimeStore {
    fn load(&self) -> Result<UptimeState, StorageError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No uptime state at {}", self.path.display());
                return Ok(UptimeState::default());
            }
            Err(e) => return Err(self.io_err(e)),
        };
        serde_json::from_str(&raw).map_err(|source| StorageError::Corrupted {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, state: &UptimeState) -> Result<(), StorageError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| self.io_err(e))?;
            info!("Created data directory {}", dir.display());
        }

        let data = serde_json::to_vec_pretty(state)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| self.io_err(e))?;
        tmp.write_all(&data).map_err(|e| self.io_err(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_err(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_err(e.error))?;
        Ok(())
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryUptimeStore {
    state: Mutex<UptimeState>,
    saves: Mutex<usize>,
}

impl MemoryUptimeStore {
    pub fn with_state(state: UptimeState) -> Self {
        Self {
            state: Mutex::new(state),
            saves: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> UptimeState {
        self.state.lock().clone()
    }

    pub fn saves(&self) -> usize {
        *self.saves.lock()
    }
}

impl UptimeStore for MemoryUptimeStore {
    fn load(&self) -> Result<UptimeState, StorageError> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &UptimeState) -> Result<(), StorageError> {
        *self.state.lock() = state.clone();
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(n: i64) -> RewardRecord {
        RewardRecord {
            reward: Reward {
                id: Some(format!("r{}", n)),
                amount: n as f64,
                currency: None,
            },
            cycle_started_at: n,
            reported_at: n + 1,
            duration_ms: 60_000,
        }
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileUptimeStore::new(dir.path().join("nested").join("uptime.json"));

        assert_eq!(store.load().unwrap(), UptimeState::default());

        let mut state = UptimeState {
            cycle: Some(UptimeCycle::new(1_000, 3_600_000)),
            rewards: vec![],
        };
        state.push_reward(record(1));
        store.save(&state).unwrap();

        assert_eq!(store.load().unwrap(), state);
        // Only the target file remains, no temp leftovers
        let entries = fs::read_dir(store.path().parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_file_store_corrupted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uptime.json");
        fs::write(&path, "{not json").unwrap();

        let err = FileUptimeStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StorageError::Corrupted { .. }));
    }

    #[test]
    fn test_reward_history_is_bounded() {
        let mut state = UptimeState::default();
        for n in 0..(REWARD_HISTORY_LIMIT as i64 + 5) {
            state.push_reward(record(n));
        }
        assert_eq!(state.rewards.len(), REWARD_HISTORY_LIMIT);
        assert_eq!(state.rewards[0].cycle_started_at, 5);
    }

    #[test]
    fn test_memory_store_counts_saves() {
        let store = MemoryUptimeStore::default();
        store.save(&UptimeState::default()).unwrap();
        store.save(&UptimeState::default()).unwrap();
        assert_eq!(store.saves(), 2);
    }
}
