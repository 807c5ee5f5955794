//! Ledger snapshot persistence for TuCoin

use crate::blockchain::{Blockchain, LedgerSnapshot};
use crate::error::ChainError;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Abstraction for persistence backends. Saving must replace the previous
/// snapshot atomically: a reader sees either the old or the new one.
pub trait Persistence: Send + Sync {
    fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<(), ChainError>;

    /// `Ok(None)` when nothing has been saved yet.
    fn load_snapshot(&self) -> Result<Option<LedgerSnapshot>, ChainError>;

    /// Restore the ledger, or start a fresh one when no snapshot exists.
    fn load_blockchain(&self) -> Result<Blockchain, ChainError> {
        match self.load_snapshot()? {
            Some(snapshot) => Blockchain::from_snapshot(snapshot),
            None => Ok(Blockchain::new()),
        }
    }
}

/// Pretty-printed JSON file, written to a sibling temp file then renamed
/// over the target.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Persistence for JsonFilePersistence {
    fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<(), ChainError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ChainError::PersistenceError(format!(
                        "Failed to create data dir {:?}: {}",
                        parent, e
                    ))
                })?;
            }
        }

        let json = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.temp_path();
        fs::write(&temp, json).map_err(|e| {
            ChainError::PersistenceError(format!("Failed to write {:?}: {}", temp, e))
        })?;
        fs::rename(&temp, &self.path).map_err(|e| {
            ChainError::PersistenceError(format!("Failed to replace {:?}: {}", self.path, e))
        })?;

        debug!(
            "Saved snapshot ({} blocks, {} pending) to {:?}",
            snapshot.chain.len(),
            snapshot.pending_transactions.len(),
            self.path
        );
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<LedgerSnapshot>, ChainError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(|e| {
            ChainError::PersistenceError(format!("Failed to read {:?}: {}", self.path, e))
        })?;
        let snapshot = serde_json::from_slice(&bytes).map_err(|e| {
            ChainError::PersistenceError(format!("Corrupt snapshot {:?}: {}", self.path, e))
        })?;
        Ok(Some(snapshot))
    }
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPersistence {
    snapshot: Arc<Mutex<Option<LedgerSnapshot>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for InMemoryPersistence {
    fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<(), ChainError> {
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<LedgerSnapshot>, ChainError> {
        Ok(self.snapshot.lock().clone())
    }
}
