//! Engine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gc::LedgerRetention;
use crate::schema::is_identifier;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    Wal,
    Delete,
    Memory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    Off,
    Normal,
    Full,
}

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Database file; `None` opens an in-memory database
    pub path: Option<PathBuf>,
    pub journal_mode: JournalMode,
    pub synchronous: Synchronous,
    /// How long a writer waits on a locked database file, in milliseconds
    pub busy_timeout_ms: u64,
    /// Enforce the rewritten foreign keys (`PRAGMA foreign_keys`). Off by
    /// default: a local row may then reference a row that only exists in
    /// the synced table.
    pub enforce_foreign_keys: bool,
    /// Name of the change ledger table
    pub ledger_table: String,
    /// Name of the key/value table holding the upload cursor and clock
    pub meta_table: String,
    /// Ledger entries uploaded per batch by a sync session
    pub sync_batch_size: usize,
    /// What ledger compaction keeps of acknowledged entries
    pub retention: LedgerRetention,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: None,
            journal_mode: JournalMode::Wal,
            synchronous: Synchronous::Normal,
            busy_timeout_ms: 5000,
            enforce_foreign_keys: false,
            ledger_table: "_shadow_changes".to_string(),
            meta_table: "_shadow_meta".to_string(),
            sync_batch_size: 100,
            retention: LedgerRetention::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: Some(path.into()), ..Self::default() }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidState(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        for name in [&self.ledger_table, &self.meta_table] {
            if !is_identifier(name) {
                return Err(Error::InvalidState(format!("'{}' is not a valid table name", name)));
            }
        }
        if self.ledger_table == self.meta_table {
            return Err(Error::InvalidState("ledger and meta tables must differ".to_string()));
        }
        if self.sync_batch_size == 0 {
            return Err(Error::InvalidState("sync_batch_size must be positive".to_string()));
        }
        Ok(())
    }
}
