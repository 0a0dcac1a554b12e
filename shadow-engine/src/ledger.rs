//! Change ledger: the append-only record of local writes that drives upload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::value::{Columns, Value};

/// Identifier of one write operation. Unique across the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WriteId(String);

impl WriteId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WriteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WriteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for WriteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(Error::InvalidState(format!("unknown ledger operation '{}'", other))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger entry before the storage engine assigns its sequence and clock.
#[derive(Clone, Debug)]
pub struct NewChange {
    pub table: String,
    pub row_id: Value,
    pub operation: Operation,
    pub value: Columns,
    pub write_id: WriteId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Strictly increasing in commit order.
    pub sequence: u64,
    pub table: String,
    pub row_id: Value,
    pub operation: Operation,
    /// Row payload: the full row for inserts and deletes, the changed
    /// columns for updates. Always carries `id`.
    pub value: Columns,
    pub write_id: WriteId,
    /// Transaction marker, strictly increasing with `sequence`.
    pub logical_clock: u64,
    pub created_at: u64,
}

/// Receipt for a write accepted by the interceptor.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteReceipt {
    pub sequence: u64,
    pub write_id: WriteId,
    pub operation: Operation,
}

impl From<&ChangeEntry> for WriteReceipt {
    fn from(entry: &ChangeEntry) -> Self {
        Self {
            sequence: entry.sequence,
            write_id: entry.write_id.clone(),
            operation: entry.operation,
        }
    }
}

/// Next value of the ledger's logical clock: wall time in milliseconds,
/// bumped past the previous value when the wall clock stalls or steps back.
pub(crate) fn next_clock(previous: u64) -> u64 {
    now_millis().max(previous.saturating_add(1))
}

pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
