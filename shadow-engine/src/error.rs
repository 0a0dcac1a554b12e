use thiserror::Error;

use crate::schema::ColumnType;

#[derive(Debug, Error)]
pub enum Error {
    /// Insert for an id already present in `synced` or `local`.
    #[error("duplicate key {id} in table '{table}'")]
    DuplicateKey { table: String, id: String },

    /// A declared column collides with a bookkeeping column.
    #[error("column '{column}' of table '{table}' collides with a bookkeeping column")]
    SchemaConflict { table: String, column: String },

    #[error("invalid schema for table '{table}': {reason}")]
    InvalidSchema { table: String, reason: String },

    /// The storage engine failed to commit a shadow-table mutation. Nothing was applied.
    #[error("transaction on table '{table}' failed")]
    Transaction {
        table: String,
        #[source]
        source: Box<Error>,
    },

    /// The confirmed row could not be stored; the transport should redeliver it.
    #[error("failed to apply confirmed row {id} to table '{table}'")]
    ReconciliationStorage {
        table: String,
        id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("table '{0}' is not declared")]
    UnknownTable(String),

    #[error("column '{column}' not found in table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("row {id} not found in table '{table}'")]
    NotFound { table: String, id: String },

    #[error("column '{column}' of table '{table}' does not accept null")]
    NullViolation { table: String, column: String },

    #[error("type mismatch for column '{column}': expected {expected}, got {got}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        got: &'static str,
    },

    #[error("primary key of table '{table}' is immutable")]
    ImmutableKey { table: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lock poisoned")]
    LockPoisoned,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Errors raised by the storage engine itself, as opposed to rejected input.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Serialization(_) | Error::LockPoisoned | Error::InvalidState(_)
        )
    }

    /// The storage engine failed, so nothing was applied and the same call
    /// may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transaction { .. } | Error::ReconciliationStorage { .. }) || self.is_storage()
    }

    pub(crate) fn into_transaction_failure(self, table: &str) -> Self {
        if self.is_storage() {
            Error::Transaction { table: table.to_string(), source: Box::new(self) }
        } else {
            self
        }
    }

    pub(crate) fn into_reconciliation_failure(self, table: &str, id: &str) -> Self {
        if self.is_storage() {
            Error::ReconciliationStorage {
                table: table.to_string(),
                id: id.to_string(),
                source: Box::new(self),
            }
        } else {
            self
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
