use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::db::ShadowDb;
use crate::error::Result;
use crate::ledger::{WriteId, WriteReceipt};
use crate::storage::Storage;
use crate::value::{Columns, Value};

/// Server-confirmed state of a row, as stored in the synced table.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncedRow {
    pub id: Value,
    /// Every declared column other than `id`.
    pub values: Columns,
    pub write_id: Option<WriteId>,
}

impl SyncedRow {
    pub fn get(&self, col: &str) -> &Value {
        self.values.get(col).unwrap_or(&Value::Null)
    }
}

/// Pending local edits of a row, as stored in the local table.
///
/// `values` holds exactly the columns in `changed_columns`; every other
/// column is stored as NULL and ignored by the merge.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalRow {
    pub id: Value,
    pub values: Columns,
    pub changed_columns: BTreeSet<String>,
    pub is_deleted: bool,
    pub write_id: WriteId,
}

impl LocalRow {
    pub(crate) fn new(id: Value, write_id: WriteId) -> Self {
        Self {
            id,
            values: Columns::new(),
            changed_columns: BTreeSet::new(),
            is_deleted: false,
            write_id,
        }
    }

    pub fn is_changed(&self, col: &str) -> bool {
        self.changed_columns.contains(col)
    }

    pub(crate) fn set(&mut self, col: &str, value: Value) {
        self.values.insert(col.to_string(), value);
        self.changed_columns.insert(col.to_string());
    }

    pub(crate) fn clear(&mut self, col: &str) {
        self.values.remove(col);
        self.changed_columns.remove(col);
    }

    /// A local row with nothing overridden and no pending delete is redundant.
    pub fn is_redundant(&self) -> bool {
        self.changed_columns.is_empty() && !self.is_deleted
    }
}

/// Confirmed state of a row delivered by the sync transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedRow {
    pub id: Value,
    pub values: Columns,
    #[serde(default)]
    pub write_id: Option<WriteId>,
}

impl ConfirmedRow {
    pub fn new(id: impl Into<Value>) -> Self {
        Self { id: id.into(), values: Columns::new(), write_id: None }
    }

    pub fn column(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn write_id(mut self, write_id: WriteId) -> Self {
        self.write_id = Some(write_id);
        self
    }
}

pub struct InsertBuilder<'a, S: Storage> {
    db: &'a ShadowDb<S>,
    table: String,
    id: Value,
    columns: Columns,
}

impl<'a, S: Storage> InsertBuilder<'a, S> {
    pub(crate) fn new(db: &'a ShadowDb<S>, table: &str, id: Value) -> Self {
        Self { db, table: table.to_string(), id, columns: Columns::new() }
    }

    pub fn column(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.columns.insert(name.to_string(), value.into());
        self
    }

    pub fn commit(self) -> Result<WriteReceipt> {
        self.db.insert_row(&self.table, self.id, self.columns)
    }
}

pub struct UpdateBuilder<'a, S: Storage> {
    db: &'a ShadowDb<S>,
    table: String,
    id: Value,
    columns: Columns,
}

impl<'a, S: Storage> UpdateBuilder<'a, S> {
    pub(crate) fn new(db: &'a ShadowDb<S>, table: &str, id: Value) -> Self {
        Self { db, table: table.to_string(), id, columns: Columns::new() }
    }

    pub fn column(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.columns.insert(name.to_string(), value.into());
        self
    }

    pub fn commit(self) -> Result<WriteReceipt> {
        self.db.update_row(&self.table, self.id, self.columns)
    }
}
