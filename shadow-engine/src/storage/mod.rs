mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::Result;
use crate::ledger::{ChangeEntry, NewChange};
use crate::merge::MergedRow;
use crate::query::Query;
use crate::row::{LocalRow, SyncedRow};
use crate::schema::ShadowTable;
use crate::value::Value;

/// Row-level access to the shadow tables and the ledger inside one open
/// transaction. Everything done through a `ShadowTx` commits or rolls back
/// together.
pub trait ShadowTx {
    fn synced_row(&mut self, table: &ShadowTable, id: &Value) -> Result<Option<SyncedRow>>;
    fn local_row(&mut self, table: &ShadowTable, id: &Value) -> Result<Option<LocalRow>>;

    /// Inserts or replaces the local row for `row.id`.
    fn put_local(&mut self, table: &ShadowTable, row: &LocalRow) -> Result<()>;
    fn delete_local(&mut self, table: &ShadowTable, id: &Value) -> Result<bool>;

    /// Inserts or replaces the synced row for `row.id`.
    fn put_synced(&mut self, table: &ShadowTable, row: &SyncedRow) -> Result<()>;
    fn delete_synced(&mut self, table: &ShadowTable, id: &Value) -> Result<bool>;

    /// Appends to the ledger, assigning the next sequence number and clock.
    fn append_change(&mut self, change: NewChange) -> Result<ChangeEntry>;
    /// Entries with `after < sequence <= through`, in sequence order.
    fn changes_between(&mut self, after: u64, through: u64) -> Result<Vec<ChangeEntry>>;
    fn last_sequence(&mut self) -> Result<u64>;

    fn acknowledged_through(&mut self) -> Result<u64>;
    fn set_acknowledged_through(&mut self, sequence: u64) -> Result<()>;
}

pub trait Storage: Send + Sync {
    /// Creates the physical tables and view for a declared table. Idempotent.
    fn install(&self, table: &ShadowTable) -> Result<()>;

    /// Runs `f` inside one atomic transaction. Writers are serialized, so
    /// ledger sequence numbers follow commit order. If `f` or the commit
    /// fails, nothing `f` did is visible afterwards.
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn ShadowTx) -> Result<T>;

    fn merged_rows(&self, table: &ShadowTable, query: &Query) -> Result<Vec<MergedRow>>;

    fn merged_row(&self, table: &ShadowTable, id: &Value) -> Result<Option<MergedRow>> {
        let query = Query::new().eq(crate::schema::ID_COLUMN, id.clone());
        Ok(self.merged_rows(table, &query)?.into_iter().next())
    }

    /// Point reads outside any write transaction; they never take the
    /// writer lock.
    fn local_row(&self, table: &ShadowTable, id: &Value) -> Result<Option<LocalRow>>;
    fn synced_row(&self, table: &ShadowTable, id: &Value) -> Result<Option<SyncedRow>>;

    /// Up to `limit` entries with `sequence > since`, in sequence order.
    fn changes_since(&self, since: u64, limit: usize) -> Result<Vec<ChangeEntry>>;

    fn acknowledged_through(&self) -> Result<u64>;

    /// Deletes acknowledged entries, keeping the newest `keep_last` of them.
    /// Returns the number of entries removed.
    fn compact_changes(&self, keep_last: usize) -> Result<usize>;
}
