//! Local-first storage over shadow tables.
//!
//! Every declared table is backed by a `synced_<name>` table holding the
//! server-confirmed rows and a `local_<name>` table holding pending edits
//! with per-column dirty tracking. Reads go through a merge view where a
//! changed local column wins over its synced counterpart. Writes land in the
//! local table and the change ledger in one transaction; confirmations from
//! the remote are reconciled column by column.
//!
//! ```no_run
//! use shadow_engine::{ColumnDef, ConfirmedRow, ShadowDb, ShadowOptions};
//!
//! # fn main() -> shadow_engine::Result<()> {
//! let mut db = ShadowDb::open_in_memory()?;
//! db.declare_table(
//!     "todos",
//!     vec![ColumnDef::text("id"), ColumnDef::text("title").not_null()],
//!     ShadowOptions::default(),
//! )?;
//! db.insert("todos", "A").column("title", "buy milk").commit()?;
//! db.apply_confirmed_row("todos", ConfirmedRow::new("A").column("title", "buy milk"))?;
//! assert!(db.local_row("todos", "A")?.is_none());
//! # Ok(())
//! # }
//! ```

mod config;
mod db;
mod error;
mod gc;
mod interceptor;
mod ledger;
mod merge;
mod query;
mod reconciler;
mod row;
mod schema;
pub mod storage;
mod sync;
mod value;

pub use config::{EngineConfig, JournalMode, Synchronous};
pub use db::ShadowDb;
pub use error::{Error, Result};
pub use gc::{run_gc, LedgerRetention};
pub use ledger::{ChangeEntry, NewChange, Operation, WriteId, WriteReceipt};
pub use merge::{merge_row, merged_view_sql, MergedRow};
pub use query::{Filter, Order, Query};
pub use reconciler::{AckReport, LocalState, ReconcileOutcome};
pub use row::{ConfirmedRow, InsertBuilder, LocalRow, SyncedRow, UpdateBuilder};
pub use schema::{
    declare_shadow_table, ColumnDef, ColumnType, ForeignKey, OnDeleteAction, ShadowOptions, ShadowTable,
};
pub use storage::{MemoryStorage, SqliteStorage, Storage};
pub use sync::{LoopbackRemote, Remote, RemoteChange, SyncReport, SyncSession};
pub use value::{Columns, Value};
