use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior};

use super::{ShadowTx, Storage};
use crate::config::{EngineConfig, JournalMode, Synchronous};
use crate::error::{Error, Result};
use crate::ledger::{next_clock, now_millis, ChangeEntry, NewChange, WriteId};
use crate::merge::{merged_view_sql, MergedRow};
use crate::query::Query;
use crate::row::{LocalRow, SyncedRow};
use crate::schema::{quote, ShadowTable, CHANGED_COLUMNS, ID_COLUMN, IS_DELETED, WRITE_ID};
use crate::value::{Columns, Value};

const ACKNOWLEDGED_KEY: &str = "acknowledged_through";
const CLOCK_KEY: &str = "logical_clock";

fn init_sql(config: &EngineConfig) -> String {
    let journal = match config.journal_mode {
        JournalMode::Wal => "WAL",
        JournalMode::Delete => "DELETE",
        JournalMode::Memory => "MEMORY",
    };
    let synchronous = match config.synchronous {
        Synchronous::Off => "OFF",
        Synchronous::Normal => "NORMAL",
        Synchronous::Full => "FULL",
    };
    format!(
        r#"
PRAGMA journal_mode = {journal};
PRAGMA synchronous = {synchronous};
PRAGMA foreign_keys = {fk};

CREATE TABLE IF NOT EXISTS {ledger} (
    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    row_id TEXT NOT NULL,
    operation TEXT NOT NULL CHECK (operation IN ('insert', 'update', 'delete')),
    value TEXT NOT NULL,
    write_id TEXT NOT NULL UNIQUE,
    logical_clock INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS {meta} (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
) WITHOUT ROWID;
"#,
        journal = journal,
        synchronous = synchronous,
        fk = if config.enforce_foreign_keys { "ON" } else { "OFF" },
        ledger = quote(&config.ledger_table),
        meta = quote(&config.meta_table),
    )
}

/// Shadow tables in SQLite. One connection, serialized behind a mutex;
/// every write transaction starts `IMMEDIATE` so the ledger sequence is
/// assigned while holding the database write lock.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    ledger_table: String,
    meta_table: String,
}

impl SqliteStorage {
    pub fn open(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let conn = match &config.path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.execute_batch(&init_sql(config))?;
        Ok(Self {
            conn: Mutex::new(conn),
            ledger_table: config.ledger_table.clone(),
            meta_table: config.meta_table.clone(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(&EngineConfig::default())
    }

    /// Direct read access for ad-hoc SQL, e.g. joins across merged views.
    /// Writes must go through the shadow database handle.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.lock()?;
        Ok(f(&conn)?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Runs `f` in a deferred transaction: a consistent snapshot that only
    /// takes a shared lock on the database file.
    fn read<T>(&self, f: impl FnOnce(&mut SqliteTx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = {
            let mut shadow = SqliteTx {
                tx: &tx,
                ledger_table: &self.ledger_table,
                meta_table: &self.meta_table,
            };
            f(&mut shadow)?
        };
        tx.commit()?;
        Ok(out)
    }
}

fn select_list(table: &ShadowTable, extra: &[&str]) -> String {
    std::iter::once(ID_COLUMN)
        .chain(table.data_columns().map(|c| c.name.as_str()))
        .chain(extra.iter().copied())
        .map(quote)
        .collect::<Vec<_>>()
        .join(", ")
}

fn upsert_sql(physical: &str, table: &ShadowTable, extra: &[&str]) -> String {
    let cols: Vec<&str> = std::iter::once(ID_COLUMN)
        .chain(table.data_columns().map(|c| c.name.as_str()))
        .chain(extra.iter().copied())
        .collect();
    let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = cols[1..]
        .iter()
        .map(|c| format!("{c} = excluded.{c}", c = quote(c)))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
        quote(physical),
        cols.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
        placeholders.join(", "),
        quote(ID_COLUMN),
        updates.join(", ")
    )
}

fn decode_columns(table: &ShadowTable, raw: &[Value]) -> Result<(Value, Columns)> {
    let id = table.id_column().col_type.coerce(ID_COLUMN, raw[0].clone())?;
    let mut values = Columns::new();
    for (col, value) in table.data_columns().zip(&raw[1..]) {
        values.insert(col.name.clone(), col.col_type.coerce(&col.name, value.clone())?);
    }
    Ok((id, values))
}

fn read_values(row: &rusqlite::Row<'_>, count: usize) -> rusqlite::Result<Vec<Value>> {
    (0..count).map(|i| row.get::<_, Value>(i)).collect()
}

type RawChange = (i64, String, String, String, String, String, i64, i64);

fn decode_change(raw: RawChange) -> Result<ChangeEntry> {
    let (sequence, table, row_id, operation, value, write_id, clock, created_at) = raw;
    Ok(ChangeEntry {
        sequence: sequence as u64,
        table,
        row_id: serde_json::from_str(&row_id)?,
        operation: operation.parse()?,
        value: serde_json::from_str(&value)?,
        write_id: WriteId::from(write_id),
        logical_clock: clock as u64,
        created_at: created_at as u64,
    })
}

fn read_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawChange> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

const CHANGE_COLUMNS: &str =
    "sequence, table_name, row_id, operation, value, write_id, logical_clock, created_at";

struct SqliteTx<'a> {
    tx: &'a Transaction<'a>,
    ledger_table: &'a str,
    meta_table: &'a str,
}

impl SqliteTx<'_> {
    fn meta(&self, key: &str) -> Result<u64> {
        let sql = format!("SELECT value FROM {} WHERE key = ?1", quote(self.meta_table));
        let value: Option<i64> = self
            .tx
            .prepare_cached(&sql)?
            .query_row(params![key], |row| row.get(0))
            .optional()?;
        Ok(value.unwrap_or(0) as u64)
    }

    fn set_meta(&self, key: &str, value: u64) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (key, value) VALUES (?1, ?2) ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            quote(self.meta_table)
        );
        self.tx.prepare_cached(&sql)?.execute(params![key, value as i64])?;
        Ok(())
    }

    fn delete_by_id(&self, physical: &str, id: &Value) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE {} = ?1", quote(physical), quote(ID_COLUMN));
        let n = self.tx.prepare_cached(&sql)?.execute(params![id])?;
        Ok(n > 0)
    }
}

impl ShadowTx for SqliteTx<'_> {
    fn synced_row(&mut self, table: &ShadowTable, id: &Value) -> Result<Option<SyncedRow>> {
        let count = table.columns().len() + 1;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            select_list(table, &[WRITE_ID]),
            quote(&table.synced_table),
            quote(ID_COLUMN)
        );
        let raw = self
            .tx
            .prepare_cached(&sql)?
            .query_row(params![id], |row| read_values(row, count))
            .optional()?;

        let Some(raw) = raw else { return Ok(None) };
        let (id, values) = decode_columns(table, &raw[..count - 1])?;
        let write_id = raw[count - 1].as_str().map(WriteId::from);
        Ok(Some(SyncedRow { id, values, write_id }))
    }

    fn local_row(&mut self, table: &ShadowTable, id: &Value) -> Result<Option<LocalRow>> {
        let width = table.columns().len();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            select_list(table, &[CHANGED_COLUMNS, IS_DELETED, WRITE_ID]),
            quote(&table.local_table),
            quote(ID_COLUMN)
        );
        let raw = self
            .tx
            .prepare_cached(&sql)?
            .query_row(params![id], |row| read_values(row, width + 3))
            .optional()?;

        let Some(raw) = raw else { return Ok(None) };
        let (id, mut values) = decode_columns(table, &raw[..width])?;
        let changed: BTreeSet<String> = match &raw[width] {
            Value::Text(json) => serde_json::from_str(json)?,
            other => return Err(Error::InvalidState(format!("bad changed_columns: {}", other))),
        };
        values.retain(|col, _| changed.contains(col));
        let is_deleted = matches!(raw[width + 1], Value::Integer(n) if n != 0);
        let write_id = raw[width + 2]
            .as_str()
            .map(WriteId::from)
            .ok_or_else(|| Error::InvalidState("local row without write_id".to_string()))?;

        Ok(Some(LocalRow { id, values, changed_columns: changed, is_deleted, write_id }))
    }

    fn put_local(&mut self, table: &ShadowTable, row: &LocalRow) -> Result<()> {
        let sql = upsert_sql(&table.local_table, table, &[CHANGED_COLUMNS, IS_DELETED, WRITE_ID]);
        let mut params = vec![row.id.clone()];
        for col in table.data_columns() {
            let value = match row.is_changed(&col.name) {
                true => row.values.get(&col.name).cloned().unwrap_or_default(),
                false => Value::Null,
            };
            params.push(value);
        }
        params.push(Value::Text(serde_json::to_string(&row.changed_columns)?));
        params.push(Value::Bool(row.is_deleted));
        params.push(Value::Text(row.write_id.to_string()));

        self.tx.prepare_cached(&sql)?.execute(params_from_iter(params.iter()))?;
        Ok(())
    }

    fn delete_local(&mut self, table: &ShadowTable, id: &Value) -> Result<bool> {
        self.delete_by_id(&table.local_table, id)
    }

    fn put_synced(&mut self, table: &ShadowTable, row: &SyncedRow) -> Result<()> {
        let sql = upsert_sql(&table.synced_table, table, &[WRITE_ID]);
        let mut params = vec![row.id.clone()];
        params.extend(table.data_columns().map(|c| row.get(&c.name).clone()));
        params.push(row.write_id.as_ref().map(|w| w.to_string()).into());

        self.tx.prepare_cached(&sql)?.execute(params_from_iter(params.iter()))?;
        Ok(())
    }

    fn delete_synced(&mut self, table: &ShadowTable, id: &Value) -> Result<bool> {
        self.delete_by_id(&table.synced_table, id)
    }

    fn append_change(&mut self, change: NewChange) -> Result<ChangeEntry> {
        let clock = next_clock(self.meta(CLOCK_KEY)?);
        self.set_meta(CLOCK_KEY, clock)?;
        let created_at = now_millis();

        let sql = format!(
            "INSERT INTO {} (table_name, row_id, operation, value, write_id, logical_clock, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            quote(self.ledger_table)
        );
        self.tx.prepare_cached(&sql)?.execute(params![
            change.table,
            serde_json::to_string(&change.row_id)?,
            change.operation.as_str(),
            serde_json::to_string(&change.value)?,
            change.write_id.as_str(),
            clock as i64,
            created_at as i64,
        ])?;
        let sequence = self.tx.last_insert_rowid() as u64;

        Ok(ChangeEntry {
            sequence,
            table: change.table,
            row_id: change.row_id,
            operation: change.operation,
            value: change.value,
            write_id: change.write_id,
            logical_clock: clock,
            created_at,
        })
    }

    fn changes_between(&mut self, after: u64, through: u64) -> Result<Vec<ChangeEntry>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE sequence > ?1 AND sequence <= ?2 ORDER BY sequence",
            CHANGE_COLUMNS,
            quote(self.ledger_table)
        );
        let raw = self
            .tx
            .prepare_cached(&sql)?
            .query_map(params![after as i64, through as i64], read_change)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(decode_change).collect()
    }

    fn last_sequence(&mut self) -> Result<u64> {
        let seq: i64 = self.tx.query_row(
            "SELECT COALESCE((SELECT seq FROM sqlite_sequence WHERE name = ?1), 0)",
            params![self.ledger_table],
            |row| row.get(0),
        )?;
        Ok(seq as u64)
    }

    fn acknowledged_through(&mut self) -> Result<u64> {
        self.meta(ACKNOWLEDGED_KEY)
    }

    fn set_acknowledged_through(&mut self, sequence: u64) -> Result<()> {
        self.set_meta(ACKNOWLEDGED_KEY, sequence)
    }
}

impl Storage for SqliteStorage {
    fn install(&self, table: &ShadowTable) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute_batch(&table.synced_ddl())?;
        tx.execute_batch(&table.local_ddl())?;
        for index in table.index_ddl() {
            tx.execute_batch(&index)?;
        }
        tx.execute_batch(&merged_view_sql(table))?;
        tx.commit()?;
        Ok(())
    }

    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn ShadowTx) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = {
            let mut shadow = SqliteTx {
                tx: &tx,
                ledger_table: &self.ledger_table,
                meta_table: &self.meta_table,
            };
            f(&mut shadow)?
        };
        tx.commit()?;
        Ok(out)
    }

    fn merged_rows(&self, table: &ShadowTable, query: &Query) -> Result<Vec<MergedRow>> {
        let (sql, params) = query.to_sql(table)?;
        let width = table.columns().len();
        let conn = self.lock()?;
        let raw = conn
            .prepare_cached(&sql)?
            .query_map(params_from_iter(params.iter()), |row| read_values(row, width))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(conn);

        raw.into_iter()
            .map(|cells| {
                let mut id = Value::Null;
                let mut values = Columns::new();
                for (col, value) in table.columns().iter().zip(cells) {
                    let value = col.col_type.coerce(&col.name, value)?;
                    if col.name == ID_COLUMN {
                        id = value;
                    } else {
                        values.insert(col.name.clone(), value);
                    }
                }
                Ok(MergedRow { id, values })
            })
            .collect()
    }

    fn local_row(&self, table: &ShadowTable, id: &Value) -> Result<Option<LocalRow>> {
        self.read(|tx| tx.local_row(table, id))
    }

    fn synced_row(&self, table: &ShadowTable, id: &Value) -> Result<Option<SyncedRow>> {
        self.read(|tx| tx.synced_row(table, id))
    }

    fn acknowledged_through(&self) -> Result<u64> {
        self.read(|tx| tx.meta(ACKNOWLEDGED_KEY))
    }

    fn changes_since(&self, since: u64, limit: usize) -> Result<Vec<ChangeEntry>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE sequence > ?1 ORDER BY sequence LIMIT ?2",
            CHANGE_COLUMNS,
            quote(&self.ledger_table)
        );
        let conn = self.lock()?;
        let raw = conn
            .prepare_cached(&sql)?
            .query_map(params![since as i64, limit.min(i64::MAX as usize) as i64], read_change)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(conn);
        raw.into_iter().map(decode_change).collect()
    }

    fn compact_changes(&self, keep_last: usize) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let acknowledged: i64 = tx
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", quote(&self.meta_table)),
                params![ACKNOWLEDGED_KEY],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        let sql = format!(
            "DELETE FROM {ledger} WHERE sequence <= ?1 AND sequence NOT IN (
                SELECT sequence FROM {ledger} WHERE sequence <= ?1 ORDER BY sequence DESC LIMIT ?2
            )",
            ledger = quote(&self.ledger_table)
        );
        let removed = tx.execute(&sql, params![acknowledged, keep_last.min(i64::MAX as usize) as i64])?;
        tx.commit()?;
        Ok(removed)
    }
}
