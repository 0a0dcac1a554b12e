use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{ShadowTx, Storage};
use crate::error::{Error, Result};
use crate::ledger::{next_clock, now_millis, ChangeEntry, NewChange, WriteId};
use crate::merge::{merge_row, MergedRow};
use crate::query::Query;
use crate::row::{LocalRow, SyncedRow};
use crate::schema::ShadowTable;
use crate::value::Value;

#[derive(Default)]
struct TableState {
    synced: BTreeMap<String, SyncedRow>,
    local: BTreeMap<String, LocalRow>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, TableState>,
    changes: BTreeMap<u64, ChangeEntry>,
    write_ids: HashSet<WriteId>,
    last_sequence: u64,
    clock: u64,
    acknowledged: u64,
}

impl State {
    fn table(&self, table: &ShadowTable) -> Result<&TableState> {
        self.tables
            .get(table.name())
            .ok_or_else(|| Error::UnknownTable(table.name().to_string()))
    }

    fn table_mut(&mut self, table: &ShadowTable) -> Result<&mut TableState> {
        self.tables
            .get_mut(table.name())
            .ok_or_else(|| Error::UnknownTable(table.name().to_string()))
    }
}

/// One mutation made inside a transaction, with what it replaced.
enum Undo {
    Local { table: String, key: String, previous: Option<LocalRow> },
    Synced { table: String, key: String, previous: Option<SyncedRow> },
    Appended { sequence: u64, write_id: WriteId, last_sequence: u64, clock: u64 },
    Acknowledged(u64),
}

/// Shadow tables held in memory, with the same semantics as the SQLite
/// backend. A transaction mutates the state in place and records an undo
/// entry per mutation; on failure the entries are replayed newest first.
pub struct MemoryStorage {
    state: Mutex<State>,
    fail_next_commit: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            fail_next_commit: AtomicBool::new(false),
        }
    }

    /// Makes the next transaction fail at commit, after its body ran.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| Error::LockPoisoned)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryTx<'a> {
    state: &'a mut State,
    undo: Vec<Undo>,
}

impl MemoryTx<'_> {
    fn rollback(self) {
        let MemoryTx { state, undo } = self;
        for step in undo.into_iter().rev() {
            match step {
                Undo::Local { table, key, previous } => {
                    if let Some(rows) = state.tables.get_mut(&table) {
                        match previous {
                            Some(row) => rows.local.insert(key, row),
                            None => rows.local.remove(&key),
                        };
                    }
                }
                Undo::Synced { table, key, previous } => {
                    if let Some(rows) = state.tables.get_mut(&table) {
                        match previous {
                            Some(row) => rows.synced.insert(key, row),
                            None => rows.synced.remove(&key),
                        };
                    }
                }
                Undo::Appended { sequence, write_id, last_sequence, clock } => {
                    state.changes.remove(&sequence);
                    state.write_ids.remove(&write_id);
                    state.last_sequence = last_sequence;
                    state.clock = clock;
                }
                Undo::Acknowledged(previous) => state.acknowledged = previous,
            }
        }
    }
}

impl ShadowTx for MemoryTx<'_> {
    fn synced_row(&mut self, table: &ShadowTable, id: &Value) -> Result<Option<SyncedRow>> {
        Ok(self.state.table(table)?.synced.get(&id.key()).cloned())
    }

    fn local_row(&mut self, table: &ShadowTable, id: &Value) -> Result<Option<LocalRow>> {
        Ok(self.state.table(table)?.local.get(&id.key()).cloned())
    }

    fn put_local(&mut self, table: &ShadowTable, row: &LocalRow) -> Result<()> {
        let mut row = row.clone();
        let changed = row.changed_columns.clone();
        row.values.retain(|col, _| changed.contains(col));
        let key = row.id.key();
        let previous = self.state.table_mut(table)?.local.insert(key.clone(), row);
        self.undo.push(Undo::Local { table: table.name().to_string(), key, previous });
        Ok(())
    }

    fn delete_local(&mut self, table: &ShadowTable, id: &Value) -> Result<bool> {
        let key = id.key();
        let Some(previous) = self.state.table_mut(table)?.local.remove(&key) else {
            return Ok(false);
        };
        self.undo.push(Undo::Local { table: table.name().to_string(), key, previous: Some(previous) });
        Ok(true)
    }

    fn put_synced(&mut self, table: &ShadowTable, row: &SyncedRow) -> Result<()> {
        let mut row = row.clone();
        for col in table.data_columns() {
            row.values.entry(col.name.clone()).or_default();
        }
        row.values.retain(|col, _| table.column(col).is_ok());
        let key = row.id.key();
        let previous = self.state.table_mut(table)?.synced.insert(key.clone(), row);
        self.undo.push(Undo::Synced { table: table.name().to_string(), key, previous });
        Ok(())
    }

    fn delete_synced(&mut self, table: &ShadowTable, id: &Value) -> Result<bool> {
        let key = id.key();
        let Some(previous) = self.state.table_mut(table)?.synced.remove(&key) else {
            return Ok(false);
        };
        self.undo.push(Undo::Synced { table: table.name().to_string(), key, previous: Some(previous) });
        Ok(true)
    }

    fn append_change(&mut self, change: NewChange) -> Result<ChangeEntry> {
        if !self.state.write_ids.insert(change.write_id.clone()) {
            return Err(Error::InvalidState(format!("duplicate write id {}", change.write_id)));
        }
        let (last_sequence, clock) = (self.state.last_sequence, self.state.clock);
        self.state.last_sequence += 1;
        self.state.clock = next_clock(self.state.clock);

        let entry = ChangeEntry {
            sequence: self.state.last_sequence,
            table: change.table,
            row_id: change.row_id,
            operation: change.operation,
            value: change.value,
            write_id: change.write_id,
            logical_clock: self.state.clock,
            created_at: now_millis(),
        };
        self.state.changes.insert(entry.sequence, entry.clone());
        self.undo.push(Undo::Appended {
            sequence: entry.sequence,
            write_id: entry.write_id.clone(),
            last_sequence,
            clock,
        });
        Ok(entry)
    }

    fn changes_between(&mut self, after: u64, through: u64) -> Result<Vec<ChangeEntry>> {
        if through <= after {
            return Ok(Vec::new());
        }
        Ok(self
            .state
            .changes
            .range(after + 1..=through)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn last_sequence(&mut self) -> Result<u64> {
        Ok(self.state.last_sequence)
    }

    fn acknowledged_through(&mut self) -> Result<u64> {
        Ok(self.state.acknowledged)
    }

    fn set_acknowledged_through(&mut self, sequence: u64) -> Result<()> {
        let previous = std::mem::replace(&mut self.state.acknowledged, sequence);
        self.undo.push(Undo::Acknowledged(previous));
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn install(&self, table: &ShadowTable) -> Result<()> {
        self.lock()?.tables.entry(table.name().to_string()).or_default();
        Ok(())
    }

    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn ShadowTx) -> Result<T>,
    {
        let mut guard = self.lock()?;
        let mut tx = MemoryTx { state: &mut *guard, undo: Vec::new() };
        let result = f(&mut tx).and_then(|out| {
            if self.fail_next_commit.swap(false, Ordering::SeqCst) {
                return Err(Error::InvalidState("commit failed".to_string()));
            }
            Ok(out)
        });
        if result.is_err() {
            tx.rollback();
        }
        result
    }

    fn merged_rows(&self, table: &ShadowTable, query: &Query) -> Result<Vec<MergedRow>> {
        let guard = self.lock()?;
        let state = guard.table(table)?;

        let keys: std::collections::BTreeSet<&String> = state.synced.keys().chain(state.local.keys()).collect();
        let rows = keys
            .into_iter()
            .filter_map(|key| merge_row(table, state.synced.get(key), state.local.get(key)))
            .collect();
        drop(guard);
        query.apply(table, rows)
    }

    fn local_row(&self, table: &ShadowTable, id: &Value) -> Result<Option<LocalRow>> {
        Ok(self.lock()?.table(table)?.local.get(&id.key()).cloned())
    }

    fn synced_row(&self, table: &ShadowTable, id: &Value) -> Result<Option<SyncedRow>> {
        Ok(self.lock()?.table(table)?.synced.get(&id.key()).cloned())
    }

    fn acknowledged_through(&self) -> Result<u64> {
        Ok(self.lock()?.acknowledged)
    }

    fn changes_since(&self, since: u64, limit: usize) -> Result<Vec<ChangeEntry>> {
        let guard = self.lock()?;
        Ok(guard
            .changes
            .range(since.saturating_add(1)..)
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn compact_changes(&self, keep_last: usize) -> Result<usize> {
        let mut guard = self.lock()?;
        let acknowledged = guard.acknowledged;
        let doomed: Vec<u64> = {
            let eligible: Vec<u64> = guard.changes.range(..=acknowledged).map(|(seq, _)| *seq).collect();
            let cut = eligible.len().saturating_sub(keep_last);
            eligible[..cut].to_vec()
        };
        for seq in &doomed {
            if let Some(entry) = guard.changes.remove(seq) {
                guard.write_ids.remove(&entry.write_id);
            }
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Operation;
    use crate::schema::{declare_shadow_table, ColumnDef, ShadowOptions};
    use crate::value::Columns;

    fn notes() -> ShadowTable {
        declare_shadow_table(
            "notes",
            vec![ColumnDef::text("id"), ColumnDef::text("body")],
            ShadowOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_undeclared_table_rejected() {
        let storage = MemoryStorage::new();
        let result = storage.transaction(|tx| tx.local_row(&notes(), &Value::from("A")));
        assert!(matches!(result, Err(Error::UnknownTable(_))));
    }

    #[test]
    fn test_failed_commit_discards_changes() {
        let storage = MemoryStorage::new();
        let table = notes();
        storage.install(&table).unwrap();

        storage.fail_next_commit();
        let result = storage.transaction(|tx| {
            tx.put_synced(&table, &SyncedRow { id: Value::from("A"), values: Columns::new(), write_id: None })
        });
        assert!(result.is_err());
        assert!(storage.synced_row(&table, &Value::from("A")).unwrap().is_none());

        storage
            .transaction(|tx| {
                tx.put_synced(&table, &SyncedRow { id: Value::from("A"), values: Columns::new(), write_id: None })
            })
            .unwrap();
        let row = storage.synced_row(&table, &Value::from("A")).unwrap().unwrap();
        assert_eq!(row.values.get("body"), Some(&Value::Null));
    }

    #[test]
    fn test_merged_rows_sorted_by_id() {
        let storage = MemoryStorage::new();
        let table = declare_shadow_table(
            "counters",
            vec![ColumnDef::integer("id"), ColumnDef::integer("n")],
            ShadowOptions::default(),
        )
        .unwrap();
        storage.install(&table).unwrap();
        storage
            .transaction(|tx| {
                tx.put_synced(&table, &SyncedRow { id: Value::from(1), values: Columns::new(), write_id: None })?;
                tx.put_synced(&table, &SyncedRow { id: Value::from(2), values: Columns::new(), write_id: None })
            })
            .unwrap();
        let rows = storage.merged_rows(&table, &Query::new()).unwrap();
        assert_eq!(rows.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), vec![Value::from(1), Value::from(2)]);
    }

    fn change(write_id: &str) -> NewChange {
        NewChange {
            table: "notes".to_string(),
            row_id: Value::from("A"),
            operation: Operation::Insert,
            value: Columns::new(),
            write_id: WriteId::from(write_id),
        }
    }

    #[test]
    fn test_failed_transaction_undoes_every_mutation() {
        let storage = MemoryStorage::new();
        let table = notes();
        storage.install(&table).unwrap();

        let mut local = LocalRow::new(Value::from("A"), WriteId::from("w1"));
        local.set("body", Value::from("draft"));
        storage
            .transaction(|tx| {
                tx.put_local(&table, &local)?;
                tx.append_change(change("w1"))
            })
            .unwrap();

        let result: Result<()> = storage.transaction(|tx| {
            tx.delete_local(&table, &Value::from("A"))?;
            tx.put_synced(&table, &SyncedRow { id: Value::from("A"), values: Columns::new(), write_id: None })?;
            tx.append_change(change("w2"))?;
            tx.set_acknowledged_through(2)?;
            Err(Error::InvalidState("abort".to_string()))
        });
        assert!(result.is_err());

        assert_eq!(storage.local_row(&table, &Value::from("A")).unwrap(), Some(local));
        assert!(storage.synced_row(&table, &Value::from("A")).unwrap().is_none());
        assert_eq!(storage.acknowledged_through().unwrap(), 0);
        assert_eq!(storage.changes_since(0, 10).unwrap().len(), 1);

        // The rolled-back write id and sequence are free again.
        let entry = storage.transaction(|tx| tx.append_change(change("w2"))).unwrap();
        assert_eq!(entry.sequence, 2);
    }

    #[test]
    fn test_point_reads_do_not_consume_commit_failure() {
        let storage = MemoryStorage::new();
        let table = notes();
        storage.install(&table).unwrap();

        storage.fail_next_commit();
        assert!(storage.local_row(&table, &Value::from("A")).unwrap().is_none());
        assert!(storage.synced_row(&table, &Value::from("A")).unwrap().is_none());
        assert_eq!(storage.acknowledged_through().unwrap(), 0);
        assert!(storage.transaction(|tx| tx.append_change(change("w1"))).is_err());
        assert!(storage.changes_since(0, 10).unwrap().is_empty());
    }
}
