use std::collections::HashMap;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::interceptor;
use crate::ledger::{ChangeEntry, WriteReceipt};
use crate::merge::MergedRow;
use crate::query::Query;
use crate::reconciler::{self, AckReport, ReconcileOutcome};
use crate::row::{ConfirmedRow, InsertBuilder, LocalRow, SyncedRow, UpdateBuilder};
use crate::schema::{declare_shadow_table, ColumnDef, ShadowOptions, ShadowTable};
use crate::storage::{SqliteStorage, Storage};
use crate::value::{Columns, Value};

/// Handle to a set of shadow tables over one storage engine.
///
/// Construct once and share (`Arc<ShadowDb<_>>`) with every caller. Tables
/// are declared up front through `&mut self`; reads and writes afterwards
/// take `&self` and may come from any thread.
pub struct ShadowDb<S: Storage = SqliteStorage> {
    storage: S,
    config: EngineConfig,
    tables: HashMap<String, ShadowTable>,
}

impl ShadowDb<SqliteStorage> {
    pub fn open(config: EngineConfig) -> Result<Self> {
        let storage = SqliteStorage::open(&config)?;
        Ok(Self { storage, config, tables: HashMap::new() })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(EngineConfig::default())
    }
}

impl<S: Storage> ShadowDb<S> {
    pub fn with_storage(storage: S) -> Self {
        Self::with_storage_and_config(storage, EngineConfig::default())
    }

    pub fn with_storage_and_config(storage: S, config: EngineConfig) -> Self {
        Self { storage, config, tables: HashMap::new() }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registers a declared table and creates its shadow pair and view.
    /// Referenced tables must be declared first.
    pub fn declare(&mut self, table: ShadowTable) -> Result<&ShadowTable> {
        for dep in table.dependencies() {
            if !self.tables.contains_key(dep) {
                return Err(Error::UnknownTable(dep.to_string()));
            }
        }
        if let Some(existing) = self.tables.get(table.name()) {
            if existing.columns() != table.columns() {
                return Err(Error::InvalidSchema {
                    table: table.name().to_string(),
                    reason: "already declared with different columns".to_string(),
                });
            }
        }

        self.storage.install(&table)?;
        tracing::info!(
            table = table.name(),
            local = %table.local_table,
            synced = %table.synced_table,
            "declared shadow table"
        );
        let name = table.name().to_string();
        self.tables.insert(name.clone(), table);
        self.table(&name)
    }

    pub fn declare_table(
        &mut self,
        name: &str,
        columns: Vec<ColumnDef>,
        options: ShadowOptions,
    ) -> Result<&ShadowTable> {
        self.declare(declare_shadow_table(name, columns, options)?)
    }

    pub fn table(&self, name: &str) -> Result<&ShadowTable> {
        self.tables.get(name).ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &ShadowTable> {
        self.tables.values()
    }

    pub fn insert(&self, table: &str, id: impl Into<Value>) -> InsertBuilder<'_, S> {
        InsertBuilder::new(self, table, id.into())
    }

    pub fn update(&self, table: &str, id: impl Into<Value>) -> UpdateBuilder<'_, S> {
        UpdateBuilder::new(self, table, id.into())
    }

    pub fn insert_row(&self, table: &str, id: impl Into<Value>, columns: Columns) -> Result<WriteReceipt> {
        let shadow = self.table(table)?;
        let id = id.into();
        self.write(shadow, |tx| interceptor::insert(tx, shadow, id, columns))
    }

    pub fn update_row(&self, table: &str, id: impl Into<Value>, columns: Columns) -> Result<WriteReceipt> {
        let shadow = self.table(table)?;
        let id = id.into();
        self.write(shadow, |tx| interceptor::update(tx, shadow, id, columns))
    }

    pub fn delete(&self, table: &str, id: impl Into<Value>) -> Result<WriteReceipt> {
        let shadow = self.table(table)?;
        let id = id.into();
        self.write(shadow, |tx| interceptor::delete(tx, shadow, id))
    }

    fn write<F>(&self, table: &ShadowTable, f: F) -> Result<WriteReceipt>
    where
        F: FnOnce(&mut dyn crate::storage::ShadowTx) -> Result<ChangeEntry>,
    {
        let entry = self
            .storage
            .transaction(f)
            .map_err(|e| e.into_transaction_failure(table.name()))?;
        Ok(WriteReceipt::from(&entry))
    }

    pub fn get(&self, table: &str, id: impl Into<Value>) -> Result<Option<MergedRow>> {
        let shadow = self.table(table)?;
        let id = shadow.coerce_id(id.into())?;
        self.storage.merged_row(shadow, &id)
    }

    pub fn query(&self, table: &str, query: &Query) -> Result<Vec<MergedRow>> {
        self.storage.merged_rows(self.table(table)?, query)
    }

    pub fn all(&self, table: &str) -> Result<Vec<MergedRow>> {
        self.query(table, &Query::new())
    }

    /// The raw local row, bypassing the merge view.
    pub fn local_row(&self, table: &str, id: impl Into<Value>) -> Result<Option<LocalRow>> {
        let shadow = self.table(table)?;
        let id = shadow.coerce_id(id.into())?;
        self.storage.local_row(shadow, &id)
    }

    /// The raw synced row, bypassing the merge view.
    pub fn synced_row(&self, table: &str, id: impl Into<Value>) -> Result<Option<SyncedRow>> {
        let shadow = self.table(table)?;
        let id = shadow.coerce_id(id.into())?;
        self.storage.synced_row(shadow, &id)
    }

    /// Applies a row confirmed by the remote. Safe to repeat: applying the
    /// same confirmation twice leaves the same state as applying it once.
    pub fn apply_confirmed_row(&self, table: &str, row: ConfirmedRow) -> Result<ReconcileOutcome> {
        let shadow = self.table(table)?;
        let id = row.id.key();
        self.storage
            .transaction(|tx| reconciler::apply_confirmed_row(tx, shadow, row))
            .map_err(|e| e.into_reconciliation_failure(table, &id))
    }

    pub fn apply_confirmed_delete(&self, table: &str, id: impl Into<Value>) -> Result<ReconcileOutcome> {
        let shadow = self.table(table)?;
        let id = id.into();
        let key = id.key();
        self.storage
            .transaction(|tx| reconciler::apply_confirmed_delete(tx, shadow, id))
            .map_err(|e| e.into_reconciliation_failure(table, &key))
    }

    /// Ledger entries after `since`, oldest first, for upload.
    pub fn changes_since(&self, since: u64, limit: usize) -> Result<Vec<ChangeEntry>> {
        self.storage.changes_since(since, limit)
    }

    /// Ledger entries not yet acknowledged by the remote.
    pub fn pending_changes(&self, limit: usize) -> Result<Vec<ChangeEntry>> {
        let since = self.storage.acknowledged_through()?;
        self.storage.changes_since(since, limit)
    }

    pub fn acknowledged_through(&self) -> Result<u64> {
        self.storage.acknowledged_through()
    }

    pub fn acknowledge_upload(&self, through: u64) -> Result<AckReport> {
        let tables = &self.tables;
        self.storage
            .transaction(|tx| reconciler::acknowledge_upload(tx, tables, through))
            .map_err(|e| e.into_transaction_failure(&self.config.ledger_table))
    }
}
