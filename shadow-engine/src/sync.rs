//! Upload/pull cycle between a `ShadowDb` and the authoritative remote.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::db::ShadowDb;
use crate::error::{Error, Result};
use crate::ledger::{ChangeEntry, Operation, WriteId};
use crate::reconciler::LocalState;
use crate::row::ConfirmedRow;
use crate::schema::ID_COLUMN;
use crate::storage::Storage;
use crate::value::Value;

/// A change the remote has made authoritative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteChange {
    Upsert { table: String, row: ConfirmedRow },
    Delete { table: String, id: Value },
}

impl RemoteChange {
    pub fn table(&self) -> &str {
        match self {
            RemoteChange::Upsert { table, .. } | RemoteChange::Delete { table, .. } => table,
        }
    }

    pub fn into_row(self) -> Option<ConfirmedRow> {
        match self {
            RemoteChange::Upsert { row, .. } => Some(row),
            RemoteChange::Delete { .. } => None,
        }
    }
}

pub trait Remote {
    /// Hands entries to the remote in sequence order. `Ok` means every entry
    /// in the slice was accepted; on error none of them count as uploaded.
    fn upload(&mut self, entries: &[ChangeEntry]) -> Result<()>;

    /// Confirmed changes not yet acknowledged, oldest first. Pulling again
    /// before `ack_pulled` returns the same changes.
    fn pull(&mut self) -> Result<Vec<RemoteChange>>;

    /// Drops the first `count` changes of the last pull: they have been
    /// applied locally, or rejected as invalid, and need no redelivery.
    fn ack_pulled(&mut self, count: usize) -> Result<()>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub uploaded: usize,
    pub batches: usize,
    pub deletes_finalized: usize,
    pub rows_applied: usize,
    pub deletes_applied: usize,
    pub columns_pruned: usize,
    pub rows_reconciled: usize,
    pub rejected: usize,
}

impl SyncReport {
    pub fn total_changes(&self) -> usize {
        self.uploaded + self.rows_applied + self.deletes_applied
    }
}

pub struct SyncSession {
    pub batch_size: usize,
}

impl SyncSession {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size: batch_size.max(1) }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.sync_batch_size)
    }

    /// One cycle: drain the ledger to the remote, then apply whatever the
    /// remote confirmed. A failed upload stops the cycle with the cursor at
    /// the last accepted batch. A confirmation the schema rejects is logged
    /// and skipped. A storage failure while applying one stops the cycle:
    /// only the changes before it are acknowledged to the remote, so the
    /// failed one and everything after it are delivered again.
    pub fn sync<S, R>(&self, db: &ShadowDb<S>, remote: &mut R) -> Result<SyncReport>
    where
        S: Storage,
        R: Remote + ?Sized,
    {
        let mut report = SyncReport::default();

        loop {
            let batch = db.pending_changes(self.batch_size)?;
            let Some(last) = batch.last().map(|e| e.sequence) else {
                break;
            };
            remote.upload(&batch)?;
            let ack = db.acknowledge_upload(last)?;
            report.uploaded += ack.acknowledged;
            report.deletes_finalized += ack.deletes_finalized;
            report.batches += 1;
            if batch.len() < self.batch_size {
                break;
            }
        }

        let pulled = remote.pull()?;
        let total = pulled.len();
        for (done, change) in pulled.into_iter().enumerate() {
            let applied = match &change {
                RemoteChange::Upsert { table, row } => db.apply_confirmed_row(table, row.clone()),
                RemoteChange::Delete { table, id } => db.apply_confirmed_delete(table, id.clone()),
            };
            match applied {
                Ok(outcome) => {
                    match change {
                        RemoteChange::Upsert { .. } => report.rows_applied += 1,
                        RemoteChange::Delete { .. } => report.deletes_applied += 1,
                    }
                    report.columns_pruned += outcome.pruned.len();
                    if outcome.local == LocalState::Reconciled {
                        report.rows_reconciled += 1;
                    }
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        table = change.table(),
                        redeliver = total - done,
                        error = %e,
                        "confirmation not applied"
                    );
                    if let Err(ack) = remote.ack_pulled(done) {
                        tracing::warn!(error = %ack, "failed to acknowledge applied confirmations");
                    }
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(table = change.table(), error = %e, "confirmation rejected");
                    report.rejected += 1;
                }
            }
        }
        remote.ack_pulled(total)?;

        tracing::info!(
            uploaded = report.uploaded,
            batches = report.batches,
            applied = report.rows_applied + report.deletes_applied,
            reconciled = report.rows_reconciled,
            rejected = report.rejected,
            "sync cycle complete"
        );
        Ok(report)
    }
}

impl Default for SyncSession {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// In-process authority. Applies uploaded entries to its own copy of every
/// table and echoes the resulting rows back on the next pull.
#[derive(Default)]
pub struct LoopbackRemote {
    tables: HashMap<String, BTreeMap<String, ConfirmedRow>>,
    outbox: VecDeque<RemoteChange>,
    seen: HashSet<WriteId>,
    offline: bool,
}

impl LoopbackRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every upload and pull fails with `Error::Transport`.
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    pub fn row(&self, table: &str, id: &Value) -> Option<&ConfirmedRow> {
        self.tables.get(table)?.get(&id.key())
    }

    pub fn rows(&self, table: &str) -> Vec<&ConfirmedRow> {
        self.tables.get(table).map(|t| t.values().collect()).unwrap_or_default()
    }

    /// A write made by some other client, merged into the authority's row.
    pub fn push_external(&mut self, table: &str, row: ConfirmedRow) {
        let merged = self.merge(table, row);
        self.outbox.push_back(RemoteChange::Upsert { table: table.to_string(), row: merged });
    }

    pub fn push_external_delete(&mut self, table: &str, id: Value) {
        if let Some(rows) = self.tables.get_mut(table) {
            rows.remove(&id.key());
        }
        self.outbox.push_back(RemoteChange::Delete { table: table.to_string(), id });
    }

    fn merge(&mut self, table: &str, row: ConfirmedRow) -> ConfirmedRow {
        let rows = self.tables.entry(table.to_string()).or_default();
        let stored = rows
            .entry(row.id.key())
            .or_insert_with(|| ConfirmedRow::new(row.id.clone()));
        stored.values.extend(row.values);
        stored.write_id = row.write_id;
        stored.clone()
    }

    fn accept(&mut self, entry: &ChangeEntry) {
        if !self.seen.insert(entry.write_id.clone()) {
            return;
        }
        match entry.operation {
            Operation::Insert | Operation::Update => {
                let mut row = ConfirmedRow::new(entry.row_id.clone()).write_id(entry.write_id.clone());
                row.values = entry.value.clone();
                row.values.remove(ID_COLUMN);
                self.push_external(&entry.table, row);
            }
            Operation::Delete => self.push_external_delete(&entry.table, entry.row_id.clone()),
        }
    }
}

impl Remote for LoopbackRemote {
    fn upload(&mut self, entries: &[ChangeEntry]) -> Result<()> {
        if self.offline {
            return Err(Error::Transport("remote unreachable".to_string()));
        }
        for entry in entries {
            self.accept(entry);
        }
        Ok(())
    }

    fn pull(&mut self) -> Result<Vec<RemoteChange>> {
        if self.offline {
            return Err(Error::Transport("remote unreachable".to_string()));
        }
        Ok(self.outbox.iter().cloned().collect())
    }

    fn ack_pulled(&mut self, count: usize) -> Result<()> {
        if self.offline {
            return Err(Error::Transport("remote unreachable".to_string()));
        }
        let count = count.min(self.outbox.len());
        self.outbox.drain(..count);
        Ok(())
    }
}
