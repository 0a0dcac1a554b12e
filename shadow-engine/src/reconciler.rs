//! Reconciler: absorbs confirmed remote state and prunes local overrides
//! that no longer differ from it.

use std::collections::{BTreeSet, HashMap};

use crate::error::{Error, Result};
use crate::ledger::Operation;
use crate::row::{ConfirmedRow, SyncedRow};
use crate::schema::{ShadowTable, ID_COLUMN};
use crate::storage::ShadowTx;
use crate::value::Value;

/// What became of the local row after a confirmation was applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalState {
    /// There was no local row.
    Absent,
    /// Every override matched and the local row was removed.
    Reconciled,
    /// Overrides remain. `pending` lists the columns still overridden.
    Pending { pending: BTreeSet<String>, is_deleted: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Columns dropped from `changed_columns` by this confirmation.
    pub pruned: BTreeSet<String>,
    pub local: LocalState,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AckReport {
    pub acknowledged: usize,
    pub deletes_finalized: usize,
    pub through: u64,
}

pub(crate) fn apply_confirmed_row(
    tx: &mut dyn ShadowTx,
    table: &ShadowTable,
    row: ConfirmedRow,
) -> Result<ReconcileOutcome> {
    let id = table.coerce_id(row.id)?;
    let previous = tx.synced_row(table, &id)?;

    let mut values = previous.map(|p| p.values).unwrap_or_default();
    for (name, value) in row.values {
        let col = table.column(&name)?;
        let value = col.col_type.coerce(&name, value)?;
        if name == ID_COLUMN {
            if !value.is_not_distinct_from(&id) {
                return Err(Error::ImmutableKey { table: table.name().to_string() });
            }
            continue;
        }
        values.insert(name, value);
    }
    for col in table.data_columns() {
        let value = values
            .entry(col.name.clone())
            .or_insert_with(|| col.default.clone().unwrap_or_default());
        if value.is_null() && !col.nullable {
            return Err(Error::NullViolation { table: table.name().to_string(), column: col.name.clone() });
        }
    }

    let synced = SyncedRow { id: id.clone(), values, write_id: row.write_id };
    tx.put_synced(table, &synced)?;

    let Some(mut local) = tx.local_row(table, &id)? else {
        tracing::debug!(table = table.name(), id = %id, "confirmed row, no local overrides");
        return Ok(ReconcileOutcome { pruned: BTreeSet::new(), local: LocalState::Absent });
    };

    let pruned: BTreeSet<String> = local
        .changed_columns
        .iter()
        .filter(|col| {
            local
                .values
                .get(col.as_str())
                .unwrap_or(&Value::Null)
                .is_not_distinct_from(synced.get(col))
        })
        .cloned()
        .collect();
    for col in &pruned {
        local.clear(col);
    }

    let state = if local.is_redundant() {
        tx.delete_local(table, &id)?;
        LocalState::Reconciled
    } else {
        if !pruned.is_empty() {
            tx.put_local(table, &local)?;
        }
        LocalState::Pending { pending: local.changed_columns.clone(), is_deleted: local.is_deleted }
    };
    tracing::debug!(table = table.name(), id = %id, pruned = pruned.len(), ?state, "confirmed row");
    Ok(ReconcileOutcome { pruned, local: state })
}

/// The remote deleted the row. The synced row goes; a pending local delete
/// is thereby confirmed and goes too. Other local overrides stay until a
/// later write supersedes them.
pub(crate) fn apply_confirmed_delete(
    tx: &mut dyn ShadowTx,
    table: &ShadowTable,
    id: Value,
) -> Result<ReconcileOutcome> {
    let id = table.coerce_id(id)?;
    tx.delete_synced(table, &id)?;

    let state = match tx.local_row(table, &id)? {
        None => LocalState::Absent,
        Some(local) if local.is_deleted => {
            tx.delete_local(table, &id)?;
            LocalState::Reconciled
        }
        Some(local) => {
            tracing::warn!(table = table.name(), id = %id, "remote delete with local overrides pending");
            LocalState::Pending { pending: local.changed_columns, is_deleted: false }
        }
    };
    Ok(ReconcileOutcome { pruned: BTreeSet::new(), local: state })
}

/// Records that the remote accepted every ledger entry up to `through`.
///
/// An accepted delete is final: when the row's local tombstone still
/// carries that delete's write id, the tombstone and the synced row are
/// both removed.
pub(crate) fn acknowledge_upload(
    tx: &mut dyn ShadowTx,
    tables: &HashMap<String, ShadowTable>,
    through: u64,
) -> Result<AckReport> {
    let previous = tx.acknowledged_through()?;
    let through = through.min(tx.last_sequence()?);
    if through <= previous {
        return Ok(AckReport { through: previous, ..AckReport::default() });
    }

    let entries = tx.changes_between(previous, through)?;
    let mut report = AckReport { acknowledged: entries.len(), deletes_finalized: 0, through };

    for entry in entries.iter().filter(|e| e.operation == Operation::Delete) {
        let Some(table) = tables.get(&entry.table) else {
            tracing::warn!(table = %entry.table, sequence = entry.sequence, "acknowledged delete for undeclared table");
            continue;
        };
        match tx.local_row(table, &entry.row_id)? {
            Some(local) if local.is_deleted && local.write_id == entry.write_id => {
                tx.delete_local(table, &entry.row_id)?;
                tx.delete_synced(table, &entry.row_id)?;
                report.deletes_finalized += 1;
            }
            _ => {}
        }
    }

    tx.set_acknowledged_through(through)?;
    tracing::debug!(through, acknowledged = report.acknowledged, "upload acknowledged");
    Ok(report)
}
