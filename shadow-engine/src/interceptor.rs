//! Write interceptor: turns logical inserts, updates and deletes into
//! shadow-table mutations plus exactly one ledger entry.
//!
//! These functions run inside a storage transaction and never touch the
//! synced table.

use crate::error::{Error, Result};
use crate::ledger::{ChangeEntry, NewChange, Operation, WriteId};
use crate::merge::merge_row;
use crate::row::LocalRow;
use crate::schema::{ShadowTable, ID_COLUMN};
use crate::storage::ShadowTx;
use crate::value::{Columns, Value};

/// Validates and coerces user-supplied columns. `id` may only appear with
/// the row's own id.
fn prepare_columns(table: &ShadowTable, id: &Value, columns: Columns) -> Result<Columns> {
    let mut out = Columns::new();
    for (name, value) in columns {
        let col = table.column(&name)?;
        let value = col.col_type.coerce(&name, value)?;
        if name == ID_COLUMN {
            if !value.is_not_distinct_from(id) {
                return Err(Error::ImmutableKey { table: table.name().to_string() });
            }
            continue;
        }
        out.insert(name, value);
    }
    Ok(out)
}

fn with_id(id: &Value, mut payload: Columns) -> Columns {
    payload.insert(ID_COLUMN.to_string(), id.clone());
    payload
}

pub(crate) fn insert(
    tx: &mut dyn ShadowTx,
    table: &ShadowTable,
    id: Value,
    columns: Columns,
) -> Result<ChangeEntry> {
    let id = table.coerce_id(id)?;
    let mut values = prepare_columns(table, &id, columns)?;

    for col in table.data_columns() {
        if !values.contains_key(&col.name) {
            if let Some(default) = &col.default {
                values.insert(col.name.clone(), default.clone());
            }
        }
        if !col.nullable && values.get(&col.name).map_or(true, Value::is_null) {
            return Err(Error::NullViolation {
                table: table.name().to_string(),
                column: col.name.clone(),
            });
        }
    }

    if tx.synced_row(table, &id)?.is_some() || tx.local_row(table, &id)?.is_some() {
        return Err(Error::DuplicateKey { table: table.name().to_string(), id: id.key() });
    }

    let write_id = WriteId::generate();
    let mut local = LocalRow::new(id.clone(), write_id.clone());
    for (col, value) in &values {
        local.set(col, value.clone());
    }
    tx.put_local(table, &local)?;

    let entry = tx.append_change(NewChange {
        table: table.name().to_string(),
        row_id: id.clone(),
        operation: Operation::Insert,
        value: with_id(&id, values),
        write_id,
    })?;
    tracing::debug!(table = table.name(), id = %id, sequence = entry.sequence, "local insert");
    Ok(entry)
}

pub(crate) fn update(
    tx: &mut dyn ShadowTx,
    table: &ShadowTable,
    id: Value,
    columns: Columns,
) -> Result<ChangeEntry> {
    let id = table.coerce_id(id)?;
    let updates = prepare_columns(table, &id, columns)?;
    for (col, value) in &updates {
        if value.is_null() && !table.column(col)?.nullable {
            return Err(Error::NullViolation { table: table.name().to_string(), column: col.clone() });
        }
    }

    let synced = tx.synced_row(table, &id)?;
    let existing = tx.local_row(table, &id)?;
    let before = merge_row(table, synced.as_ref(), existing.as_ref())
        .ok_or_else(|| Error::NotFound { table: table.name().to_string(), id: id.key() })?;

    let write_id = WriteId::generate();
    let mut local = existing.unwrap_or_else(|| LocalRow::new(id.clone(), write_id.clone()));
    local.write_id = write_id.clone();

    let mut payload = Columns::new();
    for (col, value) in updates {
        // Without a synced row there is nothing to fall back to, so the
        // column stays overridden whatever its value.
        let matches_synced = synced
            .as_ref()
            .is_some_and(|s| s.get(&col).is_not_distinct_from(&value));
        if !before.get(&col).is_not_distinct_from(&value) {
            payload.insert(col.clone(), value.clone());
        }
        if matches_synced {
            local.clear(&col);
        } else {
            local.set(&col, value);
        }
    }

    if local.is_redundant() {
        tx.delete_local(table, &id)?;
    } else {
        tx.put_local(table, &local)?;
    }

    let entry = tx.append_change(NewChange {
        table: table.name().to_string(),
        row_id: id.clone(),
        operation: Operation::Update,
        value: with_id(&id, payload),
        write_id,
    })?;
    tracing::debug!(
        table = table.name(),
        id = %id,
        sequence = entry.sequence,
        pending = local.changed_columns.len(),
        "local update"
    );
    Ok(entry)
}

pub(crate) fn delete(tx: &mut dyn ShadowTx, table: &ShadowTable, id: Value) -> Result<ChangeEntry> {
    let id = table.coerce_id(id)?;
    let synced = tx.synced_row(table, &id)?;
    let existing = tx.local_row(table, &id)?;
    let before = merge_row(table, synced.as_ref(), existing.as_ref())
        .ok_or_else(|| Error::NotFound { table: table.name().to_string(), id: id.key() })?;

    let write_id = WriteId::generate();
    let mut local = existing.unwrap_or_else(|| LocalRow::new(id.clone(), write_id.clone()));
    local.write_id = write_id.clone();
    local.is_deleted = true;
    tx.put_local(table, &local)?;

    let entry = tx.append_change(NewChange {
        table: table.name().to_string(),
        row_id: id.clone(),
        operation: Operation::Delete,
        value: with_id(&id, before.values),
        write_id,
    })?;
    tracing::debug!(table = table.name(), id = %id, sequence = entry.sequence, "local delete");
    Ok(entry)
}
