//! The merge view: one logical row out of a synced row and a local row.
//!
//! Precedence is per column. A column listed in the local row's
//! `changed_columns` reads from the local row, every other column reads from
//! the synced row. A local row marked deleted hides the row entirely.

use crate::row::{LocalRow, SyncedRow};
use crate::schema::{quote, ShadowTable, CHANGED_COLUMNS, ID_COLUMN, IS_DELETED};
use crate::value::{Columns, Value};

/// A row as the application sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct MergedRow {
    pub id: Value,
    pub values: Columns,
}

impl MergedRow {
    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn get(&self, col: &str) -> &Value {
        if col == ID_COLUMN {
            return &self.id;
        }
        self.values.get(col).unwrap_or(&Value::Null)
    }

    pub fn get_str(&self, col: &str) -> Option<&str> {
        self.get(col).as_str()
    }

    pub fn get_i64(&self, col: &str) -> Option<i64> {
        self.get(col).as_i64()
    }

    pub fn get_bool(&self, col: &str) -> Option<bool> {
        self.get(col).as_bool()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Computes the merged row, or `None` when the row is absent from the view.
pub fn merge_row(
    table: &ShadowTable,
    synced: Option<&SyncedRow>,
    local: Option<&LocalRow>,
) -> Option<MergedRow> {
    if local.is_some_and(|l| l.is_deleted) {
        return None;
    }
    let id = local.map(|l| &l.id).or(synced.map(|s| &s.id))?.clone();

    let values = table
        .data_columns()
        .map(|col| {
            let value = match local {
                Some(l) if l.is_changed(&col.name) => l.values.get(&col.name).cloned(),
                _ => synced.and_then(|s| s.values.get(&col.name).cloned()),
            };
            (col.name.clone(), value.unwrap_or_default())
        })
        .collect();

    Some(MergedRow { id, values })
}

/// SQL for the merged view over the table's shadow pair.
pub fn merged_view_sql(table: &ShadowTable) -> String {
    let mut select = vec![format!(
        "COALESCE(l.{id}, s.{id}) AS {id}",
        id = quote(ID_COLUMN)
    )];
    for col in table.data_columns() {
        let name = quote(&col.name);
        select.push(format!(
            "CASE WHEN EXISTS (SELECT 1 FROM json_each(l.{changed}) WHERE json_each.value = '{raw}') \
             THEN l.{name} ELSE s.{name} END AS {name}",
            changed = quote(CHANGED_COLUMNS),
            raw = col.name,
            name = name,
        ));
    }

    format!(
        "CREATE VIEW IF NOT EXISTS {view} AS\nSELECT\n    {select}\nFROM {synced} AS s\nFULL OUTER JOIN {local} AS l ON l.{id} = s.{id}\nWHERE l.{id} IS NULL OR l.{deleted} = 0",
        view = quote(&table.merged_view),
        select = select.join(",\n    "),
        synced = quote(&table.synced_table),
        local = quote(&table.local_table),
        id = quote(ID_COLUMN),
        deleted = quote(IS_DELETED),
    )
}
