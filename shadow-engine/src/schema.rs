//! Shadow table pair derivation.
//!
//! A logical table is declared once as a list of [`ColumnDef`]s. From it we
//! derive two physical tables: `synced_<name>` mirroring confirmed server
//! state, and `local_<name>` holding pending edits plus bookkeeping columns.
//! The merged view keeps the logical name.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::Value;

pub const ID_COLUMN: &str = "id";
pub const CHANGED_COLUMNS: &str = "changed_columns";
pub const IS_DELETED: &str = "is_deleted";
pub const WRITE_ID: &str = "write_id";

/// Column names owned by the shadow scheme. Declared columns may not use them.
pub const BOOKKEEPING_COLUMNS: [&str; 3] = [CHANGED_COLUMNS, IS_DELETED, WRITE_ID];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Blob,
    Boolean,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
        }
    }

    /// Converts `value` into this column's representation, or reports the
    /// mismatch. Integers widen into reals; 0/1 integers read back from
    /// storage become booleans.
    pub fn coerce(self, column: &str, value: Value) -> Result<Value> {
        let mismatch = |got: &Value| Error::TypeMismatch {
            column: column.to_string(),
            expected: self,
            got: got.type_name(),
        };

        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (ColumnType::Text, v @ Value::Text(_)) => Ok(v),
            (ColumnType::Integer, v @ Value::Integer(_)) => Ok(v),
            (ColumnType::Real, v @ Value::Real(_)) => Ok(v),
            (ColumnType::Real, Value::Integer(i)) => Ok(Value::Real(i as f64)),
            (ColumnType::Blob, v @ Value::Blob(_)) => Ok(v),
            (ColumnType::Boolean, v @ Value::Bool(_)) => Ok(v),
            (ColumnType::Boolean, Value::Integer(0)) => Ok(Value::Bool(false)),
            (ColumnType::Boolean, Value::Integer(1)) => Ok(Value::Bool(true)),
            (_, other) => Err(mismatch(&other)),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Blob => "blob",
            ColumnType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OnDeleteAction {
    Cascade,
    SetNull,
    Restrict,
    #[default]
    NoAction,
}

impl OnDeleteAction {
    fn sql(self) -> &'static str {
        match self {
            OnDeleteAction::Cascade => "CASCADE",
            OnDeleteAction::SetNull => "SET NULL",
            OnDeleteAction::Restrict => "RESTRICT",
            OnDeleteAction::NoAction => "NO ACTION",
        }
    }
}

/// Reference from a column to another logical table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub on_delete: OnDeleteAction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColumnType,
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub references: Option<ForeignKey>,
}

impl ColumnDef {
    pub fn new(name: &str, col_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            col_type,
            nullable: true,
            default: None,
            references: None,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn integer(name: &str) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn real(name: &str) -> Self {
        Self::new(name, ColumnType::Real)
    }

    pub fn blob(name: &str) -> Self {
        Self::new(name, ColumnType::Blob)
    }

    pub fn boolean(name: &str) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn references(mut self, table: &str, on_delete: OnDeleteAction) -> Self {
        self.references = Some(ForeignKey {
            table: table.to_string(),
            column: ID_COLUMN.to_string(),
            on_delete,
        });
        self
    }
}

/// Extra declaration options for a shadow table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowOptions {
    pub local_prefix: String,
    pub synced_prefix: String,
    /// Secondary indexes, each a list of column names, created on both
    /// physical tables.
    pub indexes: Vec<Vec<String>>,
}

impl Default for ShadowOptions {
    fn default() -> Self {
        Self {
            local_prefix: "local_".to_string(),
            synced_prefix: "synced_".to_string(),
            indexes: Vec::new(),
        }
    }
}

/// Handles for one declared logical table: the two physical tables and the
/// merged view.
#[derive(Clone, Debug)]
pub struct ShadowTable {
    name: String,
    columns: Vec<ColumnDef>,
    options: ShadowOptions,
    pub local_table: String,
    pub synced_table: String,
    pub merged_view: String,
}

/// Derives the shadow pair for a logical table.
///
/// `columns` must contain an `id` column of type text or integer; it becomes
/// the primary key of both physical tables.
pub fn declare_shadow_table(
    name: &str,
    columns: Vec<ColumnDef>,
    options: ShadowOptions,
) -> Result<ShadowTable> {
    let invalid = |reason: String| Error::InvalidSchema { table: name.to_string(), reason };

    if !is_identifier(name) {
        return Err(invalid(format!("'{}' is not a valid table name", name)));
    }
    for prefix in [&options.local_prefix, &options.synced_prefix] {
        if !is_identifier(&format!("{}{}", prefix, name)) {
            return Err(invalid(format!("'{}' is not a valid table prefix", prefix)));
        }
    }
    if options.local_prefix == options.synced_prefix {
        return Err(invalid("local and synced prefixes must differ".to_string()));
    }

    let mut seen = std::collections::HashSet::new();
    for col in &columns {
        if BOOKKEEPING_COLUMNS.contains(&col.name.as_str()) {
            return Err(Error::SchemaConflict {
                table: name.to_string(),
                column: col.name.clone(),
            });
        }
        if !is_identifier(&col.name) {
            return Err(invalid(format!("'{}' is not a valid column name", col.name)));
        }
        if !seen.insert(col.name.as_str()) {
            return Err(invalid(format!("column '{}' declared twice", col.name)));
        }
        if let Some(default) = &col.default {
            col.col_type.coerce(&col.name, default.clone())?;
        }
        if let Some(fk) = &col.references {
            if !is_identifier(&fk.table) || !is_identifier(&fk.column) {
                return Err(invalid(format!("bad reference on column '{}'", col.name)));
            }
        }
    }

    let id = columns
        .iter()
        .find(|c| c.name == ID_COLUMN)
        .ok_or_else(|| invalid("missing 'id' column".to_string()))?;
    if !matches!(id.col_type, ColumnType::Text | ColumnType::Integer) {
        return Err(invalid(format!("'id' must be text or integer, not {}", id.col_type)));
    }
    if id.references.is_some() {
        return Err(invalid("'id' cannot reference another table".to_string()));
    }

    for index in &options.indexes {
        if index.is_empty() {
            return Err(invalid("empty index".to_string()));
        }
        for col in index {
            if !seen.contains(col.as_str()) {
                return Err(Error::UnknownColumn { table: name.to_string(), column: col.clone() });
            }
        }
    }

    let mut columns = columns;
    for col in columns.iter_mut().filter(|c| c.name == ID_COLUMN) {
        col.nullable = false;
        col.default = None;
    }

    Ok(ShadowTable {
        local_table: format!("{}{}", options.local_prefix, name),
        synced_table: format!("{}{}", options.synced_prefix, name),
        merged_view: name.to_string(),
        name: name.to_string(),
        columns,
        options,
    })
}

impl ShadowTable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ShadowOptions {
        &self.options
    }

    /// All declared columns, `id` included.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn id_column(&self) -> &ColumnDef {
        self.columns
            .iter()
            .find(|c| c.name == ID_COLUMN)
            .unwrap_or(&self.columns[0])
    }

    /// Declared columns other than `id`.
    pub fn data_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.name != ID_COLUMN)
    }

    pub fn column(&self, name: &str) -> Result<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::UnknownColumn { table: self.name.clone(), column: name.to_string() })
    }

    /// Logical tables this one references, excluding itself.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter_map(|c| c.references.as_ref())
            .map(|fk| fk.table.as_str())
            .filter(move |t| *t != self.name)
    }

    pub fn coerce_id(&self, id: Value) -> Result<Value> {
        let id = self.id_column().col_type.coerce(ID_COLUMN, id)?;
        if id.is_null() {
            return Err(Error::NullViolation { table: self.name.clone(), column: ID_COLUMN.to_string() });
        }
        Ok(id)
    }

    pub fn synced_ddl(&self) -> String {
        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| self.column_ddl(c, &self.options.synced_prefix, !c.nullable))
            .collect();
        defs.push(format!("{} TEXT", quote(WRITE_ID)));
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            quote(&self.synced_table),
            defs.join(",\n    ")
        )
    }

    pub fn local_ddl(&self) -> String {
        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| self.column_ddl(c, &self.options.local_prefix, c.name == ID_COLUMN))
            .collect();
        defs.push(format!("{} TEXT NOT NULL DEFAULT '[]'", quote(CHANGED_COLUMNS)));
        defs.push(format!("{} INTEGER NOT NULL DEFAULT 0", quote(IS_DELETED)));
        defs.push(format!("{} TEXT NOT NULL", quote(WRITE_ID)));
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            quote(&self.local_table),
            defs.join(",\n    ")
        )
    }

    pub fn index_ddl(&self) -> Vec<String> {
        let mut statements = Vec::new();
        for physical in [&self.synced_table, &self.local_table] {
            for cols in &self.options.indexes {
                let index_name = format!("idx_{}_{}", physical, cols.join("_"));
                let quoted: Vec<String> = cols.iter().map(|c| quote(c)).collect();
                statements.push(format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    quote(&index_name),
                    quote(physical),
                    quoted.join(", ")
                ));
            }
        }
        statements
    }

    // References are rewritten to the same physical variant: local rows
    // reference local rows, synced rows reference synced rows.
    fn column_ddl(&self, col: &ColumnDef, prefix: &str, not_null: bool) -> String {
        let mut ddl = format!("{} {}", quote(&col.name), col.col_type.sql_type());
        if col.name == ID_COLUMN {
            ddl.push_str(" PRIMARY KEY");
        }
        if not_null {
            ddl.push_str(" NOT NULL");
        }
        if let Some(fk) = &col.references {
            ddl.push_str(&format!(
                " REFERENCES {} ({}) ON DELETE {} DEFERRABLE INITIALLY DEFERRED",
                quote(&format!("{}{}", prefix, fk.table)),
                quote(&fk.column),
                fk.on_delete.sql()
            ));
        }
        ddl
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}
