use std::cmp::Ordering;

use crate::error::Result;
use crate::merge::MergedRow;
use crate::schema::{quote, ShadowTable, ID_COLUMN};
use crate::value::Value;

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// Null-safe equality (`IS` in SQLite).
    Eq(String, Value),
    IsNull(String),
    NotNull(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// A read against a merged view. Rows come back ordered by `id` unless
/// another order is given.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Vec<(String, Order)>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, col: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(col.to_string(), value.into()));
        self
    }

    pub fn is_null(mut self, col: &str) -> Self {
        self.filters.push(Filter::IsNull(col.to_string()));
        self
    }

    pub fn not_null(mut self, col: &str) -> Self {
        self.filters.push(Filter::NotNull(col.to_string()));
        self
    }

    pub fn order_by(mut self, col: &str, order: Order) -> Self {
        self.order_by.push((col.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Rejects filters or orderings on undeclared columns.
    pub fn validate(&self, table: &ShadowTable) -> Result<()> {
        for filter in &self.filters {
            let col = match filter {
                Filter::Eq(c, _) | Filter::IsNull(c) | Filter::NotNull(c) => c,
            };
            table.column(col)?;
        }
        for (col, _) in &self.order_by {
            table.column(col)?;
        }
        Ok(())
    }

    /// Renders the query as SQL over the merged view, with its parameters.
    pub fn to_sql(&self, table: &ShadowTable) -> Result<(String, Vec<Value>)> {
        self.validate(table)?;

        let cols: Vec<String> = table.columns().iter().map(|c| quote(&c.name)).collect();
        let mut sql = format!("SELECT {} FROM {}", cols.join(", "), quote(&table.merged_view));
        let mut params = Vec::new();

        let mut clauses = Vec::new();
        for filter in &self.filters {
            match filter {
                Filter::Eq(col, value) => {
                    let value = table.column(col)?.col_type.coerce(col, value.clone())?;
                    params.push(value);
                    clauses.push(format!("{} IS ?{}", quote(col), params.len()));
                }
                Filter::IsNull(col) => clauses.push(format!("{} IS NULL", quote(col))),
                Filter::NotNull(col) => clauses.push(format!("{} IS NOT NULL", quote(col))),
            }
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let mut order: Vec<String> = self
            .order_by
            .iter()
            .map(|(col, dir)| {
                let dir = match dir {
                    Order::Asc => "ASC",
                    Order::Desc => "DESC",
                };
                format!("{} {}", quote(col), dir)
            })
            .collect();
        order.push(format!("{} ASC", quote(ID_COLUMN)));
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));

        match self.limit {
            Some(limit) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, self.offset)),
            None if self.offset > 0 => sql.push_str(&format!(" LIMIT -1 OFFSET {}", self.offset)),
            None => {}
        }
        Ok((sql, params))
    }

    /// Applies the query to rows already merged in memory.
    pub fn apply(&self, table: &ShadowTable, rows: Vec<MergedRow>) -> Result<Vec<MergedRow>> {
        self.validate(table)?;

        let mut filters = Vec::with_capacity(self.filters.len());
        for filter in &self.filters {
            filters.push(match filter {
                Filter::Eq(col, value) => {
                    Filter::Eq(col.clone(), table.column(col)?.col_type.coerce(col, value.clone())?)
                }
                other => other.clone(),
            });
        }

        let mut rows: Vec<MergedRow> = rows
            .into_iter()
            .filter(|row| {
                filters.iter().all(|f| match f {
                    Filter::Eq(col, value) => row.get(col).is_not_distinct_from(value),
                    Filter::IsNull(col) => row.get(col).is_null(),
                    Filter::NotNull(col) => !row.get(col).is_null(),
                })
            })
            .collect();

        rows.sort_by(|a, b| {
            for (col, dir) in &self.order_by {
                let ord = a.get(col).sql_cmp(b.get(col));
                let ord = if *dir == Order::Desc { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.id.sql_cmp(&b.id)
        });

        let rows = rows.into_iter().skip(self.offset);
        Ok(match self.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }
}
