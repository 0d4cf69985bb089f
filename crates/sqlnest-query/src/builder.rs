//! Statement builders.
//!
//! Every builder renders to `(sql, params)` for a given [`Dialect`]. Values
//! are bound as parameters except [`Value::Literal`], which is emitted
//! verbatim, and [`Value::Default`], which becomes the `DEFAULT` keyword.

use sqlnest_core::{Dialect, Value};

use crate::clause::{Limit, Offset, OrderBy};
use crate::expr::{Condition, bind, build_conditions, quote_column};

/// SELECT query builder.
#[derive(Debug, Clone, Default)]
pub struct SelectBuilder {
    table: String,
    columns: Vec<String>,
    conditions: Vec<Condition>,
    order_by: Vec<OrderBy>,
    limit: Option<Limit>,
    offset: Option<Offset>,
    aggregate: Option<String>,
}

impl SelectBuilder {
    /// Select from `table` (already the physical name).
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Restrict the selected columns; none means `*`.
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Add a condition (conditions are joined with AND).
    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Add several conditions.
    pub fn filters(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.conditions.extend(conditions);
        self
    }

    /// Add ORDER BY entries.
    pub fn order_by(mut self, order: impl IntoIterator<Item = OrderBy>) -> Self {
        self.order_by.extend(order);
        self
    }

    /// Set LIMIT.
    pub fn limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit.map(Limit);
        self
    }

    /// Set OFFSET.
    pub fn offset(mut self, offset: Option<u64>) -> Self {
        self.offset = offset.map(Offset);
        self
    }

    /// Select a single aggregate expression, e.g. `COUNT(*)`.
    ///
    /// Aggregates ignore ordering and paging.
    pub fn aggregate(mut self, expression: impl Into<String>) -> Self {
        self.aggregate = Some(expression.into());
        self
    }

    /// Build with the default dialect.
    pub fn build(&self) -> (String, Vec<Value>) {
        self.build_with_dialect(Dialect::default())
    }

    /// Build the SELECT statement.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let projection = match &self.aggregate {
            Some(expression) => expression.clone(),
            None if self.columns.is_empty() => "*".to_string(),
            None => self
                .columns
                .iter()
                .map(|c| quote_column(dialect, c))
                .collect::<Vec<_>>()
                .join(", "),
        };

        let mut sql = format!(
            "SELECT {} FROM {}",
            projection,
            dialect.quote_identifier(&self.table)
        );

        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&build_conditions(dialect, &mut params, &self.conditions));
        }

        if self.aggregate.is_none() {
            if !self.order_by.is_empty() {
                let order: Vec<String> = self.order_by.iter().map(|o| o.to_sql(dialect)).collect();
                sql.push_str(" ORDER BY ");
                sql.push_str(&order.join(", "));
            }
            if let Some(Limit(limit)) = self.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
            if let Some(Offset(offset)) = self.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }

        (sql, params)
    }
}

/// Single-row INSERT builder.
#[derive(Debug, Clone, Default)]
pub struct InsertBuilder {
    table: String,
    values: Vec<(String, Value)>,
}

impl InsertBuilder {
    /// Insert into `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            values: Vec::new(),
        }
    }

    /// Set one column.
    pub fn value(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.push((column.into(), value.into()));
        self
    }

    /// Set several columns.
    pub fn values(mut self, values: impl IntoIterator<Item = (String, Value)>) -> Self {
        self.values.extend(values);
        self
    }

    /// Build the INSERT statement.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let table = dialect.quote_identifier(&self.table);
        if self.values.is_empty() {
            return (format!("INSERT INTO {table} DEFAULT VALUES"), Vec::new());
        }
        let mut params = Vec::new();
        let columns: Vec<String> = self
            .values
            .iter()
            .map(|(c, _)| dialect.quote_identifier(c))
            .collect();
        let placeholders: Vec<String> = self
            .values
            .iter()
            .map(|(_, v)| bind(dialect, &mut params, v))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        );
        (sql, params)
    }
}

/// Multi-row INSERT builder (`VALUES (...), (...)`).
#[derive(Debug, Clone, Default)]
pub struct InsertManyBuilder {
    table: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl InsertManyBuilder {
    /// Insert rows with a fixed column list into `table`.
    pub fn new<I, S>(table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append one row; values are matched to columns by position.
    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }

    /// Number of rows queued.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows are queued.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Build the INSERT statement.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| dialect.quote_identifier(c))
            .collect();
        let tuples: Vec<String> = self
            .rows
            .iter()
            .map(|row| {
                let slots: Vec<String> = row.iter().map(|v| bind(dialect, &mut params, v)).collect();
                format!("({})", slots.join(", "))
            })
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            dialect.quote_identifier(&self.table),
            columns.join(", "),
            tuples.join(", ")
        );
        (sql, params)
    }
}

/// UPDATE builder.
#[derive(Debug, Clone, Default)]
pub struct UpdateBuilder {
    table: String,
    set: Vec<(String, Value)>,
    conditions: Vec<Condition>,
}

impl UpdateBuilder {
    /// Update rows of `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Assign one column.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((column.into(), value.into()));
        self
    }

    /// Assign several columns.
    pub fn set_all(mut self, values: impl IntoIterator<Item = (String, Value)>) -> Self {
        self.set.extend(values);
        self
    }

    /// Add a condition.
    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Add several conditions.
    pub fn filters(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.conditions.extend(conditions);
        self
    }

    /// Whether there is anything to assign.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Build the UPDATE statement.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let assignments: Vec<String> = self
            .set
            .iter()
            .map(|(column, value)| {
                let rhs = bind(dialect, &mut params, value);
                format!("{} = {}", dialect.quote_identifier(column), rhs)
            })
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            dialect.quote_identifier(&self.table),
            assignments.join(", ")
        );
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&build_conditions(dialect, &mut params, &self.conditions));
        }
        (sql, params)
    }
}

/// DELETE builder.
#[derive(Debug, Clone, Default)]
pub struct DeleteBuilder {
    table: String,
    conditions: Vec<Condition>,
}

impl DeleteBuilder {
    /// Delete rows of `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            conditions: Vec::new(),
        }
    }

    /// Add a condition.
    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Add several conditions.
    pub fn filters(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.conditions.extend(conditions);
        self
    }

    /// Build the DELETE statement.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", dialect.quote_identifier(&self.table));
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&build_conditions(dialect, &mut params, &self.conditions));
        }
        (sql, params)
    }
}

/// Equality conditions matching a key tuple, one per column.
pub fn key_conditions(columns: &[String], values: &[Value]) -> Vec<Condition> {
    columns
        .iter()
        .zip(values)
        .map(|(column, value)| Condition::Compare {
            column: column.clone(),
            op: crate::expr::CompareOp::Eq,
            value: value.clone(),
        })
        .collect()
}
