//! In-memory connection for tests.
//!
//! `MemoryConnection` understands the statements this workspace generates:
//! single-table SELECTs with AND-ed comparisons, `IN` lists, `IS NULL`,
//! ORDER BY/LIMIT/OFFSET and simple aggregates, plus INSERT, UPDATE, DELETE
//! and transactions. Every statement is logged so tests can assert on the
//! exact SQL and on how many round trips a traversal took.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use sqlnest_core::error::{QueryError, QueryErrorKind};
use sqlnest_core::{Connection, Dialect, Error, Result, Row, Value};

type StoredRow = BTreeMap<String, Value>;

/// A statement received by [`MemoryConnection`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Default, Clone)]
struct Tables {
    rows: BTreeMap<String, Vec<StoredRow>>,
    next_ids: HashMap<String, i64>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: Tables,
    snapshot: Option<Tables>,
    log: Vec<LoggedStatement>,
    fail_on: Option<String>,
}

/// Connection backed by in-memory tables.
#[derive(Debug)]
pub struct MemoryConnection {
    dialect: Dialect,
    state: RefCell<MemoryState>,
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnection {
    /// Empty store speaking the Postgres dialect.
    pub fn new() -> Self {
        Self::with_dialect(Dialect::Postgres)
    }

    /// Empty store speaking `dialect` (numbered placeholders only).
    pub fn with_dialect(dialect: Dialect) -> Self {
        Self {
            dialect,
            state: RefCell::new(MemoryState::default()),
        }
    }

    /// Seed a table (builder pattern).
    #[must_use]
    pub fn with_table(self, table: &str, rows: Vec<Vec<(&str, Value)>>) -> Self {
        for row in rows {
            self.seed(table, row);
        }
        self
    }

    /// Add one row to a table without logging a statement.
    pub fn seed(&self, table: &str, row: Vec<(&str, Value)>) {
        let row: StoredRow = row.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        let mut state = self.state.borrow_mut();
        state.tables.store(table, row);
    }

    /// Current rows of a table.
    pub fn rows(&self, table: &str) -> Vec<BTreeMap<String, Value>> {
        self.state
            .borrow()
            .tables
            .rows
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Every statement received so far.
    pub fn log(&self) -> Vec<LoggedStatement> {
        self.state.borrow().log.clone()
    }

    /// SQL text of every statement received so far.
    pub fn statements(&self) -> Vec<String> {
        self.state.borrow().log.iter().map(|s| s.sql.clone()).collect()
    }

    /// Forget the statement log.
    pub fn clear_log(&self) {
        self.state.borrow_mut().log.clear();
    }

    /// Fail every statement whose SQL contains `fragment`.
    pub fn fail_on(&self, fragment: &str) {
        self.state.borrow_mut().fail_on = Some(fragment.to_string());
    }

    fn receive(&self, sql: &str, params: &[Value]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.log.push(LoggedStatement {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        match &state.fail_on {
            Some(fragment) if sql.contains(fragment.as_str()) => Err(Error::Query(QueryError {
                kind: QueryErrorKind::Constraint,
                sql: Some(sql.to_string()),
                sqlstate: Some("23000".to_string()),
                message: "simulated storage failure".to_string(),
                source: None,
            })),
            _ => Ok(()),
        }
    }

    fn write(&self, sql: &str, params: &[Value]) -> Result<(u64, i64)> {
        self.receive(sql, params)?;
        let mut state = self.state.borrow_mut();
        match sql {
            "BEGIN" => {
                state.snapshot = Some(state.tables.clone());
                Ok((0, 0))
            }
            "COMMIT" => {
                state.snapshot = None;
                Ok((0, 0))
            }
            "ROLLBACK" => {
                if let Some(snapshot) = state.snapshot.take() {
                    state.tables = snapshot;
                }
                Ok((0, 0))
            }
            _ if sql.starts_with("INSERT") => insert(&mut state.tables, sql, params),
            _ if sql.starts_with("UPDATE") => update(&mut state.tables, sql, params).map(|n| (n, 0)),
            _ if sql.starts_with("DELETE") => delete(&mut state.tables, sql, params).map(|n| (n, 0)),
            _ => Err(unsupported(sql, "statement")),
        }
    }
}

impl Connection for MemoryConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.receive(sql, params)?;
        let state = self.state.borrow();
        select(&state.tables, sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.write(sql, params).map(|(affected, _)| affected)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.write(sql, params).map(|(_, id)| id)
    }
}

impl Tables {
    fn store(&mut self, table: &str, mut row: StoredRow) -> i64 {
        let next = self.next_ids.entry(table.to_string()).or_insert(1);
        let id = match row.get("id").and_then(Value::as_i64) {
            Some(id) => id,
            None => {
                row.insert("id".to_string(), Value::BigInt(*next));
                *next
            }
        };
        *next = (*next).max(id + 1);
        self.rows.entry(table.to_string()).or_default().push(row);
        id
    }
}

fn pattern(re: &str) -> Result<Regex> {
    Regex::new(re).map_err(|e| Error::Custom(format!("invalid pattern {re}: {e}")))
}

fn unsupported(sql: &str, what: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        sql: Some(sql.to_string()),
        sqlstate: None,
        message: format!("memory connection does not support this {what}"),
        source: None,
    })
}

fn operand(sql: &str, token: &str, params: &[Value]) -> Result<Value> {
    let token = token.trim();
    if let Some(index) = token.strip_prefix('$').or_else(|| token.strip_prefix('?')) {
        let index: usize = index.parse().map_err(|_| unsupported(sql, "placeholder"))?;
        return index
            .checked_sub(1)
            .and_then(|i| params.get(i))
            .cloned()
            .ok_or_else(|| unsupported(sql, "placeholder index"));
    }
    if let Some(text) = token.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        return Ok(Value::Text(text.replace("''", "'")));
    }
    match token {
        "NULL" => Ok(Value::Null),
        "DEFAULT" => Ok(Value::Default),
        "TRUE" => Ok(Value::Bool(true)),
        "FALSE" => Ok(Value::Bool(false)),
        _ => token
            .parse::<i64>()
            .map(Value::BigInt)
            .map_err(|_| unsupported(sql, "operand")),
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

fn like(value: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return part.is_empty() || rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    rest.is_empty()
}

type Predicate = Box<dyn Fn(&StoredRow) -> bool>;

fn parse_where(sql: &str, clause: Option<&str>, params: &[Value]) -> Result<Vec<Predicate>> {
    let Some(clause) = clause else {
        return Ok(Vec::new());
    };
    if clause.contains(" OR ") {
        return Err(unsupported(sql, "OR condition"));
    }
    let compare_re = pattern(r#"^"?(\w+)"? (=|!=|<>|<=|>=|<|>|LIKE|NOT LIKE) (.+)$"#)?;
    let in_re = pattern(r#"^"?(\w+)"? (NOT )?IN \((.*)\)$"#)?;
    let null_re = pattern(r#"^"?(\w+)"? IS (NOT )?NULL$"#)?;

    let mut predicates: Vec<Predicate> = Vec::new();
    for part in clause.split(" AND ") {
        let part = part.trim();
        let part = part
            .strip_prefix('(')
            .and_then(|inner| inner.strip_suffix(')'))
            .unwrap_or(part);
        if part == "1 = 0" {
            predicates.push(Box::new(|_| false));
        } else if part == "1 = 1" {
            continue;
        } else if let Some(caps) = null_re.captures(part) {
            let column = caps[1].to_string();
            let negated = caps.get(2).is_some();
            predicates.push(Box::new(move |row| {
                let is_null = row.get(&column).is_none_or(Value::is_null);
                is_null != negated
            }));
        } else if let Some(caps) = in_re.captures(part) {
            let column = caps[1].to_string();
            let negated = caps.get(2).is_some();
            let values = caps[3]
                .split(", ")
                .map(|token| operand(sql, token, params))
                .collect::<Result<Vec<_>>>()?;
            predicates.push(Box::new(move |row| {
                let Some(value) = row.get(&column).filter(|v| !v.is_null()) else {
                    return false;
                };
                values.iter().any(|v| v.same_as(value)) != negated
            }));
        } else if let Some(caps) = compare_re.captures(part) {
            let column = caps[1].to_string();
            let op = caps[2].to_string();
            let expected = operand(sql, &caps[3], params)?;
            predicates.push(Box::new(move |row| {
                let Some(actual) = row.get(&column).filter(|v| !v.is_null()) else {
                    return false;
                };
                match op.as_str() {
                    "=" => actual.same_as(&expected),
                    "!=" | "<>" => !actual.same_as(&expected),
                    "<" => compare(actual, &expected) == Some(Ordering::Less),
                    "<=" => matches!(compare(actual, &expected), Some(Ordering::Less | Ordering::Equal)),
                    ">" => compare(actual, &expected) == Some(Ordering::Greater),
                    ">=" => matches!(compare(actual, &expected), Some(Ordering::Greater | Ordering::Equal)),
                    "LIKE" | "NOT LIKE" => {
                        let hit = match (actual.as_str(), expected.as_str()) {
                            (Some(a), Some(p)) => like(a, p),
                            _ => false,
                        };
                        hit == (op == "LIKE")
                    }
                    _ => false,
                }
            }));
        } else {
            return Err(unsupported(sql, "condition"));
        }
    }
    Ok(predicates)
}

fn filtered<'a>(rows: &'a [StoredRow], predicates: &[Predicate]) -> Vec<&'a StoredRow> {
    rows.iter()
        .filter(|row| predicates.iter().all(|p| p(row)))
        .collect()
}

fn select(tables: &Tables, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let select_re = pattern(
        r#"^SELECT (.+?) FROM "(\w+)"(?: WHERE (.+?))?(?: ORDER BY (.+?))?(?: LIMIT (\d+))?(?: OFFSET (\d+))?$"#,
    )?;
    let caps = select_re
        .captures(sql)
        .ok_or_else(|| unsupported(sql, "query"))?;
    let projection = caps[1].to_string();
    let empty = Vec::new();
    let rows = tables.rows.get(&caps[2]).unwrap_or(&empty);
    let predicates = parse_where(sql, caps.get(3).map(|m| m.as_str()), params)?;
    let mut matched = filtered(rows, &predicates);

    let aggregate_re = pattern(r#"^(COUNT|MIN|MAX|SUM)\((\*|"(\w+)")\)$"#)?;
    if let Some(agg) = aggregate_re.captures(&projection) {
        let column = agg.get(3).map(|m| m.as_str().to_string());
        let star = Value::Null;
        let values: Vec<&Value> = matched
            .iter()
            .filter_map(|row| match &column {
                Some(column) => row.get(column).filter(|v| !v.is_null()),
                None => Some(&star),
            })
            .collect();
        let result = match &agg[1] {
            "COUNT" => Value::BigInt(values.len() as i64),
            "MIN" => values
                .iter()
                .min_by(|a, b| compare(a, b).unwrap_or(Ordering::Equal))
                .map_or(Value::Null, |v| (*v).clone()),
            "MAX" => values
                .iter()
                .max_by(|a, b| compare(a, b).unwrap_or(Ordering::Equal))
                .map_or(Value::Null, |v| (*v).clone()),
            _ if values.is_empty() => Value::Null,
            _ => Value::BigInt(values.iter().filter_map(|v| v.as_i64()).sum()),
        };
        return Ok(vec![Row::new(vec![projection], vec![result])]);
    }

    if let Some(order) = caps.get(4) {
        let order_re = pattern(r#"^"(\w+)" (ASC|DESC)$"#)?;
        let mut keys = Vec::new();
        for entry in order.as_str().split(", ") {
            let entry = order_re
                .captures(entry)
                .ok_or_else(|| unsupported(sql, "ORDER BY"))?;
            keys.push((entry[1].to_string(), &entry[2] == "DESC"));
        }
        matched.sort_by(|a, b| {
            for (column, desc) in &keys {
                let ordering = match (a.get(column), b.get(column)) {
                    (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                let ordering = if *desc { ordering.reverse() } else { ordering };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    let offset = caps.get(6).and_then(|m| m.as_str().parse().ok()).unwrap_or(0usize);
    let limit = caps
        .get(5)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(usize::MAX);
    let columns: Option<Vec<String>> = (projection != "*").then(|| {
        projection
            .split(", ")
            .map(|c| c.trim_matches('"').to_string())
            .collect()
    });

    Ok(matched
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|row| match &columns {
            Some(columns) => Row::new(
                columns.clone(),
                columns
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                    .collect(),
            ),
            None => Row::new(row.keys().cloned().collect(), row.values().cloned().collect()),
        })
        .collect())
}

fn insert(tables: &mut Tables, sql: &str, params: &[Value]) -> Result<(u64, i64)> {
    let insert_re = pattern(r#"^INSERT INTO "(\w+)" (?:DEFAULT VALUES|\(([^)]*)\) VALUES (.+))$"#)?;
    let caps = insert_re
        .captures(sql)
        .ok_or_else(|| unsupported(sql, "INSERT"))?;
    let table = caps[1].to_string();
    let (Some(columns), Some(tuples)) = (caps.get(2), caps.get(3)) else {
        return Ok((1, tables.store(&table, StoredRow::new())));
    };
    let columns: Vec<String> = columns
        .as_str()
        .split(", ")
        .map(|c| c.trim_matches('"').to_string())
        .collect();

    let tuple_re = pattern(r"\(([^()]*)\)")?;
    let mut count = 0;
    let mut last_id = 0;
    for tuple in tuple_re.captures_iter(tuples.as_str()) {
        let mut row = StoredRow::new();
        for (column, token) in columns.iter().zip(tuple[1].split(", ")) {
            match operand(sql, token, params)? {
                Value::Default => {}
                value => {
                    row.insert(column.clone(), value);
                }
            }
        }
        last_id = tables.store(&table, row);
        count += 1;
    }
    Ok((count, last_id))
}

fn update(tables: &mut Tables, sql: &str, params: &[Value]) -> Result<u64> {
    let update_re = pattern(r#"^UPDATE "(\w+)" SET (.+?)(?: WHERE (.+))?$"#)?;
    let caps = update_re
        .captures(sql)
        .ok_or_else(|| unsupported(sql, "UPDATE"))?;
    let assign_re = pattern(r#"^"(\w+)" = (.+)$"#)?;
    let mut assignments = Vec::new();
    for part in caps[2].split(", ") {
        let assign = assign_re
            .captures(part)
            .ok_or_else(|| unsupported(sql, "assignment"))?;
        assignments.push((assign[1].to_string(), operand(sql, &assign[2], params)?));
    }
    let predicates = parse_where(sql, caps.get(3).map(|m| m.as_str()), params)?;
    let mut count = 0;
    if let Some(rows) = tables.rows.get_mut(&caps[1]) {
        for row in rows.iter_mut().filter(|row| predicates.iter().all(|p| p(row))) {
            for (column, value) in &assignments {
                row.insert(column.clone(), value.clone());
            }
            count += 1;
        }
    }
    Ok(count)
}

fn delete(tables: &mut Tables, sql: &str, params: &[Value]) -> Result<u64> {
    let delete_re = pattern(r#"^DELETE FROM "(\w+)"(?: WHERE (.+))?$"#)?;
    let caps = delete_re
        .captures(sql)
        .ok_or_else(|| unsupported(sql, "DELETE"))?;
    let predicates = parse_where(sql, caps.get(2).map(|m| m.as_str()), params)?;
    let Some(rows) = tables.rows.get_mut(&caps[1]) else {
        return Ok(0);
    };
    let before = rows.len();
    rows.retain(|row| !predicates.iter().all(|p| p(row)));
    Ok((before - rows.len()) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> MemoryConnection {
        MemoryConnection::new().with_table(
            "post",
            vec![
                vec![("id", Value::BigInt(1)), ("title", "b".into()), ("user_id", Value::BigInt(1))],
                vec![("id", Value::BigInt(2)), ("title", "a".into()), ("user_id", Value::Null)],
                vec![("id", Value::BigInt(3)), ("title", "c".into()), ("user_id", Value::BigInt(2))],
            ],
        )
    }

    #[test]
    fn filters_orders_and_pages() {
        let conn = conn();
        let rows = conn
            .query(
                r#"SELECT * FROM "post" WHERE "user_id" IN ($1, $2) ORDER BY "title" DESC LIMIT 1"#,
                &[Value::Int(1), Value::Int(2)],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("id"), Some(&Value::BigInt(3)));

        let rows = conn
            .query(r#"SELECT "id" FROM "post" WHERE "user_id" IS NULL"#, &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 1);
    }

    #[test]
    fn counts_rows() {
        let conn = conn();
        let rows = conn
            .query(r#"SELECT COUNT(*) FROM "post" WHERE "id" > $1"#, &[Value::Int(1)])
            .unwrap();
        assert_eq!(rows[0].get(0), Some(&Value::BigInt(2)));
    }

    #[test]
    fn generates_ids_after_seeded_rows() {
        let conn = conn();
        let id = conn
            .insert(r#"INSERT INTO "post" ("title") VALUES ($1)"#, &["d".into()])
            .unwrap();
        assert_eq!(id, 4);
        assert_eq!(conn.rows("post").len(), 4);
    }

    #[test]
    fn rollback_restores_tables() {
        let conn = conn();
        conn.begin().unwrap();
        conn.execute(r#"DELETE FROM "post" WHERE "id" = $1"#, &[Value::Int(1)])
            .unwrap();
        assert_eq!(conn.rows("post").len(), 2);
        conn.rollback().unwrap();
        assert_eq!(conn.rows("post").len(), 3);
    }

    #[test]
    fn simulated_failures_are_storage_errors() {
        let conn = conn();
        conn.fail_on("UPDATE");
        let err = conn
            .execute(r#"UPDATE "post" SET "title" = $1"#, &["x".into()])
            .unwrap_err();
        assert!(err.is_storage_error());
        assert_eq!(conn.statements().len(), 1);
    }
}
