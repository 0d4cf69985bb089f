//! Filter conditions for WHERE clauses.
//!
//! [`Condition::matches`] carries the value-driven filter semantics: a scalar
//! compares for equality, NULL becomes `IS NULL`, a sequence becomes `IN`,
//! and a NULL inside a sequence turns into an extra `OR col IS NULL` branch
//! because `col IN (NULL)` never matches.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use sqlnest_core::{Dialect, Error, Result, UsageErrorKind, Value};

/// Comparison operators accepted by [`Condition::compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
}

impl CompareOp {
    /// Parse an operator token such as `">="` or `"not like"`.
    pub fn parse(op: &str) -> Result<Self> {
        let normalized = op.trim().to_ascii_uppercase();
        let parsed = match normalized.as_str() {
            "=" | "==" => CompareOp::Eq,
            "!=" | "<>" => CompareOp::Ne,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            "LIKE" => CompareOp::Like,
            "NOT LIKE" => CompareOp::NotLike,
            _ => {
                return Err(Error::usage(
                    UsageErrorKind::InvalidOperator,
                    format!("unsupported comparison operator '{}'", op),
                ));
            }
        };
        Ok(parsed)
    }

    /// SQL spelling of the operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Like => "LIKE",
            CompareOp::NotLike => "NOT LIKE",
        }
    }
}

/// A single WHERE condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column <op> value`
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    /// `column [NOT] IN (values...)`; values are never NULL
    In {
        column: String,
        values: Vec<Value>,
        negated: bool,
    },
    /// `column IS [NOT] NULL`
    Null { column: String, negated: bool },
    /// Raw SQL fragment with positional `?` markers
    Raw { sql: String, params: Vec<Value> },
    /// OR group
    Any(Vec<Condition>),
    /// AND group
    All(Vec<Condition>),
    /// Matches no row
    Never,
    /// Matches every row
    Always,
}

impl Condition {
    /// Filter `column` by `value` (see module docs for the semantics).
    pub fn matches(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::filter(column.into(), value.into(), false)
    }

    /// Negated form of [`Condition::matches`].
    pub fn not_matches(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::filter(column.into(), value.into(), true)
    }

    fn filter(column: String, value: Value, negated: bool) -> Self {
        match value {
            Value::Null => Condition::Null { column, negated },
            Value::Array(items) => {
                let has_null = items.iter().any(Value::is_null);
                let values: Vec<Value> = items.into_iter().filter(|v| !v.is_null()).collect();
                match (values.is_empty(), has_null, negated) {
                    (true, true, _) => Condition::Null { column, negated },
                    (true, false, false) => Condition::Never,
                    (true, false, true) => Condition::Always,
                    (false, false, _) => Condition::In {
                        column,
                        values,
                        negated,
                    },
                    (false, true, false) => Condition::Any(vec![
                        Condition::In {
                            column: column.clone(),
                            values,
                            negated: false,
                        },
                        Condition::Null {
                            column,
                            negated: false,
                        },
                    ]),
                    (false, true, true) => Condition::All(vec![
                        Condition::In {
                            column: column.clone(),
                            values,
                            negated: true,
                        },
                        Condition::Null {
                            column,
                            negated: true,
                        },
                    ]),
                }
            }
            value => Condition::Compare {
                column,
                op: if negated { CompareOp::Ne } else { CompareOp::Eq },
                value,
            },
        }
    }

    /// `column IN (values)` for a list already known to hold no NULLs.
    pub fn in_list(column: impl Into<String>, values: Vec<Value>) -> Self {
        if values.is_empty() {
            return Condition::Never;
        }
        Condition::In {
            column: column.into(),
            values,
            negated: false,
        }
    }

    /// `column <op> value` with an operator given as text.
    pub fn compare(column: impl Into<String>, op: &str, value: impl Into<Value>) -> Result<Self> {
        Ok(Condition::Compare {
            column: column.into(),
            op: CompareOp::parse(op)?,
            value: value.into(),
        })
    }

    /// Raw fragment with positional `?` markers, one per parameter.
    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Result<Self> {
        let sql = sql.into();
        let markers = positional_markers(&sql).len();
        if markers != params.len() {
            return Err(Error::usage(
                UsageErrorKind::ParameterCount,
                format!(
                    "fragment '{}' has {} positional marker(s) but {} parameter(s) were given",
                    sql,
                    markers,
                    params.len()
                ),
            ));
        }
        Ok(Condition::Raw { sql, params })
    }

    /// Raw fragment with `:name` markers bound from `params`.
    ///
    /// Every marker must have a value and every value must be used.
    pub fn raw_named<K, V>(sql: &str, params: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let named: HashMap<String, Value> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let quoted = quoted_ranges(sql);
        let mut rewritten = String::with_capacity(sql.len());
        let mut bound = Vec::new();
        let mut used = std::collections::HashSet::new();
        let mut last = 0;
        for captures in named_marker()?.captures_iter(sql) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let start = whole.start();
            let is_cast = start > 0 && sql.as_bytes()[start - 1] == b':';
            if is_cast || quoted.iter().any(|r| r.contains(&start)) {
                continue;
            }
            let value = named.get(name.as_str()).ok_or_else(|| {
                Error::usage(
                    UsageErrorKind::ParameterCount,
                    format!("no value given for named parameter ':{}'", name.as_str()),
                )
            })?;
            rewritten.push_str(&sql[last..start]);
            rewritten.push('?');
            bound.push(value.clone());
            used.insert(name.as_str().to_string());
            last = whole.end();
        }
        rewritten.push_str(&sql[last..]);

        if let Some(unused) = named.keys().find(|k| !used.contains(*k)) {
            return Err(Error::usage(
                UsageErrorKind::ParameterCount,
                format!("named parameter ':{}' does not appear in '{}'", unused, sql),
            ));
        }
        Condition::raw(rewritten, bound)
    }

    /// Combine with another condition using AND.
    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::All(mut items) => {
                items.push(other);
                Condition::All(items)
            }
            first => Condition::All(vec![first, other]),
        }
    }

    /// Combine with another condition using OR.
    pub fn or(self, other: Condition) -> Self {
        match self {
            Condition::Any(mut items) => {
                items.push(other);
                Condition::Any(items)
            }
            first => Condition::Any(vec![first, other]),
        }
    }

    /// Render this condition, appending bound values to `params`.
    pub fn build(&self, dialect: Dialect, params: &mut Vec<Value>) -> String {
        match self {
            Condition::Compare { column, op, value } => {
                let column = quote_column(dialect, column);
                let rhs = bind(dialect, params, value);
                format!("{column} {} {rhs}", op.as_str())
            }
            Condition::In {
                column,
                values,
                negated,
            } => {
                let column = quote_column(dialect, column);
                let list: Vec<String> = values.iter().map(|v| bind(dialect, params, v)).collect();
                let not_str = if *negated { "NOT " } else { "" };
                format!("{column} {not_str}IN ({})", list.join(", "))
            }
            Condition::Null { column, negated } => {
                let column = quote_column(dialect, column);
                let not_str = if *negated { " NOT" } else { "" };
                format!("{column} IS{not_str} NULL")
            }
            Condition::Raw { sql, params: values } => {
                let mut out = String::with_capacity(sql.len() + 2);
                let mut last = 0;
                out.push('(');
                for (marker, value) in positional_markers(sql).into_iter().zip(values) {
                    out.push_str(&sql[last..marker]);
                    out.push_str(&bind(dialect, params, value));
                    last = marker + 1;
                }
                out.push_str(&sql[last..]);
                out.push(')');
                out
            }
            Condition::Any(items) => group(dialect, params, items, " OR ", "1 = 0"),
            Condition::All(items) => group(dialect, params, items, " AND ", "1 = 1"),
            Condition::Never => "1 = 0".to_string(),
            Condition::Always => "1 = 1".to_string(),
        }
    }
}

fn group(
    dialect: Dialect,
    params: &mut Vec<Value>,
    items: &[Condition],
    separator: &str,
    empty: &str,
) -> String {
    match items {
        [] => empty.to_string(),
        [single] => single.build(dialect, params),
        _ => {
            let parts: Vec<String> = items.iter().map(|c| c.build(dialect, params)).collect();
            format!("({})", parts.join(separator))
        }
    }
}

/// Render a list of conditions joined by AND.
pub fn build_conditions(dialect: Dialect, params: &mut Vec<Value>, conditions: &[Condition]) -> String {
    let parts: Vec<String> = conditions
        .iter()
        .map(|c| c.build(dialect, params))
        .collect();
    parts.join(" AND ")
}

/// Render a value in statement position: literals inline, DEFAULT as the
/// keyword, everything else as a bound placeholder.
pub fn bind(dialect: Dialect, params: &mut Vec<Value>, value: &Value) -> String {
    match value {
        Value::Literal(sql) => sql.clone(),
        Value::Default => "DEFAULT".to_string(),
        other => {
            params.push(other.clone());
            dialect.placeholder(params.len())
        }
    }
}

/// Quote a column reference. Dotted identifiers are quoted per part; anything
/// that is not a plain identifier (`*`, `COUNT(*)`, expressions) is emitted as is.
pub fn quote_column(dialect: Dialect, column: &str) -> String {
    let is_identifier = |part: &str| {
        !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if column.split('.').all(is_identifier) {
        column
            .split('.')
            .map(|part| dialect.quote_identifier(part))
            .collect::<Vec<_>>()
            .join(".")
    } else {
        column.to_string()
    }
}

fn named_marker() -> Result<&'static Regex> {
    static MARKER: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    MARKER
        .get_or_init(|| Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)"))
        .as_ref()
        .map_err(|e| Error::Custom(format!("named parameter pattern: {e}")))
}

/// Byte ranges covered by single-quoted string literals.
fn quoted_ranges(sql: &str) -> Vec<std::ops::Range<usize>> {
    let mut ranges = Vec::new();
    let mut open = None;
    for (i, b) in sql.bytes().enumerate() {
        if b == b'\'' {
            match open.take() {
                Some(start) => ranges.push(start..i + 1),
                None => open = Some(i),
            }
        }
    }
    if let Some(start) = open {
        ranges.push(start..sql.len());
    }
    ranges
}

/// Byte offsets of `?` markers outside string literals.
fn positional_markers(sql: &str) -> Vec<usize> {
    let quoted = quoted_ranges(sql);
    sql.bytes()
        .enumerate()
        .filter(|&(i, b)| b == b'?' && !quoted.iter().any(|r| r.contains(&i)))
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(condition: &Condition) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = condition.build(Dialect::Postgres, &mut params);
        (sql, params)
    }

    #[test]
    fn scalar_and_null_filters() {
        let (sql, params) = render(&Condition::matches("title", "Hello"));
        assert_eq!(sql, "\"title\" = $1");
        assert_eq!(params, vec![Value::Text("Hello".into())]);

        let (sql, params) = render(&Condition::matches("editor_id", Value::Null));
        assert_eq!(sql, "\"editor_id\" IS NULL");
        assert!(params.is_empty());

        let (sql, _) = render(&Condition::not_matches("editor_id", Value::Null));
        assert_eq!(sql, "\"editor_id\" IS NOT NULL");

        let (sql, _) = render(&Condition::not_matches("id", 3));
        assert_eq!(sql, "\"id\" != $1");
    }

    #[test]
    fn in_list_with_null_is_rewritten() {
        let values = Value::Array(vec![Value::Int(1), Value::Int(2), Value::Null]);
        let (sql, params) = render(&Condition::matches("col", values.clone()));
        assert_eq!(sql, "(\"col\" IN ($1, $2) OR \"col\" IS NULL)");
        assert_eq!(params, vec![Value::Int(1), Value::Int(2)]);

        let (sql, params) = render(&Condition::not_matches("col", values));
        assert_eq!(sql, "(\"col\" NOT IN ($1, $2) AND \"col\" IS NOT NULL)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn degenerate_lists() {
        let (sql, _) = render(&Condition::matches("col", Value::Array(vec![])));
        assert_eq!(sql, "1 = 0");
        let (sql, _) = render(&Condition::not_matches("col", Value::Array(vec![])));
        assert_eq!(sql, "1 = 1");
        let (sql, _) = render(&Condition::matches("col", Value::Array(vec![Value::Null])));
        assert_eq!(sql, "\"col\" IS NULL");
        assert_eq!(Condition::in_list("col", vec![]), Condition::Never);
    }

    #[test]
    fn literal_values_are_inlined() {
        let (sql, params) = render(&Condition::matches(
            "updated_at",
            Value::literal("CURRENT_TIMESTAMP"),
        ));
        assert_eq!(sql, "\"updated_at\" = CURRENT_TIMESTAMP");
        assert!(params.is_empty());
    }

    #[test]
    fn operators_parse_or_fail() {
        assert_eq!(CompareOp::parse(">=").unwrap(), CompareOp::Ge);
        assert_eq!(CompareOp::parse("not like").unwrap(), CompareOp::NotLike);
        assert_eq!(CompareOp::parse("<>").unwrap(), CompareOp::Ne);
        let err = Condition::compare("id", "=>", 1).unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::InvalidOperator));
    }

    #[test]
    fn raw_fragments_check_parameter_count() {
        let ok = Condition::raw("published = ? OR author_id = ?", vec![true.into(), 3.into()])
            .unwrap();
        let (sql, params) = render(&ok);
        assert_eq!(sql, "(published = $1 OR author_id = $2)");
        assert_eq!(params.len(), 2);

        let err = Condition::raw("a = ? AND b = ?", vec![1.into()]).unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::ParameterCount));

        let quoted = Condition::raw("title = '?' AND id = ?", vec![1.into()]).unwrap();
        let (sql, _) = render(&quoted);
        assert_eq!(sql, "(title = '?' AND id = $1)");
    }

    #[test]
    fn named_fragments_bind_in_marker_order() {
        let condition = Condition::raw_named(
            "created_at > :since AND author_id = :author AND kind::text = 'a'",
            [("author", Value::Int(7)), ("since", Value::Text("2024".into()))],
        )
        .unwrap();
        let (sql, params) = render(&condition);
        assert_eq!(
            sql,
            "(created_at > $1 AND author_id = $2 AND kind::text = 'a')"
        );
        assert_eq!(params, vec![Value::Text("2024".into()), Value::Int(7)]);

        let missing = Condition::raw_named("a = :a", Vec::<(&str, Value)>::new()).unwrap_err();
        assert_eq!(missing.usage_kind(), Some(UsageErrorKind::ParameterCount));
        let unused = Condition::raw_named("a = :a", [("a", 1), ("b", 2)]).unwrap_err();
        assert_eq!(unused.usage_kind(), Some(UsageErrorKind::ParameterCount));
    }

    #[test]
    fn groups_nest_with_parentheses() {
        let condition = Condition::matches("a", 1)
            .or(Condition::matches("b", 2))
            .and(Condition::matches("c", 3));
        let (sql, params) = render(&condition);
        assert_eq!(sql, "((\"a\" = $1 OR \"b\" = $2) AND \"c\" = $3)");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn column_quoting() {
        assert_eq!(quote_column(Dialect::Postgres, "post.id"), "\"post\".\"id\"");
        assert_eq!(quote_column(Dialect::Mysql, "id"), "`id`");
        assert_eq!(quote_column(Dialect::Postgres, "COUNT(*)"), "COUNT(*)");
        assert_eq!(quote_column(Dialect::Postgres, "*"), "*");
    }
}
