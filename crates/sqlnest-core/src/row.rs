//! Raw rows as returned by a connection.

use crate::Result;
use crate::error::Error;
use crate::value::Value;

/// One row of a query result, before the session layer turns it into a
/// record. Names and values are parallel vectors in SELECT order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    names: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Pair up column names with their values. Extra entries on either side
    /// are dropped.
    pub fn new(mut names: Vec<String>, mut values: Vec<Value>) -> Self {
        let width = names.len().min(values.len());
        names.truncate(width);
        values.truncate(width);
        Self { names, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at a column position; aggregates read position 0.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the first column called `name`.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i))
    }

    /// (column, value) pairs in SELECT order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.names.iter().map(String::as_str).zip(self.values.iter())
    }
}

/// Typed extraction used by `Record::get_as`.
pub trait FromValue: Sized {
    #[allow(clippy::result_large_err)]
    fn from_value(value: &Value) -> Result<Self>;
}

impl<T> FromValue for T
where
    T: TryFrom<Value, Error = Error>,
{
    fn from_value(value: &Value) -> Result<Self> {
        T::try_from(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_position_and_name() {
        let row = Row::new(
            vec!["id".into(), "title".into()],
            vec![Value::BigInt(1), Value::Text("Hello".into())],
        );
        assert_eq!(row.len(), 2);
        assert_eq!(row.get(0), Some(&Value::BigInt(1)));
        assert_eq!(row.get_by_name("title"), Some(&Value::Text("Hello".into())));
        assert_eq!(row.get_by_name("body"), None);
        let names: Vec<_> = row.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["id", "title"]);
    }

    #[test]
    fn mismatched_widths_are_truncated() {
        let row = Row::new(vec!["id".into(), "title".into()], vec![Value::Int(1)]);
        assert_eq!(row.len(), 1);
        assert_eq!(row.iter().count(), 1);
    }

    #[test]
    fn from_value_reports_type_mismatches() {
        assert_eq!(i64::from_value(&Value::BigInt(4)).unwrap(), 4);
        assert!(matches!(
            i64::from_value(&Value::Text("x".into())),
            Err(Error::Type(_))
        ));
        assert_eq!(Option::<i64>::from_value(&Value::Null).unwrap(), None);
    }
}
