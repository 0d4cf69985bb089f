//! Lazily executed, immutable result sets.
//!
//! A `ResultSet` describes rows of one table: the table itself, the rows an
//! association reaches from another result, or one record's share of such an
//! association. Refining methods return a new `ResultSet`. Rows are fetched
//! on first access and cached for the lifetime of the set.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};

use sqlnest_core::{ConfigErrorKind, Connection, Error, Result, UsageErrorKind, Value};
use sqlnest_query::{
    Condition, DeleteBuilder, InsertBuilder, InsertManyBuilder, OrderBy, SelectBuilder, UpdateBuilder,
    quote_column,
};

use crate::association::{self, Association, Resolved};
use crate::config::InsertMethod;
use crate::database::{Database, StatementKind};
use crate::record::{Batch, Record, resolve_for_record};

/// Filters, projection, ordering and paging of a result.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct QuerySpec {
    pub(crate) conditions: Vec<Condition>,
    pub(crate) columns: Vec<String>,
    pub(crate) order: Vec<OrderBy>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
}

impl QuerySpec {
    pub(crate) fn is_plain(&self) -> bool {
        *self == Self::default()
    }
}

pub(crate) enum Source<C: Connection> {
    Node(Rc<Node<C>>),
    Records(Rc<Vec<Record<C>>>),
}

impl<C: Connection> Source<C> {
    fn records(&self) -> Result<Rc<Vec<Record<C>>>> {
        match self {
            Source::Node(node) => node.rows(),
            Source::Records(records) => Ok(Rc::clone(records)),
        }
    }
}

impl<C: Connection> Clone for Source<C> {
    fn clone(&self) -> Self {
        match self {
            Source::Node(node) => Source::Node(Rc::clone(node)),
            Source::Records(records) => Source::Records(Rc::clone(records)),
        }
    }
}

pub(crate) enum Binding<C: Connection> {
    Table,
    Association { source: Source<C>, resolved: Resolved },
    Row { record: Record<C>, resolved: Resolved },
}

impl<C: Connection> Clone for Binding<C> {
    fn clone(&self) -> Self {
        match self {
            Binding::Table => Binding::Table,
            Binding::Association { source, resolved } => Binding::Association {
                source: source.clone(),
                resolved: resolved.clone(),
            },
            Binding::Row { record, resolved } => Binding::Row {
                record: record.clone(),
                resolved: resolved.clone(),
            },
        }
    }
}

enum CacheState<C: Connection> {
    Unexecuted,
    Executing,
    Cached(Rc<Vec<Record<C>>>),
}

pub(crate) struct Node<C: Connection> {
    db: Database<C>,
    table: String,
    spec: QuerySpec,
    binding: Binding<C>,
    cache: RefCell<CacheState<C>>,
    associations: RefCell<HashMap<String, Weak<Node<C>>>>,
}

impl<C: Connection> Node<C> {
    fn new(db: Database<C>, table: String, spec: QuerySpec, binding: Binding<C>) -> Rc<Self> {
        Rc::new(Self {
            db,
            table,
            spec,
            binding,
            cache: RefCell::new(CacheState::Unexecuted),
            associations: RefCell::new(HashMap::new()),
        })
    }

    pub(crate) fn for_records(
        db: Database<C>,
        resolved: Resolved,
        spec: QuerySpec,
        records: Vec<Record<C>>,
    ) -> Rc<Self> {
        let table = resolved.target_table.clone();
        Self::new(
            db,
            table,
            spec,
            Binding::Association {
                source: Source::Records(Rc::new(records)),
                resolved,
            },
        )
    }

    /// Rows of this node, executing it on first use.
    pub(crate) fn rows(&self) -> Result<Rc<Vec<Record<C>>>> {
        match &*self.cache.borrow() {
            CacheState::Cached(rows) => return Ok(Rc::clone(rows)),
            CacheState::Executing => {
                return Err(Error::usage(
                    UsageErrorKind::Reentrant,
                    format!("result over '{}' was read while it was executing", self.table),
                ));
            }
            CacheState::Unexecuted => {}
        }

        self.cache.replace(CacheState::Executing);
        match self.execute() {
            Ok(rows) => {
                self.cache.replace(CacheState::Cached(Rc::clone(&rows)));
                Ok(rows)
            }
            Err(err) => {
                self.cache.replace(CacheState::Unexecuted);
                Err(err)
            }
        }
    }

    fn execute(&self) -> Result<Rc<Vec<Record<C>>>> {
        match &self.binding {
            Binding::Table => fetch_records(
                &self.db,
                &self.table,
                &self.spec.conditions,
                &self.spec.columns,
                &self.spec.order,
                self.spec.limit,
                self.spec.offset,
            )
            .map(Rc::new),
            Binding::Association { source, resolved } => {
                let sources = source.records()?;
                association::load(&self.db, &sources, resolved, &self.spec)
            }
            Binding::Row { record, resolved } => {
                resolve_for_record(record, resolved, &self.spec).map(|related| Rc::new(related.into_many()))
            }
        }
    }

    fn is_executed(&self) -> bool {
        matches!(&*self.cache.borrow(), CacheState::Cached(_))
    }
}

/// Run a SELECT and hydrate its rows as one batch.
pub(crate) fn fetch_records<C: Connection>(
    db: &Database<C>,
    table: &str,
    conditions: &[Condition],
    columns: &[String],
    order: &[OrderBy],
    limit: Option<u64>,
    offset: Option<u64>,
) -> Result<Vec<Record<C>>> {
    let (sql, params) = SelectBuilder::new(db.schema().table_name(table))
        .columns(columns.iter().cloned())
        .filters(conditions.iter().cloned())
        .order_by(order.iter().cloned())
        .limit(limit)
        .offset(offset)
        .build_with_dialect(db.dialect());
    let rows = db.query(&sql, &params)?;
    let batch = Batch::new();
    Ok(rows
        .iter()
        .map(|row| Record::hydrate(db, table, row, &batch))
        .collect())
}

/// Rows of one table, possibly reached through associations.
pub struct ResultSet<C: Connection> {
    node: Rc<Node<C>>,
}

impl<C: Connection> Clone for ResultSet<C> {
    fn clone(&self) -> Self {
        Self {
            node: Rc::clone(&self.node),
        }
    }
}

impl<C: Connection> fmt::Debug for ResultSet<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = match &self.node.binding {
            Binding::Table => "table".to_string(),
            Binding::Association { resolved, .. } | Binding::Row { resolved, .. } => {
                format!("{}.{}", resolved.source_table, resolved.association.slot_name())
            }
        };
        f.debug_struct("ResultSet")
            .field("table", &self.node.table)
            .field("binding", &binding)
            .field("spec", &self.node.spec)
            .field("executed", &self.node.is_executed())
            .finish()
    }
}

impl<C: Connection> ResultSet<C> {
    pub(crate) fn for_table(db: Database<C>, table: String) -> Self {
        Self {
            node: Node::new(db, table, QuerySpec::default(), Binding::Table),
        }
    }

    pub(crate) fn for_record(record: Record<C>, resolved: Resolved) -> Self {
        let db = record.database().clone();
        let table = resolved.target_table.clone();
        Self {
            node: Node::new(db, table, QuerySpec::default(), Binding::Row { record, resolved }),
        }
    }

    /// Logical table of the rows.
    pub fn table(&self) -> &str {
        &self.node.table
    }

    pub fn database(&self) -> &Database<C> {
        &self.node.db
    }

    /// Whether the rows have been fetched.
    pub fn is_executed(&self) -> bool {
        self.node.is_executed()
    }

    fn refine(&self, refine: impl FnOnce(&mut QuerySpec)) -> Self {
        let mut spec = self.node.spec.clone();
        refine(&mut spec);
        Self {
            node: Node::new(
                self.node.db.clone(),
                self.node.table.clone(),
                spec,
                self.node.binding.clone(),
            ),
        }
    }

    fn refine_paging(&self, limit: Option<u64>, offset: Option<u64>) -> Result<Self> {
        if !matches!(self.node.binding, Binding::Table) {
            return Err(Error::config(
                ConfigErrorKind::AssociationLimit,
                format!(
                    "LIMIT/OFFSET is not supported on association results over '{}'",
                    self.node.table
                ),
            ));
        }
        Ok(self.refine(|spec| {
            if limit.is_some() {
                spec.limit = limit;
            }
            if offset.is_some() {
                spec.offset = offset;
            }
        }))
    }

    /// Filter by a column: scalars compare with `=`, NULL with `IS NULL`,
    /// arrays with `IN` (NULL elements match NULL).
    pub fn where_eq(&self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Condition::matches(column, value))
    }

    /// Negated form of [`ResultSet::where_eq`].
    pub fn where_not(&self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Condition::not_matches(column, value))
    }

    /// Compare a column with an operator such as `>=` or `LIKE`.
    pub fn where_op(&self, column: impl Into<String>, op: &str, value: impl Into<Value>) -> Result<Self> {
        Ok(self.filter(Condition::compare(column, op, value)?))
    }

    /// Raw SQL fragment with positional `?` markers.
    pub fn where_raw(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<Self> {
        Ok(self.filter(Condition::raw(sql, params)?))
    }

    /// Raw SQL fragment with `:name` markers.
    pub fn where_named<K, V>(&self, sql: &str, params: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Ok(self.filter(Condition::raw_named(sql, params)?))
    }

    /// Add an arbitrary condition.
    pub fn filter(&self, condition: Condition) -> Self {
        self.refine(|spec| spec.conditions.push(condition))
    }

    /// Restrict the selected columns.
    pub fn select<I, S>(&self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.refine(|spec| spec.columns.extend(columns.into_iter().map(Into::into)))
    }

    pub fn order_by(&self, column: impl Into<String>) -> Self {
        let order = OrderBy::asc(column);
        self.refine(|spec| spec.order.push(order))
    }

    pub fn order_by_desc(&self, column: impl Into<String>) -> Self {
        let order = OrderBy::desc(column);
        self.refine(|spec| spec.order.push(order))
    }

    /// Limit the number of rows. Only valid on table results.
    pub fn limit(&self, count: u64) -> Result<Self> {
        self.refine_paging(Some(count), None)
    }

    /// Skip rows. Only valid on table results.
    pub fn offset(&self, count: u64) -> Result<Self> {
        self.refine_paging(None, Some(count))
    }

    /// One page of rows; pages start at 1.
    pub fn paged(&self, page_size: u64, page: u64) -> Result<Self> {
        if page < 1 {
            return Err(Error::usage(
                UsageErrorKind::InvalidData,
                format!("page numbers start at 1, got {page}"),
            ));
        }
        let offset = (page - 1).checked_mul(page_size).ok_or_else(|| {
            Error::usage(
                UsageErrorKind::InvalidData,
                format!("page {page} of size {page_size} is past the largest offset"),
            )
        })?;
        self.refine_paging(Some(page_size), Some(offset))
    }

    /// First row, if any.
    pub fn fetch(&self) -> Result<Option<Record<C>>> {
        Ok(self.node.rows()?.first().cloned())
    }

    /// All rows.
    pub fn fetch_all(&self) -> Result<Vec<Record<C>>> {
        Ok(self.node.rows()?.as_ref().clone())
    }

    /// Iterate over the rows. The query runs at most once per result.
    pub fn iter(&self) -> Result<impl Iterator<Item = Record<C>>> {
        let rows = self.node.rows()?;
        Ok((0..rows.len()).map(move |i| rows[i].clone()))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.node.rows()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.node.rows()?.is_empty())
    }

    /// Association reached from every row of this result.
    pub fn related(&self, name: &str) -> Result<ResultSet<C>> {
        self.traverse(Association::parse(name)?, None)
    }

    /// Like [`ResultSet::related`] with an explicit foreign-key column.
    pub fn related_via(&self, name: &str, via: &str) -> Result<ResultSet<C>> {
        self.traverse(Association::parse(name)?, Some(via))
    }

    pub fn reference(&self, name: &str) -> Result<ResultSet<C>> {
        self.traverse(Association::reference(name), None)
    }

    pub fn reference_via(&self, name: &str, via: &str) -> Result<ResultSet<C>> {
        self.traverse(Association::reference(name), Some(via))
    }

    pub fn back_reference(&self, name: &str) -> Result<ResultSet<C>> {
        self.traverse(Association::back_reference(name), None)
    }

    pub fn back_reference_via(&self, name: &str, via: &str) -> Result<ResultSet<C>> {
        self.traverse(Association::back_reference(name), Some(via))
    }

    fn traverse(&self, association: Association, via: Option<&str>) -> Result<ResultSet<C>> {
        let resolved = Resolved::new(self.node.db.schema(), &self.node.table, association, via)?;
        let signature = resolved.slot_key(&QuerySpec::default()).signature().to_string();
        if let Some(node) = self
            .node
            .associations
            .borrow()
            .get(&signature)
            .and_then(Weak::upgrade)
        {
            return Ok(Self { node });
        }

        let node = Node::new(
            self.node.db.clone(),
            resolved.target_table.clone(),
            QuerySpec::default(),
            Binding::Association {
                source: Source::Node(Rc::clone(&self.node)),
                resolved,
            },
        );
        self.node
            .associations
            .borrow_mut()
            .insert(signature, Rc::downgrade(&node));
        Ok(Self { node })
    }

    /// Conditions selecting exactly this result's rows, ignoring paging.
    /// `None` when no row can match.
    fn scope(&self) -> Result<Option<Vec<Condition>>> {
        let join = match &self.node.binding {
            Binding::Table => None,
            Binding::Association { source, resolved } => {
                match association::scope(&source.records()?, resolved) {
                    Some(condition) => Some(condition),
                    None => return Ok(None),
                }
            }
            Binding::Row { record, resolved } => {
                match association::scope(std::slice::from_ref(record), resolved) {
                    Some(condition) => Some(condition),
                    None => return Ok(None),
                }
            }
        };
        Ok(Some(
            join.into_iter()
                .chain(self.node.spec.conditions.iter().cloned())
                .collect(),
        ))
    }

    fn physical_table(&self) -> String {
        self.node.db.schema().table_name(&self.node.table)
    }

    /// Evaluate an aggregate expression over this result's rows.
    pub fn aggregate(&self, expression: &str) -> Result<Value> {
        let Some(conditions) = self.scope()? else {
            return Ok(Value::Null);
        };
        let db = &self.node.db;
        let (sql, params) = SelectBuilder::new(self.physical_table())
            .filters(conditions)
            .aggregate(expression)
            .build_with_dialect(db.dialect());
        let rows = db.query(&sql, &params)?;
        Ok(rows
            .first()
            .and_then(|row| row.get(0))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Number of rows, counted in storage.
    pub fn count(&self) -> Result<i64> {
        Ok(self.aggregate("COUNT(*)")?.as_i64().unwrap_or(0))
    }

    /// Number of non-null values of a column.
    pub fn count_column(&self, column: &str) -> Result<i64> {
        let expression = format!("COUNT({})", quote_column(self.node.db.dialect(), column));
        Ok(self.aggregate(&expression)?.as_i64().unwrap_or(0))
    }

    pub fn min(&self, column: &str) -> Result<Value> {
        self.aggregate(&format!("MIN({})", quote_column(self.node.db.dialect(), column)))
    }

    pub fn max(&self, column: &str) -> Result<Value> {
        self.aggregate(&format!("MAX({})", quote_column(self.node.db.dialect(), column)))
    }

    pub fn sum(&self, column: &str) -> Result<Value> {
        self.aggregate(&format!("SUM({})", quote_column(self.node.db.dialect(), column)))
    }

    fn reject_paged(&self, operation: &str) -> Result<()> {
        if self.node.spec.limit.is_some() || self.node.spec.offset.is_some() {
            return Err(Error::usage(
                UsageErrorKind::InvalidData,
                format!("bulk {operation} on a limited result over '{}'", self.node.table),
            ));
        }
        Ok(())
    }

    /// Insert plain rows using the configured insert method.
    pub fn insert<I, R, K, V>(&self, rows: I) -> Result<u64>
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.insert_with(rows, self.node.db.config().insert_method)
    }

    /// Insert plain rows. Nested data is not followed; use `Record::save`.
    pub fn insert_with<I, R, K, V>(&self, rows: I, method: InsertMethod) -> Result<u64>
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let rows: Vec<BTreeMap<String, Value>> = rows
            .into_iter()
            .map(|row| row.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }
        let db = &self.node.db;
        let table = self.physical_table();

        match method {
            InsertMethod::Default => {
                for row in &rows {
                    let (sql, params) = InsertBuilder::new(table.clone())
                        .values(row.clone())
                        .build_with_dialect(db.dialect());
                    db.insert(&sql, &params)?;
                }
                Ok(rows.len() as u64)
            }
            InsertMethod::Batch => {
                let columns: Vec<String> = rows[0].keys().cloned().collect();
                let mut builder = InsertManyBuilder::new(table, columns.clone());
                for row in rows {
                    if !row.keys().eq(columns.iter()) {
                        return Err(Error::usage(
                            UsageErrorKind::InvalidData,
                            "batch insert rows must all set the same columns",
                        ));
                    }
                    builder = builder.row(row.into_values().collect());
                }
                let (sql, params) = builder.build_with_dialect(db.dialect());
                db.execute(StatementKind::Insert, &sql, &params)
            }
        }
    }

    /// Update every row of this result.
    pub fn update<I, K, V>(&self, data: I) -> Result<u64>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.reject_paged("update")?;
        let builder = UpdateBuilder::new(self.physical_table())
            .set_all(data.into_iter().map(|(k, v)| (k.into(), v.into())));
        if builder.is_empty() {
            return Ok(0);
        }
        let Some(conditions) = self.scope()? else {
            return Ok(0);
        };
        let db = &self.node.db;
        let (sql, params) = builder.filters(conditions).build_with_dialect(db.dialect());
        db.execute(StatementKind::Update, &sql, &params)
    }

    /// Delete every row of this result.
    pub fn delete(&self) -> Result<u64> {
        self.reject_paged("delete")?;
        let Some(conditions) = self.scope()? else {
            return Ok(0);
        };
        let db = &self.node.db;
        let (sql, params) = DeleteBuilder::new(self.physical_table())
            .filters(conditions)
            .build_with_dialect(db.dialect());
        db.execute(StatementKind::Delete, &sql, &params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryConnection;
    use sqlnest_core::Schema;

    fn db() -> Database<MemoryConnection> {
        let conn = MemoryConnection::new()
            .with_table(
                "user",
                vec![
                    vec![("id", Value::BigInt(1)), ("name", "Ada".into())],
                    vec![("id", Value::BigInt(2)), ("name", "Bob".into())],
                ],
            )
            .with_table(
                "post",
                vec![
                    vec![("id", Value::BigInt(1)), ("title", "A".into()), ("author_id", Value::BigInt(1)), ("score", Value::BigInt(5))],
                    vec![("id", Value::BigInt(2)), ("title", "B".into()), ("author_id", Value::BigInt(2)), ("score", Value::BigInt(3))],
                    vec![("id", Value::BigInt(3)), ("title", "C".into()), ("author_id", Value::BigInt(1)), ("score", Value::BigInt(1))],
                    vec![("id", Value::BigInt(4)), ("title", "D".into()), ("author_id", Value::Null), ("score", Value::BigInt(9))],
                ],
            );
        let schema = Schema::builder()
            .alias("author", "user")
            .back_reference("user", "post", "author_id")
            .build()
            .unwrap();
        Database::new(conn, schema)
    }

    #[test]
    fn refining_leaves_the_original_untouched() {
        let db = db();
        let posts = db.table("post").unwrap();
        let first = posts.fetch_all().unwrap();
        let filtered = posts.where_eq("author_id", 1);
        assert_eq!(filtered.len().unwrap(), 2);
        assert_eq!(posts.fetch_all().unwrap().len(), 4);
        assert!(first[0].ptr_eq(&posts.fetch().unwrap().unwrap()));
        assert_eq!(db.query_count(), 2);
    }

    #[test]
    fn generated_select_carries_order_and_paging() {
        let db = db();
        let page = db.table("post").unwrap().order_by_desc("score").paged(2, 2).unwrap();
        let titles: Vec<Value> = page
            .fetch_all()
            .unwrap()
            .iter()
            .filter_map(|p| p.get("title"))
            .collect();
        assert_eq!(titles, vec![Value::from("B"), Value::from("C")]);
        assert_eq!(
            db.connection().statements(),
            vec![r#"SELECT * FROM "post" ORDER BY "score" DESC LIMIT 2 OFFSET 2"#.to_string()]
        );
        assert!(db.table("post").unwrap().paged(10, 0).is_err());
    }

    #[test]
    fn page_offsets_that_overflow_are_rejected() {
        let db = db();
        let err = db.table("post").unwrap().paged(u64::MAX, 3).unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::InvalidData));
        assert!(db.table("post").unwrap().paged(u64::MAX, 1).is_ok());
        assert_eq!(db.statement_count(), 0);
    }

    #[test]
    fn iterating_reads_the_cached_rows() {
        let db = db();
        let posts = db.table("post").unwrap().order_by("id");
        let ids: Vec<Value> = posts.iter().unwrap().filter_map(|p| p.id()).collect();
        assert_eq!(ids, (1..=4).map(Value::BigInt).collect::<Vec<_>>());

        let all = posts.fetch_all().unwrap();
        for (iterated, fetched) in posts.iter().unwrap().zip(&all) {
            assert!(iterated.ptr_eq(fetched));
        }
        assert_eq!(db.query_count(), 1);
    }

    #[test]
    fn references_are_loaded_in_one_query() {
        let db = db();
        let posts = db.table("post").unwrap().fetch_all().unwrap();
        for post in &posts {
            post.reference("author").unwrap();
        }
        assert_eq!(db.query_count(), 2);
        let sql = &db.connection().statements()[1];
        assert_eq!(sql, r#"SELECT * FROM "user" WHERE "id" IN ($1, $2)"#);
        assert!(posts[3].reference("author").unwrap().is_none());
        assert_eq!(
            posts[2].reference("author").unwrap().unwrap().get("name"),
            Some(Value::from("Ada"))
        );
    }

    #[test]
    fn association_results_reject_limits() {
        let db = db();
        let authors = db.table("post").unwrap().reference("author").unwrap();
        let err = authors.limit(1).unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::AssociationLimit));
        assert_eq!(db.query_count(), 0);
    }

    #[test]
    fn traversals_are_memoized_per_result() {
        let db = db();
        let posts = db.table("post").unwrap();
        let a = posts.reference("author").unwrap();
        let b = posts.related("author").unwrap();
        a.fetch_all().unwrap();
        assert!(b.is_executed());
        assert_eq!(db.query_count(), 2);
    }

    #[test]
    fn refined_back_references_run_once_per_batch() {
        let db = db();
        let users = db.table("user").unwrap().fetch_all().unwrap();
        for user in &users {
            let best = user.back_reference("post").unwrap().order_by_desc("score");
            best.fetch_all().unwrap();
        }
        // users, then one ordered post query for both users
        assert_eq!(db.query_count(), 2);
        let ada_posts = users[0]
            .back_reference("post")
            .unwrap()
            .order_by_desc("score")
            .fetch_all()
            .unwrap();
        let scores: Vec<i64> = ada_posts.iter().map(|p| p.get_as("score").unwrap()).collect();
        assert_eq!(scores, vec![5, 1]);
        assert_eq!(db.query_count(), 2);
    }

    #[test]
    fn aggregates_follow_the_association_scope() {
        let db = db();
        let users = db.table("user").unwrap().where_eq("id", 1);
        let posts = users.back_reference("post").unwrap();
        assert_eq!(posts.count().unwrap(), 2);
        assert_eq!(posts.max("score").unwrap(), Value::BigInt(5));
        assert_eq!(db.table("post").unwrap().sum("score").unwrap(), Value::BigInt(18));
        assert_eq!(db.table("post").unwrap().count_column("author_id").unwrap(), 3);

        let nobody = db.table("user").unwrap().where_eq("id", 99);
        db.reset_counters();
        assert_eq!(nobody.back_reference("post").unwrap().count().unwrap(), 0);
        // only the user lookup ran
        assert_eq!(db.query_count(), 1);
    }

    #[test]
    fn bulk_writes() {
        let db = db();
        let posts = db.table("post").unwrap();
        let inserted = posts
            .insert_with(
                vec![
                    vec![("title", Value::from("E")), ("score", Value::from(2))],
                    vec![("title", Value::from("F")), ("score", Value::from(4))],
                ],
                InsertMethod::Batch,
            )
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(db.statement_count(), 1);

        let updated = posts.where_eq("author_id", Value::Null).update([("score", 0)]).unwrap();
        assert_eq!(updated, 3);
        let deleted = posts.where_op("score", "<", 2).unwrap().delete().unwrap();
        assert_eq!(deleted, 4);
        assert_eq!(db.connection().rows("post").len(), 2);

        let limited = posts.limit(1).unwrap();
        assert!(limited.delete().unwrap_err().is_usage_error());
    }

    #[test]
    fn batch_insert_requires_uniform_columns() {
        let db = db();
        let err = db
            .table("post")
            .unwrap()
            .insert_with(
                vec![vec![("title", Value::from("E"))], vec![("score", Value::from(1))]],
                InsertMethod::Batch,
            )
            .unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::InvalidData));
        assert_eq!(db.statement_count(), 0);
    }
}
