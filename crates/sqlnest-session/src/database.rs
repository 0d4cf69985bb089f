//! The `Database` handle: connection, schema, configuration and query hooks.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use sqlnest_core::{Connection, Dialect, Error, Result, Row, Schema, UsageErrorKind, Value};

use crate::config::DatabaseConfig;
use crate::n1_detection::{N1QueryTracker, N1Stats};
use crate::record::Record;
use crate::result::ResultSet;

/// Kind of statement sent to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Transaction,
}

/// A statement about to be sent to storage, as seen by query listeners.
#[derive(Debug, Clone, Copy)]
pub struct QueryEvent<'a> {
    pub kind: StatementKind,
    pub sql: &'a str,
    pub params: &'a [Value],
}

type QueryListener = Rc<dyn Fn(&QueryEvent<'_>)>;

struct DatabaseInner<C: Connection> {
    conn: C,
    schema: Arc<Schema>,
    config: DatabaseConfig,
    dialect: Dialect,
    queries: Cell<usize>,
    statements: Cell<usize>,
    listeners: RefCell<Vec<QueryListener>>,
    n1: RefCell<Option<N1QueryTracker>>,
}

/// Entry point for traversals and saves.
///
/// `Database` is a cheap, reference-counted handle; clones share the
/// connection, schema, counters and listeners. It is single-threaded.
pub struct Database<C: Connection> {
    inner: Rc<DatabaseInner<C>>,
}

impl<C: Connection> Clone for Database<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<C: Connection> fmt::Debug for Database<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("dialect", &self.inner.dialect)
            .field("schema", &self.inner.schema)
            .field("config", &self.inner.config)
            .field("queries", &self.inner.queries.get())
            .field("statements", &self.inner.statements.get())
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Database<C> {
    /// Create a database handle with the default configuration.
    pub fn new(conn: C, schema: Schema) -> Self {
        Self::with_config(conn, Arc::new(schema), DatabaseConfig::default())
    }

    /// Create a database handle sharing an existing schema.
    pub fn with_config(conn: C, schema: Arc<Schema>, config: DatabaseConfig) -> Self {
        let dialect = conn.dialect();
        let n1 = config.n1_threshold.map(N1QueryTracker::new);
        tracing::debug!(?dialect, ?config, "database handle created");
        Self {
            inner: Rc::new(DatabaseInner {
                conn,
                schema,
                config,
                dialect,
                queries: Cell::new(0),
                statements: Cell::new(0),
                listeners: RefCell::new(Vec::new()),
                n1: RefCell::new(n1),
            }),
        }
    }

    /// The schema registry.
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Shared handle to the schema registry.
    pub fn shared_schema(&self) -> Arc<Schema> {
        Arc::clone(&self.inner.schema)
    }

    /// The active configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// SQL dialect of the underlying connection.
    pub fn dialect(&self) -> Dialect {
        self.inner.dialect
    }

    /// The underlying connection.
    pub fn connection(&self) -> &C {
        &self.inner.conn
    }

    /// Do two handles share the same database?
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Result over every row of a table (or alias).
    pub fn table(&self, name: &str) -> Result<ResultSet<C>> {
        let table = self.schema().resolve_table(name)?;
        Ok(ResultSet::for_table(self.clone(), table))
    }

    /// Fetch one row by its single-column primary key.
    pub fn find(&self, table: &str, id: impl Into<Value>) -> Result<Option<Record<C>>> {
        let result = self.table(table)?;
        let key = self
            .schema()
            .single_primary_key(result.table())
            .ok_or_else(|| {
                Error::usage(
                    UsageErrorKind::CompoundKey,
                    format!("'{}' has a compound primary key", result.table()),
                )
            })?
            .to_string();
        result.where_eq(key, id).fetch()
    }

    /// A new, empty record for a table (or alias).
    pub fn record(&self, table: &str) -> Result<Record<C>> {
        let table = self.schema().resolve_table(table)?;
        Ok(Record::new(self.clone(), table))
    }

    /// Build a record tree from JSON.
    ///
    /// Objects become references, arrays of objects under `<name>List` keys
    /// become back-references, everything else is a column value.
    pub fn create_record(&self, table: &str, data: serde_json::Value) -> Result<Record<C>> {
        let record = self.record(table)?;
        record.load_json(data)?;
        Ok(record)
    }

    /// Register a listener called before every statement is sent.
    pub fn on_query<F>(&self, listener: F)
    where
        F: Fn(&QueryEvent<'_>) + 'static,
    {
        self.inner.listeners.borrow_mut().push(Rc::new(listener));
    }

    /// Number of SELECT statements sent so far.
    pub fn query_count(&self) -> usize {
        self.inner.queries.get()
    }

    /// Number of INSERT/UPDATE/DELETE statements sent so far.
    pub fn statement_count(&self) -> usize {
        self.inner.statements.get()
    }

    /// Reset the query and statement counters.
    pub fn reset_counters(&self) {
        self.inner.queries.set(0);
        self.inner.statements.set(0);
    }

    /// N+1 statistics, when detection is enabled.
    pub fn n1_stats(&self) -> Option<N1Stats> {
        self.inner.n1.borrow().as_ref().map(N1QueryTracker::stats)
    }

    /// Begin a transaction on the underlying connection.
    pub fn begin(&self) -> Result<()> {
        self.notify(StatementKind::Transaction, "BEGIN", &[]);
        self.inner.conn.begin()
    }

    /// Commit the current transaction.
    pub fn commit(&self) -> Result<()> {
        self.notify(StatementKind::Transaction, "COMMIT", &[]);
        self.inner.conn.commit()
    }

    /// Roll back the current transaction.
    pub fn rollback(&self) -> Result<()> {
        self.notify(StatementKind::Transaction, "ROLLBACK", &[]);
        self.inner.conn.rollback()
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        self.begin()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback after failed transaction body failed");
                }
                Err(err)
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, params), fields(params = params.len()))]
    pub(crate) fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.notify(StatementKind::Select, sql, params);
        self.inner.queries.set(self.inner.queries.get() + 1);
        let rows = self.inner.conn.query(sql, params)?;
        tracing::trace!(rows = rows.len(), "query returned");
        Ok(rows)
    }

    #[tracing::instrument(level = "trace", skip(self, params), fields(params = params.len()))]
    pub(crate) fn execute(&self, kind: StatementKind, sql: &str, params: &[Value]) -> Result<u64> {
        self.notify(kind, sql, params);
        self.inner.statements.set(self.inner.statements.get() + 1);
        self.inner.conn.execute(sql, params)
    }

    #[tracing::instrument(level = "trace", skip(self, params), fields(params = params.len()))]
    pub(crate) fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.notify(StatementKind::Insert, sql, params);
        self.inner.statements.set(self.inner.statements.get() + 1);
        self.inner.conn.insert(sql, params)
    }

    pub(crate) fn record_unbatched(&self, table: &str, association: &str) {
        if let Some(tracker) = self.inner.n1.borrow_mut().as_mut() {
            tracker.record_load(table, association);
        }
    }

    fn notify(&self, kind: StatementKind, sql: &str, params: &[Value]) {
        let listeners: Vec<QueryListener> = self.inner.listeners.borrow().clone();
        if listeners.is_empty() {
            return;
        }
        let event = QueryEvent { kind, sql, params };
        for listener in &listeners {
            listener(&event);
        }
    }
}
