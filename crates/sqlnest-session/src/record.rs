//! Records: one row of a table, with its nested association slots.
//!
//! A `Record` is a shared handle. Clones point at the same row state, so a
//! record reached through two traversal paths is one object, and edits made
//! through any handle are seen by all of them.
//!
//! Records hydrated from one query share a [`Batch`]. Traversals started
//! from any member are resolved for the whole batch in a single query and
//! the partitions are attached to each member's slot, which is what removes
//! the N+1 pattern.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};

use sqlnest_core::{Connection, Error, FromValue, Result, Row, UsageErrorKind, Value};
use sqlnest_query::{DeleteBuilder, key_conditions};

use crate::association::{self, Association, Resolved, SlotKey};
use crate::database::{Database, StatementKind};
use crate::persist::{Planner, SaveReport};
use crate::result::{Node, QuerySpec, ResultSet};

/// Nested data held in an association slot.
pub enum Related<C: Connection> {
    /// Reference slot: the single parent row, if any.
    One(Option<Record<C>>),
    /// Back-reference slot: the child rows.
    Many(Vec<Record<C>>),
}

impl<C: Connection> Clone for Related<C> {
    fn clone(&self) -> Self {
        match self {
            Related::One(record) => Related::One(record.clone()),
            Related::Many(records) => Related::Many(records.clone()),
        }
    }
}

impl<C: Connection> fmt::Debug for Related<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Related::One(record) => f.debug_tuple("One").field(record).finish(),
            Related::Many(records) => f.debug_tuple("Many").field(records).finish(),
        }
    }
}

impl<C: Connection> Related<C> {
    /// The records in this slot, in order.
    pub fn records(&self) -> Vec<Record<C>> {
        match self {
            Related::One(record) => record.iter().cloned().collect(),
            Related::Many(records) => records.clone(),
        }
    }

    /// Number of records in the slot.
    pub fn len(&self) -> usize {
        match self {
            Related::One(record) => usize::from(record.is_some()),
            Related::Many(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The single record of a reference slot.
    pub fn into_one(self) -> Option<Record<C>> {
        match self {
            Related::One(record) => record,
            Related::Many(records) => records.into_iter().next(),
        }
    }

    /// The records of a back-reference slot.
    pub fn into_many(self) -> Vec<Record<C>> {
        match self {
            Related::One(record) => record.into_iter().collect(),
            Related::Many(records) => records,
        }
    }
}

pub(crate) struct RecordState<C: Connection> {
    table: String,
    values: BTreeMap<String, Value>,
    dirty: BTreeSet<String>,
    exists: bool,
    original_key: Option<Vec<Value>>,
    nested: BTreeMap<String, Related<C>>,
    traversals: HashMap<String, Related<C>>,
    batch: Option<Rc<Batch<C>>>,
}

/// Records hydrated by one query.
///
/// Members are held weakly; traversal results are memoized by association
/// signature for as long as someone holds them.
pub(crate) struct Batch<C: Connection> {
    members: RefCell<Vec<Weak<RefCell<RecordState<C>>>>>,
    associations: RefCell<HashMap<String, Weak<Node<C>>>>,
}

impl<C: Connection> Batch<C> {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            members: RefCell::new(Vec::new()),
            associations: RefCell::new(HashMap::new()),
        })
    }

    fn members(&self, db: &Database<C>) -> Vec<Record<C>> {
        self.members
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|state| Record {
                db: db.clone(),
                state,
            })
            .collect()
    }

    fn association(&self, signature: &str) -> Option<Rc<Node<C>>> {
        self.associations
            .borrow()
            .get(signature)
            .and_then(Weak::upgrade)
    }

    fn remember(&self, signature: String, node: &Rc<Node<C>>) {
        self.associations
            .borrow_mut()
            .insert(signature, Rc::downgrade(node));
    }
}

/// One row of a table.
pub struct Record<C: Connection> {
    db: Database<C>,
    state: Rc<RefCell<RecordState<C>>>,
}

impl<C: Connection> Clone for Record<C> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            state: Rc::clone(&self.state),
        }
    }
}

impl<C: Connection> fmt::Debug for Record<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Record")
            .field("table", &state.table)
            .field("values", &state.values)
            .field("exists", &state.exists)
            .field("dirty", &state.dirty)
            .field("nested", &state.nested.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<C: Connection> Record<C> {
    pub(crate) fn new(db: Database<C>, table: String) -> Self {
        Self {
            db,
            state: Rc::new(RefCell::new(RecordState {
                table,
                values: BTreeMap::new(),
                dirty: BTreeSet::new(),
                exists: false,
                original_key: None,
                nested: BTreeMap::new(),
                traversals: HashMap::new(),
                batch: None,
            })),
        }
    }

    pub(crate) fn hydrate(db: &Database<C>, table: &str, row: &Row, batch: &Rc<Batch<C>>) -> Self {
        let values: BTreeMap<String, Value> = row
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        let record = Self {
            db: db.clone(),
            state: Rc::new(RefCell::new(RecordState {
                table: table.to_string(),
                values,
                dirty: BTreeSet::new(),
                exists: true,
                original_key: None,
                nested: BTreeMap::new(),
                traversals: HashMap::new(),
                batch: Some(Rc::clone(batch)),
            })),
        };
        let key = record.key();
        record.state.borrow_mut().original_key = key;
        batch
            .members
            .borrow_mut()
            .push(Rc::downgrade(&record.state));
        record
    }

    /// The database this record belongs to.
    pub fn database(&self) -> &Database<C> {
        &self.db
    }

    /// Logical table name.
    pub fn table(&self) -> String {
        self.state.borrow().table.clone()
    }

    /// Column value, if set.
    pub fn get(&self, column: &str) -> Option<Value> {
        self.state.borrow().values.get(column).cloned()
    }

    /// Column value converted to `T`; an unset column reads as NULL.
    pub fn get_as<T: FromValue>(&self, column: &str) -> Result<T> {
        let value = self.get(column).unwrap_or(Value::Null);
        T::from_value(&value).map_err(|err| match err {
            Error::Type(mut type_err) => {
                type_err.column = Some(column.to_string());
                Error::Type(type_err)
            }
            other => other,
        })
    }

    /// Whether a column is set.
    pub fn has(&self, column: &str) -> bool {
        self.state.borrow().values.contains_key(column)
    }

    /// Set a column. The column becomes modified unless it already held an
    /// equal value on a persisted row.
    pub fn set(&self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        let mut state = self.state.borrow_mut();
        let unchanged = state.exists
            && state
                .values
                .get(&column)
                .is_some_and(|current| current.same_as(&value));
        if !unchanged {
            state.dirty.insert(column.clone());
        }
        state.values.insert(column, value);
    }

    /// Set a column and return the record (builder pattern).
    #[must_use]
    pub fn with(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    /// Remove a column value.
    pub fn unset(&self, column: &str) {
        let mut state = self.state.borrow_mut();
        state.values.remove(column);
        state.dirty.remove(column);
    }

    /// Set several columns at once.
    pub fn set_data<I, K, V>(&self, data: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        for (column, value) in data {
            self.set(column, value);
        }
    }

    /// All column values.
    pub fn data(&self) -> BTreeMap<String, Value> {
        self.state.borrow().values.clone()
    }

    /// Column/value pairs in column order.
    pub fn properties(&self) -> Vec<(String, Value)> {
        self.state
            .borrow()
            .values
            .iter()
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect()
    }

    /// Values of the modified columns.
    pub fn modified(&self) -> BTreeMap<String, Value> {
        let state = self.state.borrow();
        state
            .dirty
            .iter()
            .filter_map(|column| Some((column.clone(), state.values.get(column)?.clone())))
            .collect()
    }

    /// No column has been modified since the last save.
    pub fn is_clean(&self) -> bool {
        self.state.borrow().dirty.is_empty()
    }

    /// Forget pending modifications.
    pub fn set_clean(&self) {
        self.state.borrow_mut().dirty.clear();
    }

    /// Whether the row is known to be in storage.
    pub fn exists(&self) -> bool {
        self.state.borrow().exists
    }

    /// Current primary key tuple, if every key column is set.
    pub fn key(&self) -> Option<Vec<Value>> {
        let state = self.state.borrow();
        let columns = self.db.schema().primary_key(&state.table);
        columns
            .iter()
            .map(|column| state.values.get(column).filter(|v| !v.is_null()).cloned())
            .collect()
    }

    /// Current value of a single-column primary key.
    pub fn id(&self) -> Option<Value> {
        let table = self.table();
        let column = self.db.schema().single_primary_key(&table)?;
        self.get(column).filter(|v| !v.is_null())
    }

    /// Primary key under which the row was loaded or last saved.
    pub fn original_key(&self) -> Option<Vec<Value>> {
        self.state.borrow().original_key.clone()
    }

    /// Do both handles point at the same record?
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.state) as *const () as usize
    }

    /// Attach a parent record under a reference name.
    pub fn set_reference(&self, name: &str, parent: Option<Record<C>>) {
        self.state
            .borrow_mut()
            .nested
            .insert(Association::reference(name).slot_name(), Related::One(parent));
    }

    /// Attach child records under a back-reference name.
    pub fn set_back_reference(&self, name: &str, children: Vec<Record<C>>) {
        self.state
            .borrow_mut()
            .nested
            .insert(Association::back_reference(name).slot_name(), Related::Many(children));
    }

    /// Append one child record under a back-reference name.
    pub fn push_back_reference(&self, name: &str, child: Record<C>) {
        let slot = Association::back_reference(name).slot_name();
        let mut state = self.state.borrow_mut();
        match state.nested.get_mut(&slot) {
            Some(Related::Many(children)) => children.push(child),
            _ => {
                state.nested.insert(slot, Related::Many(vec![child]));
            }
        }
    }

    /// Nested association slots, by slot name.
    pub fn nested(&self) -> BTreeMap<String, Related<C>> {
        self.state.borrow().nested.clone()
    }

    /// The parent row named by a reference, e.g. `post.reference("author")`.
    pub fn reference(&self, name: &str) -> Result<Option<Record<C>>> {
        self.resolve(Association::reference(name), None)
            .map(Related::into_one)
    }

    /// Like [`Record::reference`] with an explicit foreign-key column.
    pub fn reference_via(&self, name: &str, via: &str) -> Result<Option<Record<C>>> {
        self.resolve(Association::reference(name), Some(via))
            .map(Related::into_one)
    }

    /// The child rows named by a back-reference, e.g. `user.back_reference("post")`.
    pub fn back_reference(&self, name: &str) -> Result<ResultSet<C>> {
        self.back_reference_inner(name, None)
    }

    /// Like [`Record::back_reference`] with an explicit foreign-key column.
    pub fn back_reference_via(&self, name: &str, via: &str) -> Result<ResultSet<C>> {
        self.back_reference_inner(name, Some(via))
    }

    /// Resolve an association by name; a `List` suffix means back-reference.
    pub fn related(&self, name: &str) -> Result<Related<C>> {
        self.resolve(Association::parse(name)?, None)
    }

    fn resolve(&self, association: Association, via: Option<&str>) -> Result<Related<C>> {
        let resolved = Resolved::new(self.db.schema(), &self.table(), association, via)?;
        resolve_for_record(self, &resolved, &QuerySpec::default())
    }

    fn back_reference_inner(&self, name: &str, via: Option<&str>) -> Result<ResultSet<C>> {
        let resolved = Resolved::new(
            self.db.schema(),
            &self.table(),
            Association::back_reference(name),
            via,
        )?;
        Ok(ResultSet::for_record(self.clone(), resolved))
    }

    /// Save this record and its nested records.
    pub fn save(&self) -> Result<SaveReport> {
        Planner::new(&self.db).save(self)
    }

    /// Set columns, then save.
    pub fn update<I, K, V>(&self, data: I) -> Result<SaveReport>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.set_data(data);
        self.save()
    }

    /// Delete this row by its original key.
    pub fn delete(&self) -> Result<u64> {
        let (table, key) = {
            let state = self.state.borrow();
            (state.table.clone(), state.original_key.clone())
        };
        let key = match (self.exists(), key) {
            (true, Some(key)) => key,
            _ => {
                return Err(Error::usage(
                    UsageErrorKind::NotPersisted,
                    format!("cannot delete a '{table}' row that was never saved"),
                ));
            }
        };
        let schema = self.db.schema();
        let (sql, params) = DeleteBuilder::new(schema.table_name(&table))
            .filters(key_conditions(schema.primary_key(&table), &key))
            .build_with_dialect(self.db.dialect());
        let affected = self.db.execute(StatementKind::Delete, &sql, &params)?;
        let mut state = self.state.borrow_mut();
        state.exists = false;
        state.original_key = None;
        state.dirty = state.values.keys().cloned().collect();
        Ok(affected)
    }

    /// Column values and nested slots as JSON. Records reached twice on one
    /// path are emitted as their column values only.
    pub fn to_json(&self) -> serde_json::Value {
        let mut visiting = HashSet::new();
        self.to_json_inner(&mut visiting)
    }

    fn to_json_inner(&self, visiting: &mut HashSet<usize>) -> serde_json::Value {
        let (values, nested) = {
            let state = self.state.borrow();
            (state.values.clone(), state.nested.clone())
        };
        let mut object: serde_json::Map<String, serde_json::Value> = values
            .iter()
            .map(|(column, value)| (column.clone(), value.to_json()))
            .collect();
        if visiting.insert(self.identity()) {
            for (slot, related) in nested {
                let json = match related {
                    Related::One(None) => serde_json::Value::Null,
                    Related::One(Some(parent)) => parent.to_json_inner(visiting),
                    Related::Many(children) => serde_json::Value::Array(
                        children
                            .iter()
                            .map(|child| child.to_json_inner(visiting))
                            .collect(),
                    ),
                };
                object.insert(slot, json);
            }
            visiting.remove(&self.identity());
        }
        serde_json::Value::Object(object)
    }

    pub(crate) fn load_json(&self, data: serde_json::Value) -> Result<()> {
        let serde_json::Value::Object(map) = data else {
            return Err(Error::usage(
                UsageErrorKind::InvalidData,
                format!("'{}' data must be a JSON object", self.table()),
            ));
        };
        for (key, value) in map {
            match value {
                serde_json::Value::Object(_) => {
                    let parent = self.nested_record(&key)?;
                    parent.load_json(value)?;
                    self.set_reference(&key, Some(parent));
                }
                serde_json::Value::Array(items)
                    if items.iter().all(serde_json::Value::is_object)
                        && Association::parse(&key)
                            .is_ok_and(|a| a.kind() == association::AssociationKind::BackReference) =>
                {
                    let name = key.trim_end_matches("List");
                    let mut children = Vec::with_capacity(items.len());
                    for item in items {
                        let child = self.nested_record(name)?;
                        child.load_json(item)?;
                        children.push(child);
                    }
                    self.set_back_reference(name, children);
                }
                other => self.set(key, Value::from_json(other)),
            }
        }
        Ok(())
    }

    fn nested_record(&self, name: &str) -> Result<Record<C>> {
        let table = self.db.schema().resolve_table(name)?;
        Ok(Record::new(self.db.clone(), table))
    }

    pub(crate) fn slot(&self, key: &SlotKey) -> Option<Related<C>> {
        let state = self.state.borrow();
        match key {
            SlotKey::Nested(name) => state.nested.get(name).cloned(),
            SlotKey::Refined(signature) => state.traversals.get(signature).cloned(),
        }
    }

    /// Store resolved data in a slot that is still empty.
    pub(crate) fn fill_slot(&self, key: &SlotKey, related: Related<C>) {
        let mut state = self.state.borrow_mut();
        match key {
            SlotKey::Nested(name) => {
                state.nested.entry(name.clone()).or_insert(related);
            }
            SlotKey::Refined(signature) => {
                state.traversals.entry(signature.clone()).or_insert(related);
            }
        }
    }

    pub(crate) fn dirty_values(&self) -> Vec<(String, Value)> {
        self.modified().into_iter().collect()
    }

    pub(crate) fn mark_saved(&self) {
        let key = self.key();
        let mut state = self.state.borrow_mut();
        state.exists = true;
        state.dirty.clear();
        state.original_key = key;
    }
}

/// Resolve an association for one record, batching across its siblings.
pub(crate) fn resolve_for_record<C: Connection>(
    record: &Record<C>,
    resolved: &Resolved,
    spec: &QuerySpec,
) -> Result<Related<C>> {
    let slot = resolved.slot_key(spec);
    if let Some(hit) = record.slot(&slot) {
        return Ok(hit);
    }

    let batch = record.state.borrow().batch.clone();
    let node = match batch {
        Some(batch) => match batch.association(slot.signature()) {
            Some(node) => node,
            None => {
                let siblings = batch.members(&record.db);
                let node = Node::for_records(record.db.clone(), resolved.clone(), spec.clone(), siblings);
                batch.remember(slot.signature().to_string(), &node);
                node
            }
        },
        None => {
            record
                .db
                .record_unbatched(&resolved.source_table, slot.signature());
            Node::for_records(
                record.db.clone(),
                resolved.clone(),
                spec.clone(),
                vec![record.clone()],
            )
        }
    };

    let rows = node.rows()?;
    Ok(record
        .slot(&slot)
        .unwrap_or_else(|| association::partition_for(record, resolved, &rows)))
}
