//! Nested saves.
//!
//! `Planner` flattens a record and everything nested under it into a list
//! of rows plus foreign-key links, orders the rows so that every required
//! foreign key points at a row that is already written, and then issues one
//! INSERT or UPDATE per row that needs it. Generated keys are copied into
//! dependent rows as soon as they are known.
//!
//! Nullable foreign keys do not constrain the order. When such a key points
//! at a row that is written later, the column is left unset and a follow-up
//! UPDATE fills it in right after the referenced row is written. This lets
//! rows that reference each other through nullable keys save in one call.
//!
//! The planner never opens a transaction; wrap `save` in
//! [`Database::transaction`] when the writes must be atomic.

use std::collections::HashMap;

use sqlnest_core::{ConfigErrorKind, Connection, Error, Result, UsageErrorKind, Value};
use sqlnest_query::{InsertBuilder, UpdateBuilder, key_conditions};

use crate::association::{Association, AssociationKind};
use crate::database::{Database, StatementKind};
use crate::graph::DependencyGraph;
use crate::record::{Record, Related};

/// A statement issued by a save.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub table: String,
    pub sql: String,
    pub params: Vec<Value>,
}

/// What a save did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveReport {
    /// Statements in execution order.
    pub statements: Vec<Statement>,
    /// Rows inserted.
    pub inserted: usize,
    /// Rows updated, including follow-up key updates.
    pub updated: usize,
    /// Persisted rows with nothing to write.
    pub skipped: usize,
}

impl SaveReport {
    /// Tables written, in statement order.
    pub fn tables(&self) -> Vec<&str> {
        self.statements.iter().map(|s| s.table.as_str()).collect()
    }
}

/// `child.column` holds the primary key of `parent`.
#[derive(Debug, Clone)]
struct Link {
    child: usize,
    parent: usize,
    column: String,
    required: bool,
}

pub(crate) struct Planner<'a, C: Connection> {
    db: &'a Database<C>,
    rows: Vec<Record<C>>,
    index: HashMap<usize, usize>,
    links: Vec<Link>,
}

impl<'a, C: Connection> Planner<'a, C> {
    pub(crate) fn new(db: &'a Database<C>) -> Self {
        Self {
            db,
            rows: Vec::new(),
            index: HashMap::new(),
            links: Vec::new(),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(table = %root.table()))]
    pub(crate) fn save(mut self, root: &Record<C>) -> Result<SaveReport> {
        self.flatten(root)?;
        let graph = self.graph();
        self.validate()?;
        let order = graph.topological_order()?;
        tracing::debug!(
            rows = self.rows.len(),
            links = self.links.len(),
            required = self.links.iter().filter(|l| l.required).count(),
            "save planned"
        );
        self.execute(&order)
    }

    /// Collect rows depth first. Rows are identified by handle, so a record
    /// reachable along several paths (or along a cycle) is visited once.
    fn flatten(&mut self, record: &Record<C>) -> Result<usize> {
        if let Some(&index) = self.index.get(&record.identity()) {
            return Ok(index);
        }
        let index = self.rows.len();
        self.rows.push(record.clone());
        self.index.insert(record.identity(), index);

        let db = self.db;
        let schema = db.schema();
        let table = record.table();
        for (slot, related) in record.nested() {
            let association = Association::parse(&slot)?;
            match (association.kind(), related) {
                (AssociationKind::Reference, Related::One(Some(parent))) => {
                    let parent = self.flatten(&parent)?;
                    let column = schema.reference_key(&table, association.name());
                    let required = schema.is_required(&table, &column);
                    self.links.push(Link {
                        child: index,
                        parent,
                        column,
                        required,
                    });
                }
                (AssociationKind::BackReference, Related::Many(children)) => {
                    let column = schema.back_reference_key(&table, association.name());
                    for child in children {
                        let required = schema.is_required(&child.table(), &column);
                        let child = self.flatten(&child)?;
                        self.links.push(Link {
                            child,
                            parent: index,
                            column: column.clone(),
                            required,
                        });
                    }
                }
                (AssociationKind::Reference, Related::One(None)) => {}
                (AssociationKind::Reference, Related::Many(_)) | (AssociationKind::BackReference, Related::One(_)) => {
                    return Err(Error::usage(
                        UsageErrorKind::InvalidData,
                        format!("slot '{slot}' on '{table}' holds the wrong kind of nested data"),
                    ));
                }
            }
        }
        Ok(index)
    }

    fn graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for row in &self.rows {
            graph.add_node(row.table());
        }
        // Persisted parents with a key are only a source of values.
        for link in self.links.iter().filter(|l| l.required && !self.key_known(l.parent)) {
            graph.add_edge(link.parent, link.child);
        }
        graph
    }

    fn key_known(&self, row: usize) -> bool {
        self.rows[row].exists() && self.rows[row].id().is_some()
    }

    fn validate(&self) -> Result<()> {
        let schema = self.db.schema();
        for link in &self.links {
            let parent = &self.rows[link.parent];
            if schema.single_primary_key(&parent.table()).is_none() {
                return Err(Error::usage(
                    UsageErrorKind::CompoundKey,
                    format!(
                        "'{}.{}' cannot reference '{}', which has a compound primary key",
                        self.rows[link.child].table(),
                        link.column,
                        parent.table()
                    ),
                ));
            }
        }

        for link in self.links.iter().filter(|l| l.required) {
            let parent = &self.rows[link.parent];
            if parent.exists() && parent.id().is_none() {
                return Err(Error::config(
                    ConfigErrorKind::MissingRequiredKey,
                    format!(
                        "'{}.{}' is required but the '{}' row it points at was loaded without its key",
                        self.rows[link.child].table(),
                        link.column,
                        parent.table()
                    ),
                ));
            }
        }

        for (index, row) in self.rows.iter().enumerate() {
            if row.exists() {
                continue;
            }
            let table = row.table();
            for column in schema.required_columns(&table) {
                let has_value = row.get(column).is_some_and(|v| !v.is_null());
                let supplied = self
                    .links
                    .iter()
                    .any(|l| l.child == index && &l.column == column);
                if !has_value && !supplied {
                    return Err(Error::config(
                        ConfigErrorKind::MissingRequiredKey,
                        format!("'{table}.{column}' is required but has no value and no nested row supplies it"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Primary key of `parent`, if known.
    fn parent_key(&self, parent: usize) -> Option<Value> {
        self.rows[parent].id()
    }

    fn execute(&self, order: &[usize]) -> Result<SaveReport> {
        let mut report = SaveReport::default();
        let mut written: Vec<bool> = self.rows.iter().map(Record::exists).collect();
        let mut deferred: Vec<&Link> = Vec::new();

        for &index in order {
            let row = &self.rows[index];
            for link in self.links.iter().filter(|l| l.child == index) {
                match self.parent_key(link.parent) {
                    Some(key) if written[link.parent] => row.set(link.column.clone(), key),
                    _ if !link.required => deferred.push(link),
                    _ => {
                        return Err(Error::config(
                            ConfigErrorKind::MissingRequiredKey,
                            format!(
                                "'{}.{}' is required but its row has no key",
                                row.table(),
                                link.column
                            ),
                        ));
                    }
                }
            }

            self.write(row, &mut report)?;
            written[index] = true;

            let (ready, waiting): (Vec<&Link>, Vec<&Link>) =
                deferred.into_iter().partition(|l| l.parent == index && written[l.child]);
            deferred = waiting;
            for link in ready {
                let Some(key) = self.parent_key(link.parent) else {
                    continue;
                };
                let child = &self.rows[link.child];
                child.set(link.column.clone(), key);
                self.write(child, &mut report)?;
            }
        }

        tracing::debug!(
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            "save finished"
        );
        Ok(report)
    }

    fn write(&self, row: &Record<C>, report: &mut SaveReport) -> Result<()> {
        let schema = self.db.schema();
        let dialect = self.db.dialect();
        let table = row.table();
        let physical = schema.table_name(&table);

        if row.exists() {
            let dirty = row.dirty_values();
            if dirty.is_empty() {
                report.skipped += 1;
                return Ok(());
            }
            let key = row.original_key().or_else(|| row.key()).ok_or_else(|| {
                Error::usage(
                    UsageErrorKind::MissingPrimaryKey,
                    format!("cannot update a '{table}' row without a primary key"),
                )
            })?;
            let (sql, params) = UpdateBuilder::new(physical)
                .set_all(dirty)
                .filters(key_conditions(schema.primary_key(&table), &key))
                .build_with_dialect(dialect);
            self.db.execute(StatementKind::Update, &sql, &params)?;
            report.updated += 1;
            report.statements.push(Statement {
                kind: StatementKind::Update,
                table,
                sql,
                params,
            });
        } else {
            let generated = schema
                .single_primary_key(&table)
                .filter(|pk| row.get(pk).is_none_or(|v| v.is_null()))
                .map(str::to_string);
            let values: Vec<(String, Value)> = row
                .properties()
                .into_iter()
                .filter(|(column, _)| Some(column) != generated.as_ref())
                .collect();
            let (sql, params) = InsertBuilder::new(physical)
                .values(values)
                .build_with_dialect(dialect);
            let id = self.db.insert(&sql, &params)?;
            if let Some(pk) = generated {
                row.set(pk, Value::BigInt(id));
            }
            report.inserted += 1;
            report.statements.push(Statement {
                kind: StatementKind::Insert,
                table,
                sql,
                params,
            });
        }
        row.mark_saved();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryConnection;
    use sqlnest_core::Schema;

    fn blog_schema() -> Schema {
        Schema::builder()
            .alias("author", "user")
            .primary("categorization", ["post_id", "category_id"])
            .required("post", "author_id")
            .required("categorization", "post_id")
            .required("categorization", "category_id")
            .build()
            .unwrap()
    }

    fn blog_db() -> Database<MemoryConnection> {
        Database::new(MemoryConnection::new(), blog_schema())
    }

    #[test]
    fn writes_parents_before_children() {
        let db = blog_db();
        let post = db.record("post").unwrap().with("title", "Hello");
        let author = db.record("user").unwrap().with("name", "Ada");
        let category = db.record("category").unwrap().with("title", "Rust");
        let link = db.record("categorization").unwrap();
        link.set_reference("category", Some(category.clone()));
        post.set_reference("author", Some(author.clone()));
        post.set_back_reference("categorization", vec![link.clone()]);

        let report = post.save().unwrap();
        assert_eq!(report.tables(), vec!["user", "post", "category", "categorization"]);
        assert_eq!(report.inserted, 4);

        assert_eq!(post.get("author_id"), author.id());
        assert_eq!(link.get("post_id"), post.id());
        assert_eq!(link.get("category_id"), category.id());
        assert!(post.exists() && post.is_clean());
        assert_eq!(link.key(), Some(vec![Value::BigInt(1), Value::BigInt(1)]));
    }

    #[test]
    fn second_save_is_a_no_op() {
        let db = blog_db();
        let post = db.record("post").unwrap().with("title", "Hello");
        post.set_reference("author", Some(db.record("user").unwrap().with("name", "Ada")));
        post.save().unwrap();

        let before = db.statement_count();
        let report = post.save().unwrap();
        assert!(report.statements.is_empty());
        assert_eq!(report.skipped, 2);
        assert_eq!(db.statement_count(), before);
    }

    #[test]
    fn existing_rows_update_only_dirty_columns() {
        let conn = MemoryConnection::new().with_table(
            "post",
            vec![vec![("id", Value::BigInt(7)), ("title", "Old".into()), ("body", "x".into())]],
        );
        let db = Database::new(conn, Schema::default());
        let post = db.find("post", 7).unwrap().unwrap();
        let report = post.update([("title", "New")]).unwrap();
        assert_eq!(report.statements.len(), 1);
        assert_eq!(
            report.statements[0].sql,
            r#"UPDATE "post" SET "title" = $1 WHERE "id" = $2"#
        );
        assert_eq!(db.connection().rows("post")[0].get("title"), Some(&Value::from("New")));
    }

    #[test]
    fn primary_key_changes_target_the_original_key() {
        let conn = MemoryConnection::new().with_table("tag", vec![vec![("id", Value::BigInt(1))]]);
        let db = Database::new(conn, Schema::default());
        let tag = db.find("tag", 1).unwrap().unwrap();
        tag.set("id", 5);
        let report = tag.save().unwrap();
        assert_eq!(report.statements[0].params, vec![Value::Int(5), Value::BigInt(1)]);
        assert_eq!(tag.original_key(), Some(vec![Value::Int(5)]));
    }

    #[test]
    fn missing_required_keys_fail_before_any_statement() {
        let db = blog_db();
        let post = db.record("post").unwrap().with("title", "Orphan");
        let err = post.save().unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::MissingRequiredKey));
        assert_eq!(db.statement_count(), 0);
    }

    #[test]
    fn mutual_nullable_references_are_deferred() {
        let db = Database::new(MemoryConnection::new(), Schema::default());
        let user = db.record("user").unwrap().with("name", "Ada");
        let profile = db.record("profile").unwrap().with("bio", "hi");
        user.set_reference("profile", Some(profile.clone()));
        profile.set_reference("user", Some(user.clone()));

        let report = user.save().unwrap();
        let kinds: Vec<(StatementKind, &str)> = report
            .statements
            .iter()
            .map(|s| (s.kind, s.table.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (StatementKind::Insert, "user"),
                (StatementKind::Insert, "profile"),
                (StatementKind::Update, "user"),
            ]
        );
        assert_eq!(user.get("profile_id"), profile.id());
        assert_eq!(profile.get("user_id"), user.id());
        assert!(user.is_clean());
    }

    #[test]
    fn mutual_required_references_are_cycles() {
        let schema = Schema::builder()
            .required("user", "profile_id")
            .required("profile", "user_id")
            .build()
            .unwrap();
        let db = Database::new(MemoryConnection::new(), schema);
        let user = db.record("user").unwrap();
        let profile = db.record("profile").unwrap();
        user.set_reference("profile", Some(profile.clone()));
        profile.set_reference("user", Some(user.clone()));

        let err = user.save().unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::DependencyCycle));
        assert!(err.to_string().contains("->"));
        assert_eq!(db.statement_count(), 0);
    }

    #[test]
    fn persisted_required_references_are_not_cycles() {
        let schema = Schema::builder()
            .required("user", "profile_id")
            .required("profile", "user_id")
            .build()
            .unwrap();
        let conn = MemoryConnection::new()
            .with_table(
                "user",
                vec![vec![
                    ("id", Value::BigInt(1)),
                    ("name", "Ada".into()),
                    ("profile_id", Value::BigInt(1)),
                ]],
            )
            .with_table(
                "profile",
                vec![vec![("id", Value::BigInt(1)), ("user_id", Value::BigInt(1))]],
            );
        let db = Database::new(conn, schema);
        let user = db.find("user", 1).unwrap().unwrap();
        let profile = db.find("profile", 1).unwrap().unwrap();
        user.set_reference("profile", Some(profile.clone()));
        profile.set_reference("user", Some(user.clone()));
        user.set("name", "Ada Lovelace");
        db.reset_counters();

        let report = user.save().unwrap();
        assert_eq!(report.statements.len(), 1);
        assert_eq!(report.statements[0].kind, StatementKind::Update);
        assert_eq!(report.statements[0].table, "user");
        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(db.statement_count(), 1);
    }

    #[test]
    fn keyless_loaded_parents_fail_before_any_statement() {
        let db = blog_db();
        db.connection()
            .seed("user", vec![("id", Value::BigInt(1)), ("name", "Ada".into())]);
        let author = db
            .table("user")
            .unwrap()
            .select(["name"])
            .fetch()
            .unwrap()
            .unwrap();
        assert!(author.exists());
        assert_eq!(author.id(), None);

        let post = db.record("post").unwrap().with("title", "Hello");
        post.set_reference("author", Some(author));
        let tag = db.record("tag").unwrap().with("label", "rust");
        tag.set_back_reference("post", vec![post]);
        db.reset_counters();

        let err = tag.save().unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::MissingRequiredKey));
        assert_eq!(db.statement_count(), 0);
        assert!(db.connection().rows("tag").is_empty());
    }

    #[test]
    fn compound_parents_are_rejected() {
        let db = blog_db();
        let note = db.record("note").unwrap();
        note.set_reference("categorization", Some(db.record("categorization").unwrap()));
        let err = note.save().unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::CompoundKey));
        assert_eq!(db.statement_count(), 0);
    }

    #[test]
    fn storage_failures_abort_the_save() {
        let db = blog_db();
        db.connection().fail_on(r#"INSERT INTO "post""#);
        let post = db.record("post").unwrap().with("title", "Hello");
        post.set_reference("author", Some(db.record("user").unwrap().with("name", "Ada")));
        post.set_back_reference("comment", vec![db.record("comment").unwrap().with("body", "first")]);

        let err = post.save().unwrap_err();
        assert!(err.is_storage_error());
        // user written, post failed, comment never attempted
        assert_eq!(db.statement_count(), 2);
        assert!(!post.exists());
    }

    #[test]
    fn siblings_keep_caller_order() {
        let db = Database::new(MemoryConnection::new(), Schema::default());
        let user = db.record("user").unwrap().with("name", "Ada");
        let posts: Vec<_> = ["b", "a", "c"]
            .into_iter()
            .map(|title| db.record("post").unwrap().with("title", title))
            .collect();
        user.set_back_reference("post", posts.clone());
        user.save().unwrap();

        let titles: Vec<Value> = db
            .connection()
            .rows("post")
            .iter()
            .filter_map(|row| row.get("title").cloned())
            .collect();
        assert_eq!(titles, vec![Value::from("b"), Value::from("a"), Value::from("c")]);
        assert!(posts.iter().all(|p| p.get("user_id") == user.id()));
    }
}
