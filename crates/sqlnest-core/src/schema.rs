//! Schema registry: table aliases, keys and association metadata.
//!
//! A [`Schema`] is built once through [`SchemaBuilder`] (or deserialized from a
//! [`SchemaConfig`]) and is never mutated afterwards; sessions share it
//! through an `Arc`.
//!
//! Defaults follow the usual naming conventions:
//!
//! - primary key: `["id"]`
//! - reference `author` on table `post`: column `author_id` on `post`
//! - back-reference `comment` from table `post`: column `post_id` on `comment`

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigErrorKind, Error, Result};

/// Function mapping a logical table name to its physical name.
pub type RewriteFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Immutable schema metadata consumed by the resolver, planner and builder.
#[derive(Clone)]
pub struct Schema {
    tables: BTreeSet<String>,
    aliases: HashMap<String, String>,
    primary: HashMap<String, Vec<String>>,
    references: HashMap<String, HashMap<String, String>>,
    back_references: HashMap<String, HashMap<String, String>>,
    required: HashMap<String, BTreeSet<String>>,
    rewrite: Option<RewriteFn>,
    default_primary: Vec<String>,
    empty: BTreeSet<String>,
}

impl Schema {
    /// Start building a schema.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Parse a JSON [`SchemaConfig`] into a schema.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SchemaConfig = serde_json::from_str(json)?;
        SchemaBuilder::from_config(config).build()
    }

    /// Resolve an alias or table name to its logical table name.
    ///
    /// When tables were declared, names outside that set are rejected.
    pub fn resolve_table(&self, name: &str) -> Result<String> {
        if name.is_empty() {
            return Err(Error::config(
                ConfigErrorKind::UnknownTable,
                "empty table name",
            ));
        }
        let table = self.aliases.get(name).map_or(name, String::as_str);
        if !self.tables.is_empty() && !self.tables.contains(table) {
            return Err(Error::config(
                ConfigErrorKind::UnknownTable,
                format!("'{}' does not name a known table or alias", name),
            ));
        }
        Ok(table.to_string())
    }

    /// Physical name of a logical table, after the rewrite function.
    pub fn table_name(&self, table: &str) -> String {
        match &self.rewrite {
            Some(rewrite) => rewrite(table),
            None => table.to_string(),
        }
    }

    /// Alias resolution followed by the rewrite function.
    pub fn physical_table(&self, name: &str) -> Result<String> {
        let table = self.resolve_table(name)?;
        Ok(self.table_name(&table))
    }

    /// Primary-key columns of a table, in key order.
    pub fn primary_key(&self, table: &str) -> &[String] {
        self.primary.get(table).unwrap_or(&self.default_primary)
    }

    /// Single primary-key column, or `None` for compound keys.
    pub fn single_primary_key(&self, table: &str) -> Option<&str> {
        match self.primary_key(table) {
            [column] => Some(column),
            _ => None,
        }
    }

    /// Foreign-key column on `table` holding the reference `association`.
    pub fn reference_key(&self, table: &str, association: &str) -> String {
        self.references
            .get(table)
            .and_then(|names| names.get(association))
            .cloned()
            .unwrap_or_else(|| format!("{}_id", association))
    }

    /// Foreign-key column on the target of back-reference `association`
    /// that points back at `table`.
    pub fn back_reference_key(&self, table: &str, association: &str) -> String {
        self.back_references
            .get(table)
            .and_then(|names| names.get(association))
            .cloned()
            .unwrap_or_else(|| format!("{}_id", table))
    }

    /// Columns of `table` that must be non-null on insert.
    pub fn required_columns(&self, table: &str) -> &BTreeSet<String> {
        self.required.get(table).unwrap_or(&self.empty)
    }

    /// Is `column` of `table` required (non-nullable)?
    pub fn is_required(&self, table: &str, column: &str) -> bool {
        self.required_columns(table).contains(column)
    }

    /// Declared tables, empty when the schema does not validate names.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            tables: BTreeSet::new(),
            aliases: HashMap::new(),
            primary: HashMap::new(),
            references: HashMap::new(),
            back_references: HashMap::new(),
            required: HashMap::new(),
            rewrite: None,
            default_primary: vec!["id".to_string()],
            empty: BTreeSet::new(),
        }
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("tables", &self.tables)
            .field("aliases", &self.aliases)
            .field("primary", &self.primary)
            .field("references", &self.references)
            .field("back_references", &self.back_references)
            .field("required", &self.required)
            .field("rewrite", &self.rewrite.is_some())
            .finish()
    }
}

/// Serializable schema description.
///
/// ```json
/// {
///   "tables": ["user", "post"],
///   "aliases": {"author": "user"},
///   "primary": {"categorization": ["post_id", "category_id"]},
///   "references": {"post": {"author": "author_id"}},
///   "back_references": {"user": {"post": "author_id"}},
///   "required": {"post": ["author_id"]}
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub tables: Vec<String>,
    pub aliases: BTreeMap<String, String>,
    pub primary: BTreeMap<String, Vec<String>>,
    pub references: BTreeMap<String, BTreeMap<String, String>>,
    pub back_references: BTreeMap<String, BTreeMap<String, String>>,
    pub required: BTreeMap<String, Vec<String>>,
}

/// Builder for [`Schema`].
#[derive(Default)]
pub struct SchemaBuilder {
    config: SchemaConfig,
    rewrite: Option<RewriteFn>,
}

impl SchemaBuilder {
    /// Start from a deserialized configuration.
    pub fn from_config(config: SchemaConfig) -> Self {
        Self {
            config,
            rewrite: None,
        }
    }

    /// Declare a table. Once any table is declared, unknown names are rejected.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.config.tables.push(table.into());
        self
    }

    /// Map an alias (e.g. `author`) onto a table (e.g. `user`).
    pub fn alias(mut self, alias: impl Into<String>, table: impl Into<String>) -> Self {
        self.config.aliases.insert(alias.into(), table.into());
        self
    }

    /// Set the primary-key columns of a table.
    pub fn primary<I, S>(mut self, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.primary.insert(
            table.into(),
            columns.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Override the foreign-key column of a reference.
    pub fn reference(
        mut self,
        table: impl Into<String>,
        association: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        self.config
            .references
            .entry(table.into())
            .or_default()
            .insert(association.into(), column.into());
        self
    }

    /// Override the foreign-key column of a back-reference.
    pub fn back_reference(
        mut self,
        table: impl Into<String>,
        association: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        self.config
            .back_references
            .entry(table.into())
            .or_default()
            .insert(association.into(), column.into());
        self
    }

    /// Mark a column as required (non-nullable).
    pub fn required(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.config
            .required
            .entry(table.into())
            .or_default()
            .push(column.into());
        self
    }

    /// Install the logical-to-physical table name rewrite.
    pub fn rewrite<F>(mut self, rewrite: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.rewrite = Some(Arc::new(rewrite));
        self
    }

    /// Validate and freeze the schema.
    pub fn build(self) -> Result<Schema> {
        let SchemaConfig {
            tables,
            aliases,
            primary,
            references,
            back_references,
            required,
        } = self.config;

        for (table, columns) in &primary {
            if columns.is_empty() || columns.iter().any(String::is_empty) {
                return Err(Error::config(
                    ConfigErrorKind::InvalidSchema,
                    format!("primary key of '{}' must name at least one column", table),
                ));
            }
        }
        let overrides = references.iter().chain(back_references.iter());
        for (table, names) in overrides {
            if let Some((association, _)) = names.iter().find(|(_, column)| column.is_empty()) {
                return Err(Error::config(
                    ConfigErrorKind::InvalidSchema,
                    format!("key column for '{}.{}' is empty", table, association),
                ));
            }
        }
        let tables: BTreeSet<String> = tables.into_iter().collect();
        if !tables.is_empty() {
            if let Some((alias, table)) = aliases.iter().find(|(_, t)| !tables.contains(*t)) {
                return Err(Error::config(
                    ConfigErrorKind::UnknownTable,
                    format!("alias '{}' points at undeclared table '{}'", alias, table),
                ));
            }
        }

        tracing::debug!(
            tables = tables.len(),
            aliases = aliases.len(),
            "schema registry built"
        );

        Ok(Schema {
            tables,
            aliases: aliases.into_iter().collect(),
            primary: primary.into_iter().collect(),
            references: references
                .into_iter()
                .map(|(table, names)| (table, names.into_iter().collect()))
                .collect(),
            back_references: back_references
                .into_iter()
                .map(|(table, names)| (table, names.into_iter().collect()))
                .collect(),
            required: required
                .into_iter()
                .map(|(table, columns)| (table, columns.into_iter().collect()))
                .collect(),
            rewrite: self.rewrite,
            ..Schema::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blog() -> Schema {
        Schema::builder()
            .alias("author", "user")
            .primary("categorization", ["post_id", "category_id"])
            .reference("post", "editor", "edited_by")
            .back_reference("user", "post", "author_id")
            .required("post", "author_id")
            .build()
            .unwrap()
    }

    #[test]
    fn defaults_follow_naming_conventions() {
        let schema = Schema::default();
        assert_eq!(schema.primary_key("post"), ["id".to_string()]);
        assert_eq!(schema.reference_key("post", "author"), "author_id");
        assert_eq!(schema.back_reference_key("post", "comment"), "post_id");
        assert_eq!(schema.resolve_table("post").unwrap(), "post");
        assert!(!schema.is_required("post", "author_id"));
    }

    #[test]
    fn overrides_take_precedence() {
        let schema = blog();
        assert_eq!(schema.resolve_table("author").unwrap(), "user");
        assert_eq!(schema.reference_key("post", "editor"), "edited_by");
        assert_eq!(schema.reference_key("post", "author"), "author_id");
        assert_eq!(schema.back_reference_key("user", "post"), "author_id");
        assert_eq!(schema.single_primary_key("categorization"), None);
        assert_eq!(schema.single_primary_key("post"), Some("id"));
        assert!(schema.is_required("post", "author_id"));
    }

    #[test]
    fn rewrite_applies_after_alias() {
        let schema = Schema::builder()
            .alias("author", "user")
            .rewrite(|table| format!("blog_{table}"))
            .build()
            .unwrap();
        assert_eq!(schema.physical_table("author").unwrap(), "blog_user");
        assert_eq!(schema.table_name("post"), "blog_post");
    }

    #[test]
    fn declared_tables_reject_unknown_names() {
        let schema = Schema::builder()
            .table("post")
            .table("user")
            .alias("author", "user")
            .build()
            .unwrap();
        assert_eq!(schema.resolve_table("author").unwrap(), "user");
        let err = schema.resolve_table("comment").unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::UnknownTable));
        assert!(schema.resolve_table("").is_err());
    }

    #[test]
    fn invalid_metadata_is_rejected() {
        let empty_key = Schema::builder()
            .primary("post", Vec::<String>::new())
            .build()
            .unwrap_err();
        assert_eq!(empty_key.config_kind(), Some(ConfigErrorKind::InvalidSchema));

        let dangling = Schema::builder()
            .table("post")
            .alias("author", "user")
            .build()
            .unwrap_err();
        assert_eq!(dangling.config_kind(), Some(ConfigErrorKind::UnknownTable));
    }

    #[test]
    fn loads_from_json() {
        let schema = Schema::from_json(
            r#"{
                "aliases": {"author": "user"},
                "primary": {"categorization": ["post_id", "category_id"]},
                "required": {"categorization": ["post_id", "category_id"]}
            }"#,
        )
        .unwrap();
        assert_eq!(schema.resolve_table("author").unwrap(), "user");
        assert_eq!(schema.required_columns("categorization").len(), 2);
        assert!(Schema::from_json("{\"primary\": 3}").is_err());
    }
}
