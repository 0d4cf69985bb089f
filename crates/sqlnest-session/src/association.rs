//! Association naming, key resolution and batched loading.
//!
//! A reference (`post.author`) follows a foreign key on the source row to the
//! target's primary key. A back-reference (`user.postList`) follows the
//! source's primary key to a foreign key on the target rows.
//!
//! Loading an association for a set of source rows issues one `IN` query over
//! the distinct non-null keys, then splits the result back out per source row.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use sqlnest_core::{ConfigErrorKind, Connection, Error, Result, Schema, UsageErrorKind, Value, ValueKey};
use sqlnest_query::Condition;

use crate::database::Database;
use crate::record::{Record, Related};
use crate::result::{QuerySpec, fetch_records};

const LIST_SUFFIX: &str = "List";

/// Direction of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationKind {
    /// Source row holds the foreign key; resolves to at most one row.
    Reference,
    /// Target rows hold the foreign key; resolves to a list.
    BackReference,
}

/// A named association between two tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Association {
    kind: AssociationKind,
    name: String,
}

impl Association {
    /// Parse a traversal name; a `List` suffix marks a back-reference.
    pub fn parse(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::config(
                ConfigErrorKind::UnknownAssociation,
                "association name cannot be empty",
            ));
        }
        match name.strip_suffix(LIST_SUFFIX) {
            Some(base) if !base.is_empty() => Ok(Self::back_reference(base)),
            _ => Ok(Self::reference(name)),
        }
    }

    pub fn reference(name: impl Into<String>) -> Self {
        Self {
            kind: AssociationKind::Reference,
            name: name.into(),
        }
    }

    pub fn back_reference(name: impl Into<String>) -> Self {
        Self {
            kind: AssociationKind::BackReference,
            name: name.into(),
        }
    }

    pub fn kind(&self) -> AssociationKind {
        self.kind
    }

    /// Association name without the `List` suffix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the slot this association fills on a record.
    pub fn slot_name(&self) -> String {
        match self.kind {
            AssociationKind::Reference => self.name.clone(),
            AssociationKind::BackReference => format!("{}{LIST_SUFFIX}", self.name),
        }
    }
}

/// Where resolved association data is stored on a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum SlotKey {
    /// The plain nested slot, shared with caller-supplied data.
    Nested(String),
    /// A traversal with an explicit key column or refinements.
    Refined(String),
}

impl SlotKey {
    pub(crate) fn signature(&self) -> &str {
        match self {
            SlotKey::Nested(signature) | SlotKey::Refined(signature) => signature,
        }
    }
}

/// An association with its join columns resolved against the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resolved {
    pub(crate) association: Association,
    pub(crate) via: Option<String>,
    pub(crate) source_table: String,
    pub(crate) target_table: String,
    /// Column read from source rows.
    pub(crate) source_column: String,
    /// Column matched on target rows.
    pub(crate) target_column: String,
}

impl Resolved {
    pub(crate) fn new(
        schema: &Schema,
        source_table: &str,
        association: Association,
        via: Option<&str>,
    ) -> Result<Self> {
        let target_table = schema.resolve_table(association.name()).map_err(|err| match err {
            Error::Config(config) if config.kind == ConfigErrorKind::UnknownTable => Error::config(
                ConfigErrorKind::UnknownAssociation,
                format!(
                    "'{}' has no association '{}': {}",
                    source_table,
                    association.slot_name(),
                    config.message
                ),
            ),
            other => other,
        })?;

        let single_key = |table: &str| {
            schema.single_primary_key(table).map(str::to_string).ok_or_else(|| {
                Error::usage(
                    UsageErrorKind::CompoundKey,
                    format!(
                        "association '{}' from '{}' joins on the compound primary key of '{}'",
                        association.slot_name(),
                        source_table,
                        table
                    ),
                )
            })
        };

        let (source_column, target_column) = match association.kind() {
            AssociationKind::Reference => (
                via.map_or_else(
                    || schema.reference_key(source_table, association.name()),
                    str::to_string,
                ),
                single_key(&target_table)?,
            ),
            AssociationKind::BackReference => (
                single_key(source_table)?,
                via.map_or_else(
                    || schema.back_reference_key(source_table, association.name()),
                    str::to_string,
                ),
            ),
        };

        Ok(Self {
            association,
            via: via.map(str::to_string),
            source_table: source_table.to_string(),
            target_table,
            source_column,
            target_column,
        })
    }

    pub(crate) fn is_many(&self) -> bool {
        self.association.kind() == AssociationKind::BackReference
    }

    /// Slot for this traversal under `spec`. Plain traversals share the
    /// nested slot; anything refined gets its own.
    pub(crate) fn slot_key(&self, spec: &QuerySpec) -> SlotKey {
        let slot = self.association.slot_name();
        if self.via.is_none() && spec.is_plain() {
            SlotKey::Nested(slot)
        } else {
            SlotKey::Refined(format!(
                "{slot}|{}|{:?}",
                self.via.as_deref().unwrap_or_default(),
                spec
            ))
        }
    }
}

/// Distinct non-null values of `column`, in first-seen order.
pub(crate) fn collect_keys<C: Connection>(records: &[Record<C>], column: &str) -> Vec<Value> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter_map(|record| record.get(column))
        .filter(|value| value.key().is_some_and(|key| seen.insert(key)))
        .collect()
}

fn partition<C: Connection>(rows: &[Record<C>], column: &str) -> HashMap<ValueKey, Vec<Record<C>>> {
    let mut groups: HashMap<ValueKey, Vec<Record<C>>> = HashMap::new();
    for row in rows {
        if let Some(key) = row.get(column).and_then(|v| v.key()) {
            groups.entry(key).or_default().push(row.clone());
        }
    }
    groups
}

fn related_for<C: Connection>(
    record: &Record<C>,
    resolved: &Resolved,
    groups: &HashMap<ValueKey, Vec<Record<C>>>,
) -> Related<C> {
    let matches = record
        .get(&resolved.source_column)
        .and_then(|v| v.key())
        .and_then(|key| groups.get(&key))
        .cloned()
        .unwrap_or_default();
    if resolved.is_many() {
        Related::Many(matches)
    } else {
        Related::One(matches.into_iter().next())
    }
}

/// The part of `rows` that belongs to `record`.
pub(crate) fn partition_for<C: Connection>(
    record: &Record<C>,
    resolved: &Resolved,
    rows: &[Record<C>],
) -> Related<C> {
    related_for(record, resolved, &partition(rows, &resolved.target_column))
}

/// Store each source row's partition in its slot.
fn attach<C: Connection>(sources: &[Record<C>], resolved: &Resolved, slot: &SlotKey, rows: &[Record<C>]) {
    let groups = partition(rows, &resolved.target_column);
    for source in sources {
        source.fill_slot(slot, related_for(source, resolved, &groups));
    }
}

/// Load an association for a set of source rows.
///
/// Returns the union of all partitions. Source rows whose slot is already
/// filled are not overwritten.
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(source = %resolved.source_table, association = %resolved.association.slot_name())
)]
pub(crate) fn load<C: Connection>(
    db: &Database<C>,
    sources: &[Record<C>],
    resolved: &Resolved,
    spec: &QuerySpec,
) -> Result<Rc<Vec<Record<C>>>> {
    let slot = resolved.slot_key(spec);

    // Everything is already attached: assemble without a query.
    if spec.order.is_empty()
        && !sources.is_empty()
        && sources.iter().all(|source| source.slot(&slot).is_some())
    {
        let mut seen = HashSet::new();
        let rows: Vec<Record<C>> = sources
            .iter()
            .filter_map(|source| source.slot(&slot))
            .flat_map(|related| related.records())
            .filter(|record| seen.insert(record.identity()))
            .collect();
        return Ok(Rc::new(rows));
    }

    let keys = collect_keys(sources, &resolved.source_column);
    if keys.is_empty() {
        tracing::debug!("no join keys; association resolves empty without a query");
        attach(sources, resolved, &slot, &[]);
        return Ok(Rc::new(Vec::new()));
    }

    tracing::debug!(sources = sources.len(), keys = keys.len(), "loading association");
    let mut conditions = Vec::with_capacity(spec.conditions.len() + 1);
    conditions.push(Condition::in_list(resolved.target_column.clone(), keys));
    conditions.extend(spec.conditions.iter().cloned());

    let mut columns = spec.columns.clone();
    if !columns.is_empty() && !columns.contains(&resolved.target_column) {
        columns.push(resolved.target_column.clone());
    }

    let rows = fetch_records(
        db,
        &resolved.target_table,
        &conditions,
        &columns,
        &spec.order,
        None,
        None,
    )?;
    attach(sources, resolved, &slot, &rows);
    Ok(Rc::new(rows))
}

/// Join keys of the source rows, as a filter on the target table.
/// `None` when no source row has a key, meaning no target row can match.
pub(crate) fn scope<C: Connection>(sources: &[Record<C>], resolved: &Resolved) -> Option<Condition> {
    let keys = collect_keys(sources, &resolved.source_column);
    if keys.is_empty() {
        None
    } else {
        Some(Condition::in_list(resolved.target_column.clone(), keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_suffix_marks_back_references() {
        let assoc = Association::parse("postList").unwrap();
        assert_eq!(assoc.kind(), AssociationKind::BackReference);
        assert_eq!(assoc.name(), "post");
        assert_eq!(assoc.slot_name(), "postList");

        let assoc = Association::parse("author").unwrap();
        assert_eq!(assoc.kind(), AssociationKind::Reference);

        // A bare suffix is a plain reference name.
        assert_eq!(Association::parse("List").unwrap().kind(), AssociationKind::Reference);
        assert!(Association::parse("").unwrap_err().is_config_error());
    }

    #[test]
    fn resolves_default_key_columns() {
        let schema = Schema::builder().alias("author", "user").build().unwrap();
        let r = Resolved::new(&schema, "post", Association::reference("author"), None).unwrap();
        assert_eq!(r.target_table, "user");
        assert_eq!(r.source_column, "author_id");
        assert_eq!(r.target_column, "id");

        let r = Resolved::new(&schema, "user", Association::back_reference("post"), None).unwrap();
        assert_eq!(r.source_column, "id");
        assert_eq!(r.target_column, "user_id");
    }

    #[test]
    fn explicit_columns_win() {
        let schema = Schema::builder()
            .alias("editor", "user")
            .reference("post", "editor", "edited_by")
            .build()
            .unwrap();
        let r = Resolved::new(&schema, "post", Association::reference("editor"), None).unwrap();
        assert_eq!(r.source_column, "edited_by");

        let r = Resolved::new(&schema, "user", Association::back_reference("post"), Some("editor_id")).unwrap();
        assert_eq!(r.target_column, "editor_id");
    }

    #[test]
    fn compound_keys_cannot_be_joined() {
        let schema = Schema::builder()
            .primary("categorization", ["post_id", "category_id"])
            .build()
            .unwrap();
        let err = Resolved::new(&schema, "categorization", Association::back_reference("note"), None)
            .unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::CompoundKey));

        // Joining on the foreign-key side of a compound table is fine.
        let r = Resolved::new(&schema, "post", Association::back_reference("categorization"), None).unwrap();
        assert_eq!(r.target_column, "post_id");
    }

    #[test]
    fn unknown_associations_are_config_errors() {
        let schema = Schema::builder().table("post").table("user").build().unwrap();
        let err = Resolved::new(&schema, "post", Association::reference("author"), None).unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::UnknownAssociation));
    }

    #[test]
    fn refined_traversals_get_their_own_slot() {
        let schema = Schema::default();
        let r = Resolved::new(&schema, "user", Association::back_reference("post"), None).unwrap();
        assert_eq!(r.slot_key(&QuerySpec::default()), SlotKey::Nested("postList".into()));
        let refined = QuerySpec {
            conditions: vec![Condition::matches("published", true)],
            ..QuerySpec::default()
        };
        assert!(matches!(r.slot_key(&refined), SlotKey::Refined(_)));
        assert_ne!(r.slot_key(&refined), r.slot_key(&QuerySpec::default()));
    }
}
