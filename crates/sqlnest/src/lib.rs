//! sqlnest - relational traversal and nested writes over SQL databases.
//!
//! sqlnest reads and writes plain rows through a schema registry of naming
//! conventions, and provides:
//!
//! - Association traversal with no N+1 queries: following a reference or a
//!   back-reference from any row of a result loads it for every row at once
//! - Lazy, immutable result sets that execute once and cache their rows
//! - Nested saves: a row together with its parents and children is written in
//!   foreign-key order with generated keys copied into dependent rows
//! - A small SQL builder emitting parameterized statements for PostgreSQL,
//!   MySQL and SQLite
//!
//! # Quick Start
//!
//! ```ignore
//! use sqlnest::prelude::*;
//!
//! let schema = Schema::builder()
//!     .alias("author", "user")
//!     .required("post", "author_id")
//!     .build()?;
//! let db = Database::new(conn, schema);
//!
//! // One query for the posts, one for all of their authors.
//! let posts = db.table("post")?.order_by("id");
//! for post in posts.fetch_all()? {
//!     let author = post.reference("author")?;
//!     println!("{:?} by {:?}", post.get("title"), author.and_then(|a| a.get("name")));
//! }
//!
//! // INSERT user, then INSERT post with author_id set.
//! let post = db.create_record("post", json!({
//!     "title": "Hello",
//!     "author": {"name": "Ada"},
//! }))?;
//! post.save()?;
//! ```
//!
//! # Crates
//!
//! - `sqlnest-core`: values, rows, errors, the `Connection` trait and the schema registry
//! - `sqlnest-query`: conditions and statement builders
//! - `sqlnest-session`: `Database`, `ResultSet`, `Record`, association resolution and saves

pub use sqlnest_core::{
    ConfigErrorKind, Connection, Dialect, Error, FromValue, IsolationLevel, QueryErrorKind, Result,
    Row, Schema, SchemaBuilder, SchemaConfig, UsageErrorKind, Value,
};

pub use sqlnest_query::{CompareOp, Condition, OrderBy, OrderDirection};

pub use sqlnest_session::{
    Association, AssociationKind, Database, DatabaseConfig, DependencyGraph, InsertMethod,
    N1Stats, QueryEvent, Record, Related, ResultSet, SaveReport, Statement, StatementKind,
};

/// Re-exported for building nested data trees.
pub use serde_json::json;

/// Statement builders.
pub use sqlnest_query as query;
pub use sqlnest_session as session;

pub mod prelude {
    pub use crate::{
        // Core
        Connection,
        // Session
        Database,
        DatabaseConfig,
        Error,
        InsertMethod,
        Record,
        Related,
        Result,
        ResultSet,
        SaveReport,
        // Schema
        Schema,
        Value,
        json,
    };
}
