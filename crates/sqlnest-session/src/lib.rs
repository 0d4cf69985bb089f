//! Association traversal and nested persistence for sqlnest.
//!
//! `sqlnest-session` is the **row layer**. It turns a [`Connection`] plus a
//! [`Schema`] into a [`Database`] handle from which rows are read as
//! [`Record`]s and written back, nested graphs included.
//!
//! # Role In The Architecture
//!
//! - **Result sets**: lazy, immutable query descriptions that execute once
//!   and cache their rows.
//! - **Association resolver**: following a reference or back-reference from
//!   any row of a result loads the associated rows for every sibling row in
//!   one query.
//! - **Persistence planner**: saving a record writes its nested rows in
//!   foreign-key order and copies generated keys into dependent rows.
//!
//! # Example
//!
//! ```ignore
//! let db = Database::new(conn, schema);
//!
//! // Two queries in total, however many posts there are.
//! for post in db.table("post")?.fetch_all()? {
//!     let author = post.reference("author")?;
//! }
//!
//! // Four inserts, parents first.
//! let post = db.create_record("post", json!({
//!     "title": "Hello",
//!     "author": {"name": "Ada"},
//!     "categorizationList": [{"category": {"title": "Rust"}}],
//! }))?;
//! post.save()?;
//! ```
//!
//! [`Connection`]: sqlnest_core::Connection
//! [`Schema`]: sqlnest_core::Schema

pub mod association;
pub mod config;
pub mod database;
pub mod graph;
pub mod n1_detection;
pub mod persist;
pub mod record;
pub mod result;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use association::{Association, AssociationKind};
pub use config::{DatabaseConfig, InsertMethod};
pub use database::{Database, QueryEvent, StatementKind};
pub use graph::DependencyGraph;
pub use n1_detection::{N1QueryTracker, N1Stats};
pub use persist::{SaveReport, Statement};
pub use record::{Record, Related};
pub use result::ResultSet;
