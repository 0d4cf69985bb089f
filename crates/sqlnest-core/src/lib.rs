//! Core types and traits for sqlnest.
//!
//! This crate provides the foundational pieces shared by the builder and the
//! session layer:
//!
//! - [`Value`] dynamic SQL values and their join-key form [`ValueKey`]
//! - [`Row`] raw rows returned by a driver
//! - [`Connection`] the synchronous storage interface
//! - [`Schema`] the immutable schema registry
//! - [`Error`] configuration, usage and storage errors

pub mod connection;
pub mod dialect;
pub mod error;
pub mod row;
pub mod schema;
pub mod value;

pub use connection::{Connection, IsolationLevel};
pub use dialect::Dialect;
pub use error::{
    ConfigError, ConfigErrorKind, ConnectionError, ConnectionErrorKind, Error, QueryError,
    QueryErrorKind, Result, TransactionError, TransactionErrorKind, TypeError, UsageError,
    UsageErrorKind,
};
pub use row::{FromValue, Row};
pub use schema::{RewriteFn, Schema, SchemaBuilder, SchemaConfig};
pub use value::{Value, ValueKey};
