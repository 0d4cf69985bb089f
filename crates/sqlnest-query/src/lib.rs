//! SQL text builder for sqlnest.
//!
//! Turns filter conditions, ordering and value maps into dialect-specific
//! SQL plus a positional parameter list. The builder never talks to a
//! connection.

pub mod builder;
pub mod clause;
pub mod expr;

pub use builder::{
    DeleteBuilder, InsertBuilder, InsertManyBuilder, SelectBuilder, UpdateBuilder, key_conditions,
};
pub use clause::{Limit, Offset, OrderBy, OrderDirection};
pub use expr::{CompareOp, Condition, build_conditions, quote_column};
pub use sqlnest_core::Dialect;
