//! Database-level configuration.

use serde::{Deserialize, Serialize};
use sqlnest_core::Result;

/// How bulk inserts are sent to storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertMethod {
    /// One INSERT statement per row.
    #[default]
    Default,
    /// A single multi-row INSERT; every row must set the same columns.
    Batch,
}

/// Configuration for [`Database`](crate::Database) behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Insert method used by `ResultSet::insert` when none is given.
    pub insert_method: InsertMethod,
    /// Warn after this many unbatched loads of one association; `None` disables.
    pub n1_threshold: Option<usize>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            insert_method: InsertMethod::Default,
            n1_threshold: Some(3),
        }
    }
}

impl DatabaseConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the default insert method (builder pattern).
    #[must_use]
    pub fn with_insert_method(mut self, method: InsertMethod) -> Self {
        self.insert_method = method;
        self
    }

    /// Set the N+1 warning threshold (builder pattern).
    #[must_use]
    pub fn with_n1_threshold(mut self, threshold: Option<usize>) -> Self {
        self.n1_threshold = threshold;
        self
    }
}
