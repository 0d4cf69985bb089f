//! N+1 query detection.
//!
//! Traversals started from a record that was fetched as part of a result are
//! batched across all of its siblings. A record built by hand, or one whose
//! result has been dropped, has no siblings, so each traversal from such a
//! record costs its own query. Repeating that for many records is the N+1
//! pattern; the tracker counts those unbatched loads per association and warns
//! once a threshold is reached.

use std::collections::HashMap;

/// Tracks unbatched association loads.
#[derive(Debug)]
pub struct N1QueryTracker {
    /// (table, association) -> load count
    counts: HashMap<(String, String), usize>,
    /// Threshold for warning (loads per association)
    threshold: usize,
}

/// Statistics about N+1 detection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct N1Stats {
    /// Total number of unbatched loads recorded
    pub total_loads: usize,
    /// Number of distinct associations loaded unbatched
    pub associations_loaded: usize,
    /// Number of associations that reached the threshold
    pub potential_n1: usize,
}

impl N1QueryTracker {
    /// Create a tracker warning at `threshold` loads per association.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            counts: HashMap::new(),
            threshold,
        }
    }

    /// Get the current threshold.
    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record one unbatched load of `association` from a `table` record.
    pub fn record_load(&mut self, table: &str, association: &str) {
        let count = self
            .counts
            .entry((table.to_string(), association.to_string()))
            .or_insert(0);
        *count += 1;

        if *count == self.threshold {
            tracing::warn!(
                target: "sqlnest::n1",
                table = table,
                association = association,
                queries = *count,
                threshold = self.threshold,
                "N+1 query pattern detected; traverse from the result instead of from detached records"
            );
        }
    }

    /// Get the current count for a specific association.
    #[must_use]
    pub fn count_for(&self, table: &str, association: &str) -> usize {
        self.counts
            .get(&(table.to_string(), association.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Get statistics about N+1 detection.
    #[must_use]
    pub fn stats(&self) -> N1Stats {
        N1Stats {
            total_loads: self.counts.values().sum(),
            associations_loaded: self.counts.len(),
            potential_n1: self
                .counts
                .values()
                .filter(|&&c| c >= self.threshold)
                .count(),
        }
    }

    /// Reset all counts.
    pub fn reset(&mut self) {
        self.counts.clear();
    }
}
