//! Dependency graph over pending rows.
//!
//! Nodes are indices into the planner's row list; an edge `before -> after`
//! means `before` must be written first. Ordering is Kahn's algorithm with
//! ready nodes taken lowest index first, so rows that do not depend on each
//! other keep the order in which they were discovered.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use sqlnest_core::{ConfigErrorKind, Error, Result};

/// Arena graph with labelled nodes.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    labels: Vec<String>,
    /// node -> nodes that must come after it
    dependents: Vec<Vec<usize>>,
    /// node -> nodes that must come before it
    prerequisites: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node and return its index.
    pub fn add_node(&mut self, label: impl Into<String>) -> usize {
        self.labels.push(label.into());
        self.dependents.push(Vec::new());
        self.prerequisites.push(Vec::new());
        self.labels.len() - 1
    }

    /// Require `before` to be ordered ahead of `after`. Duplicate edges are ignored.
    pub fn add_edge(&mut self, before: usize, after: usize) {
        if !self.dependents[before].contains(&after) {
            self.dependents[before].push(after);
            self.prerequisites[after].push(before);
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Every node, each after all of its prerequisites.
    ///
    /// # Errors
    ///
    /// A configuration error naming the nodes of one cycle, if any.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.prerequisites.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| Reverse(node))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &next in &self.dependents[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() == self.len() {
            return Ok(order);
        }

        let remaining: Vec<bool> = in_degree.iter().map(|degree| *degree > 0).collect();
        let cycle = self.find_cycle(&remaining);
        let tables: Vec<&str> = cycle.iter().map(|&node| self.labels[node].as_str()).collect();
        Err(Error::config(
            ConfigErrorKind::DependencyCycle,
            format!("Dependency cycle detected: {}", tables.join(" -> ")),
        ))
    }

    /// Walk prerequisites among the unordered nodes until one repeats.
    /// Every unordered node has an unordered prerequisite, so the walk
    /// always closes a cycle.
    fn find_cycle(&self, remaining: &[bool]) -> Vec<usize> {
        let Some(start) = remaining.iter().position(|r| *r) else {
            return Vec::new();
        };
        let mut path = vec![start];
        let mut node = start;
        loop {
            let Some(&prev) = self.prerequisites[node].iter().find(|&&p| remaining[p]) else {
                return path;
            };
            if let Some(pos) = path.iter().position(|&n| n == prev) {
                let mut cycle = path.split_off(pos);
                cycle.push(prev);
                // Prerequisite walk runs backwards; report in write order.
                cycle.reverse();
                return cycle;
            }
            path.push(prev);
            node = prev;
        }
    }
}
