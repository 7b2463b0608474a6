//! Schema migration dependency graph.
//!
//! Migrations are declared as a flat list where each entry names the
//! migrations it depends on. [`MigrationGraph`] validates that list, fixes a
//! deterministic application order, and knows which migrations are leaves
//! (nothing depends on them). A store whose ledger contains every leaf is
//! fully migrated.
//!
//! The order is a topological sort that breaks ties by declaration order, so
//! the same catalog always applies in the same sequence.

use std::collections::{HashMap, HashSet};
use std::fmt;

/// One schema migration: an id, its prerequisites, and the statements it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub id: &'static str,
    pub depends_on: &'static [&'static str],
    pub statements: &'static [&'static str],
}

/// Problems that make a migration catalog unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    Duplicate(String),
    UnknownDependency { migration: String, dependency: String },
    Cycle(Vec<String>),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::Duplicate(id) => write!(f, "duplicate migration id '{}'", id),
            GraphError::UnknownDependency {
                migration,
                dependency,
            } => write!(
                f,
                "migration '{}' depends on unknown migration '{}'",
                migration, dependency
            ),
            GraphError::Cycle(ids) => write!(f, "migration cycle among: {}", ids.join(", ")),
        }
    }
}

impl std::error::Error for GraphError {}

/// A validated, ordered migration catalog.
#[derive(Debug, Clone)]
pub struct MigrationGraph {
    ordered: Vec<Migration>,
    leaves: Vec<&'static str>,
}

impl MigrationGraph {
    pub fn new(migrations: &[Migration]) -> Result<Self, GraphError> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, m) in migrations.iter().enumerate() {
            if index.insert(m.id, i).is_some() {
                return Err(GraphError::Duplicate(m.id.to_string()));
            }
        }

        for m in migrations {
            for dep in m.depends_on {
                if !index.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        migration: m.id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
            }
        }

        let mut placed: HashSet<&str> = HashSet::new();
        let mut ordered = Vec::with_capacity(migrations.len());
        while ordered.len() < migrations.len() {
            let next = migrations.iter().find(|m| {
                !placed.contains(m.id) && m.depends_on.iter().all(|d| placed.contains(d))
            });
            match next {
                Some(m) => {
                    placed.insert(m.id);
                    ordered.push(*m);
                }
                None => {
                    let stuck = migrations
                        .iter()
                        .filter(|m| !placed.contains(m.id))
                        .map(|m| m.id.to_string())
                        .collect();
                    return Err(GraphError::Cycle(stuck));
                }
            }
        }

        let depended_on: HashSet<&str> = migrations
            .iter()
            .flat_map(|m| m.depends_on.iter().copied())
            .collect();
        let leaves = ordered
            .iter()
            .map(|m| m.id)
            .filter(|id| !depended_on.contains(id))
            .collect();

        Ok(Self { ordered, leaves })
    }

    /// All migrations in application order.
    pub fn ordered(&self) -> &[Migration] {
        &self.ordered
    }

    /// Migrations no other migration depends on.
    pub fn leaves(&self) -> &[&'static str] {
        &self.leaves
    }

    /// True when every leaf is in `applied`.
    pub fn is_current(&self, applied: &HashSet<String>) -> bool {
        self.leaves.iter().all(|leaf| applied.contains(*leaf))
    }

    /// Leaves not yet in `applied`.
    pub fn missing_leaves(&self, applied: &HashSet<String>) -> Vec<&'static str> {
        self.leaves
            .iter()
            .copied()
            .filter(|leaf| !applied.contains(*leaf))
            .collect()
    }

    /// Every migration not in `applied`, in application order.
    pub fn outstanding(&self, applied: &HashSet<String>) -> Vec<Migration> {
        self.ordered
            .iter()
            .filter(|m| !applied.contains(m.id))
            .copied()
            .collect()
    }
}
