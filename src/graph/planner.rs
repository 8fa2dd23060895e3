//! Execution order planner
//!
//! Layers a validated graph into batches. Members of a batch share no edges
//! and may run together; every module's dependencies sit in an earlier batch.

use crate::graph::builder::DependencyGraph;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

/// Which way a plan walks the dependency edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanDirection {
    /// Dependencies before dependents (apply, plan)
    Forward,
    /// Dependents before dependencies (destroy)
    Reverse,
}

/// Ordered batches of module paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    batches: Vec<Vec<PathBuf>>,
    direction: PlanDirection,
}

impl ExecutionPlan {
    /// Layer the graph. Cannot fail: the graph is already proven acyclic.
    pub fn from_graph(graph: &DependencyGraph) -> Self {
        let mut pending: BTreeMap<&Path, usize> = graph
            .modules()
            .map(|module| (module.path.as_path(), module.dependencies.len()))
            .collect();

        let mut ready: Vec<&Path> = pending
            .iter()
            .filter(|(_, remaining)| **remaining == 0)
            .map(|(path, _)| *path)
            .collect();

        let mut batches = Vec::new();
        while !ready.is_empty() {
            for path in &ready {
                pending.remove(path);
            }

            let mut next = BTreeSet::new();
            for path in &ready {
                for dependent in graph.dependents_of(path) {
                    if let Some(remaining) = pending.get_mut(dependent) {
                        *remaining -= 1;
                        if *remaining == 0 {
                            next.insert(dependent);
                        }
                    }
                }
            }

            batches.push(ready.iter().map(|path| path.to_path_buf()).collect());
            ready = next.into_iter().collect();
        }

        Self {
            batches,
            direction: PlanDirection::Forward,
        }
    }

    /// The same plan walked backwards, for tearing a stack down
    pub fn reversed(&self) -> Self {
        let direction = match self.direction {
            PlanDirection::Forward => PlanDirection::Reverse,
            PlanDirection::Reverse => PlanDirection::Forward,
        };
        Self {
            batches: self.batches.iter().rev().cloned().collect(),
            direction,
        }
    }

    pub fn batches(&self) -> &[Vec<PathBuf>] {
        &self.batches
    }

    pub fn direction(&self) -> PlanDirection {
        self.direction
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Total number of modules across all batches
    pub fn module_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Batch position of every module
    pub fn batch_indices(&self) -> HashMap<&Path, usize> {
        self.batches
            .iter()
            .enumerate()
            .flat_map(|(i, batch)| batch.iter().map(move |path| (path.as_path(), i)))
            .collect()
    }

    pub fn batch_index_of(&self, path: &Path) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|member| member == path))
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.direction {
            PlanDirection::Forward => "Execution order",
            PlanDirection::Reverse => "Reverse execution order",
        };
        writeln!(f, "{verb} ({} batches):", self.batches.len())?;
        for (i, batch) in self.batches.iter().enumerate() {
            writeln!(f, "  batch {}:", i + 1)?;
            for path in batch {
                writeln!(f, "    - {}", path.display())?;
            }
        }
        Ok(())
    }
}
