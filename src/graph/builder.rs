//! Dependency graph builder
//!
//! Resolves each module's declared dependency paths against the discovered
//! set and proves the resulting relation acyclic. Nothing is executed against
//! a graph that failed either check.

use crate::core::errors::{Result, StackError};
use crate::stack::discovery::ModuleSet;
use crate::stack::module::Module;
use crate::stack::paths::resolve_dependency_path;
use indexmap::IndexSet;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A validated, acyclic dependency graph over one run's modules.
///
/// Modules are owned here and keyed by path. Edges live in a petgraph
/// `DiGraph` whose node weights are module paths, pointing from a dependency
/// to its dependent.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    modules: BTreeMap<PathBuf, Module>,
    graph: DiGraph<PathBuf, ()>,
    node_map: HashMap<PathBuf, NodeIndex>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl DependencyGraph {
    /// Resolve and validate the dependencies of every module in the set
    pub fn build(modules: ModuleSet) -> Result<Self> {
        let mut modules = modules.into_inner();
        resolve_dependencies(&mut modules)?;
        check_for_cycles(&modules)?;

        let mut graph = DiGraph::with_capacity(modules.len(), 0);
        let mut node_map = HashMap::with_capacity(modules.len());
        for path in modules.keys() {
            let idx = graph.add_node(path.clone());
            node_map.insert(path.clone(), idx);
        }
        for module in modules.values() {
            let dependent = node_map[&module.path];
            for dep in &module.dependencies {
                graph.add_edge(node_map[dep], dependent, ());
            }
        }

        debug!(
            modules = graph.node_count(),
            edges = graph.edge_count(),
            "Built dependency graph"
        );

        Ok(Self {
            modules,
            graph,
            node_map,
        })
    }

    pub fn get(&self, path: &Path) -> Option<&Module> {
        self.modules.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.modules.contains_key(path)
    }

    /// Modules in path order
    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Direct dependencies of a module
    pub fn dependencies_of(&self, path: &Path) -> Vec<&Path> {
        self.neighbors(path, Direction::Incoming)
    }

    /// Modules that directly depend on `path`
    pub fn dependents_of(&self, path: &Path) -> Vec<&Path> {
        self.neighbors(path, Direction::Outgoing)
    }

    fn neighbors(&self, path: &Path, direction: Direction) -> Vec<&Path> {
        let Some(&idx) = self.node_map.get(path) else {
            return Vec::new();
        };
        let mut neighbors: Vec<&Path> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].as_path())
            .collect();
        neighbors.sort();
        neighbors
    }

    /// Hand the modules back as a discovery snapshot, e.g. to rebuild
    pub fn into_module_set(self) -> ModuleSet {
        ModuleSet::from_modules(self.modules.into_values())
    }
}

/// Graphs are equal when they hold the same modules by path, each with the
/// same dependency set
impl PartialEq for DependencyGraph {
    fn eq(&self, other: &Self) -> bool {
        self.modules == other.modules
    }
}

impl fmt::Display for DependencyGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stack of {} modules:", self.modules.len())?;
        for module in self.modules.values() {
            let mut deps: Vec<_> = module.dependencies.iter().collect();
            deps.sort();
            write!(f, "  => {}", module.path.display())?;
            if deps.is_empty() {
                writeln!(f)?;
                continue;
            }
            writeln!(f, " (dependencies: [")?;
            for dep in deps {
                writeln!(f, "       {}", dep.display())?;
            }
            writeln!(f, "     ])")?;
        }
        Ok(())
    }
}

fn resolve_dependencies(modules: &mut BTreeMap<PathBuf, Module>) -> Result<()> {
    let mut errors = Vec::new();
    let mut resolved = Vec::with_capacity(modules.len());

    for module in modules.values() {
        let mut deps = IndexSet::new();
        let mut unresolved: Vec<PathBuf> = Vec::new();

        for raw in module.declared_dependencies() {
            let dep = resolve_dependency_path(&module.path, raw);
            if modules.contains_key(&dep) {
                deps.insert(dep);
            } else if !unresolved.contains(&dep) {
                unresolved.push(dep);
            }
        }

        if !unresolved.is_empty() {
            errors.push(StackError::UnrecognizedDependency {
                module_path: module.path.clone(),
                dependency_paths: unresolved,
            });
        }
        resolved.push((module.path.clone(), deps));
    }

    if let Some(err) = StackError::from_many(errors) {
        return Err(err);
    }

    for (path, deps) in resolved {
        if let Some(module) = modules.get_mut(&path) {
            module.dependencies = deps;
        }
    }
    Ok(())
}

fn check_for_cycles(modules: &BTreeMap<PathBuf, Module>) -> Result<()> {
    let mut marks: HashMap<&Path, Mark> = HashMap::with_capacity(modules.len());
    let mut stack: Vec<&Path> = Vec::new();

    for path in modules.keys() {
        visit(path, modules, &mut marks, &mut stack)?;
    }
    Ok(())
}

fn visit<'a>(
    path: &'a Path,
    modules: &'a BTreeMap<PathBuf, Module>,
    marks: &mut HashMap<&'a Path, Mark>,
    stack: &mut Vec<&'a Path>,
) -> Result<()> {
    match marks.get(path) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::InProgress) => {
            let start = stack.iter().position(|p| *p == path).unwrap_or(0);
            return Err(StackError::DependencyCycle {
                cycle: stack[start..].iter().map(|p| p.to_path_buf()).collect(),
            });
        }
        None => {}
    }

    marks.insert(path, Mark::InProgress);
    stack.push(path);

    if let Some(module) = modules.get(path) {
        for dep in &module.dependencies {
            visit(dep, modules, marks, stack)?;
        }
    }

    stack.pop();
    marks.insert(path, Mark::Done);
    Ok(())
}
