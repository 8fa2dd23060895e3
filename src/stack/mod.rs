//! Stacks: the modules under one root, their graph and their plan.

pub mod config;
pub mod discovery;
pub mod module;
pub mod paths;

use crate::core::config::RunConfig;
use crate::core::errors::Result;
use crate::exec::coordinator::Coordinator;
use crate::exec::report::RunReport;
use crate::graph::builder::DependencyGraph;
use crate::graph::planner::ExecutionPlan;
use config::ConfigProvider;
use discovery::ModuleSet;
use std::path::Path;

/// A validated stack ready to run
#[derive(Debug, Clone)]
pub struct Stack {
    graph: DependencyGraph,
    plan: ExecutionPlan,
}

impl Stack {
    /// Discover, resolve and plan every module under `root`.
    ///
    /// Fails on unrecognized dependencies and cycles; nothing is executed
    /// against a stack that does not validate.
    pub fn discover(
        root: &Path,
        run_config: &RunConfig,
        tool_args: &[String],
        provider: &dyn ConfigProvider,
    ) -> Result<Self> {
        let modules = discovery::discover_modules(root, run_config, tool_args, provider)?;
        Self::from_modules(modules)
    }

    pub fn from_modules(modules: ModuleSet) -> Result<Self> {
        let graph = DependencyGraph::build(modules)?;
        let plan = ExecutionPlan::from_graph(&graph);
        Ok(Self { graph, plan })
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Apply in dependency order
    pub async fn run(&self, coordinator: &Coordinator) -> RunReport {
        coordinator.run(&self.graph, &self.plan).await
    }

    /// Tear down in reverse dependency order
    pub async fn run_reverse(&self, coordinator: &Coordinator) -> RunReport {
        coordinator.run(&self.graph, &self.plan.reversed()).await
    }
}
