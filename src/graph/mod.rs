//! Dependency graph construction and execution planning

pub mod builder;
pub mod planner;

pub use builder::DependencyGraph;
pub use planner::{ExecutionPlan, PlanDirection};
