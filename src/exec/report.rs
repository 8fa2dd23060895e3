//! Run report
//!
//! One entry per module, filled in batch by batch. Every module ends up in
//! exactly one of three states: succeeded, failed with a cause, or skipped
//! with the reason it never ran.

use crate::core::errors::StackError;
use crate::graph::planner::PlanDirection;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Why a module was not executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// A prerequisite failed. `chain` runs from the direct prerequisite to the
    /// module whose failure started it; `cause` is that module's failure.
    UpstreamFailed { chain: Vec<PathBuf>, cause: String },
    /// The run was cancelled before the module started
    Cancelled,
}

impl SkipReason {
    /// The module whose failure caused the skip
    pub fn origin(&self) -> Option<&Path> {
        match self {
            Self::UpstreamFailed { chain, .. } => chain.last().map(PathBuf::as_path),
            Self::Cancelled => None,
        }
    }
}

/// Final state of one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModuleOutcome {
    Succeeded,
    Failed { category: String, cause: String },
    Skipped { reason: SkipReason },
}

impl ModuleOutcome {
    pub fn failed(err: &StackError) -> Self {
        Self::Failed {
            category: err.category().to_string(),
            cause: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Report entry for one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleReport {
    pub path: PathBuf,
    /// Batch the module was planned in
    pub batch: usize,
    pub outcome: ModuleOutcome,
    /// Lock key the module executed under, if any
    pub lock_key: Option<String>,
    pub duration_ms: u64,
}

impl ModuleReport {
    pub fn new(path: PathBuf, batch: usize, outcome: ModuleOutcome) -> Self {
        Self {
            path,
            batch,
            outcome,
            lock_key: None,
            duration_ms: 0,
        }
    }

    pub fn with_lock_key(mut self, lock_key: Option<String>) -> Self {
        self.lock_key = lock_key;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub direction: PlanDirection,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
    modules: BTreeMap<PathBuf, ModuleReport>,
}

impl RunReport {
    pub fn new(direction: PlanDirection) -> Self {
        Self {
            direction,
            started_at: Utc::now(),
            finished_at: None,
            cancelled: false,
            modules: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, entry: ModuleReport) {
        self.modules.insert(entry.path.clone(), entry);
    }

    pub fn finish(&mut self, cancelled: bool) {
        self.cancelled = cancelled;
        self.finished_at = Some(Utc::now());
    }

    pub fn get(&self, path: &Path) -> Option<&ModuleReport> {
        self.modules.get(path)
    }

    pub fn outcome(&self, path: &Path) -> Option<&ModuleOutcome> {
        self.modules.get(path).map(|entry| &entry.outcome)
    }

    /// Entries in path order
    pub fn entries(&self) -> impl Iterator<Item = &ModuleReport> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// True when every recorded module succeeded and the run was not cancelled
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.modules.values().all(|entry| entry.outcome.is_success())
    }

    pub fn succeeded(&self) -> Vec<&Path> {
        self.paths_where(|outcome| matches!(outcome, ModuleOutcome::Succeeded))
    }

    pub fn failed(&self) -> Vec<&Path> {
        self.paths_where(|outcome| matches!(outcome, ModuleOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> Vec<&Path> {
        self.paths_where(|outcome| matches!(outcome, ModuleOutcome::Skipped { .. }))
    }

    fn paths_where(&self, pred: impl Fn(&ModuleOutcome) -> bool) -> Vec<&Path> {
        self.modules
            .values()
            .filter(|entry| pred(&entry.outcome))
            .map(|entry| entry.path.as_path())
            .collect()
    }

    /// If `path` did not succeed because of a failure, the upstream chain and
    /// cause a dependent inherits from it
    pub(crate) fn failure_chain(&self, path: &Path) -> Option<(Vec<PathBuf>, String)> {
        match &self.modules.get(path)?.outcome {
            ModuleOutcome::Failed { cause, .. } => Some((Vec::new(), cause.clone())),
            ModuleOutcome::Skipped {
                reason: SkipReason::UpstreamFailed { chain, cause },
            } => Some((chain.clone(), cause.clone())),
            _ => None,
        }
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} modules: {} succeeded, {} failed, {} skipped",
            self.modules.len(),
            self.succeeded().len(),
            self.failed().len(),
            self.skipped().len()
        );
        if self.cancelled {
            summary.push_str(" (cancelled)");
        }
        summary
    }
}
