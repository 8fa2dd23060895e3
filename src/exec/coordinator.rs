//! Execution coordinator
//!
//! Walks an [`ExecutionPlan`] batch by batch. Modules of one batch run
//! concurrently, bounded by a semaphore; the next batch starts only when the
//! whole current batch has finished. A module whose remote state has an
//! identity executes inside the distributed lock for that identity.

use crate::core::cancel::CancelSignal;
use crate::core::config::RunConfig;
use crate::core::errors::StackError;
use crate::exec::invoker::ProvisionInvoker;
use crate::exec::report::{ModuleOutcome, ModuleReport, RunReport, SkipReason};
use crate::graph::builder::DependencyGraph;
use crate::graph::planner::{ExecutionPlan, PlanDirection};
use crate::lock::{acquire_with_retry, LockError, LockStore};
use crate::stack::module::Module;
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Drives module executions against the provisioning tool
#[derive(Clone)]
pub struct Coordinator {
    invoker: Arc<dyn ProvisionInvoker>,
    lock_store: Arc<dyn LockStore>,
    config: RunConfig,
    cancel: CancelSignal,
}

impl Coordinator {
    pub fn new(
        config: RunConfig,
        invoker: Arc<dyn ProvisionInvoker>,
        lock_store: Arc<dyn LockStore>,
    ) -> Self {
        Self {
            invoker,
            lock_store,
            config,
            cancel: CancelSignal::never(),
        }
    }

    /// Observe `cancel` between batches and while waiting for locks
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Execute every module of `plan`, returning one report entry per module.
    ///
    /// Per-module failures never abort the run. Dependents of a failed module
    /// (dependencies for a reverse plan) are recorded as skipped and the
    /// tool is never invoked for them.
    pub async fn run(&self, graph: &DependencyGraph, plan: &ExecutionPlan) -> RunReport {
        let direction = plan.direction();
        let mut report = RunReport::new(direction);
        let permits = self
            .config
            .max_parallel_modules
            .unwrap_or(Semaphore::MAX_PERMITS)
            .min(Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(permits));

        info!(
            modules = plan.module_count(),
            batches = plan.len(),
            ?direction,
            "Starting run"
        );

        for (batch_idx, batch) in plan.batches().iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(batch = batch_idx + 1, "Run cancelled, not starting remaining batches");
                for path in batch {
                    report.record(skipped(path, batch_idx, SkipReason::Cancelled));
                }
                continue;
            }

            debug!(batch = batch_idx + 1, size = batch.len(), "Starting batch");
            let mut running = FuturesUnordered::new();

            for path in batch {
                let Some(module) = graph.get(path) else {
                    error!(path = %path.display(), "Planned module missing from graph");
                    continue;
                };

                if let Some(reason) = blocked_by(graph, &report, path, direction) {
                    if let Some(upstream) = reason.origin() {
                        let err = StackError::DependencyFailed {
                            module_path: path.clone(),
                            upstream: upstream.to_path_buf(),
                        };
                        warn!(module = %module.options.log_prefix, "{err}");
                    }
                    report.record(skipped(path, batch_idx, reason));
                    continue;
                }

                if let Some(load_error) = &module.load_error {
                    let err = StackError::config_parse(&module.options.config_path, load_error.clone());
                    error!(module = %module.options.log_prefix, error = %err, "Module cannot run");
                    report.record(ModuleReport::new(
                        path.clone(),
                        batch_idx,
                        ModuleOutcome::failed(&err),
                    ));
                    continue;
                }

                let task = ModuleTask {
                    module: module.clone(),
                    batch: batch_idx,
                    invoker: self.invoker.clone(),
                    lock_store: self.lock_store.clone(),
                    config: self.config.clone(),
                    cancel: self.cancel.clone(),
                    semaphore: semaphore.clone(),
                };
                let path = path.clone();
                let handle = tokio::spawn(task.execute());
                running.push(async move { (path, handle.await) });
            }

            while let Some((path, joined)) = running.next().await {
                let entry = match joined {
                    Ok(entry) => entry,
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "Module task panicked");
                        ModuleReport::new(
                            path,
                            batch_idx,
                            ModuleOutcome::Failed {
                                category: "internal".to_string(),
                                cause: format!("module task aborted: {e}"),
                            },
                        )
                    }
                };
                report.record(entry);
            }
        }

        report.finish(self.cancel.is_cancelled());
        info!(summary = %report.summary(), "Run finished");
        report
    }
}

/// Why `path` must not run, judged from its already-recorded prerequisites
fn blocked_by(
    graph: &DependencyGraph,
    report: &RunReport,
    path: &Path,
    direction: PlanDirection,
) -> Option<SkipReason> {
    let prerequisites = match direction {
        PlanDirection::Forward => graph.dependencies_of(path),
        PlanDirection::Reverse => graph.dependents_of(path),
    };

    for prerequisite in prerequisites {
        if let Some((upstream, cause)) = report.failure_chain(prerequisite) {
            let mut chain = Vec::with_capacity(upstream.len() + 1);
            chain.push(prerequisite.to_path_buf());
            chain.extend(upstream);
            return Some(SkipReason::UpstreamFailed { chain, cause });
        }
        if matches!(
            report.outcome(prerequisite),
            Some(ModuleOutcome::Skipped {
                reason: SkipReason::Cancelled
            })
        ) {
            return Some(SkipReason::Cancelled);
        }
    }
    None
}

fn skipped(path: &Path, batch: usize, reason: SkipReason) -> ModuleReport {
    ModuleReport::new(path.to_path_buf(), batch, ModuleOutcome::Skipped { reason })
}

/// Everything one spawned module execution owns
struct ModuleTask {
    module: Module,
    batch: usize,
    invoker: Arc<dyn ProvisionInvoker>,
    lock_store: Arc<dyn LockStore>,
    config: RunConfig,
    cancel: CancelSignal,
    semaphore: Arc<Semaphore>,
}

impl ModuleTask {
    async fn execute(self) -> ModuleReport {
        let span = info_span!("module", module = %self.module.options.log_prefix);
        self.execute_inner().instrument(span).await
    }

    async fn execute_inner(self) -> ModuleReport {
        let path = self.module.path.clone();
        let started = Instant::now();

        let _permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return skipped(&path, self.batch, SkipReason::Cancelled);
            }
        };
        if self.cancel.is_cancelled() {
            info!("Run cancelled before module started");
            return skipped(&path, self.batch, SkipReason::Cancelled);
        }

        let identity = self.module.remote_state_identity();
        let lock_key = identity.as_ref().map(|id| id.lock_key());

        let guard = match &lock_key {
            Some(key) => {
                let holder = format!("{} (pid {})", path.display(), std::process::id());
                match acquire_with_retry(
                    self.lock_store.clone(),
                    key,
                    &holder,
                    &self.config.lock,
                    &self.cancel,
                )
                .await
                {
                    Ok(guard) => Some(guard),
                    Err(StackError::Cancelled { .. }) => {
                        info!(key = %key, "Run cancelled while waiting for lock");
                        return skipped(&path, self.batch, SkipReason::Cancelled)
                            .with_lock_key(lock_key.clone());
                    }
                    Err(e) => {
                        error!(key = %key, error = %e, "Could not acquire state lock");
                        return self.finished(
                            path,
                            ModuleOutcome::failed(&e),
                            lock_key.clone(),
                            started,
                        );
                    }
                }
            }
            None => {
                debug!("Module has no remote state identity, running without a lock");
                None
            }
        };

        info!(tool = %self.module.options.tool_binary, "Invoking provisioning tool");
        let result = self.invoker.invoke(&self.module.options).await;

        let mut lease_lost = None;
        if let Some(guard) = guard {
            match guard.release().await {
                Ok(()) => {}
                Err(lost @ LockError::LeaseLost { .. }) => lease_lost = Some(StackError::from(lost)),
                Err(e) => {
                    warn!(error = %e, "Failed to release state lock; it will expire after its lease");
                }
            }
        }

        let outcome = match (result, lease_lost) {
            // Another holder may have written the same state concurrently
            (Ok(()), Some(err)) => {
                error!(error = %err, "Module lost its state lock while running");
                ModuleOutcome::failed(&err)
            }
            (Ok(()), None) => {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Module succeeded");
                ModuleOutcome::Succeeded
            }
            (Err(failure), _) => {
                let err = StackError::Invocation {
                    module_path: path.clone(),
                    exit_code: failure.exit_code,
                    diagnostics: failure.diagnostics,
                };
                error!(error = %err, "Module failed");
                ModuleOutcome::failed(&err)
            }
        };
        self.finished(path, outcome, lock_key, started)
    }

    fn finished(
        &self,
        path: PathBuf,
        outcome: ModuleOutcome,
        lock_key: Option<String>,
        started: Instant,
    ) -> ModuleReport {
        ModuleReport::new(path, self.batch, outcome)
            .with_lock_key(lock_key)
            .with_duration(started.elapsed())
    }
}
