//! In-process invoker for exercising the coordinator without a real tool.

use crate::exec::invoker::{InvocationFailure, ProvisionInvoker};
use crate::stack::module::ModuleOptions;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct GroupCounter {
    current: usize,
    peak: usize,
}

/// Records every invocation by working directory.
///
/// Modules can be told to fail, every call can be slowed down, and modules
/// can be put into named groups whose concurrent invocations are counted.
/// A group's peak concurrency shows whether its members ever overlapped.
#[derive(Debug, Default)]
pub struct RecordingInvoker {
    calls: Mutex<Vec<PathBuf>>,
    failures: HashMap<PathBuf, InvocationFailure>,
    groups: HashMap<PathBuf, String>,
    counters: DashMap<String, GroupCounter>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl RecordingInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the module at `path` fail with the given exit code and message
    pub fn fail<P: Into<PathBuf>>(mut self, path: P, exit_code: i32, diagnostics: &str) -> Self {
        self.failures
            .insert(path.into(), InvocationFailure::new(Some(exit_code), diagnostics));
        self
    }

    /// Hold every invocation open for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Count concurrent invocations of `path` under `group`
    pub fn track_group<P: Into<PathBuf>>(mut self, path: P, group: &str) -> Self {
        self.groups.insert(path.into(), group.to_string());
        self
    }

    /// Working directories in invocation order
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Highest number of simultaneous invocations seen within `group`
    pub fn max_concurrency(&self, group: &str) -> usize {
        self.counters.get(group).map(|c| c.peak).unwrap_or(0)
    }

    /// Highest number of simultaneous invocations seen overall
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, group: Option<&String>) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(group) = group {
            let mut counter = self.counters.entry(group.clone()).or_default();
            counter.current += 1;
            counter.peak = counter.peak.max(counter.current);
        }
    }

    fn exit(&self, group: Option<&String>) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(group) = group {
            if let Some(mut counter) = self.counters.get_mut(group) {
                counter.current -= 1;
            }
        }
    }
}

#[async_trait]
impl ProvisionInvoker for RecordingInvoker {
    async fn invoke(&self, options: &ModuleOptions) -> Result<(), InvocationFailure> {
        let path = &options.working_dir;
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(path.clone());
        }

        let group = self.groups.get(path);
        self.enter(group);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.exit(group);

        match self.failures.get(path) {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RunConfig;
    use std::path::Path;

    fn options(path: &str) -> ModuleOptions {
        ModuleOptions::for_module(Path::new(path), Path::new("/"), &RunConfig::default(), &[])
    }

    #[tokio::test]
    async fn test_records_calls_and_failures() {
        let invoker = RecordingInvoker::new().fail("/b", 2, "nope");
        assert!(invoker.invoke(&options("/a")).await.is_ok());
        let failure = invoker.invoke(&options("/b")).await.unwrap_err();

        assert_eq!(failure.exit_code, Some(2));
        assert_eq!(invoker.calls(), vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[tokio::test]
    async fn test_group_counts_overlap() {
        let invoker = RecordingInvoker::new()
            .with_delay(Duration::from_millis(20))
            .track_group("/a", "shared")
            .track_group("/b", "shared");
        let (a, b) = (options("/a"), options("/b"));
        let _ = tokio::join!(invoker.invoke(&a), invoker.invoke(&b));

        assert_eq!(invoker.max_concurrency("shared"), 2);
        assert_eq!(invoker.peak_in_flight(), 2);
    }
}
