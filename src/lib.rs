// Shared infrastructure
pub mod core {
    pub mod cancel;
    pub mod config;
    pub mod errors;
}

pub mod stack; // Discovery and module binding
pub mod graph; // Dependency graph and execution order
pub mod state; // Remote state identity
pub mod lock; // Distributed execution locks
pub mod exec; // Coordinated execution

// Re-exports for convenience
pub use core::cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use core::config::{LockConfig, LockStoreKind, RetryStrategy, RunConfig};
pub use core::errors::{Result, StackError};
pub use exec::{
    CommandInvoker, Coordinator, InvocationFailure, ModuleOutcome, ModuleReport,
    ProvisionInvoker, RunReport, SkipReason,
};
pub use graph::{DependencyGraph, ExecutionPlan, PlanDirection};
pub use lock::{acquire_with_retry, open_store, LockError, LockGuard, LockLease, LockStore};
pub use stack::config::{ConfigProvider, ModuleConfig, RemoteState, YamlConfigProvider};
pub use stack::discovery::{discover_modules, discover_paths, ModuleSet};
pub use stack::module::{Module, ModuleOptions};
pub use stack::Stack;
pub use state::RemoteStateIdentity;
