pub mod coordinator;
pub mod invoker;
pub mod report;
#[doc(hidden)]
pub mod testing;

pub use coordinator::Coordinator;
pub use invoker::{CommandInvoker, InvocationFailure, ProvisionInvoker};
pub use report::{ModuleOutcome, ModuleReport, RunReport, SkipReason};
