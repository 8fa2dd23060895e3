//! The provisioning tool, seen through one narrow capability.

use crate::stack::module::ModuleOptions;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// Lines of stderr kept as diagnostics when the tool fails
const DIAGNOSTIC_TAIL_LINES: usize = 40;

/// Structured failure of one tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationFailure {
    /// Exit status, or None when the process never ran or was killed by a signal
    pub exit_code: Option<i32>,
    pub diagnostics: String,
}

impl InvocationFailure {
    pub fn new<S: Into<String>>(exit_code: Option<i32>, diagnostics: S) -> Self {
        Self {
            exit_code,
            diagnostics: diagnostics.into(),
        }
    }
}

/// Runs the provisioning tool for one module to completion
#[async_trait]
pub trait ProvisionInvoker: Send + Sync {
    async fn invoke(&self, options: &ModuleOptions) -> Result<(), InvocationFailure>;
}

/// Spawns the configured binary in the module's working directory.
///
/// Interactive runs inherit the terminal. Non-interactive runs close stdin,
/// capture output into the log and keep the tail of stderr as diagnostics.
#[derive(Debug, Clone, Default)]
pub struct CommandInvoker;

#[async_trait]
impl ProvisionInvoker for CommandInvoker {
    async fn invoke(&self, options: &ModuleOptions) -> Result<(), InvocationFailure> {
        let mut command = Command::new(&options.tool_binary);
        command
            .args(&options.tool_args)
            .current_dir(&options.working_dir);

        if !options.non_interactive {
            let status = command.status().await.map_err(|e| {
                InvocationFailure::new(None, format!("failed to start {}: {e}", options.tool_binary))
            })?;
            return if status.success() {
                Ok(())
            } else {
                Err(InvocationFailure::new(
                    status.code(),
                    "tool exited unsuccessfully; see its output above",
                ))
            };
        }

        command
            .env("TF_INPUT", "false")
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = command.output().await.map_err(|e| {
            InvocationFailure::new(None, format!("failed to start {}: {e}", options.tool_binary))
        })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!(target: "stackspin::tool", module = %options.log_prefix, "{line}");
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            warn!(target: "stackspin::tool", module = %options.log_prefix, "{line}");
        }

        if output.status.success() {
            Ok(())
        } else {
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES)..].join("\n");
            Err(InvocationFailure::new(output.status.code(), tail))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::config::RunConfig;
    use std::path::Path;

    fn options(binary: &str, args: &[&str]) -> ModuleOptions {
        let config = RunConfig {
            tool_binary: binary.to_string(),
            non_interactive: true,
            ..Default::default()
        };
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let dir = std::env::temp_dir();
        ModuleOptions::for_module(&dir, Path::new("/"), &config, &args)
    }

    #[tokio::test]
    async fn test_successful_command() {
        let result = CommandInvoker.invoke(&options("sh", &["-c", "echo ok"])).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_failure_carries_exit_code_and_stderr() {
        let failure = CommandInvoker
            .invoke(&options("sh", &["-c", "echo broken >&2; exit 3"]))
            .await
            .unwrap_err();
        assert_eq!(failure.exit_code, Some(3));
        assert_eq!(failure.diagnostics, "broken");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let failure = CommandInvoker
            .invoke(&options("stackspin-no-such-binary", &[]))
            .await
            .unwrap_err();
        assert_eq!(failure.exit_code, None);
        assert!(failure.diagnostics.contains("failed to start"));
    }
}
