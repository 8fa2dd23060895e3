use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Unified error type for the stackspin library
#[derive(Debug, Error)]
pub enum StackError {
    /// Filesystem errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Run configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// A module's configuration file could not be read or parsed
    #[error("Failed to load module configuration {}: {message}", .config_path.display())]
    ConfigParse {
        config_path: PathBuf,
        message: String,
    },

    /// A module declares dependencies that match no discovered module
    #[error(
        "Module {} specifies dependencies that are not part of the stack: {}",
        .module_path.display(),
        DisplayPaths(.dependency_paths, ", ")
    )]
    UnrecognizedDependency {
        module_path: PathBuf,
        dependency_paths: Vec<PathBuf>,
    },

    /// The dependency relation is not acyclic. `cycle` lists each member once,
    /// in the order the traversal reached them.
    #[error("Found a dependency cycle between modules: {}", DisplayCycle(.cycle))]
    DependencyCycle { cycle: Vec<PathBuf> },

    /// The lock retry budget ran out while someone else held the lock
    #[error("Could not acquire lock {key} after {attempts} attempts (held by {holder})")]
    LockContention {
        key: String,
        attempts: u32,
        holder: String,
    },

    /// The lock store itself failed
    #[error("Lock store operation failed: {operation}")]
    LockStore {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The provisioning tool exited unsuccessfully
    #[error("Provisioning failed in {} (exit code: {}): {diagnostics}", .module_path.display(), DisplayExitCode(*.exit_code))]
    Invocation {
        module_path: PathBuf,
        exit_code: Option<i32>,
        diagnostics: String,
    },

    /// A module was not run because one of its dependencies failed
    #[error("Module {} was not run because dependency {} failed", .module_path.display(), .upstream.display())]
    DependencyFailed {
        module_path: PathBuf,
        upstream: PathBuf,
    },

    /// The run was cancelled before the operation could start
    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },

    /// Several independent errors reported together
    #[error("{} errors occurred:\n{}", .0.len(), DisplayErrors(.0))]
    Multiple(Vec<StackError>),
}

impl StackError {
    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error pointing at a specific field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn config_parse<S: Into<String>>(config_path: &Path, message: S) -> Self {
        Self::ConfigParse {
            config_path: config_path.to_path_buf(),
            message: message.into(),
        }
    }

    /// Create a lock store error
    pub fn lock_store<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::LockStore {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Collapse a list of errors: one error stays bare, several become `Multiple`
    pub fn from_many(mut errors: Vec<StackError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }

    /// Structural errors invalidate the whole graph and abort before any execution
    pub fn is_structural(&self) -> bool {
        match self {
            Self::UnrecognizedDependency { .. } | Self::DependencyCycle { .. } => true,
            Self::Multiple(errors) => errors.iter().any(Self::is_structural),
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Configuration { .. } => "configuration",
            Self::ConfigParse { .. } => "config_parse",
            Self::UnrecognizedDependency { .. } => "unrecognized_dependency",
            Self::DependencyCycle { .. } => "dependency_cycle",
            Self::LockContention { .. } => "lock_contention",
            Self::LockStore { .. } => "lock_store",
            Self::Invocation { .. } => "invocation",
            Self::DependencyFailed { .. } => "dependency_failed",
            Self::Cancelled { .. } => "cancelled",
            Self::Multiple(_) => "multiple",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, StackError>;

impl From<serde_yaml::Error> for StackError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

struct DisplayPaths<'a>(&'a [PathBuf], &'a str);

impl fmt::Display for DisplayPaths<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, path) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(self.1)?;
            }
            write!(f, "{}", path.display())?;
        }
        Ok(())
    }
}

struct DisplayCycle<'a>(&'a [PathBuf]);

impl fmt::Display for DisplayCycle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        DisplayPaths(self.0, " -> ").fmt(f)?;
        if let Some(first) = self.0.first() {
            write!(f, " -> {}", first.display())?;
        }
        Ok(())
    }
}

struct DisplayExitCode(Option<i32>);

impl fmt::Display for DisplayExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "{code}"),
            None => f.write_str("none"),
        }
    }
}

struct DisplayErrors<'a>(&'a [StackError]);

impl fmt::Display for DisplayErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  - {err}")?;
        }
        Ok(())
    }
}
