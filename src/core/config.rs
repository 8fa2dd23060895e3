//! Run configuration
//!
//! Settings that shape a whole run: where discovery looks, which binary is
//! invoked, how wide a batch may fan out and how hard lock acquisition tries.

use crate::core::errors::{Result, StackError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Backoff between lock acquisition attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Exponential backoff with configurable parameters
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Linear backoff with fixed delay
    Linear { delay_ms: u64 },
    /// No delay between retries
    Immediate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Delay to wait after the given (zero-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64 * multiplier.powf(attempt as f64)).round();
                let delay = if delay.is_finite() { delay as u64 } else { *max_delay_ms };
                Duration::from_millis(delay.min(*max_delay_ms))
            }
            Self::Linear { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Immediate => Duration::ZERO,
        }
    }
}

/// Default lease database, relative to the stack root
pub const DEFAULT_LOCK_DB: &str = ".stackspin/locks.db";

/// Which lock store backs the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockStoreKind {
    /// In-process store, only excludes executions within this process
    Memory,
    /// SQLite lease database shared by every process that opens `path`.
    /// A relative path is taken from the stack root.
    Sqlite { path: PathBuf },
}

impl Default for LockStoreKind {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from(DEFAULT_LOCK_DB),
        }
    }
}

impl LockStoreKind {
    /// Anchor a relative database path at `root`
    pub fn resolve_against(&self, root: &Path) -> Self {
        match self {
            Self::Sqlite { path } if path.is_relative() => Self::Sqlite {
                path: root.join(path),
            },
            other => other.clone(),
        }
    }
}

/// Lock acquisition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Total attempts before contention becomes a module failure
    pub max_attempts: u32,
    /// Delay between attempts
    pub retry_strategy: RetryStrategy,
    /// Randomize each delay by up to +/-25%
    pub jitter: bool,
    /// Lease lifetime; abandoned locks become reclaimable after this long
    pub lease_ttl_secs: u64,
    pub store: LockStoreKind,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            retry_strategy: RetryStrategy::default(),
            jitter: true,
            lease_ttl_secs: 300,
            store: LockStoreKind::default(),
        }
    }
}

impl LockConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Delay before the attempt following `attempt`, jitter included
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_strategy.delay_for(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = 0.75 + fastrand::f64() * 0.5;
        base.mul_f64(factor)
    }
}

fn default_config_file_name() -> String {
    "spin.yaml".to_string()
}

fn default_tool_binary() -> String {
    "terraform".to_string()
}

/// Configuration for a whole stack run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum number of modules executing at once within a batch (None = unbounded)
    #[serde(default)]
    pub max_parallel_modules: Option<usize>,
    /// File name that marks a directory as a module
    #[serde(default = "default_config_file_name")]
    pub config_file_name: String,
    /// Provisioning binary invoked in each module
    #[serde(default = "default_tool_binary")]
    pub tool_binary: String,
    /// Run the tool without prompting for input
    #[serde(default)]
    pub non_interactive: bool,
    #[serde(default)]
    pub lock: LockConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallel_modules: None,
            config_file_name: default_config_file_name(),
            tool_binary: default_tool_binary(),
            non_interactive: false,
            lock: LockConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load and validate a configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StackError::io(format!("read run config {}", path.display()), e))?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_modules == Some(0) {
            return Err(StackError::configuration_field(
                "max_parallel_modules must be greater than 0",
                "max_parallel_modules",
            ));
        }

        if self.config_file_name.trim().is_empty() {
            return Err(StackError::configuration_field(
                "config_file_name cannot be empty",
                "config_file_name",
            ));
        }

        if self.tool_binary.trim().is_empty() {
            return Err(StackError::configuration_field(
                "tool_binary cannot be empty",
                "tool_binary",
            ));
        }

        if self.lock.max_attempts == 0 {
            return Err(StackError::configuration_field(
                "lock.max_attempts must be greater than 0",
                "lock.max_attempts",
            ));
        }

        if self.lock.lease_ttl_secs == 0 {
            return Err(StackError::configuration_field(
                "lock.lease_ttl_secs must be greater than 0",
                "lock.lease_ttl_secs",
            ));
        }

        if let RetryStrategy::Exponential {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        } = self.lock.retry_strategy
        {
            if multiplier < 1.0 {
                return Err(StackError::configuration_field(
                    "exponential multiplier must be at least 1.0",
                    "lock.retry_strategy.multiplier",
                ));
            }
            if max_delay_ms < initial_delay_ms {
                return Err(StackError::configuration_field(
                    "max_delay_ms cannot be smaller than initial_delay_ms",
                    "lock.retry_strategy.max_delay_ms",
                ));
            }
        }

        Ok(())
    }

    /// Merges two configurations, with override_with taking precedence where it
    /// departs from the defaults
    pub fn merge(base: &Self, override_with: &Self) -> Result<Self> {
        let defaults = Self::default();
        let pick = |base_value: &String, override_value: &String, default_value: &String| {
            if override_value != default_value {
                override_value.clone()
            } else {
                base_value.clone()
            }
        };

        let merged = Self {
            max_parallel_modules: override_with
                .max_parallel_modules
                .or(base.max_parallel_modules),
            config_file_name: pick(
                &base.config_file_name,
                &override_with.config_file_name,
                &defaults.config_file_name,
            ),
            tool_binary: pick(
                &base.tool_binary,
                &override_with.tool_binary,
                &defaults.tool_binary,
            ),
            non_interactive: base.non_interactive || override_with.non_interactive,
            lock: if override_with.lock != defaults.lock {
                override_with.lock.clone()
            } else {
                base.lock.clone()
            },
        };

        merged.validate()?;
        Ok(merged)
    }
}
