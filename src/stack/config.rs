//! Parsed module configuration and the provider that loads it.

use crate::core::errors::{Result, StackError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Declared dependencies of a module, as written in its configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies {
    /// Paths relative to the module's directory (or absolute)
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Remote backend descriptor of a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteState {
    /// Backend kind, e.g. `s3`, `gcs`, `azurerm`
    pub backend: String,
    /// Backend parameters
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl RemoteState {
    pub fn new<S: Into<String>>(backend: S) -> Self {
        Self {
            backend: backend.into(),
            config: BTreeMap::new(),
        }
    }

    pub fn with_param<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// Parsed configuration of one module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default)]
    pub dependencies: Option<Dependencies>,
    #[serde(default)]
    pub remote_state: Option<RemoteState>,
}

impl ModuleConfig {
    /// Declared dependency paths in declaration order
    pub fn dependency_paths(&self) -> &[String] {
        self.dependencies
            .as_ref()
            .map(|deps| deps.paths.as_slice())
            .unwrap_or(&[])
    }

    pub fn with_dependencies<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = Some(Dependencies {
            paths: paths.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_remote_state(mut self, remote_state: RemoteState) -> Self {
        self.remote_state = Some(remote_state);
        self
    }
}

/// Loads a module's configuration file
pub trait ConfigProvider: Send + Sync {
    fn load(&self, config_path: &Path) -> Result<ModuleConfig>;
}

/// Reads module configuration from YAML documents
#[derive(Debug, Clone, Default)]
pub struct YamlConfigProvider;

impl ConfigProvider for YamlConfigProvider {
    fn load(&self, config_path: &Path) -> Result<ModuleConfig> {
        let contents = std::fs::read_to_string(config_path)
            .map_err(|e| StackError::config_parse(config_path, e.to_string()))?;

        // An empty file declares a module with no dependencies and no backend
        if contents.trim().is_empty() {
            return Ok(ModuleConfig::default());
        }

        serde_yaml::from_str(&contents)
            .map_err(|e| StackError::config_parse(config_path, e.to_string()))
    }
}
