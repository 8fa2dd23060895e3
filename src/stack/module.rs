use crate::core::config::RunConfig;
use crate::stack::config::ModuleConfig;
use crate::state::RemoteStateIdentity;
use indexmap::IndexSet;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Effective options the provisioning tool is invoked with for one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleOptions {
    /// Directory the tool runs in
    pub working_dir: PathBuf,
    /// Configuration file the module was bound from
    pub config_path: PathBuf,
    /// Binary to invoke
    pub tool_binary: String,
    /// Arguments forwarded to the tool
    pub tool_args: Vec<String>,
    /// Run without prompting for input
    pub non_interactive: bool,
    /// Label attached to every log line of this module's execution
    pub log_prefix: String,
}

impl ModuleOptions {
    /// Bind the run-wide settings to a single module directory
    pub fn for_module(
        module_dir: &Path,
        root: &Path,
        run_config: &RunConfig,
        tool_args: &[String],
    ) -> Self {
        let log_prefix = match module_dir.strip_prefix(root) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative.display().to_string(),
            _ => module_dir.display().to_string(),
        };

        Self {
            working_dir: module_dir.to_path_buf(),
            config_path: module_dir.join(&run_config.config_file_name),
            tool_binary: run_config.tool_binary.clone(),
            tool_args: tool_args.to_vec(),
            non_interactive: run_config.non_interactive,
            log_prefix,
        }
    }
}

/// A discovered unit of infrastructure configuration.
///
/// `dependencies` holds keys into the module set that owns this module; it is
/// empty until the graph builder resolves the declared paths. Comparing two
/// modules compares their dependency sets without regard to order.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub path: PathBuf,
    pub config: ModuleConfig,
    pub options: ModuleOptions,
    pub dependencies: IndexSet<PathBuf>,
    /// Set when the module's configuration could not be loaded
    pub load_error: Option<String>,
}

impl Module {
    pub fn new(path: PathBuf, config: ModuleConfig, options: ModuleOptions) -> Self {
        Self {
            path,
            config,
            options,
            dependencies: IndexSet::new(),
            load_error: None,
        }
    }

    /// A module whose configuration failed to load. It keeps its place in the
    /// stack so dependents still resolve, but it is never executed.
    pub fn broken(path: PathBuf, options: ModuleOptions, error: String) -> Self {
        Self {
            path,
            config: ModuleConfig::default(),
            options,
            dependencies: IndexSet::new(),
            load_error: Some(error),
        }
    }

    pub fn is_broken(&self) -> bool {
        self.load_error.is_some()
    }

    /// Raw dependency paths as declared in the configuration
    pub fn declared_dependencies(&self) -> &[String] {
        self.config.dependency_paths()
    }

    /// Identity of the remote state this module mutates, if it has one
    pub fn remote_state_identity(&self) -> Option<RemoteStateIdentity> {
        self.config
            .remote_state
            .as_ref()
            .and_then(RemoteStateIdentity::from_remote_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::config::RemoteState;

    #[test]
    fn test_options_for_module() {
        let config = RunConfig {
            non_interactive: true,
            ..Default::default()
        };
        let args = vec!["apply".to_string(), "-auto-approve".to_string()];
        let options = ModuleOptions::for_module(
            Path::new("/stack/env/app"),
            Path::new("/stack"),
            &config,
            &args,
        );

        assert_eq!(options.working_dir, PathBuf::from("/stack/env/app"));
        assert_eq!(options.config_path, PathBuf::from("/stack/env/app/spin.yaml"));
        assert_eq!(options.tool_binary, "terraform");
        assert_eq!(options.tool_args, args);
        assert!(options.non_interactive);
        assert_eq!(options.log_prefix, "env/app");
    }

    #[test]
    fn test_root_module_prefix_is_full_path() {
        let options = ModuleOptions::for_module(
            Path::new("/stack"),
            Path::new("/stack"),
            &RunConfig::default(),
            &[],
        );
        assert_eq!(options.log_prefix, "/stack");
    }

    #[test]
    fn test_dependency_order_does_not_affect_equality() {
        let options = ModuleOptions::for_module(
            Path::new("/s/app"),
            Path::new("/s"),
            &RunConfig::default(),
            &[],
        );
        let mut a = Module::new(PathBuf::from("/s/app"), ModuleConfig::default(), options);
        let mut b = a.clone();
        a.dependencies.insert(PathBuf::from("/s/net"));
        a.dependencies.insert(PathBuf::from("/s/db"));
        b.dependencies.insert(PathBuf::from("/s/db"));
        b.dependencies.insert(PathBuf::from("/s/net"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_identity_from_config() {
        let options = ModuleOptions::for_module(
            Path::new("/s/db"),
            Path::new("/s"),
            &RunConfig::default(),
            &[],
        );
        let config = ModuleConfig::default().with_remote_state(
            RemoteState::new("s3")
                .with_param("bucket", "state")
                .with_param("key", "db.tfstate"),
        );
        let module = Module::new(PathBuf::from("/s/db"), config, options.clone());
        assert!(module.remote_state_identity().is_some());

        let local = Module::new(PathBuf::from("/s/db"), ModuleConfig::default(), options);
        assert!(local.remote_state_identity().is_none());
    }
}
