//! Module discovery
//!
//! Walks a directory tree for module configuration files and binds each
//! containing directory to a [`Module`]. The result is an immutable snapshot
//! handed to the graph builder.

use crate::core::config::RunConfig;
use crate::core::errors::{Result, StackError};
use crate::stack::config::ConfigProvider;
use crate::stack::module::{Module, ModuleOptions};
use crate::stack::paths::absolute_path;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Snapshot of the modules discovered for one run, keyed by cleaned absolute path
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleSet {
    modules: BTreeMap<PathBuf, Module>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from already-bound modules; a later module with the same
    /// path replaces an earlier one
    pub fn from_modules<I: IntoIterator<Item = Module>>(modules: I) -> Self {
        Self {
            modules: modules
                .into_iter()
                .map(|module| (module.path.clone(), module))
                .collect(),
        }
    }

    pub fn insert(&mut self, module: Module) -> Option<Module> {
        self.modules.insert(module.path.clone(), module)
    }

    pub fn get(&self, path: &Path) -> Option<&Module> {
        self.modules.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.modules.contains_key(path)
    }

    /// Modules in path order
    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.modules.keys()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules whose configuration failed to load
    pub fn broken(&self) -> impl Iterator<Item = &Module> {
        self.modules.values().filter(|module| module.is_broken())
    }

    pub fn into_inner(self) -> BTreeMap<PathBuf, Module> {
        self.modules
    }
}

impl IntoIterator for ModuleSet {
    type Item = Module;
    type IntoIter = std::collections::btree_map::IntoValues<PathBuf, Module>;

    fn into_iter(self) -> Self::IntoIter {
        self.modules.into_values()
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// Find every module under `root`
pub fn discover_modules(
    root: &Path,
    run_config: &RunConfig,
    tool_args: &[String],
    provider: &dyn ConfigProvider,
) -> Result<ModuleSet> {
    let root = absolute_path(root)?;
    if !root.is_dir() {
        return Err(StackError::configuration_field(
            format!("stack root {} is not a directory", root.display()),
            "root",
        ));
    }

    let mut module_dirs = Vec::new();
    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let operation = format!("walk {}", root.display());
            match e.into_io_error() {
                Some(io) => StackError::io(operation, io),
                None => StackError::configuration(format!("{operation}: filesystem loop")),
            }
        })?;

        if entry.file_type().is_file() && entry.file_name() == run_config.config_file_name.as_str()
        {
            if let Some(dir) = entry.path().parent() {
                debug!(module = %dir.display(), "Found module configuration");
                module_dirs.push(dir.to_path_buf());
            }
        }
    }

    let modules = bind_modules(&root, &module_dirs, run_config, tool_args, provider)?;
    info!(
        root = %root.display(),
        modules = modules.len(),
        broken = modules.broken().count(),
        "Discovered modules"
    );
    Ok(modules)
}

/// Bind an explicit list of module directories
pub fn discover_paths(
    root: &Path,
    module_dirs: &[PathBuf],
    run_config: &RunConfig,
    tool_args: &[String],
    provider: &dyn ConfigProvider,
) -> Result<ModuleSet> {
    let root = absolute_path(root)?;
    let module_dirs = module_dirs
        .iter()
        .map(|dir| {
            if dir.is_absolute() {
                absolute_path(dir)
            } else {
                absolute_path(&root.join(dir))
            }
        })
        .collect::<Result<Vec<_>>>()?;
    bind_modules(&root, &module_dirs, run_config, tool_args, provider)
}

fn bind_modules(
    root: &Path,
    module_dirs: &[PathBuf],
    run_config: &RunConfig,
    tool_args: &[String],
    provider: &dyn ConfigProvider,
) -> Result<ModuleSet> {
    let mut modules = ModuleSet::new();

    for dir in module_dirs {
        let path = absolute_path(dir)?;
        let options = ModuleOptions::for_module(&path, root, run_config, tool_args);

        let module = match provider.load(&options.config_path) {
            Ok(config) => Module::new(path, config, options),
            Err(e) => {
                // Contained to this module; the run carries on without it
                warn!(module = %path.display(), error = %e, "Failed to load module configuration");
                Module::broken(path, options, e.to_string())
            }
        };
        modules.insert(module);
    }

    Ok(modules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::config::YamlConfigProvider;
    use std::fs;

    fn write_module(root: &Path, dir: &str, contents: &str) {
        let module_dir = root.join(dir);
        fs::create_dir_all(&module_dir).unwrap();
        fs::write(module_dir.join("spin.yaml"), contents).unwrap();
    }

    #[test]
    fn test_discovers_nested_modules() {
        let tmp = tempfile::tempdir().unwrap();
        write_module(tmp.path(), "net", "");
        write_module(tmp.path(), "env/prod/db", "dependencies:\n  paths: [\"../../../net\"]\n");
        fs::create_dir_all(tmp.path().join("docs")).unwrap();

        let modules = discover_modules(
            tmp.path(),
            &RunConfig::default(),
            &["plan".to_string()],
            &YamlConfigProvider,
        )
        .unwrap();

        let root = absolute_path(tmp.path()).unwrap();
        let paths: Vec<_> = modules.paths().cloned().collect();
        assert_eq!(paths, vec![root.join("env/prod/db"), root.join("net")]);

        let db = modules.get(&root.join("env/prod/db")).unwrap();
        assert_eq!(db.declared_dependencies(), &["../../../net"]);
        assert_eq!(db.options.tool_args, vec!["plan".to_string()]);
        assert_eq!(db.options.log_prefix, "env/prod/db");
        assert!(db.dependencies.is_empty());
    }

    #[test]
    fn test_skips_hidden_directories() {
        let tmp = tempfile::tempdir().unwrap();
        write_module(tmp.path(), "app", "");
        write_module(tmp.path(), "app/.terraform/modules/vendored", "");

        let modules =
            discover_modules(tmp.path(), &RunConfig::default(), &[], &YamlConfigProvider).unwrap();
        assert_eq!(modules.len(), 1);
    }

    #[test]
    fn test_parse_failure_is_contained() {
        let tmp = tempfile::tempdir().unwrap();
        write_module(tmp.path(), "good", "");
        write_module(tmp.path(), "bad", "dependencies: [oops");

        let modules =
            discover_modules(tmp.path(), &RunConfig::default(), &[], &YamlConfigProvider).unwrap();
        assert_eq!(modules.len(), 2);

        let broken: Vec<_> = modules.broken().collect();
        assert_eq!(broken.len(), 1);
        assert!(broken[0].path.ends_with("bad"));
    }

    #[test]
    fn test_missing_root() {
        let err = discover_modules(
            Path::new("/no/such/stack/root"),
            &RunConfig::default(),
            &[],
            &YamlConfigProvider,
        )
        .unwrap_err();
        assert!(matches!(err, StackError::Configuration { .. }));
    }

    #[test]
    fn test_discover_explicit_paths() {
        let tmp = tempfile::tempdir().unwrap();
        write_module(tmp.path(), "a", "");
        write_module(tmp.path(), "b", "");

        let modules = discover_paths(
            tmp.path(),
            &[PathBuf::from("a"), PathBuf::from("./b/")],
            &RunConfig::default(),
            &[],
            &YamlConfigProvider,
        )
        .unwrap();
        let root = absolute_path(tmp.path()).unwrap();
        assert!(modules.contains(&root.join("a")));
        assert!(modules.contains(&root.join("b")));
    }
}
