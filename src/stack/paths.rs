//! Path normalization shared by discovery and dependency resolution.
//!
//! Paths are compared as cleaned absolute paths. Cleaning is purely lexical:
//! `.` segments are dropped and `..` pops the previous segment. Symlinks are
//! not resolved.

use crate::core::errors::{Result, StackError};
use std::path::{Component, Path, PathBuf};

/// Lexically clean a path
pub fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match cleaned.components().next_back() {
                Some(Component::Normal(_)) => {
                    cleaned.pop();
                }
                // `..` at the root stays at the root
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => cleaned.push(".."),
            },
            other => cleaned.push(other.as_os_str()),
        }
    }
    if cleaned.as_os_str().is_empty() {
        cleaned.push(".");
    }
    cleaned
}

/// Make a path absolute against the process working directory, then clean it
pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(clean_path(path));
    }
    let cwd = std::env::current_dir()
        .map_err(|e| StackError::io("resolve current directory", e))?;
    Ok(clean_path(&cwd.join(path)))
}

/// Resolve a declared dependency path against the declaring module's directory
pub fn resolve_dependency_path(module_dir: &Path, raw: &str) -> PathBuf {
    let raw = Path::new(raw);
    if raw.is_absolute() {
        clean_path(raw)
    } else {
        clean_path(&module_dir.join(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(clean_path(Path::new("/a/b/")), PathBuf::from("/a/b"));
        assert_eq!(clean_path(Path::new("/../a")), PathBuf::from("/a"));
        assert_eq!(clean_path(Path::new("a/../..")), PathBuf::from(".."));
        assert_eq!(clean_path(Path::new("../../a")), PathBuf::from("../../a"));
        assert_eq!(clean_path(Path::new("./")), PathBuf::from("."));
    }

    #[test]
    fn test_resolve_relative_dependency() {
        let module = Path::new("/stack/app");
        assert_eq!(
            resolve_dependency_path(module, "../vpc"),
            PathBuf::from("/stack/vpc")
        );
        assert_eq!(
            resolve_dependency_path(module, "./nested/../db"),
            PathBuf::from("/stack/app/db")
        );
        assert_eq!(
            resolve_dependency_path(module, "/elsewhere/./net"),
            PathBuf::from("/elsewhere/net")
        );
    }

    #[test]
    fn test_absolute_path_is_clean() {
        let resolved = absolute_path(Path::new("some/../dir")).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("dir"));
    }
}
