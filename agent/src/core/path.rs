//! Lexical workspace-root containment for role-supplied paths.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path escapes workspace root: {0}")]
    EscapesRoot(String),
}

/// Resolve `relative` against `root` without touching the filesystem.
///
/// Absolute paths are accepted only when they already lie under `root`.
/// `..` components may not climb above the root.
pub fn resolve_within_root(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let trimmed = relative.trim();
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }
    let candidate = Path::new(trimmed);
    let rest = if candidate.is_absolute() {
        candidate
            .strip_prefix(root)
            .map_err(|_| PathError::EscapesRoot(trimmed.to_string()))?
    } else {
        candidate
    };

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in rest.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(name) => parts.push(name),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(PathError::EscapesRoot(trimmed.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::EscapesRoot(trimmed.to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }

    let mut resolved = root.to_path_buf();
    resolved.extend(parts);
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_join_root() {
        let root = Path::new("/work");
        assert_eq!(
            resolve_within_root(root, "./src/../src/lib.rs").unwrap(),
            PathBuf::from("/work/src/lib.rs")
        );
    }

    #[test]
    fn climbing_above_root_is_rejected() {
        let root = Path::new("/work");
        assert_eq!(
            resolve_within_root(root, "../etc/passwd"),
            Err(PathError::EscapesRoot("../etc/passwd".to_string()))
        );
        assert!(resolve_within_root(root, "src/../../x").is_err());
    }

    #[test]
    fn absolute_paths_must_live_under_root() {
        let root = Path::new("/work");
        assert_eq!(
            resolve_within_root(root, "/work/a.txt").unwrap(),
            PathBuf::from("/work/a.txt")
        );
        assert!(resolve_within_root(root, "/etc/passwd").is_err());
    }

    #[test]
    fn empty_and_root_only_paths_are_rejected() {
        let root = Path::new("/work");
        assert_eq!(resolve_within_root(root, "  "), Err(PathError::Empty));
        assert_eq!(resolve_within_root(root, "."), Err(PathError::Empty));
    }
}
