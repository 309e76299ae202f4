//! Lexical path confinement.
//!
//! Resolves a model-supplied path against the authorized root and rejects
//! anything that escapes it. No filesystem access happens here: the check is
//! pure path algebra, and it runs on the *resolved* path so `..` segments
//! and absolute-path injection cannot smuggle a target outside the root.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfineError {
    #[error("file path is required")]
    EmptyPath,
    #[error("file path is outside the authorized directory (attempted: {attempted}, resolved: {resolved})")]
    OutOfBounds { attempted: String, resolved: PathBuf },
}

/// Fold `.` and `..` components of an absolute path without touching the
/// filesystem. Excess `..` is clamped at the filesystem root.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `input` against `root` and prove the result stays under `root`.
///
/// Absolute inputs are normalized as-is; relative inputs are joined to the
/// root first. Returns the resolved absolute path.
pub fn resolve_within(root: &Path, input: &str) -> Result<PathBuf, ConfineError> {
    if input.trim().is_empty() {
        return Err(ConfineError::EmptyPath);
    }

    let candidate = Path::new(input);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let resolved = normalize_lexical(&joined);

    // The relative path from root to the resolved target must not begin
    // with a parent traversal and must not be absolute. `strip_prefix`
    // failing is exactly that condition (the root itself strips to "").
    if resolved.strip_prefix(root).is_err() {
        return Err(ConfineError::OutOfBounds {
            attempted: input.to_string(),
            resolved,
        });
    }

    Ok(resolved)
}

/// Display `path` relative to `root`, falling back to the absolute form.
#[must_use]
pub fn display_relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .map_or_else(|_| path.to_string_lossy().into_owned(), |rel| {
            rel.to_string_lossy().into_owned()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/authorized/root")
    }

    #[test]
    fn rejects_empty_and_whitespace_input() {
        assert!(matches!(
            resolve_within(&root(), ""),
            Err(ConfineError::EmptyPath)
        ));
        assert!(matches!(
            resolve_within(&root(), "   "),
            Err(ConfineError::EmptyPath)
        ));
    }

    #[test]
    fn resolves_relative_path_under_root() {
        let resolved = resolve_within(&root(), "notes/today.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/authorized/root/notes/today.txt"));
    }

    #[test]
    fn rejects_parent_traversal_escape() {
        let err = resolve_within(&root(), "../../etc/passwd").unwrap_err();
        assert!(matches!(err, ConfineError::OutOfBounds { .. }));
    }

    #[test]
    fn accepts_traversal_that_stays_inside() {
        let resolved = resolve_within(&root(), "sub/../file.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/authorized/root/file.txt"));
    }

    #[test]
    fn rejects_absolute_path_outside_root() {
        let err = resolve_within(&root(), "/abs/outside").unwrap_err();
        assert!(matches!(err, ConfineError::OutOfBounds { .. }));
    }

    #[test]
    fn accepts_absolute_path_inside_root() {
        let resolved = resolve_within(&root(), "/authorized/root/deep/file.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/authorized/root/deep/file.txt"));
    }

    #[test]
    fn root_itself_is_in_bounds() {
        let resolved = resolve_within(&root(), "/authorized/root").unwrap();
        assert_eq!(resolved, root());
    }

    #[test]
    fn check_runs_on_resolved_not_raw_path() {
        // Raw input starts innocently but resolves outside.
        let err = resolve_within(&root(), "sub/../../outside.txt").unwrap_err();
        match err {
            ConfineError::OutOfBounds { resolved, .. } => {
                assert_eq!(resolved, PathBuf::from("/authorized/outside.txt"));
            }
            other => panic!("expected OutOfBounds, got {other:?}"),
        }
    }

    #[test]
    fn sibling_with_root_prefix_is_rejected() {
        // "/authorized/rootx" shares a string prefix with the root but is a
        // different directory; component-wise strip_prefix must reject it.
        let err = resolve_within(&root(), "/authorized/rootx/file").unwrap_err();
        assert!(matches!(err, ConfineError::OutOfBounds { .. }));
    }

    #[test]
    fn display_relative_strips_root() {
        let path = PathBuf::from("/authorized/root/a/b.txt");
        assert_eq!(display_relative(&path, &root()), "a/b.txt");
    }
}
