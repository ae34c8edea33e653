//! Path normalization and containment checks.
//!
//! The lexical helpers never touch the filesystem, so they work for paths
//! that do not exist yet. [`resolve_symlinks`] reads the disk to see where a
//! path really lands before containment is decided.

use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Links followed before giving up on a chain of dangling symlinks.
const MAX_LINK_HOPS: usize = 40;

/// Normalize a path lexically, resolving `.` and `..` components.
///
/// `..` never climbs above the root or a Windows prefix.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::ParentDir => match normalized.components().next_back() {
                None | Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => {
                    normalized.pop();
                }
            },
            Component::CurDir => {}
            _ => normalized.push(component),
        }
    }

    normalized
}

/// Resolve `path` against `base` when relative, then normalize.
#[must_use]
pub fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&base.join(path))
    }
}

/// Check whether `path` lies at or below `root`.
///
/// Comparison is per component, so `/work-other` is not under `/work`.
#[must_use]
pub fn is_under_root(path: &Path, root: &Path) -> bool {
    let normalized_path = normalize_path(path);
    let normalized_root = normalize_path(root);

    normalized_path.starts_with(&normalized_root)
}

/// True when `path` is under any of `roots`.
#[must_use]
pub fn is_under_any<P: AsRef<Path>>(path: &Path, roots: &[P]) -> bool {
    roots.iter().any(|root| is_under_root(path, root.as_ref()))
}

/// Resolve symlinks in the longest existing prefix of `path`, keeping the
/// missing tail as written. A dangling link is followed to where it points,
/// since creating a file through it lands there.
///
/// `path` is expected to be absolute.
#[must_use]
pub fn resolve_symlinks(path: &Path) -> PathBuf {
    let mut current = normalize_path(path);
    for _ in 0..MAX_LINK_HOPS {
        let mut existing = current.as_path();
        let mut tail: Vec<OsString> = Vec::new();
        loop {
            if let Ok(canonical) = existing.canonicalize() {
                return tail.iter().rev().fold(canonical, |acc, part| acc.join(part));
            }
            if let Ok(link) = fs::read_link(existing) {
                let base = existing.parent().unwrap_or_else(|| Path::new("/"));
                let mut next = absolutize(&link, base);
                for part in tail.iter().rev() {
                    next.push(part);
                }
                current = next;
                break;
            }
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    tail.push(name.to_os_string());
                    existing = parent;
                }
                _ => return current,
            }
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_resolves_dots() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_path(Path::new("/../../etc")), PathBuf::from("/etc"));
        assert_eq!(normalize_path(Path::new("a/../../b")), PathBuf::from("b"));
    }

    #[test]
    fn absolutize_joins_relative_paths() {
        let base = Path::new("/work/project");
        assert_eq!(
            absolutize(Path::new("src/../lib.rs"), base),
            PathBuf::from("/work/project/lib.rs")
        );
        assert_eq!(absolutize(Path::new("/tmp/x"), base), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn containment_is_component_wise() {
        let root = Path::new("/work");
        assert!(is_under_root(Path::new("/work"), root));
        assert!(is_under_root(Path::new("/work/src/main.rs"), root));
        assert!(!is_under_root(Path::new("/work-other/file"), root));
        assert!(!is_under_root(Path::new("/work/../etc/passwd"), root));
    }

    #[test]
    fn any_root_matches() {
        let roots = [PathBuf::from("/a"), PathBuf::from("/b")];
        assert!(is_under_any(Path::new("/b/c"), &roots));
        assert!(!is_under_any(Path::new("/c"), &roots));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_resolve_to_their_targets() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("real/sub")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();
        std::os::unix::fs::symlink(root.join("gone/target"), root.join("dangling")).unwrap();

        assert_eq!(resolve_symlinks(&root.join("alias/sub")), root.join("real/sub"));
        assert_eq!(
            resolve_symlinks(&root.join("alias/new/file.txt")),
            root.join("real/new/file.txt")
        );
        assert_eq!(resolve_symlinks(&root.join("dangling")), root.join("gone/target"));
        assert_eq!(resolve_symlinks(&root.join("missing.txt")), root.join("missing.txt"));
    }
}
