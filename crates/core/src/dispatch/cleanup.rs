//! Removal of generated build artifacts with a single permission retry.

use crate::error::{DistError, Result};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const ARTIFACT_DIRS: &[&str] = &["build", "dist", "__pycache__"];
const ARTIFACT_EXTENSIONS: &[&str] = &["so", "pyd"];

/// Recover from a failed filesystem operation on `path`.
///
/// On permission denied the path and its parent are made writable and `op` is
/// retried exactly once. Any other failure, or a failing retry, is returned as
/// [`DistError::Filesystem`].
pub fn recover_from_permission_error<F>(op: F, path: &Path, err: io::Error) -> Result<()>
where
    F: Fn(&Path) -> io::Result<()>,
{
    if err.kind() != io::ErrorKind::PermissionDenied {
        return Err(DistError::Filesystem {
            path: path.to_path_buf(),
            source: err,
        });
    }

    tracing::debug!("Permission denied on {}, retrying once", path.display());
    make_writable(path);
    if let Some(parent) = path.parent() {
        make_writable(parent);
    }

    op(path).map_err(|source| DistError::Filesystem {
        path: path.to_path_buf(),
        source,
    })
}

fn make_writable(path: &Path) {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return;
    };
    let mut permissions = metadata.permissions();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(permissions.mode() | 0o700);
    }
    #[cfg(not(unix))]
    {
        permissions.set_readonly(false);
    }

    if let Err(e) = std::fs::set_permissions(path, permissions) {
        tracing::debug!("Could not relax permissions on {}: {}", path.display(), e);
    }
}

/// Remove a file or directory tree, going through the permission recovery hook.
pub fn remove_path(path: &Path) -> Result<()> {
    let op = |p: &Path| {
        if p.is_dir() {
            std::fs::remove_dir_all(p)
        } else {
            std::fs::remove_file(p)
        }
    };

    match op(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => recover_from_permission_error(op, path, e),
    }
}

fn is_artifact(path: &Path, is_dir: bool) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();

    if is_dir {
        return ARTIFACT_DIRS.contains(&name) || name.ends_with(".egg-info");
    }
    if ARTIFACT_EXTENSIONS.contains(&extension) {
        return true;
    }
    // C sources generated next to their .pyx
    extension == "c" && path.with_extension("pyx").exists()
}

/// Remove generated build artifacts below `dir` and return what was removed.
pub fn remove_build_artifacts(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut artifacts = Vec::new();
    let mut walker = WalkDir::new(dir).min_depth(1).into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        let is_dir = entry.file_type().is_dir();
        if is_artifact(entry.path(), is_dir) {
            artifacts.push(entry.path().to_path_buf());
            if is_dir {
                walker.skip_current_dir();
            }
        }
    }

    for artifact in &artifacts {
        remove_path(artifact)?;
    }

    if !artifacts.is_empty() {
        tracing::info!(
            "Removed {} build artifacts from {}",
            artifacts.len(),
            dir.display()
        );
    }

    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    #[test]
    fn test_permission_error_retried_once() {
        let calls = Cell::new(0);
        let op = |_: &Path| {
            calls.set(calls.get() + 1);
            Ok(())
        };

        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        recover_from_permission_error(op, Path::new("/tmp/none"), err).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_failing_retry_propagates() {
        let calls = Cell::new(0);
        let op = |_: &Path| {
            calls.set(calls.get() + 1);
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        };

        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        let result = recover_from_permission_error(op, Path::new("/tmp/none"), err);
        assert!(matches!(result, Err(DistError::Filesystem { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let calls = Cell::new(0);
        let op = |_: &Path| {
            calls.set(calls.get() + 1);
            Ok(())
        };

        let err = io::Error::new(io::ErrorKind::Other, "disk on fire");
        let result = recover_from_permission_error(op, Path::new("/tmp/none"), err);
        assert!(matches!(result, Err(DistError::Filesystem { .. })));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_remove_build_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("build/lib")).unwrap();
        std::fs::write(root.join("build/lib/mod.o"), b"").unwrap();
        std::fs::create_dir_all(root.join("src/pkg.egg-info")).unwrap();
        std::fs::write(root.join("src/fast.pyx"), b"").unwrap();
        std::fs::write(root.join("src/fast.c"), b"").unwrap();
        std::fs::write(root.join("src/native.c"), b"").unwrap();
        std::fs::write(root.join("src/fast.so"), b"").unwrap();
        std::fs::write(root.join("src/main.py"), b"").unwrap();

        let mut removed = remove_build_artifacts(root).unwrap();
        removed.sort();

        assert_eq!(removed.len(), 4);
        assert!(!root.join("build").exists());
        assert!(!root.join("src/pkg.egg-info").exists());
        assert!(!root.join("src/fast.c").exists());
        assert!(!root.join("src/fast.so").exists());
        assert!(root.join("src/native.c").exists());
        assert!(root.join("src/fast.pyx").exists());
        assert!(root.join("src/main.py").exists());
    }
}
