//! Filename safety. Resolves Open Question 9(c): the transformed crate
//! rejects path traversal and absolute paths rather than reproducing the
//! original server's unguarded behavior (see SPEC_FULL.md).
//!
//! Adapted from the teacher's `sanitize_path` (grounded on the same file
//! layout: subdirectory transfers are supported, `..` and leading `/` are
//! rejected, and `\` is normalized to `/` for Windows-style clients).

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

/// Resolve `filename` (as received on the wire) to a path inside `dir`.
/// Accepts subdirectory transfers; rejects traversal and absolute paths.
pub fn sanitize(dir: &Path, filename: &str) -> Result<PathBuf> {
    let normalized = filename.replace('\\', "/");

    if normalized.starts_with('/') {
        return Err(anyhow!("absolute paths are not allowed"));
    }

    for component in normalized.split('/') {
        if component == ".." {
            return Err(anyhow!("path traversal is not allowed"));
        }
    }

    let clean: PathBuf = normalized
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();

    if clean.as_os_str().is_empty() {
        return Err(anyhow!("invalid filename"));
    }

    let candidate = dir.join(&clean);

    let canonical_dir = dir
        .canonicalize()
        .map_err(|e| anyhow!("cannot canonicalize served directory: {e}"))?;

    if candidate.exists() {
        let canonical = candidate
            .canonicalize()
            .map_err(|e| anyhow!("cannot canonicalize path: {e}"))?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(anyhow!("path escapes served directory"));
        }
        Ok(canonical)
    } else {
        let mut ancestor = candidate.parent();
        while let Some(a) = ancestor {
            if a.exists() {
                let canonical_ancestor = a
                    .canonicalize()
                    .map_err(|e| anyhow!("cannot canonicalize ancestor: {e}"))?;
                if !canonical_ancestor.starts_with(&canonical_dir) {
                    return Err(anyhow!("path escapes served directory"));
                }
                return Ok(candidate);
            }
            ancestor = a.parent();
        }
        Err(anyhow!("path escapes served directory"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_simple_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"test").unwrap();
        let result = sanitize(dir.path(), "hello.txt").unwrap();
        assert!(result.ends_with("hello.txt"));
    }

    #[test]
    fn sanitize_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        std::fs::write(dir.path().join("sub/deep/file.cfg"), b"data").unwrap();
        let result = sanitize(dir.path(), "sub/deep/file.cfg").unwrap();
        assert!(result.ends_with("sub/deep/file.cfg"));
    }

    #[test]
    fn sanitize_rejects_dotdot() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sanitize(dir.path(), "../etc/passwd").is_err());
        assert!(sanitize(dir.path(), "sub/../../etc/passwd").is_err());
    }

    #[test]
    fn sanitize_rejects_absolute() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sanitize(dir.path(), "/etc/passwd").is_err());
    }

    #[test]
    fn sanitize_normalizes_backslashes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ios")).unwrap();
        std::fs::write(dir.path().join("ios/config.cfg"), b"data").unwrap();
        let result = sanitize(dir.path(), "ios\\config.cfg").unwrap();
        assert!(result.ends_with("ios/config.cfg"));
    }

    #[test]
    fn sanitize_nonexistent_path_within_dir_for_wrq() {
        let dir = tempfile::tempdir().unwrap();
        let result = sanitize(dir.path(), "new_dir/file.bin").unwrap();
        assert!(result.ends_with("new_dir/file.bin"));
    }

    #[test]
    fn sanitize_rejects_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sanitize(dir.path(), "").is_err());
        assert!(sanitize(dir.path(), ".").is_err());
        assert!(sanitize(dir.path(), "..").is_err());
    }
}
