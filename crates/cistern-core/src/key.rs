//! Key utilities: canonical joining, validation, prefix handling, and
//! translation between object keys and OS paths.
//!
//! Keys use the forward slash as their hierarchy separator on the wire,
//! regardless of the host OS. Backends translate to native separators at
//! their own edges.

use std::path::{Path, PathBuf};

use crate::error::CisternError;
use crate::Result;

/// Join key fragments with forward slashes, skipping empty fragments.
///
/// Boundary slashes on each fragment are trimmed so joining never produces
/// doubled separators; interior slashes are preserved.
pub fn join<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for part in parts {
        let part = part.trim_matches('/');
        if part.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// Validate a key before it reaches any backend.
///
/// Empty keys and keys containing a NUL byte are rejected uniformly here so
/// no backend ever sees one.
pub fn validate(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CisternError::invalid_input("key must not be empty"));
    }
    if key.contains('\0') {
        return Err(CisternError::invalid_input(
            "key must not contain a NUL byte",
        ));
    }
    Ok(())
}

/// Strip a listing prefix from a key, also dropping one leading separator
/// left behind by the cut.
pub fn strip_prefix<'a>(key: &'a str, prefix: &str) -> &'a str {
    let rest = key.strip_prefix(prefix).unwrap_or(key);
    rest.strip_prefix('/').unwrap_or(rest)
}

/// The final path segment of a key.
pub fn base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Translate a slash-separated key into a relative path using the host
/// separator.
pub fn to_rel_path(key: &str) -> PathBuf {
    key.split('/').filter(|s| !s.is_empty()).collect()
}

/// Translate a path relative to some root into a slash-separated key.
pub fn from_rel_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_skips_empty_parts() {
        assert_eq!(join(["", "foo", "", "bar"]), "foo/bar");
        assert_eq!(join(["foo"]), "foo");
        assert_eq!(join(["", ""]), "");
    }

    #[test]
    fn test_join_trims_boundary_slashes() {
        assert_eq!(join(["foo/", "/bar"]), "foo/bar");
        assert_eq!(join(["foo/bar", "baz"]), "foo/bar/baz");
        assert_eq!(join(["/"]), "");
    }

    #[test]
    fn test_validate_rejects_nul_and_empty() {
        assert!(validate("").is_err());
        assert!(validate("\0").is_err());
        assert!(validate("foo\0bar").is_err());
        assert!(validate("foo/bar").is_ok());
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(strip_prefix("dst/a/b.txt", "dst"), "a/b.txt");
        assert_eq!(strip_prefix("dst/a/b.txt", "dst/"), "a/b.txt");
        assert_eq!(strip_prefix("other", "dst"), "other");
        assert_eq!(strip_prefix("dst", "dst"), "");
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("a/b/c.py"), "c.py");
        assert_eq!(base_name("c.py"), "c.py");
    }

    #[test]
    fn test_path_round_trip() {
        let rel = to_rel_path("a/b/c.txt");
        assert_eq!(from_rel_path(&rel), "a/b/c.txt");
    }
}
