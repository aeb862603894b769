//! Path validation and security utilities
//!
//! Request URIs name a mount token and a path relative to that mount's
//! root. Everything here fails closed: anything that could address a file
//! outside the root is an error, never a best-effort rewrite.

use std::path::{Component, Path, PathBuf};

use percent_encoding::percent_decode_str;

use crate::error::ProtocolError;
use crate::{MAX_FILENAME_LEN, MAX_PATH_LEN};

/// A parsed `<scheme>://<token>/<path>` request URI
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeUri {
    pub scheme: String,
    pub token: String,
    /// Percent-decoded path relative to the mount root (may be empty)
    pub path: String,
}

impl BridgeUri {
    pub fn parse(uri: &str) -> Result<Self, ProtocolError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| ProtocolError::InvalidUri(format!("missing scheme: {}", uri)))?;

        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(ProtocolError::InvalidUri(format!("bad scheme: {}", scheme)));
        }

        let (token, raw_path) = match rest.split_once('/') {
            Some((token, path)) => (token, path),
            None => (rest, ""),
        };

        if token.is_empty() {
            return Err(ProtocolError::InvalidUri("missing mount token".into()));
        }
        if !token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ProtocolError::InvalidUri("malformed mount token".into()));
        }

        let path = percent_decode_str(raw_path)
            .decode_utf8()
            .map_err(|_| ProtocolError::InvalidUri("path is not valid UTF-8".into()))?
            .into_owned();

        Ok(Self {
            scheme: scheme.to_string(),
            token: token.to_string(),
            path,
        })
    }
}

/// Validate and resolve a path safely within a base directory.
///
/// Rejects absolute paths, `..` components, NUL bytes and over-long
/// names. Works on paths that do not exist yet, and never follows
/// symlinks; see [`contain_symlinks`] for that.
pub fn safe_path(base: &Path, relative: &str) -> Result<PathBuf, ProtocolError> {
    if relative.contains('\0') {
        return Err(ProtocolError::PathTraversal(
            "path contains null byte".into(),
        ));
    }

    if relative.len() > MAX_PATH_LEN {
        return Err(ProtocolError::PathTraversal(format!(
            "path too long: {} bytes (max {})",
            relative.len(),
            MAX_PATH_LEN
        )));
    }

    let relative_path = Path::new(relative);

    if relative_path.is_absolute() {
        return Err(ProtocolError::PathTraversal(
            "absolute paths not allowed".into(),
        ));
    }

    let mut result = base.to_path_buf();

    for component in relative_path.components() {
        match component {
            Component::Normal(name) => {
                let name_str = name.to_string_lossy();
                if name_str.len() > MAX_FILENAME_LEN {
                    return Err(ProtocolError::PathTraversal(format!(
                        "filename too long: {} bytes (max {})",
                        name_str.len(),
                        MAX_FILENAME_LEN
                    )));
                }
                result.push(name);
            }
            Component::ParentDir => {
                return Err(ProtocolError::PathTraversal(
                    "parent directory (..) not allowed".into(),
                ));
            }
            Component::CurDir => {}
            Component::Prefix(_) => {
                return Err(ProtocolError::PathTraversal(
                    "path prefixes not allowed".into(),
                ));
            }
            Component::RootDir => {
                return Err(ProtocolError::PathTraversal(
                    "root directory not allowed in relative path".into(),
                ));
            }
        }
    }

    if !result.starts_with(base) {
        return Err(ProtocolError::PathTraversal(
            "path escapes base directory".into(),
        ));
    }

    Ok(result)
}

/// Validate a filename (single path component)
pub fn validate_filename(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::PathTraversal("empty filename".into()));
    }

    if name.contains('\0') {
        return Err(ProtocolError::PathTraversal(
            "filename contains null byte".into(),
        ));
    }

    if name.len() > MAX_FILENAME_LEN {
        return Err(ProtocolError::PathTraversal(format!(
            "filename too long: {} bytes (max {})",
            name.len(),
            MAX_FILENAME_LEN
        )));
    }

    if name == "." || name == ".." {
        return Err(ProtocolError::PathTraversal(
            "special directory names not allowed".into(),
        ));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(ProtocolError::PathTraversal(
            "filename contains path separator".into(),
        ));
    }

    Ok(())
}

/// Check that `path` does not reach outside `base` through symlinks.
///
/// The deepest ancestor of `path` that exists (possibly `path` itself) is
/// canonicalized and must stay under the canonical base. Paths that do not
/// exist yet are therefore checked through their parent directory.
pub fn contain_symlinks(base: &Path, path: &Path) -> Result<(), ProtocolError> {
    let canonical_base = base
        .canonicalize()
        .map_err(|e| ProtocolError::PathTraversal(format!("cannot canonicalize base: {}", e)))?;

    let existing = path
        .ancestors()
        .find(|p| p.symlink_metadata().is_ok())
        .ok_or_else(|| ProtocolError::PathTraversal("no existing ancestor".into()))?;

    let canonical = existing
        .canonicalize()
        .map_err(|e| ProtocolError::PathTraversal(format!("cannot canonicalize path: {}", e)))?;

    if !canonical.starts_with(&canonical_base) {
        return Err(ProtocolError::PathTraversal(
            "symlink escapes mount root".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base() -> PathBuf {
        PathBuf::from("/shared")
    }

    #[test]
    fn test_parse_uri() {
        let uri = BridgeUri::parse("burrow://abc123/src/main.rs").unwrap();
        assert_eq!(uri.scheme, "burrow");
        assert_eq!(uri.token, "abc123");
        assert_eq!(uri.path, "src/main.rs");

        let root = BridgeUri::parse("burrow://abc123").unwrap();
        assert_eq!(root.path, "");

        let root = BridgeUri::parse("burrow://abc123/").unwrap();
        assert_eq!(root.path, "");
    }

    #[test]
    fn test_parse_uri_decodes_percent() {
        let uri = BridgeUri::parse("burrow://abc/my%20file.txt").unwrap();
        assert_eq!(uri.path, "my file.txt");

        let uri = BridgeUri::parse("burrow://abc/%2e%2e/%2E%2E/etc/passwd").unwrap();
        assert_eq!(uri.path, "../../etc/passwd");
        assert!(safe_path(&base(), &uri.path).is_err());

        let uri = BridgeUri::parse("burrow://abc/a%2F..%2F..%2Fetc").unwrap();
        assert!(safe_path(&base(), &uri.path).is_err());
    }

    #[test]
    fn test_parse_uri_rejects_malformed() {
        assert!(BridgeUri::parse("no-scheme/path").is_err());
        assert!(BridgeUri::parse("://abc/path").is_err());
        assert!(BridgeUri::parse("burrow:///path").is_err());
        assert!(BridgeUri::parse("burrow://ab%2e/path").is_err());
        assert!(BridgeUri::parse("burrow://abc/%ff%fe").is_err());
    }

    #[test]
    fn test_safe_path_normal() {
        assert_eq!(
            safe_path(&base(), "file.txt").unwrap(),
            PathBuf::from("/shared/file.txt")
        );
        assert_eq!(
            safe_path(&base(), "a/b/c/d.txt").unwrap(),
            PathBuf::from("/shared/a/b/c/d.txt")
        );
        assert_eq!(safe_path(&base(), "").unwrap(), base());
    }

    #[test]
    fn test_safe_path_rejects_traversal() {
        assert!(safe_path(&base(), "../etc/passwd").is_err());
        assert!(safe_path(&base(), "../../etc/passwd").is_err());
        assert!(safe_path(&base(), "foo/../../../etc/passwd").is_err());
        assert!(safe_path(&base(), "..").is_err());
    }

    #[test]
    fn test_safe_path_rejects_absolute() {
        assert!(safe_path(&base(), "/etc/passwd").is_err());
        assert!(safe_path(&base(), "/").is_err());
    }

    #[test]
    fn test_safe_path_handles_dot() {
        assert_eq!(
            safe_path(&base(), "./file.txt").unwrap(),
            PathBuf::from("/shared/file.txt")
        );
        assert_eq!(
            safe_path(&base(), "dir/./file.txt").unwrap(),
            PathBuf::from("/shared/dir/file.txt")
        );
    }

    #[test]
    fn test_safe_path_rejects_null() {
        assert!(safe_path(&base(), "file\0.txt").is_err());
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("file.txt").is_ok());
        assert!(validate_filename("").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("file/name").is_err());
    }

    #[test]
    fn test_path_length_limits() {
        let long_name = "a".repeat(MAX_FILENAME_LEN + 1);
        assert!(validate_filename(&long_name).is_err());
        assert!(safe_path(&base(), &long_name).is_err());

        let long_path = format!("{}/{}", "dir", "a".repeat(MAX_PATH_LEN));
        assert!(safe_path(&base(), &long_path).is_err());
    }

    #[test]
    fn test_contain_symlinks_accepts_new_file() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("not-yet/created.txt");
        assert!(contain_symlinks(temp.path(), &target).is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn test_contain_symlinks_rejects_escape() {
        use std::os::unix::fs::symlink;

        let outside = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let link = temp.path().join("evil_link");
        symlink(outside.path(), &link).unwrap();

        let err = contain_symlinks(temp.path(), &link).unwrap_err();
        assert!(matches!(err, ProtocolError::PathTraversal(_)));

        // A file that would be created behind the link is rejected too
        assert!(contain_symlinks(temp.path(), &link.join("new.txt")).is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_contain_symlinks_accepts_internal_link() {
        use std::os::unix::fs::symlink;

        let temp = tempfile::tempdir().unwrap();
        let real = temp.path().join("real.txt");
        std::fs::write(&real, "x").unwrap();
        let link = temp.path().join("link.txt");
        symlink(&real, &link).unwrap();

        assert!(contain_symlinks(temp.path(), &link).is_ok());
    }
}
