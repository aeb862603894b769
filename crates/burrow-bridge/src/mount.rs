//! Mount token registry
//!
//! Maps opaque tokens to directory roots. A token is the only capability a
//! client needs to reach a root, so tokens are 128 random bits and every
//! URI is re-validated against its root on each request.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use burrow_core::path::{contain_symlinks, safe_path, validate_filename, BridgeUri};
use burrow_core::{ErrorCode, FsError, ProtocolError, DEFAULT_SCHEME};

/// Bytes of randomness in a mount token
pub const TOKEN_BYTES: usize = 16;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("mount root {path:?} is not usable: {reason}")]
    InvalidRoot { path: PathBuf, reason: String },

    #[error("random number generator failed: {0}")]
    Rng(String),
}

/// A registered mount
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mount {
    pub token: String,
    pub name: String,
    /// Canonical root directory
    pub root: PathBuf,
    /// Owning session, if any
    pub session: Option<String>,
}

/// Concurrent token → root map
pub struct MountRegistry {
    mounts: DashMap<String, Mount>,
    scheme: String,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::with_scheme(DEFAULT_SCHEME)
    }

    pub fn with_scheme(scheme: impl Into<String>) -> Self {
        Self {
            mounts: DashMap::new(),
            scheme: scheme.into(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Register `root` under a fresh token that lives until unregistered
    pub fn register(&self, name: &str, root: impl AsRef<Path>) -> Result<String, MountError> {
        self.insert(name, root.as_ref(), None)
    }

    /// Register `root` for a session; the mount goes away with [`end_session`](Self::end_session)
    pub fn register_for_session(
        &self,
        session: &str,
        name: &str,
        root: impl AsRef<Path>,
    ) -> Result<String, MountError> {
        self.insert(name, root.as_ref(), Some(session.to_string()))
    }

    fn insert(&self, name: &str, root: &Path, session: Option<String>) -> Result<String, MountError> {
        let root = root.canonicalize().map_err(|e| MountError::InvalidRoot {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !root.is_dir() {
            return Err(MountError::InvalidRoot {
                path: root,
                reason: "not a directory".into(),
            });
        }

        let token = loop {
            let token = generate_token()?;
            if !self.mounts.contains_key(&token) {
                break token;
            }
        };

        info!("Registered mount {:?} at {:?}", name, root);
        self.mounts.insert(
            token.clone(),
            Mount {
                token: token.clone(),
                name: name.to_string(),
                root,
                session,
            },
        );
        Ok(token)
    }

    /// Root directory for `token`
    pub fn resolve(&self, token: &str) -> Result<PathBuf, FsError> {
        self.mounts
            .get(token)
            .map(|m| m.root.clone())
            .ok_or_else(|| FsError::mount_not_found(token))
    }

    pub fn get(&self, token: &str) -> Option<Mount> {
        self.mounts.get(token).map(|m| m.clone())
    }

    pub fn unregister(&self, token: &str) -> bool {
        let removed = self.mounts.remove(token).is_some();
        if removed {
            debug!("Unregistered mount {}", token);
        }
        removed
    }

    /// Drop every mount owned by `session`, returning how many went away
    pub fn end_session(&self, session: &str) -> usize {
        let before = self.mounts.len();
        self.mounts
            .retain(|_, m| m.session.as_deref() != Some(session));
        let removed = before.saturating_sub(self.mounts.len());
        if removed > 0 {
            info!("Session {} ended, dropped {} mount(s)", session, removed);
        }
        removed
    }

    pub fn list(&self) -> Vec<Mount> {
        let mut mounts: Vec<Mount> = self.mounts.iter().map(|m| m.value().clone()).collect();
        mounts.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.token.cmp(&b.token)));
        mounts
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Resolve a request URI to an absolute path under its mount root.
    ///
    /// Fails closed on unknown tokens, foreign schemes, traversal and
    /// symlinks that leave the root.
    pub fn resolve_uri(&self, uri: &str) -> Result<PathBuf, FsError> {
        self.resolve_in_root(uri).map(|(_, path)| path)
    }

    /// Resolve a URI naming an entry that will be removed or moved away.
    /// The mount root itself is refused.
    pub fn resolve_entry(&self, uri: &str) -> Result<PathBuf, FsError> {
        let (root, path) = self.resolve_in_root(uri)?;
        if path == root {
            return Err(FsError::new(
                ErrorCode::PermissionDenied,
                "the mount root cannot be deleted or replaced",
            ));
        }
        Ok(path)
    }

    /// Resolve a URI naming an entry that will be created or written.
    /// Its final component must be a valid filename.
    pub fn resolve_new_entry(&self, uri: &str) -> Result<PathBuf, FsError> {
        let path = self.resolve_entry(uri)?;
        let name = path
            .file_name()
            .ok_or_else(|| ProtocolError::PathTraversal("missing filename".into()))?;
        validate_filename(&name.to_string_lossy())?;
        Ok(path)
    }

    fn resolve_in_root(&self, uri: &str) -> Result<(PathBuf, PathBuf), FsError> {
        let uri = BridgeUri::parse(uri)?;
        if uri.scheme != self.scheme {
            return Err(ProtocolError::InvalidUri(format!(
                "unexpected scheme {:?}",
                uri.scheme
            ))
            .into());
        }

        let root = self.resolve(&uri.token)?;
        let path = safe_path(&root, &uri.path)?;
        contain_symlinks(&root, &path)?;
        Ok((root, path))
    }

    /// Build the URI for `path` inside the mount `token`
    pub fn uri_for(&self, token: &str, path: &str) -> String {
        format!(
            "{}://{}/{}",
            self.scheme,
            token,
            path.trim_start_matches('/')
        )
    }
}

impl Default for MountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_token() -> Result<String, MountError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::getrandom(&mut bytes).map_err(|e| MountError::Rng(e.to_string()))?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::ErrorCode;

    #[test]
    fn test_register_and_resolve() {
        let temp = tempfile::tempdir().unwrap();
        let registry = MountRegistry::new();

        let token = registry.register("work", temp.path()).unwrap();
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        let root = registry.resolve(&token).unwrap();
        assert_eq!(root, temp.path().canonicalize().unwrap());
    }

    #[test]
    fn test_tokens_are_unique() {
        let temp = tempfile::tempdir().unwrap();
        let registry = MountRegistry::new();
        let a = registry.register("a", temp.path()).unwrap();
        let b = registry.register("a", temp.path()).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_token() {
        let registry = MountRegistry::new();
        let err = registry.resolve("deadbeef").unwrap_err();
        assert_eq!(err.code, ErrorCode::MountNotFound);

        let err = registry.resolve_uri("burrow://deadbeef/a.txt").unwrap_err();
        assert_eq!(err.code, ErrorCode::MountNotFound);
    }

    #[test]
    fn test_register_rejects_files() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();

        let registry = MountRegistry::new();
        assert!(matches!(
            registry.register("f", &file),
            Err(MountError::InvalidRoot { .. })
        ));
        assert!(registry.register("missing", temp.path().join("nope")).is_err());
    }

    #[test]
    fn test_resolve_uri_stays_under_root() {
        let temp = tempfile::tempdir().unwrap();
        let registry = MountRegistry::new();
        let token = registry.register("r", temp.path()).unwrap();
        let root = temp.path().canonicalize().unwrap();

        let path = registry
            .resolve_uri(&registry.uri_for(&token, "src/main.rs"))
            .unwrap();
        assert_eq!(path, root.join("src/main.rs"));

        for evil in ["../../etc/passwd", "%2e%2e/%2e%2e/etc/passwd", "a/%2F../../x"] {
            let uri = format!("burrow://{}/{}", token, evil);
            match registry.resolve_uri(&uri) {
                Ok(path) => assert!(path.starts_with(&root), "{} escaped", evil),
                Err(e) => assert_eq!(e.code, ErrorCode::PathTraversal, "{}", evil),
            }
        }
    }

    #[test]
    fn test_entry_resolution_guards_root_and_names() {
        let temp = tempfile::tempdir().unwrap();
        let registry = MountRegistry::new();
        let token = registry.register("r", temp.path()).unwrap();
        let root = temp.path().canonicalize().unwrap();

        let root_uri = registry.uri_for(&token, "");
        assert_eq!(registry.resolve_uri(&root_uri).unwrap(), root);
        assert_eq!(
            registry.resolve_entry(&root_uri).unwrap_err().code,
            ErrorCode::PermissionDenied
        );
        assert_eq!(
            registry.resolve_new_entry(&root_uri).unwrap_err().code,
            ErrorCode::PermissionDenied
        );

        let odd = registry.uri_for(&token, "x%5Cy");
        assert!(registry.resolve_entry(&odd).is_ok());
        assert_eq!(
            registry.resolve_new_entry(&odd).unwrap_err().code,
            ErrorCode::PathTraversal
        );

        assert_eq!(
            registry
                .resolve_new_entry(&registry.uri_for(&token, "dir/file.txt"))
                .unwrap(),
            root.join("dir/file.txt")
        );
    }

    #[test]
    fn test_resolve_uri_rejects_foreign_scheme() {
        let temp = tempfile::tempdir().unwrap();
        let registry = MountRegistry::new();
        let token = registry.register("r", temp.path()).unwrap();

        let err = registry
            .resolve_uri(&format!("file://{}/a", token))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    #[cfg(unix)]
    fn test_resolve_uri_rejects_escaping_symlink() {
        let outside = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("out")).unwrap();

        let registry = MountRegistry::new();
        let token = registry.register("r", temp.path()).unwrap();

        let err = registry
            .resolve_uri(&registry.uri_for(&token, "out/secret"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PathTraversal);
    }

    #[test]
    fn test_session_lifetime() {
        let temp = tempfile::tempdir().unwrap();
        let registry = MountRegistry::new();

        let owned = registry
            .register_for_session("s1", "owned", temp.path())
            .unwrap();
        let other = registry
            .register_for_session("s2", "other", temp.path())
            .unwrap();
        let free = registry.register("free", temp.path()).unwrap();

        assert_eq!(registry.end_session("s1"), 1);
        assert!(registry.resolve(&owned).is_err());
        assert!(registry.resolve(&other).is_ok());
        assert!(registry.resolve(&free).is_ok());

        assert!(registry.unregister(&free));
        assert!(!registry.unregister(&free));
        assert_eq!(registry.list().len(), 1);
    }
}
