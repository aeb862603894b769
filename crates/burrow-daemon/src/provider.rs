//! Host configuration providers
//!
//! The orchestrator never reads configuration itself; it asks a
//! [`ConfigProvider`] to turn an alias into connection parameters. Providers
//! may take arbitrarily long (prompting for a passphrase, say).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use directories::BaseDirs;
use parking_lot::RwLock;

use burrow_core::{Config, HostEntry};

use crate::error::DialError;
use crate::proxy::ProxyCommand;

/// How to authenticate once the transport is up
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Password(String),
    PublicKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::None => f.write_str("None"),
            AuthMethod::Password(_) => f.write_str("Password(..)"),
            AuthMethod::PublicKey { path, .. } => write!(f, "PublicKey({:?})", path),
        }
    }
}

/// Everything needed to dial one hop
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedHost {
    pub alias: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub auth: AuthMethod,
    /// Proxy command template (`%h`/`%p` not yet expanded)
    pub proxy_command: Option<String>,
    /// Accepted host key fingerprints; empty accepts any key
    pub host_key_fingerprints: Vec<String>,
}

impl ResolvedHost {
    pub fn new(alias: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            alias: alias.into(),
            hostname: hostname.into(),
            port,
            user: default_user(),
            auth: AuthMethod::None,
            proxy_command: None,
            host_key_fingerprints: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_auth(mut self, auth: AuthMethod) -> Self {
        self.auth = auth;
        self
    }

    pub fn via_jump(mut self, jump_alias: &str) -> Self {
        self.proxy_command = Some(ProxyCommand::jump_template(jump_alias));
        self
    }

    pub fn with_proxy_command(mut self, command: impl Into<String>) -> Self {
        self.proxy_command = Some(command.into());
        self
    }
}

/// Source of host parameters
#[async_trait]
pub trait ConfigProvider: Send + Sync + 'static {
    async fn resolve(&self, alias: &str) -> Result<ResolvedHost, DialError>;
}

/// In-memory provider
#[derive(Default)]
pub struct StaticProvider {
    hosts: RwLock<HashMap<String, ResolvedHost>>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: ResolvedHost) {
        self.hosts.write().insert(host.alias.clone(), host);
    }

    pub fn with_host(self, host: ResolvedHost) -> Self {
        self.insert(host);
        self
    }

    pub fn remove(&self, alias: &str) -> Option<ResolvedHost> {
        self.hosts.write().remove(alias)
    }
}

#[async_trait]
impl ConfigProvider for StaticProvider {
    async fn resolve(&self, alias: &str) -> Result<ResolvedHost, DialError> {
        self.hosts
            .read()
            .get(alias)
            .cloned()
            .ok_or_else(|| DialError::HostNotFound(alias.to_string()))
    }
}

/// Provider backed by the `[hosts.<alias>]` tables of the config file
pub struct HostsProvider {
    hosts: BTreeMap<String, HostEntry>,
}

impl HostsProvider {
    pub fn new(hosts: BTreeMap<String, HostEntry>) -> Self {
        Self { hosts }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.hosts.clone())
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }

    fn convert(alias: &str, entry: &HostEntry) -> Result<ResolvedHost, DialError> {
        let hostname = entry.hostname.clone().unwrap_or_else(|| alias.to_string());
        if hostname.trim().is_empty() {
            return Err(DialError::invalid_config(alias, "empty hostname"));
        }
        if entry.port == 0 {
            return Err(DialError::invalid_config(alias, "port 0"));
        }

        let proxy_command = match (&entry.proxy_command, &entry.proxy_jump) {
            (Some(_), Some(_)) => {
                return Err(DialError::invalid_config(
                    alias,
                    "proxy_command and proxy_jump are mutually exclusive",
                ));
            }
            (Some(command), None) => Some(command.clone()),
            (None, Some(jump)) if jump.trim().is_empty() => {
                return Err(DialError::invalid_config(alias, "empty proxy_jump"));
            }
            (None, Some(jump)) => Some(ProxyCommand::jump_template(jump.trim())),
            (None, None) => None,
        };

        let auth = match (&entry.identity_file, &entry.password) {
            (Some(path), _) => AuthMethod::PublicKey {
                path: expand_home(path),
                passphrase: entry.identity_passphrase.clone(),
            },
            (None, Some(password)) => AuthMethod::Password(password.clone()),
            (None, None) => AuthMethod::None,
        };

        Ok(ResolvedHost {
            alias: alias.to_string(),
            hostname,
            port: entry.port,
            user: entry.user.clone().unwrap_or_else(default_user),
            auth,
            proxy_command,
            host_key_fingerprints: entry.host_key_fingerprints.clone(),
        })
    }
}

#[async_trait]
impl ConfigProvider for HostsProvider {
    async fn resolve(&self, alias: &str) -> Result<ResolvedHost, DialError> {
        let entry = self
            .hosts
            .get(alias)
            .ok_or_else(|| DialError::HostNotFound(alias.to_string()))?;
        Self::convert(alias, entry)
    }
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".into())
}

/// Expand a leading `~/` to the home directory
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml: &str) -> HostsProvider {
        HostsProvider::from_config(&Config::parse(toml).unwrap())
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticProvider::new().with_host(ResolvedHost::new("a", "10.0.0.1", 22));
        assert_eq!(provider.resolve("a").await.unwrap().hostname, "10.0.0.1");
        assert_eq!(
            provider.resolve("b").await.unwrap_err(),
            DialError::HostNotFound("b".into())
        );
    }

    #[tokio::test]
    async fn test_hosts_provider_resolves_jump() {
        let provider = config(
            r#"
            [hosts.bastion]
            hostname = "bastion.example.com"
            user = "ops"
            password = "hunter2"

            [hosts.db]
            hostname = "10.0.0.5"
            port = 2222
            proxy_jump = "bastion"
            identity_file = "/keys/id_ed25519"
        "#,
        );

        let db = provider.resolve("db").await.unwrap();
        assert_eq!(db.port, 2222);
        assert_eq!(db.proxy_command.as_deref(), Some("ssh -W [%h]:%p bastion"));
        assert!(matches!(db.auth, AuthMethod::PublicKey { .. }));

        let bastion = provider.resolve("bastion").await.unwrap();
        assert_eq!(bastion.user, "ops");
        assert_eq!(bastion.auth, AuthMethod::Password("hunter2".into()));
        assert!(!format!("{:?}", bastion.auth).contains("hunter2"));
    }

    #[tokio::test]
    async fn test_hosts_provider_defaults_hostname_to_alias() {
        let provider = config("[hosts.myhost]\n");
        let host = provider.resolve("myhost").await.unwrap();
        assert_eq!(host.hostname, "myhost");
        assert_eq!(host.port, 22);
        assert_eq!(host.auth, AuthMethod::None);
    }

    #[tokio::test]
    async fn test_hosts_provider_rejects_inconsistent_entries() {
        let provider = config(
            r#"
            [hosts.both]
            proxy_command = "ssh -W %h:%p a"
            proxy_jump = "a"

            [hosts.blank]
            hostname = "  "
        "#,
        );

        for alias in ["both", "blank"] {
            assert!(matches!(
                provider.resolve(alias).await,
                Err(DialError::InvalidConfig { .. })
            ));
        }
        assert!(matches!(
            provider.resolve("nope").await,
            Err(DialError::HostNotFound(_))
        ));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/abs/key")), PathBuf::from("/abs/key"));
        let expanded = expand_home(Path::new("~/.ssh/id"));
        assert!(expanded.ends_with(".ssh/id"));
        assert!(!expanded.starts_with("~"));
    }
}
