//! Configuration system for Burrow
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/dev.burrow.burrow/config.toml
//! - Linux: ~/.config/burrow/config.toml
//! - Windows: %APPDATA%/burrow/config.toml

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::DEFAULT_MAX_FRAME_SIZE;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// File-system bridge server settings
    pub bridge: BridgeConfig,
    /// SSH dial settings
    pub ssh: SshConfig,
    /// Known hosts by alias
    pub hosts: BTreeMap<String, HostEntry>,
}

/// Bridge server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Listening port (0 = pick any free port)
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Maximum concurrent editor connections
    pub max_connections: usize,
    /// Largest accepted frame in bytes
    pub max_frame_size: usize,
    /// Seconds a new connection gets to finish TLS and the WebSocket upgrade
    pub handshake_timeout_secs: u64,
    /// URI scheme clients put in front of mount tokens
    pub scheme: String,
    /// Optional TLS wrapping
    pub tls: Option<TlsConfig>,
    /// Mounts registered at startup
    pub mounts: Vec<MountConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: 8765,
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_connections: 16,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout_secs: 10,
            scheme: crate::DEFAULT_SCHEME.into(),
            tls: None,
            mounts: Vec::new(),
        }
    }
}

impl BridgeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }
}

/// TLS material for the bridge listener
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert_path: Option<PathBuf>,
    /// PEM private key (PKCS#8)
    pub key_path: Option<PathBuf>,
    /// Generate a throwaway self-signed certificate instead of loading one
    pub self_signed: bool,
}

/// A directory exposed at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    pub name: String,
    pub path: PathBuf,
}

/// SSH dial configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Timeout for config/credential lookups (unset = wait indefinitely)
    pub provider_timeout_secs: Option<u64>,
    /// Maximum ProxyJump nesting
    pub max_jump_depth: usize,
    /// Dial events kept for late observers (0 = all)
    pub event_history: usize,
    /// SSH keepalive interval in seconds (0 = disabled)
    pub keepalive_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            provider_timeout_secs: None,
            max_jump_depth: 8,
            event_history: 256,
            keepalive_secs: 30,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn provider_timeout(&self) -> Option<Duration> {
        self.provider_timeout_secs.map(Duration::from_secs)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }
}

/// One `[hosts.<alias>]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostEntry {
    /// Real host name or address (defaults to the alias)
    pub hostname: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub identity_passphrase: Option<String>,
    /// OpenSSH-style `ssh -W host:port alias`; `%h`/`%p` are expanded
    pub proxy_command: Option<String>,
    /// Jump host alias, shorthand for `ssh -W [%h]:%p <alias>`
    pub proxy_jump: Option<String>,
    /// Accepted SHA-256 host key fingerprints (empty = accept any)
    pub host_key_fingerprints: Vec<String>,
}

impl Default for HostEntry {
    fn default() -> Self {
        Self {
            hostname: None,
            port: 22,
            user: None,
            password: None,
            identity_file: None,
            identity_passphrase: None,
            proxy_command: None,
            proxy_jump: None,
            host_key_fingerprints: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        let config = Self::parse(&content)?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "burrow", "burrow")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let mut config = Self::default();
        config.bridge.mounts.push(MountConfig {
            name: "home".into(),
            path: PathBuf::from("/home/me"),
        });
        config.hosts.insert(
            "bastion".into(),
            HostEntry {
                hostname: Some("bastion.example.com".into()),
                user: Some("me".into()),
                identity_file: Some(PathBuf::from("~/.ssh/id_ed25519")),
                ..HostEntry::default()
            },
        );
        config.hosts.insert(
            "db".into(),
            HostEntry {
                hostname: Some("10.0.0.5".into()),
                user: Some("me".into()),
                proxy_jump: Some("bastion".into()),
                ..HostEntry::default()
            },
        );
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
