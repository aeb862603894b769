//! Dial errors

use thiserror::Error;

/// Why a dial did not produce a session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("invalid configuration for {alias}: {reason}")]
    InvalidConfig { alias: String, reason: String },

    #[error("invalid proxy command: {0}")]
    InvalidProxyCommand(String),

    #[error("jump chain through {alias} exceeds {max} hops")]
    JumpDepthExceeded { alias: String, max: usize },

    #[error("connect to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("timed out while {0}")]
    Timeout(String),

    #[error("ssh handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },

    #[error("host key for {0} was rejected")]
    HostKeyRejected(String),

    #[error("authentication as {user} on {host} failed")]
    AuthFailed { user: String, host: String },

    #[error("forward to {host}:{port} failed: {reason}")]
    Forward {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("dial runtime failed: {0}")]
    Runtime(String),

    #[error("dial cancelled")]
    Cancelled,
}

impl DialError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DialError::Cancelled)
    }

    pub fn invalid_config(alias: &str, reason: impl Into<String>) -> Self {
        DialError::InvalidConfig {
            alias: alias.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_distinct() {
        assert!(DialError::Cancelled.is_cancelled());
        assert!(!DialError::HostNotFound("x".into()).is_cancelled());
        assert!(!DialError::Timeout("resolving x".into()).is_cancelled());
    }
}
