//! ProxyCommand parsing
//!
//! Only the stdio-forward form is understood:
//!
//! ```text
//! ssh -W <host>:<port> <alias>
//! ```
//!
//! The host may be bracketed (`[::1]`, `[127.0.0.1]`). Any other command is
//! rejected rather than executed.

use std::fmt;

use crate::error::DialError;

/// Target of an `-W` forward
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StdioForward {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for StdioForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A parsed `ssh -W host:port alias` command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyCommand {
    pub stdio_forward: StdioForward,
    pub host_alias: String,
}

impl ProxyCommand {
    pub fn parse(command: &str) -> Result<Self, DialError> {
        let invalid = || DialError::InvalidProxyCommand(command.to_string());

        let tokens: Vec<&str> = command.split_whitespace().collect();
        let [program, flag, target, alias] = tokens.as_slice() else {
            return Err(invalid());
        };
        if *program != "ssh" || *flag != "-W" || alias.is_empty() {
            return Err(invalid());
        }

        let (host, port) = target.rsplit_once(':').ok_or_else(invalid)?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner.strip_suffix(']').ok_or_else(invalid)?,
            None if host.contains(':') || host.contains(']') => return Err(invalid()),
            None => host,
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;

        Ok(Self {
            stdio_forward: StdioForward {
                host: host.to_string(),
                port,
            },
            host_alias: alias.to_string(),
        })
    }

    /// Command template equivalent to `ProxyJump <alias>`
    pub fn jump_template(alias: &str) -> String {
        format!("ssh -W [%h]:%p {}", alias)
    }
}

/// Expand `%h`, `%p` and `%%` in a proxy command template
pub fn expand(template: &str, host: &str, port: u16) -> String {
    let mut out = String::with_capacity(template.len() + host.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push_str(host),
            Some('p') => out.push_str(&port.to_string()),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}
