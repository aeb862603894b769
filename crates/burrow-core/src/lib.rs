//! Burrow Core - Wire codec, protocol bodies, and shared utilities
//!
//! This crate contains the foundational types used across all Burrow
//! components. It has no dependencies on networking or SSH code.

pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod path;
pub mod protocol;
pub mod replay;
pub mod types;

pub use codec::{Frame, Header, MessageType, OperationId, Payload, UNSOLICITED};
pub use config::{BridgeConfig, Config, ConfigError, HostEntry, MountConfig, SshConfig, TlsConfig};
pub use error::*;
pub use event::{LogLevel, LogRecord};
pub use protocol::*;
pub use replay::{Replay, ReplayReceiver, Signal};
pub use types::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;

/// URI scheme used when none is configured
pub const DEFAULT_SCHEME: &str = "burrow";
